//! Netfilter queue adapter
//!
//! Binds one NFQUEUE and hands out owned [`Packet`]s that can cross threads.
//! The kernel message behind each packet stays parked in the adapter until
//! the packet's verdict comes back.

use log::{debug, error, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// First sleep after an empty read; doubles while the queue stays idle.
const MIN_BACKOFF: Duration = Duration::from_millis(1);
/// Upper bound on how long the reader sleeps before rechecking for closure.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queue numbers bound by this process.
static CLAIMED_QUEUES: Lazy<Mutex<HashSet<u16>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("netfilter queue #{0} is already bound")]
    AlreadyBound(u16),
    #[error("insufficient privileges to bind netfilter queue #{0}")]
    Permission(u16),
    #[error("failed to open netfilter queue #{queue_num}: {source}")]
    Open {
        queue_num: u16,
        #[source]
        source: io::Error,
    },
    #[error("packet {0} has no pending kernel message")]
    UnknownPacket(u32),
    #[error("failed to deliver verdict for packet {id}: {source}")]
    Verdict {
        id: u32,
        #[source]
        source: io::Error,
    },
}

/// Decision returned to the kernel for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    /// Drop, optionally tagging the flow so firewall rules drop the rest of it.
    Deny { mark: Option<u32> },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => write!(f, "allow"),
            Verdict::Deny { mark: Some(mark) } => write!(f, "deny (mark {})", mark),
            Verdict::Deny { mark: None } => write!(f, "deny"),
        }
    }
}

/// Where verdicts for a packet go.
pub trait VerdictSink: Send + Sync {
    fn issue(&self, packet_id: u32, verdict: Verdict) -> Result<(), QueueError>;
}

/// One intercepted packet awaiting its verdict.
///
/// Setting the verdict consumes the packet, so a second verdict cannot be
/// issued. A packet dropped without a verdict is accepted.
pub struct Packet {
    id: u32,
    payload: Vec<u8>,
    sink: Option<Arc<dyn VerdictSink>>,
}

impl Packet {
    pub fn new(id: u32, payload: Vec<u8>, sink: Arc<dyn VerdictSink>) -> Self {
        Self {
            id,
            payload,
            sink: Some(sink),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Raw IP datagram, starting at the network header.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_verdict(mut self, verdict: Verdict) -> Result<(), QueueError> {
        match self.sink.take() {
            Some(sink) => sink.issue(self.id, verdict),
            None => Ok(()),
        }
    }

    pub fn set_verdict_and_mark(self, mark: u32) -> Result<(), QueueError> {
        self.set_verdict(Verdict::Deny { mark: Some(mark) })
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            warn!("Packet {} released without a verdict, accepting", self.id);
            if let Err(e) = sink.issue(self.id, Verdict::Allow) {
                debug!("Fallback verdict failed: {}", e);
            }
        }
    }
}

/// Exclusive claim on a queue number for the lifetime of the guard.
#[derive(Debug)]
pub struct QueueClaim(u16);

impl QueueClaim {
    pub fn acquire(queue_num: u16) -> Result<Self, QueueError> {
        if !CLAIMED_QUEUES.lock().insert(queue_num) {
            return Err(QueueError::AlreadyBound(queue_num));
        }
        Ok(Self(queue_num))
    }
}

impl Drop for QueueClaim {
    fn drop(&mut self) {
        CLAIMED_QUEUES.lock().remove(&self.0);
    }
}

/// Kernel messages parked until their packet's verdict.
struct Pending<M> {
    parked: Mutex<HashMap<u32, M>>,
}

impl<M> Pending<M> {
    fn new() -> Self {
        Self {
            parked: Mutex::new(HashMap::new()),
        }
    }

    fn park(&self, id: u32, msg: M) {
        self.parked.lock().insert(id, msg);
    }

    fn take(&self, id: u32) -> Option<M> {
        self.parked.lock().remove(&id)
    }

    fn take_all(&self) -> Vec<(u32, M)> {
        self.parked.lock().drain().collect()
    }
}

struct Inner {
    queue_num: u16,
    queue: Mutex<nfq::Queue>,
    pending: Pending<nfq::Message>,
    closed: AtomicBool,
    _claim: QueueClaim,
}

impl VerdictSink for Inner {
    fn issue(&self, packet_id: u32, verdict: Verdict) -> Result<(), QueueError> {
        let mut msg = self
            .pending
            .take(packet_id)
            .ok_or(QueueError::UnknownPacket(packet_id))?;

        match verdict {
            Verdict::Allow => msg.set_verdict(nfq::Verdict::Accept),
            Verdict::Deny { mark } => {
                msg.set_verdict(nfq::Verdict::Drop);
                if let Some(mark) = mark {
                    msg.set_nfmark(mark);
                }
            }
        }

        self.queue
            .lock()
            .verdict(msg)
            .map_err(|source| QueueError::Verdict {
                id: packet_id,
                source,
            })
    }
}

/// A bound netfilter queue.
pub struct NfQueue {
    inner: Arc<Inner>,
}

impl Inner {
    fn release_pending(&self) -> usize {
        let parked = self.pending.take_all();
        let count = parked.len();
        let mut queue = self.queue.lock();
        for (id, mut msg) in parked {
            msg.set_verdict(nfq::Verdict::Accept);
            if let Err(e) = queue.verdict(msg) {
                debug!("Failed to release packet {}: {}", id, e);
            }
        }
        count
    }
}

/// Stops the packet sequence of an [`NfQueue`] from another thread.
#[derive(Clone)]
pub struct QueueCloser {
    inner: Arc<Inner>,
}

impl QueueCloser {
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Accepts every packet still waiting for a verdict. The kernel drops
    /// whatever is queued when the socket closes, so this runs before exit.
    /// Verdicts arriving later for those packets fail with
    /// [`QueueError::UnknownPacket`].
    pub fn release_pending(&self) -> usize {
        self.inner.release_pending()
    }
}

impl NfQueue {
    /// Binds netfilter queue `queue_num`.
    ///
    /// Fails if the queue is already bound, by this process or another one,
    /// or if the process lacks CAP_NET_ADMIN.
    pub fn open(queue_num: u16) -> Result<Self, QueueError> {
        let claim = QueueClaim::acquire(queue_num)?;

        let open_err = |source: io::Error| match source.raw_os_error() {
            Some(libc::EBUSY) => QueueError::AlreadyBound(queue_num),
            Some(libc::EPERM) | Some(libc::EACCES) => QueueError::Permission(queue_num),
            _ => QueueError::Open { queue_num, source },
        };

        let mut queue = nfq::Queue::open().map_err(open_err)?;
        queue.bind(queue_num).map_err(open_err)?;
        // Let the kernel accept instead of drop when our backlog overflows
        if let Err(e) = queue.set_fail_open(queue_num, true) {
            warn!("Could not enable fail-open on queue #{}: {}", queue_num, e);
        }
        // recv must not hold the queue lock while workers issue verdicts
        queue.set_nonblocking(true);

        Ok(Self {
            inner: Arc::new(Inner {
                queue_num,
                queue: Mutex::new(queue),
                pending: Pending::new(),
                closed: AtomicBool::new(false),
                _claim: claim,
            }),
        })
    }

    pub fn queue_num(&self) -> u16 {
        self.inner.queue_num
    }

    pub fn closer(&self) -> QueueCloser {
        QueueCloser {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Intercepted packets, in kernel order, until the queue is closed.
    pub fn packets(&self) -> Packets<'_> {
        Packets {
            queue: self,
            backoff: MIN_BACKOFF,
        }
    }
}

/// Next idle sleep of the reader.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).clamp(MIN_BACKOFF, POLL_INTERVAL)
}

pub struct Packets<'a> {
    queue: &'a NfQueue,
    backoff: Duration,
}

impl Packets<'_> {
    fn idle(&mut self) {
        thread::sleep(self.backoff);
        self.backoff = next_backoff(self.backoff);
    }
}

impl Iterator for Packets<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        let queue: &NfQueue = self.queue;
        let inner = &queue.inner;
        loop {
            if inner.closed.load(Ordering::SeqCst) {
                return None;
            }

            let received = inner.queue.lock().recv();
            match received {
                Ok(msg) => {
                    self.backoff = MIN_BACKOFF;
                    let id = msg.get_packet_id();
                    let payload = msg.get_payload().to_vec();
                    inner.pending.park(id, msg);
                    let sink: Arc<dyn VerdictSink> = Arc::clone(inner) as Arc<dyn VerdictSink>;
                    return Some(Packet::new(id, payload, sink));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.idle(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ENOBUFS: the kernel dropped messages we were too slow to read
                    error!("Error reading from queue #{}: {}", inner.queue_num, e);
                    self.idle();
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records every verdict it receives.
    #[derive(Default)]
    pub struct RecordingSink {
        pub verdicts: Mutex<Vec<(u32, Verdict)>>,
    }

    impl RecordingSink {
        pub fn verdicts(&self) -> Vec<(u32, Verdict)> {
            self.verdicts.lock().clone()
        }
    }

    impl VerdictSink for RecordingSink {
        fn issue(&self, packet_id: u32, verdict: Verdict) -> Result<(), QueueError> {
            self.verdicts.lock().push((packet_id, verdict));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn verdict_is_issued_once() {
        let sink = Arc::new(RecordingSink::default());
        let packet = Packet::new(7, vec![0x45], sink.clone());
        packet.set_verdict(Verdict::Allow).unwrap();
        assert_eq!(sink.verdicts(), vec![(7, Verdict::Allow)]);
    }

    #[test]
    fn deny_carries_mark() {
        let sink = Arc::new(RecordingSink::default());
        Packet::new(3, vec![], sink.clone())
            .set_verdict_and_mark(42)
            .unwrap();
        assert_eq!(sink.verdicts(), vec![(3, Verdict::Deny { mark: Some(42) })]);
    }

    #[test]
    fn dropped_packet_is_accepted() {
        let sink = Arc::new(RecordingSink::default());
        drop(Packet::new(9, vec![], sink.clone()));
        assert_eq!(sink.verdicts(), vec![(9, Verdict::Allow)]);
    }

    #[test]
    fn claiming_a_queue_twice_fails() {
        let first = QueueClaim::acquire(4242).unwrap();
        assert!(matches!(
            QueueClaim::acquire(4242),
            Err(QueueError::AlreadyBound(4242))
        ));
        drop(first);
        assert!(QueueClaim::acquire(4242).is_ok());
    }

    #[test]
    fn release_takes_only_undecided_messages() {
        let pending = Pending::new();
        for id in 1..=3u32 {
            pending.park(id, id * 10);
        }
        assert_eq!(pending.take(2), Some(20));

        let mut released = pending.take_all();
        released.sort();
        assert_eq!(released, vec![(1, 10), (3, 30)]);
        // A late verdict finds nothing left to answer
        assert_eq!(pending.take(1), None);
        assert!(pending.take_all().is_empty());
    }

    #[test]
    fn idle_backoff_is_bounded() {
        assert_eq!(next_backoff(MIN_BACKOFF), Duration::from_millis(2));
        assert_eq!(next_backoff(Duration::ZERO), MIN_BACKOFF);
        let mut backoff = MIN_BACKOFF;
        for _ in 0..20 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, POLL_INTERVAL);
    }

    #[test]
    fn verdict_display() {
        assert_eq!(Verdict::Allow.to_string(), "allow");
        assert_eq!(Verdict::Deny { mark: Some(1) }.to_string(), "deny (mark 1)");
    }
}
