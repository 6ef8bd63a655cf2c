//! Per-packet verdict pipeline and the worker pool running it.
//!
//! Each packet goes through DNS tracking, connection resolution, the policy
//! and finally its verdict, on whichever worker drew it. Packets that are
//! DNS responses or cannot be attributed to a process are accepted.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::dns::{DnsCache, DnsTracker};
use crate::policy::Policy;
use crate::queue::{Packet, Verdict};
use crate::resolver::ConnectionResolver;

#[derive(Debug, Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub dns: AtomicU64,
    pub unresolved: AtomicU64,
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
    pub fallbacks: AtomicU64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} packets: {} dns, {} unresolved, {} allowed, {} denied, {} policy fallbacks",
            self.total.load(Ordering::Relaxed),
            self.dns.load(Ordering::Relaxed),
            self.unresolved.load(Ordering::Relaxed),
            self.allowed.load(Ordering::Relaxed),
            self.denied.load(Ordering::Relaxed),
            self.fallbacks.load(Ordering::Relaxed),
        )
    }
}

pub struct Pipeline {
    dns: Arc<DnsCache>,
    resolver: ConnectionResolver,
    policy: Arc<dyn Policy>,
    policy_timeout: Duration,
    fallback: Verdict,
    stats: Stats,
}

impl Pipeline {
    /// `fallback` applies to packets whose policy call failed or timed out.
    pub fn new(
        dns: Arc<DnsCache>,
        resolver: ConnectionResolver,
        policy: Arc<dyn Policy>,
        policy_timeout: Duration,
        fallback: Verdict,
    ) -> Self {
        Self {
            dns,
            resolver,
            policy,
            policy_timeout,
            fallback,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn process(&self, packet: Packet) {
        self.stats.total.fetch_add(1, Ordering::Relaxed);

        if DnsTracker::new(&self.dns).track(packet.payload()) {
            self.stats.dns.fetch_add(1, Ordering::Relaxed);
            debug!("dns tracked");
            self.enforce(packet, Verdict::Allow);
            return;
        }

        let Some(conn) = self.resolver.resolve(packet.payload()) else {
            self.stats.unresolved.fetch_add(1, Ordering::Relaxed);
            debug!("Packet {} not attributable, accepting", packet.id());
            self.enforce(packet, Verdict::Allow);
            return;
        };

        let verdict = match self.policy.decide(&conn, self.policy_timeout) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.stats.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!("Policy failed for {}: {}, applying {}", conn, e, self.fallback);
                self.fallback
            }
        };

        let who = &conn.process;
        match verdict {
            Verdict::Allow => debug!(
                "✔ {} [{} uid {}] -> {}:{}",
                who.path, who.name, who.uid, conn.to(), conn.dst_port()
            ),
            Verdict::Deny { .. } => warn!(
                "✘ {} [{} uid {}] -> {}:{}",
                who.path, who.name, who.uid, conn.to(), conn.dst_port()
            ),
        }
        self.enforce(packet, verdict);
    }

    fn enforce(&self, packet: Packet, verdict: Verdict) {
        let counter = if verdict.is_allow() {
            &self.stats.allowed
        } else {
            &self.stats.denied
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let id = packet.id();
        if let Err(e) = packet.set_verdict(verdict) {
            error!("Failed to set verdict for packet {}: {}", id, e);
        }
    }
}

/// Fixed set of threads draining the work channel.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    done: Receiver<()>,
}

impl WorkerPool {
    /// Spawns `count` workers. They exit once every sender of `work` is gone
    /// and the channel is empty.
    pub fn start(count: usize, work: Receiver<Packet>, pipeline: Arc<Pipeline>) -> io::Result<Self> {
        // Never sent on; disconnects once the last worker exits
        let (done_tx, done_rx) = bounded::<()>(0);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let work = work.clone();
            let pipeline = Arc::clone(&pipeline);
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    let _done = done_tx;
                    debug!("Worker #{} started.", id);
                    for packet in work.iter() {
                        pipeline.process(packet);
                    }
                    debug!("Worker #{} stopped.", id);
                })?;
            handles.push(handle);
        }

        Ok(Self {
            handles,
            done: done_rx,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Waits up to `timeout` for the workers to finish the remaining work.
    /// Returns false if some were still busy at the deadline; they are left
    /// running and their packets fall back to the kernel's verdict.
    pub fn drain(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => {
                for handle in self.handles {
                    if handle.join().is_err() {
                        warn!("A worker panicked");
                    }
                }
                true
            }
            Ok(()) | Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Forwards every packet into the work channel until the sequence ends or
/// the workers are gone. Blocks while all workers are busy.
pub fn ingest<I>(packets: I, work: Sender<Packet>) -> u64
where
    I: IntoIterator<Item = Packet>,
{
    let mut forwarded = 0;
    for packet in packets {
        if let Err(e) = work.send(packet) {
            warn!("Work channel closed, accepting packet {}", e.0.id());
            break;
        }
        forwarded += 1;
    }
    forwarded
}
