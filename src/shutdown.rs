//! Shutdown coordination
//!
//! Running -> Stopping on the first termination signal, Stopping ->
//! Terminated once in-flight packets are drained (or the drain deadline
//! passes) and the process monitor is stopped. Signals arriving after the
//! first are ignored.
//!
//! Firewall rules are not touched here: they stay installed so matched
//! traffic keeps flowing through the queue rules' bypass until the daemon
//! is back.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, info, warn};
use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::pipeline::WorkerPool;
use crate::process::ProcessMonitor;

pub const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Running = 0,
    Stopping = 1,
    Terminated = 2,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => State::Running,
            1 => State::Stopping,
            _ => State::Terminated,
        }
    }
}

pub struct Shutdown {
    state: AtomicU8,
    trigger_tx: Sender<Signal>,
    trigger_rx: Receiver<Signal>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (trigger_tx, trigger_rx) = bounded(1);
        Self {
            state: AtomicU8::new(State::Running as u8),
            trigger_tx,
            trigger_rx,
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Starts stopping. Returns false if shutdown was already underway.
    pub fn trigger(&self, signal: Signal) -> bool {
        let started = self
            .state
            .compare_exchange(
                State::Running as u8,
                State::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if started {
            info!("Got signal: {}", signal);
            let _ = self.trigger_tx.try_send(signal);
        } else {
            debug!("Ignoring {}, already stopping", signal);
        }
        started
    }

    /// Blocks until the first termination signal.
    pub fn wait(&self) -> Option<Signal> {
        self.trigger_rx.recv().ok()
    }

    /// Finishes a shutdown: waits for the workers, then stops the monitor.
    /// Must run after the ingestion side has stopped feeding the workers.
    /// Returns whether the workers drained before `drain_timeout`.
    pub fn finish(
        &self,
        workers: WorkerPool,
        monitor: &dyn ProcessMonitor,
        drain_timeout: Duration,
    ) -> bool {
        let pending = workers.len();
        let drained = workers.drain(drain_timeout);
        if !drained {
            warn!(
                "Workers still busy after {:?}, abandoning in-flight packets",
                drain_timeout
            );
        } else {
            debug!("{} workers drained", pending);
        }

        if self
            .state
            .compare_exchange(
                State::Stopping as u8,
                State::Terminated as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            monitor.stop();
        }
        drained
    }
}

/// Blocks the termination signals for the calling thread and every thread
/// spawned after it, so only the listener thread receives them.
pub fn block_termination_signals() -> nix::Result<SigSet> {
    let mut set = SigSet::empty();
    for signal in TERMINATION_SIGNALS {
        set.add(signal);
    }
    set.thread_block()?;
    Ok(set)
}

pub fn spawn_signal_listener(set: SigSet, shutdown: Arc<Shutdown>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || loop {
            match set.wait() {
                Ok(signal) => {
                    shutdown.trigger(signal);
                }
                Err(e) => {
                    error!("Waiting for signals failed: {}", e);
                    return;
                }
            }
        })
}
