//! Process identification
//!
//! Maps a packet's endpoints to the process owning the socket by reading
//! /proc: the socket tables give the inode, the fd links give the owner.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::conn::FiveTuple;
use crate::proc_parser::{self, NetEntry};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn process monitor thread: {0}")]
    Spawn(#[source] io::Error),
}

/// The process owning a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub name: String,
    pub path: String,
    pub uid: u32,
}

/// Live view of which process owns which socket.
///
/// Lookups may race with sockets closing; a miss is not an error.
pub trait ProcessMonitor: Send + Sync {
    fn start(&self) -> Result<(), MonitorError>;
    /// Releases the monitor's resources. Safe to call more than once.
    fn stop(&self);
    fn find(&self, tuple: &FiveTuple) -> Option<Process>;
}

type Snapshot = HashMap<u64, Process>;

struct Refresher {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// /proc backed monitor with a background refresher thread.
///
/// Sockets missing from the snapshot are looked up directly in /proc, so a
/// connection opened since the last refresh is still attributed.
pub struct ProcMonitor {
    proc_root: PathBuf,
    refresh: Duration,
    snapshot: Arc<RwLock<Snapshot>>,
    refresher: Mutex<Option<Refresher>>,
}

impl ProcMonitor {
    pub fn new(refresh: Duration) -> Self {
        Self::with_root("/proc", refresh)
    }

    pub fn with_root(proc_root: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            refresh,
            snapshot: Arc::new(RwLock::new(HashMap::new())),
            refresher: Mutex::new(None),
        }
    }

    fn rescan(&self) {
        *self.snapshot.write() = scan_processes(&self.proc_root);
    }

    fn lookup(&self, candidates: &[u64]) -> Option<Process> {
        let snapshot = self.snapshot.read();
        candidates
            .iter()
            .find_map(|inode| snapshot.get(inode).cloned())
    }
}

impl ProcessMonitor for ProcMonitor {
    fn start(&self) -> Result<(), MonitorError> {
        let mut refresher = self.refresher.lock();
        if refresher.is_some() {
            return Ok(());
        }

        let tcp_table = self.proc_root.join("net/tcp");
        fs::metadata(&tcp_table).map_err(|source| MonitorError::Unreadable {
            path: tcp_table,
            source,
        })?;

        self.rescan();
        info!(
            "Process monitor started ({} sockets tracked)",
            self.snapshot.read().len()
        );

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let proc_root = self.proc_root.clone();
        let snapshot = Arc::clone(&self.snapshot);
        let period = self.refresh;
        let handle = thread::Builder::new()
            .name("procmon".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        *snapshot.write() = scan_processes(&proc_root);
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(MonitorError::Spawn)?;

        *refresher = Some(Refresher { stop_tx, handle });
        Ok(())
    }

    fn stop(&self) {
        let Some(refresher) = self.refresher.lock().take() else {
            return;
        };
        let _ = refresher.stop_tx.send(());
        if refresher.handle.join().is_err() {
            debug!("Process monitor thread panicked");
        }
        info!("Process monitor stopped");
    }

    fn find(&self, tuple: &FiveTuple) -> Option<Process> {
        let entries = proc_parser::read_net_entries(&self.proc_root, tuple.protocol);
        let candidates = matching_inodes(&entries, tuple);
        if candidates.is_empty() {
            return None;
        }

        if let Some(process) = self.lookup(&candidates) {
            return Some(process);
        }

        // The socket is newer than the snapshot
        let (inode, process) = find_owner(&self.proc_root, &candidates)?;
        debug!("Socket {} owned by pid {}, not yet in snapshot", inode, process.pid);
        self.snapshot.write().insert(inode, process.clone());
        Some(process)
    }
}

/// Inodes of sockets that could carry `tuple`, best match first.
fn matching_inodes(entries: &[NetEntry], tuple: &FiveTuple) -> Vec<u64> {
    let src = tuple.src.to_canonical();
    let dst = tuple.dst.to_canonical();

    let exact = entries.iter().filter(|e| {
        e.local_port == tuple.src_port
            && e.remote_port == tuple.dst_port
            && e.local_addr.to_canonical() == src
            && e.remote_addr.to_canonical() == dst
    });
    // Unconnected UDP sockets and wildcard binds
    let loose = entries.iter().filter(|e| {
        let local = e.local_addr.to_canonical();
        e.local_port == tuple.src_port && (local == src || local.is_unspecified())
    });

    let mut inodes: Vec<u64> = Vec::new();
    for entry in exact.chain(loose) {
        if entry.inode != 0 && !inodes.contains(&entry.inode) {
            inodes.push(entry.inode);
        }
    }
    inodes
}

/// Numeric /proc entries with their socket inodes.
fn process_sockets(proc_root: &Path) -> impl Iterator<Item = (u32, Vec<u64>)> {
    fs::read_dir(proc_root)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let fds = fs::read_dir(entry.path().join("fd")).ok()?;
            let inodes: Vec<u64> = fds
                .flatten()
                .filter_map(|fd| fs::read_link(fd.path()).ok())
                .filter_map(|link| proc_parser::socket_inode(&link.to_string_lossy()))
                .collect();
            Some((pid, inodes))
        })
}

/// Owner of the best ranked inode in `candidates`. Stops at the first
/// holder of the top candidate.
fn find_owner(proc_root: &Path, candidates: &[u64]) -> Option<(u64, Process)> {
    let mut best: Option<(usize, u64, u32)> = None;
    for (pid, inodes) in process_sockets(proc_root) {
        let hit = inodes
            .iter()
            .filter_map(|inode| candidates.iter().position(|c| c == inode).map(|rank| (rank, *inode)))
            .min();
        if let Some((rank, inode)) = hit {
            if best.map_or(true, |(best_rank, _, _)| rank < best_rank) {
                best = Some((rank, inode, pid));
            }
            if rank == 0 {
                break;
            }
        }
    }

    let (_, inode, pid) = best?;
    read_process(proc_root, pid).map(|process| (inode, process))
}

fn scan_processes(proc_root: &Path) -> HashMap<u64, Process> {
    let mut inode_to_process = HashMap::new();
    for (pid, inodes) in process_sockets(proc_root) {
        if inodes.is_empty() {
            continue;
        }

        if let Some(process) = read_process(proc_root, pid) {
            for inode in inodes {
                inode_to_process.insert(inode, process.clone());
            }
        }
    }
    inode_to_process
}

fn read_process(proc_root: &Path, pid: u32) -> Option<Process> {
    let dir = proc_root.join(pid.to_string());
    let name = fs::read_to_string(dir.join("comm")).ok()?.trim().to_string();
    let path = fs::read_link(dir.join("exe"))
        .map(|p| clean_exe_path(&p.to_string_lossy()))
        .unwrap_or_default();
    let uid = fs::read_to_string(dir.join("status"))
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("Uid:"))
                .and_then(|l| l.split_whitespace().nth(1).and_then(|u| u.parse().ok()))
        })
        .unwrap_or(0);

    Some(Process {
        pid,
        name,
        path,
        uid,
    })
}

/// Strips the " (deleted)" suffix the kernel appends to replaced binaries.
fn clean_exe_path(path: &str) -> String {
    let path = path.split('\0').next().unwrap_or("");
    path.strip_suffix(" (deleted)").unwrap_or(path).to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Monitor answering from a fixed table.
    #[derive(Default)]
    pub struct StaticMonitor {
        pub table: HashMap<FiveTuple, Process>,
        pub lookups: AtomicUsize,
        pub stops: AtomicUsize,
    }

    impl StaticMonitor {
        pub fn with(tuple: FiveTuple, process: Process) -> Self {
            let mut table = HashMap::new();
            table.insert(tuple, process);
            Self {
                table,
                ..Default::default()
            }
        }
    }

    impl ProcessMonitor for StaticMonitor {
        fn start(&self) -> Result<(), MonitorError> {
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn find(&self, tuple: &FiveTuple) -> Option<Process> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.table.get(tuple).cloned()
        }
    }

    pub fn process(pid: u32, path: &str) -> Process {
        Process {
            pid,
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            uid: 1000,
        }
    }
}
