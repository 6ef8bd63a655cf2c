use std::sync::Arc;

use crate::conn::{Connection, FiveTuple};
use crate::dns::DnsCache;
use crate::process::ProcessMonitor;

/// Attributes packets to processes.
pub struct ConnectionResolver {
    monitor: Arc<dyn ProcessMonitor>,
    dns: Arc<DnsCache>,
}

impl ConnectionResolver {
    pub fn new(monitor: Arc<dyn ProcessMonitor>, dns: Arc<DnsCache>) -> Self {
        Self { monitor, dns }
    }

    /// `None` when the packet is not TCP/UDP over IP or its socket has no
    /// known owner, e.g. because it closed before the monitor saw it.
    pub fn resolve(&self, packet: &[u8]) -> Option<Connection> {
        let parsed = FiveTuple::parse(packet)?;
        let process = self.monitor.find(&parsed.tuple)?;
        Some(Connection {
            host: self.dns.lookup(&parsed.tuple.dst),
            tuple: parsed.tuple,
            process,
        })
    }
}
