//! DNS answer tracking
//!
//! DNS responses reach the same queue as new connections. They are always
//! accepted; their A/AAAA answers are remembered so later connections to
//! those addresses can be shown and matched by name.

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RData;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::conn::{FiveTuple, Protocol};

const DNS_PORT: u16 = 53;

/// A name and the addresses one response resolved it to.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub observed_at: Instant,
    pub ttl: Duration,
}

impl DnsRecord {
    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.duration_since(self.observed_at) > self.ttl.min(max_age)
    }
}

/// Address to name map with age and capacity bounds.
pub struct DnsCache {
    by_address: RwLock<HashMap<IpAddr, DnsRecord>>,
    capacity: usize,
    max_age: Duration,
}

impl DnsCache {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            by_address: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_age,
        }
    }

    pub fn insert(&self, record: DnsRecord) {
        let now = Instant::now();
        let mut map = self.by_address.write();
        for address in &record.addresses {
            map.insert(*address, record.clone());
        }

        if map.len() > self.capacity {
            map.retain(|_, r| !r.is_expired(now, self.max_age));
        }
        while map.len() > self.capacity {
            let oldest = map
                .iter()
                .min_by_key(|(_, r)| r.observed_at)
                .map(|(address, _)| *address);
            match oldest {
                Some(address) => map.remove(&address),
                None => break,
            };
        }
    }

    /// Name last resolved to `address`, if still fresh.
    pub fn lookup(&self, address: &IpAddr) -> Option<String> {
        let now = Instant::now();
        {
            let map = self.by_address.read();
            match map.get(address) {
                None => return None,
                Some(r) if !r.is_expired(now, self.max_age) => return Some(r.name.clone()),
                Some(_) => {}
            }
        }
        self.remove_if_expired(address, now);
        None
    }

    /// Another worker may have refreshed the entry since it was read.
    fn remove_if_expired(&self, address: &IpAddr, now: Instant) {
        let mut map = self.by_address.write();
        if map.get(address).is_some_and(|r| r.is_expired(now, self.max_age)) {
            map.remove(address);
        }
    }

    #[cfg(test)]
    pub fn contains_name(&self, name: &str) -> bool {
        self.by_address.read().values().any(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.by_address.read().len()
    }
}

/// Recognises DNS responses and feeds their answers to a [`DnsCache`].
pub struct DnsTracker<'a> {
    cache: &'a DnsCache,
}

impl<'a> DnsTracker<'a> {
    pub fn new(cache: &'a DnsCache) -> Self {
        Self { cache }
    }

    /// Returns true when `packet` is a DNS response. Such packets must be
    /// accepted without further evaluation.
    pub fn track(&self, packet: &[u8]) -> bool {
        let Some(parsed) = FiveTuple::parse(packet) else {
            return false;
        };
        if parsed.tuple.protocol != Protocol::Udp || parsed.tuple.src_port != DNS_PORT {
            return false;
        }

        let msg = match Message::from_vec(&packet[parsed.payload_offset..]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Not a DNS message from {}: {}", parsed.tuple.src, e);
                return false;
            }
        };
        if msg.message_type() != MessageType::Response {
            return false;
        }

        if let Some(record) = extract_record(&msg) {
            debug!(
                "DNS {} -> {:?} (ttl {}s)",
                record.name,
                record.addresses,
                record.ttl.as_secs()
            );
            self.cache.insert(record);
        }
        true
    }
}

fn extract_record(msg: &Message) -> Option<DnsRecord> {
    let name = msg.queries().first()?.name().to_string();
    let name = name.trim_end_matches('.').to_string();

    let mut addresses = Vec::new();
    let mut ttl = u32::MAX;
    for answer in msg.answers() {
        match answer.data() {
            Some(RData::A(addr)) => {
                addresses.push(IpAddr::V4(**addr));
                ttl = ttl.min(answer.ttl());
            }
            Some(RData::AAAA(addr)) => {
                addresses.push(IpAddr::V6(**addr));
                ttl = ttl.min(answer.ttl());
            }
            Some(RData::CNAME(cname)) => {
                debug!("CNAME {} -> {}", answer.name(), cname.0);
            }
            _ => {}
        }
    }

    if addresses.is_empty() {
        return None;
    }
    Some(DnsRecord {
        name,
        addresses,
        observed_at: Instant::now(),
        ttl: Duration::from_secs(u64::from(ttl)),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::conn::testing::{tcp_syn, udp};
    use std::net::Ipv4Addr;

    fn record(name: &str, addr: [u8; 4], age: Duration, ttl: u64) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::from(addr))],
            observed_at: Instant::now() - age,
            ttl: Duration::from_secs(ttl),
        }
    }

    #[test]
    fn tracks_response_answers() {
        let cache = DnsCache::new(16, Duration::from_secs(3600));
        let tracker = DnsTracker::new(&cache);
        let addr = Ipv4Addr::new(93, 184, 216, 34);

        assert!(tracker.track(&dns_response("example.com", addr)));
        assert!(cache.contains_name("example.com"));
        assert_eq!(cache.lookup(&IpAddr::V4(addr)).as_deref(), Some("example.com"));
    }

    #[test]
    fn ignores_queries_and_other_traffic() {
        let cache = DnsCache::new(16, Duration::from_secs(3600));
        let tracker = DnsTracker::new(&cache);

        assert!(!tracker.track(&dns_query("example.com")));
        assert!(!tracker.track(&tcp_syn([10, 0, 0, 2], 51000, [1, 1, 1, 1], 53)));
        assert!(!tracker.track(&udp([1, 1, 1, 1], 53, [10, 0, 0, 2], 40000, b"junk")));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn expired_records_are_dropped_on_lookup() {
        let cache = DnsCache::new(16, Duration::from_secs(3600));
        cache.insert(record("old.example", [10, 1, 1, 1], Duration::from_secs(120), 60));
        assert!(cache.lookup(&IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1))).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn refreshed_record_survives_stale_removal() {
        let cache = DnsCache::new(16, Duration::from_secs(3600));
        let addr = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 3));
        // A lookup saw the old record expire, then a new answer arrived
        cache.insert(record("fresh.example", [10, 1, 1, 3], Duration::ZERO, 300));
        cache.remove_if_expired(&addr, Instant::now());
        assert_eq!(cache.lookup(&addr).as_deref(), Some("fresh.example"));

        cache.insert(record("stale.example", [10, 1, 1, 3], Duration::from_secs(10), 5));
        cache.remove_if_expired(&addr, Instant::now());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn max_age_caps_long_ttls() {
        let cache = DnsCache::new(16, Duration::from_secs(30));
        cache.insert(record("long.example", [10, 1, 1, 2], Duration::from_secs(60), 86400));
        assert!(cache.lookup(&IpAddr::V4(Ipv4Addr::new(10, 1, 1, 2))).is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = DnsCache::new(2, Duration::from_secs(3600));
        cache.insert(record("a.example", [10, 0, 0, 1], Duration::from_secs(30), 300));
        cache.insert(record("b.example", [10, 0, 0, 2], Duration::from_secs(20), 300));
        cache.insert(record("c.example", [10, 0, 0, 3], Duration::from_secs(10), 300));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains_name("a.example"));
        assert!(cache.contains_name("c.example"));
    }
}
