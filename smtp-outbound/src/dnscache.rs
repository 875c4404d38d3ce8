//! Bounded DNS cache in front of the resolver.
//!
//! Entries are keyed by `(lowercase name, query type)` through an ordered
//! index. Positive entries expire with the minimum TTL of their records,
//! negative answers are held for [`QUERY_MIN_INTERVAL`] before the resolver
//! is asked again, and a full cache is reset wholesale before the next
//! insert rather than aged out.

use std::{collections::BTreeMap, net::Ipv4Addr};

use async_trait::async_trait;
use tracing::{debug, trace};
use trust_dns_resolver::error::ResolveErrorKind;

use smtp_wire::Hostname;

/// Records kept per cache entry.
pub const MAX_HOSTS: usize = 5;
/// Entry bound; exceeding it clears the whole cache.
pub const MAX_DNS_ENTRIES: usize = 10_000;
/// Seconds a negative answer stays authoritative.
pub const QUERY_MIN_INTERVAL: i64 = 60;

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum QType {
    Mx,
    A,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DnsStatus {
    Success,
    HostNotFound,
    NoData,
    TryAgain,
    Error,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostTarget {
    Ipv4(Ipv4Addr),
    Name(String),
}

/// One resource record as the relay cares about it. MX answers carry their
/// preference; A answers carry preference 0.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RrHost {
    pub preference: u16,
    pub ttl: u32,
    pub target: HostTarget,
}

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub name: String,
    pub qtype: QType,
    pub timestamp: i64,
    pub status: DnsStatus,
    pub hosts: Vec<RrHost>,
}

/// The resolution backend. Implemented for trust-dns' `AsyncResolver`;
/// tests plug in canned answers.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn lookup(&self, name: &str, qtype: QType) -> (DnsStatus, Vec<RrHost>);
}

#[async_trait]
impl<C, P> Resolve for trust_dns_resolver::AsyncResolver<C, P>
where
    C: trust_dns_resolver::proto::DnsHandle<Error = trust_dns_resolver::error::ResolveError>,
    P: trust_dns_resolver::ConnectionProvider<Conn = C>,
{
    async fn lookup(&self, name: &str, qtype: QType) -> (DnsStatus, Vec<RrHost>) {
        use trust_dns_resolver::proto::rr::RData;

        let lookup = match qtype {
            QType::Mx => self.mx_lookup(name).await.map(|l| l.as_lookup().clone()),
            QType::A => self.ipv4_lookup(name).await.map(|l| l.as_lookup().clone()),
        };
        let lookup = match lookup {
            Ok(l) => l,
            Err(e) => {
                let status = match e.kind() {
                    ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                        use trust_dns_resolver::proto::op::ResponseCode;
                        if *response_code == ResponseCode::NXDomain {
                            DnsStatus::HostNotFound
                        } else {
                            DnsStatus::NoData
                        }
                    }
                    ResolveErrorKind::Timeout => DnsStatus::TryAgain,
                    _ => DnsStatus::Error,
                };
                return (status, Vec::new());
            }
        };

        let mut hosts: Vec<RrHost> = Vec::new();
        for record in lookup.record_iter() {
            let host = match record.rdata() {
                RData::A(addr) => {
                    RrHost { preference: 0, ttl: record.ttl(), target: HostTarget::Ipv4(*addr) }
                }
                RData::MX(mx) => {
                    let mut name = mx.exchange().to_utf8();
                    if name.ends_with('.') {
                        name.pop();
                    }
                    RrHost {
                        preference: mx.preference(),
                        ttl: record.ttl(),
                        target: HostTarget::Name(name),
                    }
                }
                _ => continue,
            };
            // Keep the list ordered by preference
            let pos = hosts
                .iter()
                .position(|h| host.preference < h.preference)
                .unwrap_or(hosts.len());
            hosts.insert(pos, host);
            hosts.truncate(MAX_HOSTS);
        }

        if hosts.is_empty() {
            (DnsStatus::Error, hosts)
        } else {
            (DnsStatus::Success, hosts)
        }
    }
}

pub struct DnsCache<R> {
    resolver: R,
    entries: Vec<CacheEntry>,
    index: BTreeMap<(String, QType), usize>,
}

impl<R: Resolve> DnsCache<R> {
    pub fn new(resolver: R) -> DnsCache<R> {
        DnsCache { resolver, entries: Vec::new(), index: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> &CacheEntry {
        &self.entries[index]
    }

    fn reset(&mut self) {
        debug!(entries = self.entries.len(), "DNS cache full, resetting");
        self.entries.clear();
        self.index.clear();
    }

    /// Look `(name, qtype)` up, consulting the resolver on miss or expiry.
    /// Returns the status and the index of the entry holding the records.
    pub async fn lookup(&mut self, name: &str, qtype: QType, now: i64) -> (DnsStatus, usize) {
        let key = (name.to_lowercase(), qtype);

        // Bracketed IP literals are answered synthetically, TTL 0
        if name.starts_with('[') {
            let (status, hosts) = match Hostname::parse_complete(name) {
                Some(Hostname::Ipv4 { ip, .. }) => (
                    DnsStatus::Success,
                    vec![RrHost { preference: 0, ttl: 0, target: HostTarget::Ipv4(ip) }],
                ),
                _ => (DnsStatus::Error, Vec::new()),
            };
            let index = self.store(key, name, qtype, now, status, hosts);
            return (status, index);
        }

        match self.index.get(&key) {
            None => {
                trace!(name, ?qtype, "DNS cache miss");
                let (status, hosts) = self.resolver.lookup(name, qtype).await;
                let index = self.store(key, name, qtype, now, status, hosts);
                (status, index)
            }
            Some(&index) => {
                let entry = &self.entries[index];
                let refresh = match entry.status {
                    DnsStatus::HostNotFound | DnsStatus::NoData => {
                        entry.timestamp + QUERY_MIN_INTERVAL < now
                    }
                    DnsStatus::Success => {
                        let min_ttl =
                            entry.hosts.iter().map(|h| i64::from(h.ttl)).min().unwrap_or(0);
                        entry.timestamp + min_ttl < now
                    }
                    _ => true,
                };
                if refresh {
                    trace!(name, ?qtype, "DNS cache entry expired, refreshing");
                    let (status, hosts) = self.resolver.lookup(name, qtype).await;
                    let entry = &mut self.entries[index];
                    entry.status = status;
                    entry.hosts = hosts;
                    entry.timestamp = now;
                }
                (self.entries[index].status, index)
            }
        }
    }

    /// Resolve a destination domain the way the relay reaches it: MX first,
    /// then A when the domain has no MX at all.
    pub async fn resolve_destination(&mut self, domain: &str, now: i64) -> Option<usize> {
        let (status, index) = self.lookup(domain, QType::Mx, now).await;
        match status {
            DnsStatus::Success => Some(index),
            DnsStatus::HostNotFound | DnsStatus::NoData => {
                let (status, index) = self.lookup(domain, QType::A, now).await;
                match status {
                    DnsStatus::Success => Some(index),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn store(
        &mut self,
        key: (String, QType),
        name: &str,
        qtype: QType,
        now: i64,
        status: DnsStatus,
        hosts: Vec<RrHost>,
    ) -> usize {
        if let Some(&index) = self.index.get(&key) {
            let entry = &mut self.entries[index];
            entry.status = status;
            entry.hosts = hosts;
            entry.timestamp = now;
            return index;
        }
        if self.entries.len() >= MAX_DNS_ENTRIES {
            self.reset();
        }
        let index = self.entries.len();
        self.entries.push(CacheEntry {
            name: name.to_owned(),
            qtype,
            timestamp: now,
            status,
            hosts,
        });
        self.index.insert(key, index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use futures::executor::block_on;

    struct StubResolver {
        answers: Mutex<Vec<(String, QType, DnsStatus, Vec<RrHost>)>>,
        calls: AtomicUsize,
    }

    impl StubResolver {
        fn new(answers: Vec<(String, QType, DnsStatus, Vec<RrHost>)>) -> StubResolver {
            StubResolver { answers: Mutex::new(answers), calls: AtomicUsize::new(0) }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<'a> Resolve for &'a StubResolver {
        async fn lookup(&self, name: &str, qtype: QType) -> (DnsStatus, Vec<RrHost>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answers = self.answers.lock().unwrap();
            answers
                .iter()
                .find(|(n, t, _, _)| n == name && *t == qtype)
                .map(|(_, _, s, h)| (*s, h.clone()))
                .unwrap_or((DnsStatus::HostNotFound, Vec::new()))
        }
    }

    fn mx(preference: u16, ttl: u32, name: &str) -> RrHost {
        RrHost { preference, ttl, target: HostTarget::Name(name.to_owned()) }
    }

    #[test]
    fn positive_hit_until_ttl_expires() {
        let stub = StubResolver::new(vec![(
            "foreign.example".to_owned(),
            QType::Mx,
            DnsStatus::Success,
            vec![mx(10, 60, "mx1.foreign.example"), mx(20, 300, "mx2.foreign.example")],
        )]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            let (status, index) = cache.lookup("foreign.example", QType::Mx, 1000).await;
            assert_eq!(status, DnsStatus::Success);
            assert_eq!(stub.calls(), 1);

            // Within min-TTL: served from cache
            let (status, index2) = cache.lookup("Foreign.Example", QType::Mx, 1059).await;
            assert_eq!(status, DnsStatus::Success);
            assert_eq!(index, index2);
            assert_eq!(stub.calls(), 1);

            // Past the minimum TTL (60): refreshed in place
            let (_, index3) = cache.lookup("foreign.example", QType::Mx, 1061).await;
            assert_eq!(index, index3);
            assert_eq!(stub.calls(), 2);
        });
    }

    #[test]
    fn negative_answers_stick_for_the_interval() {
        let stub = StubResolver::new(vec![]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            let (status, _) = cache.lookup("nx.example", QType::Mx, 1000).await;
            assert_eq!(status, DnsStatus::HostNotFound);
            assert_eq!(stub.calls(), 1);

            // Sticky inside the interval
            let (status, _) = cache.lookup("nx.example", QType::Mx, 1000 + QUERY_MIN_INTERVAL).await;
            assert_eq!(status, DnsStatus::HostNotFound);
            assert_eq!(stub.calls(), 1);

            // Re-asked after it
            let _ = cache.lookup("nx.example", QType::Mx, 1001 + QUERY_MIN_INTERVAL).await;
            assert_eq!(stub.calls(), 2);
        });
    }

    #[test]
    fn mx_records_stay_preference_sorted() {
        let stub = StubResolver::new(vec![(
            "m.example".to_owned(),
            QType::Mx,
            DnsStatus::Success,
            vec![mx(5, 60, "a"), mx(10, 60, "b"), mx(20, 60, "c")],
        )]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            let (_, index) = cache.lookup("m.example", QType::Mx, 0).await;
            let prefs: Vec<u16> =
                cache.entry(index).hosts.iter().map(|h| h.preference).collect();
            let mut sorted = prefs.clone();
            sorted.sort_unstable();
            assert_eq!(prefs, sorted);
        });
    }

    #[test]
    fn ip_literal_is_synthesized() {
        let stub = StubResolver::new(vec![]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            let (status, index) = cache.lookup("[10.1.2.3]", QType::Mx, 0).await;
            assert_eq!(status, DnsStatus::Success);
            assert_eq!(stub.calls(), 0);
            let entry = cache.entry(index);
            assert_eq!(entry.hosts.len(), 1);
            assert_eq!(entry.hosts[0].ttl, 0);
            assert_eq!(
                entry.hosts[0].target,
                HostTarget::Ipv4("10.1.2.3".parse().unwrap())
            );
        });
    }

    #[test]
    fn bad_ip_literal_is_an_error() {
        let stub = StubResolver::new(vec![]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            let (status, _) = cache.lookup("[10.1.2]", QType::Mx, 0).await;
            assert_eq!(status, DnsStatus::Error);
        });
    }

    #[test]
    fn mx_fallback_to_a() {
        let stub = StubResolver::new(vec![(
            "a-only.example".to_owned(),
            QType::A,
            DnsStatus::Success,
            vec![RrHost {
                preference: 0,
                ttl: 60,
                target: HostTarget::Ipv4("192.0.2.7".parse().unwrap()),
            }],
        )]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            let index = cache.resolve_destination("a-only.example", 0).await;
            assert!(index.is_some());
            assert_eq!(cache.entry(index.unwrap()).qtype, QType::A);
        });
    }

    #[test]
    fn index_stays_ordered() {
        let stub = StubResolver::new(vec![]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            for name in ["zeta.example", "alpha.example", "Mu.example"] {
                let _ = cache.lookup(name, QType::Mx, 0).await;
                let _ = cache.lookup(name, QType::A, 0).await;
            }
            let keys: Vec<_> = cache.index.keys().cloned().collect();
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted);
            // Lowercased on entry
            assert!(cache.index.contains_key(&("mu.example".to_owned(), QType::Mx)));
        });
    }

    #[test]
    fn full_cache_resets_entirely() {
        let stub = StubResolver::new(vec![]);
        let mut cache = DnsCache::new(&stub);
        block_on(async {
            for i in 0..MAX_DNS_ENTRIES {
                let _ = cache.lookup(&format!("h{}.example", i), QType::A, 0).await;
            }
            assert_eq!(cache.len(), MAX_DNS_ENTRIES);
            let (_, index) = cache.lookup("one-more.example", QType::A, 0).await;
            assert_eq!(index, 0);
            assert_eq!(cache.len(), 1);
        });
    }
}
