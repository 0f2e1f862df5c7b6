//! DNS lookup contract.
//!
//! Resolution itself is a collaborator: the library consumes an ordered
//! candidate list and never opens a resolver socket of its own.  The
//! [`DnsResolver`] trait is what an embedding application implements,
//! typically over `tokio::net::lookup_host` plus its SRV resolver of
//! choice.

use std::{future::Future, io, net::IpAddr};

/// One SRV answer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
    pub ttl: u32,
}

/// Order SRV answers the way clients must try them: ascending priority,
/// then descending weight within a priority group.
pub fn order_records(records: &mut [SrvRecord]) {
    records.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.weight.cmp(&a.weight))
    });
}

pub trait DnsResolver {
    /// `_service._proto.name` lookup returning unordered answers; the
    /// caller orders them with [`order_records`].
    fn resolve_srv(
        &self,
        name: &str,
        service: &str,
        proto: &str,
    ) -> impl Future<Output = io::Result<Vec<SrvRecord>>> + Send;

    /// A/AAAA lookup.
    fn lookup_host(&self, host: &str) -> impl Future<Output = io::Result<Vec<IpAddr>>> + Send;
}

/// Fixed answers, for tests and for applications that resolved
/// out-of-band.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    pub srv: Vec<SrvRecord>,
    pub hosts: Vec<(String, IpAddr)>,
}

impl DnsResolver for StaticResolver {
    async fn resolve_srv(&self, _: &str, _: &str, _: &str) -> io::Result<Vec<SrvRecord>> {
        Ok(self.srv.clone())
    }

    async fn lookup_host(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let found: Vec<IpAddr> = self
            .hosts
            .iter()
            .filter(|(name, _)| name == host)
            .map(|(_, addr)| *addr)
            .collect();

        if found.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "unknown host"));
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(host: &str, priority: u16, weight: u16) -> SrvRecord {
        SrvRecord {
            host: host.to_string(),
            port: 3478,
            priority,
            weight,
            ttl: 300,
        }
    }

    #[test]
    fn orders_by_priority_then_weight() {
        let mut records = vec![
            record("c", 20, 100),
            record("a", 10, 5),
            record("b", 10, 50),
        ];

        order_records(&mut records);

        let hosts: Vec<_> = records.iter().map(|it| it.host.as_str()).collect();
        assert_eq!(hosts, ["b", "a", "c"]);
    }
}
