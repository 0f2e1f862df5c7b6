use codec::message::attributes::Transport;

use std::net::SocketAddr;

/// One resolved TURN server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerCandidate {
    pub address: SocketAddr,
    pub transport: Transport,
}

impl ServerCandidate {
    pub fn udp(address: SocketAddr) -> Self {
        Self {
            transport: Transport::Udp,
            address,
        }
    }

    pub fn tcp(address: SocketAddr) -> Self {
        Self {
            transport: Transport::Tcp,
            address,
        }
    }
}

/// Merge per-transport candidate lists into one failover order: every
/// UDP candidate is tried before the TCP fallback.  Each input list is
/// expected in SRV order already, see [`crate::dns::order_records`].
pub fn merge_candidates(
    udp: impl IntoIterator<Item = SocketAddr>,
    tcp: impl IntoIterator<Item = SocketAddr>,
) -> Vec<ServerCandidate> {
    udp.into_iter()
        .map(ServerCandidate::udp)
        .chain(tcp.into_iter().map(ServerCandidate::tcp))
        .collect()
}

/// Failover cursor over the merged candidate list.
///
/// Alternate servers learned from 300 responses are spliced in right
/// after the current position.
pub(super) struct CandidateList {
    candidates: Vec<ServerCandidate>,
    index: usize,
}

impl CandidateList {
    pub fn new(candidates: Vec<ServerCandidate>) -> Self {
        Self {
            candidates,
            index: 0,
        }
    }

    pub fn current(&self) -> Option<ServerCandidate> {
        self.candidates.get(self.index).copied()
    }

    pub fn advance(&mut self) -> Option<ServerCandidate> {
        self.index += 1;
        self.current()
    }

    pub fn insert_next(&mut self, candidate: ServerCandidate) {
        if self.candidates.contains(&candidate) {
            return;
        }

        let at = (self.index + 1).min(self.candidates.len());
        self.candidates.insert(at, candidate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_is_tried_before_tcp() {
        let udp: SocketAddr = "192.0.2.1:3478".parse().unwrap();
        let tcp: SocketAddr = "192.0.2.2:3478".parse().unwrap();

        let merged = merge_candidates([udp], [tcp]);
        assert_eq!(merged[0], ServerCandidate::udp(udp));
        assert_eq!(merged[1], ServerCandidate::tcp(tcp));
    }

    #[test]
    fn alternate_server_is_tried_next() {
        let a: SocketAddr = "192.0.2.1:3478".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:3478".parse().unwrap();
        let alt: SocketAddr = "192.0.2.9:3478".parse().unwrap();

        let mut list = CandidateList::new(merge_candidates([a, b], []));
        list.insert_next(ServerCandidate::udp(alt));

        assert_eq!(list.advance().unwrap().address, alt);
        assert_eq!(list.advance().unwrap().address, b);
        assert_eq!(list.advance(), None);
    }
}
