use ahash::{HashMap, HashMapExt};

use std::{
    collections::VecDeque,
    net::SocketAddr,
    ops::RangeInclusive,
    time::Instant,
};

/// How many released numbers are kept out of rotation so a server that
/// still holds the old binding never sees the number reused for a
/// different peer inside the binding lifetime.
const RECENT_KEEPOUT: usize = 16;

#[derive(Debug, Clone)]
pub struct ChannelBinding {
    pub peer: SocketAddr,
    pub number: u16,
    /// the server acknowledged the ChannelBind request.
    pub confirmed: bool,
    /// when the binding must be refreshed (10 minute lifetime, rebound
    /// at 9).
    pub refresh_at: Instant,
}

/// Client-side channel table: peer to channel number, both directions,
/// with round-robin allocation over the configured range.
///
/// A peer is bound to at most one channel and a channel to at most one
/// peer; unbinding only happens through allocation shutdown.
pub struct ChannelTable {
    range: RangeInclusive<u16>,
    next: u16,
    by_peer: HashMap<SocketAddr, u16>,
    by_number: HashMap<u16, ChannelBinding>,
    recently_released: VecDeque<u16>,
}

impl ChannelTable {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            next: *range.start(),
            by_peer: HashMap::with_capacity(16),
            by_number: HashMap::with_capacity(16),
            recently_released: VecDeque::with_capacity(RECENT_KEEPOUT),
            range,
        }
    }

    pub fn get_by_peer(&self, peer: &SocketAddr) -> Option<&ChannelBinding> {
        self.by_number.get(self.by_peer.get(peer)?)
    }

    pub fn get_by_number(&self, number: u16) -> Option<&ChannelBinding> {
        self.by_number.get(&number)
    }

    pub fn confirm(&mut self, number: u16, refresh_at: Instant) {
        if let Some(binding) = self.by_number.get_mut(&number) {
            binding.confirmed = true;
            binding.refresh_at = refresh_at;
        }
    }

    /// Push the refresh deadline forward without touching the
    /// confirmation, used while a rebind request is in flight.
    pub fn touch(&mut self, number: u16, refresh_at: Instant) {
        if let Some(binding) = self.by_number.get_mut(&number) {
            binding.refresh_at = refresh_at;
        }
    }

    /// bindings whose refresh deadline has passed.
    pub fn due_for_refresh(&self, now: Instant) -> Vec<(SocketAddr, u16)> {
        self.by_number
            .values()
            .filter(|it| it.confirmed && it.refresh_at <= now)
            .map(|it| (it.peer, it.number))
            .collect()
    }

    pub fn next_refresh(&self) -> Option<Instant> {
        self.by_number
            .values()
            .filter(|it| it.confirmed)
            .map(|it| it.refresh_at)
            .min()
    }

    /// Bind a peer to a fresh channel number.
    ///
    /// Returns `None` when the peer is already bound or the range is
    /// exhausted.  Numbers cycle round-robin and skip both live
    /// bindings and the most recently released numbers.
    pub fn bind(&mut self, peer: SocketAddr, refresh_at: Instant) -> Option<u16> {
        if self.by_peer.contains_key(&peer) {
            return None;
        }

        let number = self.allocate()?;
        self.by_peer.insert(peer, number);
        self.by_number.insert(
            number,
            ChannelBinding {
                confirmed: false,
                refresh_at,
                number,
                peer,
            },
        );

        Some(number)
    }

    pub fn unbind(&mut self, number: u16) {
        if let Some(binding) = self.by_number.remove(&number) {
            self.by_peer.remove(&binding.peer);
            if self.recently_released.len() == RECENT_KEEPOUT {
                self.recently_released.pop_front();
            }

            self.recently_released.push_back(number);
        }
    }

    pub fn clear(&mut self) {
        self.by_peer.clear();
        self.by_number.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }

    fn allocate(&mut self) -> Option<u16> {
        let size = (*self.range.end() - *self.range.start()) as usize + 1;

        for _ in 0..size {
            let candidate = self.next;
            self.next = if candidate == *self.range.end() {
                *self.range.start()
            } else {
                candidate + 1
            };

            if self.by_number.contains_key(&candidate) {
                continue;
            }

            if self.recently_released.contains(&candidate) {
                continue;
            }

            return Some(candidate);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    #[test]
    fn allocates_round_robin() {
        let now = Instant::now();
        let mut table = ChannelTable::new(0x4000..=0x4003);

        assert_eq!(table.bind(peer(1), now), Some(0x4000));
        assert_eq!(table.bind(peer(2), now), Some(0x4001));

        // a peer is bound to at most one channel.
        assert_eq!(table.bind(peer(1), now), None);

        assert_eq!(table.get_by_peer(&peer(2)).unwrap().number, 0x4001);
        assert_eq!(table.get_by_number(0x4000).unwrap().peer, peer(1));
    }

    #[test]
    fn released_numbers_are_kept_out_of_rotation() {
        let now = Instant::now();
        let mut table = ChannelTable::new(0x4000..=0x40ff);

        let number = table.bind(peer(1), now).unwrap();
        table.unbind(number);

        // the freed number is not handed out again right away.
        for port in 2..200 {
            assert_ne!(table.bind(peer(port), now), Some(number));
        }
    }

    #[test]
    fn refuses_when_range_is_exhausted() {
        let now = Instant::now();
        let mut table = ChannelTable::new(0x4000..=0x4001);

        assert!(table.bind(peer(1), now).is_some());
        assert!(table.bind(peer(2), now).is_some());
        assert_eq!(table.bind(peer(3), now), None);
    }
}
