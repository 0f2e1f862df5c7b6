use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};

use codec::message::MAGIC_COOKIE;

use super::RequesterInner;

static GLOBAL: OnceLock<RequesterManager> = OnceLock::new();

/// Process-wide registry routing inbound STUN packets to the requester
/// whose transaction id they carry.
///
/// Requesters register themselves on construction and unregister on
/// drop; the manager only ever holds weak references, so a leaked entry
/// cannot keep a cancelled requester alive.  The map mutation is the
/// only critical section.
#[derive(Default)]
pub struct RequesterManager {
    map: Mutex<HashMap<[u8; 12], Weak<Mutex<RequesterInner>>>>,
}

impl RequesterManager {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::with_capacity(16)),
        }
    }

    /// The singleton used by every requester in the process.
    pub fn global() -> &'static RequesterManager {
        GLOBAL.get_or_init(RequesterManager::new)
    }

    /// Offer an inbound packet from any source.
    ///
    /// Returns true when exactly one registered requester claimed it.
    pub fn handle_packet(&self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        // cheap pre-checks before touching the registry: STUN header
        // shape and the magic cookie.
        if bytes.len() < 20 || bytes[0] >> 6 != 0 {
            return false;
        }

        if bytes[4..8] != MAGIC_COOKIE.to_be_bytes() {
            return false;
        }

        let Ok(tid) = <[u8; 12]>::try_from(&bytes[8..20]) else {
            return false;
        };

        let entry = { self.map.lock().get(&tid).cloned() };
        let Some(weak) = entry else {
            return false;
        };

        let Some(inner) = weak.upgrade() else {
            // the requester died without unregistering, prune.
            self.map.lock().remove(&tid);
            return false;
        };

        inner.lock().handle_response(from, bytes, now)
    }

    /// number of live registrations, for diagnostics.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub(super) fn register(&self, tid: [u8; 12], inner: &Arc<Mutex<RequesterInner>>) {
        self.map.lock().insert(tid, Arc::downgrade(inner));
    }

    pub(super) fn unregister(&self, tid: &[u8; 12]) {
        self.map.lock().remove(tid);
    }
}
