//! Per-connection index of in-flight operations.
//!
//! The pending map correlates response messages with the outgoing operations
//! that are waiting for them, keyed by the wrapping 16-bit operation id.
//! All access goes through one mutex scoped strictly to index mutation and
//! lookup; no other work happens under it, so the non-blocking receive path
//! and worker-path removals contend only briefly.
//!
//! The map is ordered by id so diagnostics iterate deterministically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::operation::Operation;

struct Inner {
    map: BTreeMap<u16, Arc<Operation>>,
    /// Last assigned id; wraps 0xFFFF -> 1, 0 is never assigned.
    last_id: u16,
}

/// The pending-operation index of one connection.
pub struct PendingMap {
    inner: Mutex<Inner>,
}

impl PendingMap {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                last_id: 0,
            }),
        }
    }

    /// Return the next operation id.
    ///
    /// Ids wrap from 0xFFFF back to 1; 0 is reserved for unassigned
    /// messages. The counter alone does not guarantee the id is free:
    /// uniqueness among pending operations holds because callers bound the
    /// number of concurrently outstanding operations below 65535.
    pub fn next_id(&self) -> u16 {
        let mut inner = self.inner.lock().unwrap();
        inner.last_id = if inner.last_id == u16::MAX {
            1
        } else {
            inner.last_id + 1
        };
        inner.last_id
    }

    /// Assign an id to the operation and index it.
    ///
    /// The id is stamped into the operation's request header before the
    /// entry becomes visible to the receive path.
    pub fn insert(&self, operation: &Arc<Operation>) -> u16 {
        let id = self.next_id();
        operation.assign_id(id);

        let prev = self.inner.lock().unwrap().map.insert(id, operation.clone());
        if prev.is_some() {
            debug_assert!(false, "operation id {id} already pending");
            tracing::error!(id, "operation id already pending, replacing stale entry");
        }
        id
    }

    /// Remove an operation by id. Idempotent: removing an absent id is a
    /// no-op, not an error.
    pub fn remove(&self, id: u16) -> Option<Arc<Operation>> {
        self.inner.lock().unwrap().map.remove(&id)
    }

    /// Look up a pending operation by id.
    ///
    /// `None` means "unsolicited or stale response": callers log and drop
    /// the message, never treat it as fatal.
    pub fn find(&self, id: u16) -> Option<Arc<Operation>> {
        self.inner.lock().unwrap().map.get(&id).cloned()
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    /// Whether no operations are pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().map.is_empty()
    }

    /// Remove and return every pending operation, in id order.
    pub fn drain(&self) -> Vec<Arc<Operation>> {
        let mut inner = self.inner.lock().unwrap();
        let map = std::mem::take(&mut inner.map);
        map.into_values().collect()
    }
}

impl Default for PendingMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionBuilder};
    use crate::transport::ChannelTransport;

    /// Build a connection for index tests; the runtime only hosts the
    /// (idle) worker task and must outlive the connection.
    fn test_connection() -> (tokio::runtime::Runtime, Connection) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let guard = rt.enter();
        let (transport, _rx) = ChannelTransport::new();
        let connection = ConnectionBuilder::new(0x01).build(transport);
        drop(guard);
        (rt, connection)
    }

    fn make_operation(connection: &Connection) -> Arc<Operation> {
        Operation::create_outgoing(connection, 0x03, b"payload", 16).unwrap()
    }

    #[test]
    fn test_next_id_starts_at_one() {
        let map = PendingMap::new();
        assert_eq!(map.next_id(), 1);
        assert_eq!(map.next_id(), 2);
    }

    #[test]
    fn test_next_id_wraps_skipping_zero() {
        let map = PendingMap::new();
        let mut last = 0;
        for _ in 0..u16::MAX {
            last = map.next_id();
            assert_ne!(last, 0);
        }
        assert_eq!(last, u16::MAX);
        // Wrap: 0 is skipped
        assert_eq!(map.next_id(), 1);
    }

    #[test]
    fn test_insert_find_remove_cycle() {
        let (_rt, connection) = test_connection();
        let map = PendingMap::new();
        let op = make_operation(&connection);

        let id = map.insert(&op);
        assert_eq!(op.id(), id);
        assert!(map.find(id).is_some());
        assert_eq!(map.len(), 1);

        let removed = map.remove(id);
        assert!(removed.is_some());
        assert!(map.find(id).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_insert_stamps_id_into_request_header() {
        let (_rt, connection) = test_connection();
        let map = PendingMap::new();
        let op = make_operation(&connection);

        let id = map.insert(&op);
        let frame = op.request_frame();
        let header = crate::protocol::Header::decode(&frame).unwrap();
        assert_eq!(header.id, id);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_rt, connection) = test_connection();
        let map = PendingMap::new();
        let op = make_operation(&connection);

        let id = map.insert(&op);
        assert!(map.remove(id).is_some());
        assert!(map.remove(id).is_none());
    }

    #[test]
    fn test_drain_returns_all_in_id_order() {
        let (_rt, connection) = test_connection();
        let map = PendingMap::new();

        let ids: Vec<u16> = (0..4)
            .map(|_| map.insert(&make_operation(&connection)))
            .collect();
        let drained = map.drain();

        assert_eq!(drained.len(), 4);
        let drained_ids: Vec<u16> = drained.iter().map(|op| op.id()).collect();
        assert_eq!(drained_ids, ids);
        assert!(map.is_empty());
    }

    /// Tiny deterministic PRNG for interleaving decisions (xorshift).
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_concurrent_insert_remove_find_preserve_uniqueness() {
        use std::collections::HashSet;
        use std::sync::Mutex as StdMutex;

        let (_rt, connection) = test_connection();
        let map = Arc::new(PendingMap::new());
        // Shadow set of ids believed live; insert must never collide.
        let live = Arc::new(StdMutex::new(HashSet::new()));

        let threads: Vec<_> = (0..4u64)
            .map(|seed| {
                let map = map.clone();
                let live = live.clone();
                let connection = connection.clone();
                std::thread::spawn(move || {
                    let mut rng = Rng(seed * 0x9E37_79B9 + 1);
                    let mut mine: Vec<u16> = Vec::new();
                    for _ in 0..300 {
                        if mine.is_empty() || rng.next() % 3 != 0 {
                            let op = make_operation(&connection);
                            let id = map.insert(&op);
                            assert!(
                                live.lock().unwrap().insert(id),
                                "id {id} assigned while still pending"
                            );
                            mine.push(id);
                        } else {
                            let idx = (rng.next() as usize) % mine.len();
                            let id = mine.swap_remove(idx);
                            assert!(map.remove(id).is_some());
                            live.lock().unwrap().remove(&id);
                            assert!(map.find(id).is_none());
                        }
                        if !mine.is_empty() {
                            let idx = (rng.next() as usize) % mine.len();
                            assert!(map.find(mine[idx]).is_some());
                        }
                    }
                    // Drain the rest
                    for id in mine {
                        assert!(map.remove(id).is_some());
                        live.lock().unwrap().remove(&id);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
        assert!(map.is_empty());
        assert!(live.lock().unwrap().is_empty());
    }
}
