//! Session registry: a fixed-size slot table plus a nickname index, mirroring
//! the reference's `clients` list + `clients_by_id`/`clients_by_nick` dicts.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::session::Session;

/// Fixed-capacity slot table. Sized `max_players * 4` so reconnect races and
/// lingering half-torn-down sessions never starve a legitimate new player,
/// matching the reference's oversized `clients` list.
pub struct Registry {
    slots: RwLock<Vec<Option<Arc<Session>>>>,
    by_nick: RwLock<std::collections::HashMap<String, Arc<Session>>>,
    capacity: usize,
}

impl Registry {
    pub fn new(max_players: usize) -> Self {
        let capacity = max_players * 4;
        Self {
            slots: RwLock::new((0..capacity).map(|_| None).collect()),
            by_nick: RwLock::new(std::collections::HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a new session built from the lowest free slot index. `make`
    /// receives the chosen slot id and must return the fully constructed
    /// session to store there.
    ///
    /// The reference inserts at the lowest free index after two randomized
    /// sleeps (3-9 hundredths of a second) and retries if another insert won
    /// the race in the meantime; here the whole scan-and-claim happens under
    /// one write lock, so no retry is needed, but the same small random
    /// jitter is kept before acquiring the lock to preserve the original's
    /// insertion-order quirk under concurrent connects.
    pub fn insert<F>(&self, make: F) -> Option<Arc<Session>>
    where
        F: FnOnce(i32) -> Arc<Session>,
    {
        let jitter_ms = rand::rng().random_range(3..=9) * 10;
        std::thread::sleep(std::time::Duration::from_millis(jitter_ms));

        let mut slots = self.slots.write();
        let slot_id = slots.iter().position(|s| s.is_none())?;
        let session = make(slot_id as i32);
        self.by_nick
            .write()
            .insert(session.nickname.clone(), session.clone());
        slots[slot_id] = Some(session.clone());
        tracing::debug!(slot = slot_id, nickname = %session.nickname, "inserted session");
        Some(session)
    }

    /// Remove a session from all registry locations.
    pub fn remove(&self, slot_id: i32) {
        let slot_id = slot_id as usize;
        let removed = {
            let mut slots = self.slots.write();
            slots.get_mut(slot_id).and_then(Option::take)
        };
        if let Some(session) = removed {
            self.by_nick.write().remove(&session.nickname);
            tracing::debug!(slot = slot_id, nickname = %session.nickname, "removed session");
        }
    }

    pub fn by_slot(&self, slot_id: i32) -> Option<Arc<Session>> {
        self.slots
            .read()
            .get(slot_id as usize)
            .and_then(|s| s.clone())
    }

    pub fn by_nickname(&self, nickname: &str) -> Option<Arc<Session>> {
        self.by_nick.read().get(nickname).cloned()
    }

    /// All sessions that have finished the sync handshake, matching the
    /// reference's `get_client(cid=-1)`.
    pub fn synced_sessions(&self) -> Vec<Arc<Session>> {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|s| s.is_synced())
            .cloned()
            .collect()
    }

    /// Every occupied slot, synced or not — used for broadcast and teardown
    /// sweeps.
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.slots.read().iter().filter_map(|s| s.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    /// Comma-separated nickname list (optionally with `:slot` suffixes), for
    /// the `list`/`Ss` broadcast.
    pub fn nickname_list(&self, with_slot: bool) -> String {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|s| {
                if with_slot {
                    format!("{}:{}", s.nickname, s.slot_id)
                } else {
                    s.nickname.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::dummy_session;

    #[test]
    fn insert_picks_lowest_free_slot() {
        let registry = Registry::new(2);
        let s0 = registry.insert(|id| dummy_session(id, "a")).unwrap();
        let s1 = registry.insert(|id| dummy_session(id, "b")).unwrap();
        assert_eq!(s0.slot_id, 0);
        assert_eq!(s1.slot_id, 1);
    }

    #[test]
    fn remove_clears_slot_and_nickname() {
        let registry = Registry::new(1);
        let session = registry.insert(|id| dummy_session(id, "a")).unwrap();
        registry.remove(session.slot_id);
        assert!(registry.by_slot(session.slot_id).is_none());
        assert!(registry.by_nickname("a").is_none());
    }

    #[test]
    fn capacity_is_four_times_max_players() {
        let registry = Registry::new(8);
        assert_eq!(registry.capacity(), 32);
    }

    #[test]
    fn insert_reuses_a_freed_slot() {
        let registry = Registry::new(1);
        let first = registry.insert(|id| dummy_session(id, "a")).unwrap();
        registry.remove(first.slot_id);
        let second = registry.insert(|id| dummy_session(id, "b")).unwrap();
        assert_eq!(second.slot_id, first.slot_id);
    }
}
