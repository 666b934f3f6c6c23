//! Registry of outstanding chunk ownership

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::peer::PeerId;

/// Concurrent map of outstanding `chunk index -> owning peer`.
///
/// Each index appears at most once; registering an index again overwrites the
/// previous owner. All mutations take the write lock, so uniqueness holds
/// under concurrent access without cross-entry transactions.
#[derive(Debug, Default)]
pub struct AssignmentRegistry {
    entries: RwLock<HashMap<u32, PeerId>>,
}

impl AssignmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `peer` as owner, returning the previous owner if any.
    pub fn register(&self, chunk_index: u32, peer: PeerId) -> Option<PeerId> {
        self.entries.write().insert(chunk_index, peer)
    }

    /// Removes the entry for `chunk_index`.
    pub fn unregister(&self, chunk_index: u32) -> Option<PeerId> {
        self.entries.write().remove(&chunk_index)
    }

    /// Removes the entry only if `peer` still owns it.
    pub fn unregister_if_owner(&self, chunk_index: u32, peer: &PeerId) -> bool {
        let mut entries = self.entries.write();
        if entries.get(&chunk_index) == Some(peer) {
            entries.remove(&chunk_index);
            true
        } else {
            false
        }
    }

    pub fn owner(&self, chunk_index: u32) -> Option<PeerId> {
        self.entries.read().get(&chunk_index).cloned()
    }

    pub fn is_owned_by(&self, chunk_index: u32, peer: &PeerId) -> bool {
        self.entries.read().get(&chunk_index) == Some(peer)
    }

    /// Atomically removes every entry owned by `peer`; returns the freed indices ascending.
    pub fn release_peer(&self, peer: &PeerId) -> Vec<u32> {
        let mut entries = self.entries.write();
        let mut freed: Vec<u32> = entries
            .iter()
            .filter(|(_, owner)| *owner == peer)
            .map(|(index, _)| *index)
            .collect();
        for index in &freed {
            entries.remove(index);
        }
        freed.sort_unstable();
        freed
    }

    /// Number of chunks currently owned by `peer`.
    pub fn in_flight_count(&self, peer: &PeerId) -> usize {
        self.entries
            .read()
            .values()
            .filter(|owner| *owner == peer)
            .count()
    }

    /// Indices owned by `peer`, ascending.
    pub fn chunks_owned_by(&self, peer: &PeerId) -> Vec<u32> {
        let mut owned: Vec<u32> = self
            .entries
            .read()
            .iter()
            .filter(|(_, owner)| *owner == peer)
            .map(|(index, _)| *index)
            .collect();
        owned.sort_unstable();
        owned
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Ordered copy of the registry for observability.
    pub fn snapshot(&self) -> BTreeMap<u32, PeerId> {
        self.entries
            .read()
            .iter()
            .map(|(index, peer)| (*index, peer.clone()))
            .collect()
    }

    /// Chooses an owner for `chunk_index` and registers it under one write lock.
    ///
    /// `choose` sees the per-peer outstanding counts at the moment of the
    /// decision, so concurrent assignments cannot both pass a capacity check
    /// for the same slot.
    pub(crate) fn assign_with<E>(
        &self,
        chunk_index: u32,
        choose: impl FnOnce(&HashMap<PeerId, usize>) -> Result<PeerId, E>,
    ) -> Result<PeerId, E> {
        let mut entries = self.entries.write();

        let mut counts: HashMap<PeerId, usize> = HashMap::new();
        for (index, owner) in entries.iter() {
            // A re-issued chunk does not count against its current owner.
            if *index != chunk_index {
                *counts.entry(owner.clone()).or_default() += 1;
            }
        }

        let chosen = choose(&counts)?;
        entries.insert(chunk_index, chosen.clone());
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_register_overwrites_previous_owner() {
        let registry = AssignmentRegistry::new();
        assert_eq!(registry.register(7, PeerId::new("a")), None);
        assert_eq!(registry.register(7, PeerId::new("b")), Some(PeerId::new("a")));
        assert_eq!(registry.owner(7), Some(PeerId::new("b")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_peer_is_idempotent() {
        let registry = AssignmentRegistry::new();
        registry.register(2, PeerId::new("a"));
        registry.register(1, PeerId::new("a"));
        registry.register(3, PeerId::new("b"));

        assert_eq!(registry.release_peer(&PeerId::new("a")), vec![1, 2]);
        assert!(registry.release_peer(&PeerId::new("a")).is_empty());
        assert_eq!(registry.owner(3), Some(PeerId::new("b")));
    }

    #[test]
    fn test_unregister_if_owner_ignores_other_peers() {
        let registry = AssignmentRegistry::new();
        registry.register(1, PeerId::new("a"));
        assert!(!registry.unregister_if_owner(1, &PeerId::new("b")));
        assert!(registry.unregister_if_owner(1, &PeerId::new("a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_assign_with_excludes_reissued_chunk_from_counts() {
        let registry = AssignmentRegistry::new();
        registry.register(1, PeerId::new("a"));
        registry.register(2, PeerId::new("a"));

        let chosen: Result<PeerId, ()> = registry.assign_with(1, |counts| {
            assert_eq!(counts.get(&PeerId::new("a")), Some(&1));
            Ok(PeerId::new("a"))
        });
        assert_eq!(chosen, Ok(PeerId::new("a")));
        assert_eq!(registry.in_flight_count(&PeerId::new("a")), 2);
    }

    #[test]
    fn test_concurrent_registration_keeps_one_owner_per_chunk() {
        let registry = std::sync::Arc::new(AssignmentRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100u32 {
                        registry.register(i % 10, PeerId::new(format!("p{t}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 10);
    }

    proptest! {
        #[test]
        fn prop_each_chunk_has_at_most_one_owner(
            ops in proptest::collection::vec((0u32..16, 0u8..4, any::<bool>()), 0..200)
        ) {
            let registry = AssignmentRegistry::new();
            let mut model: HashMap<u32, PeerId> = HashMap::new();

            for (index, peer, register) in ops {
                let peer = PeerId::new(format!("p{peer}"));
                if register {
                    registry.register(index, peer.clone());
                    model.insert(index, peer);
                } else {
                    registry.unregister(index);
                    model.remove(&index);
                }
            }

            let snapshot = registry.snapshot();
            prop_assert_eq!(snapshot.len(), model.len());
            for (index, peer) in model {
                prop_assert_eq!(snapshot.get(&index), Some(&peer));
            }
        }
    }
}
