//! In-memory secret store

use super::{check_group_key_overwrite, DeRecord, DeStatus, GroupKey, SecretStore};
use crate::keygen::DkgSecrets;
use crate::sign::{DePublic, DeSecret};
use crate::{Error, GroupId, Result, SigningId};
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::debug;

/// Secret store backed by concurrent maps
///
/// Each entry is guarded by its shard lock, which makes nonce consumption
/// atomic without a global lock.
#[derive(Default)]
pub struct MemoryStore {
    dkg: DashMap<GroupId, DkgSecrets>,
    des: DashMap<String, DeRecord>,
    keys: DashMap<GroupId, GroupKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn put_dkg(&self, secrets: DkgSecrets) -> Result<()> {
        match self.dkg.entry(secrets.group_id) {
            Entry::Occupied(_) => Err(Error::DuplicateSubmission(format!(
                "DKG secrets for group {}",
                secrets.group_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(secrets);
                Ok(())
            }
        }
    }

    fn dkg(&self, group_id: GroupId) -> Result<Option<DkgSecrets>> {
        Ok(self.dkg.get(&group_id).map(|entry| entry.value().clone()))
    }

    fn delete_dkg(&self, group_id: GroupId) -> Result<()> {
        self.dkg.remove(&group_id);
        Ok(())
    }

    fn insert_des(&self, des: Vec<DeSecret>) -> Result<Vec<DePublic>> {
        let mut publics = Vec::with_capacity(des.len());
        for secret in des {
            let record = DeRecord::new(secret);
            publics.push(record.public.clone());
            self.des.insert(record.public.key(), record);
        }
        publics.sort_by_key(|public| public.key());
        debug!(count = publics.len(), "Stored nonce pairs");
        Ok(publics)
    }

    fn unpublished_des(&self) -> Result<Vec<DePublic>> {
        let mut pending: Vec<DePublic> = self
            .des
            .iter()
            .filter(|entry| entry.is_pending())
            .map(|entry| entry.public.clone())
            .collect();
        pending.sort_by_key(|public| public.key());
        Ok(pending)
    }

    fn mark_published(&self, des: &[DePublic]) -> Result<()> {
        for public in des {
            let mut record = self
                .des
                .get_mut(&public.key())
                .ok_or_else(|| Error::NotFound(format!("nonce pair {}", public.key())))?;
            record.published = true;
        }
        Ok(())
    }

    fn consume_de(&self, public: &DePublic, signing_id: SigningId) -> Result<DeSecret> {
        let mut record = self
            .des
            .get_mut(&public.key())
            .ok_or_else(|| Error::NotFound(format!("nonce pair {}", public.key())))?;
        record.consume(signing_id)
    }

    fn unused_de_count(&self) -> Result<usize> {
        Ok(self
            .des
            .iter()
            .filter(|entry| entry.is_available())
            .count())
    }

    fn des(&self) -> Result<Vec<(DePublic, DeStatus)>> {
        Ok(self
            .des
            .iter()
            .map(|entry| (entry.public.clone(), entry.status))
            .collect())
    }

    fn set_group_key(&self, key: GroupKey) -> Result<()> {
        match self.keys.entry(key.group_id) {
            Entry::Occupied(existing) => Err(check_group_key_overwrite(existing.get(), &key)),
            Entry::Vacant(slot) => {
                slot.insert(key);
                Ok(())
            }
        }
    }

    fn group_key(&self, group_id: GroupId) -> Result<Option<GroupKey>> {
        Ok(self.keys.get(&group_id).map(|entry| entry.value().clone()))
    }

    fn group_ids(&self) -> Result<Vec<GroupId>> {
        let mut ids: Vec<GroupId> = self.keys.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::exercise;
    use rand::rngs::OsRng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_memory_store_contract() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_concurrent_consumption_hands_out_each_pair_once() {
        let store = Arc::new(MemoryStore::new());
        let publics = store
            .insert_des((0..8).map(|_| DeSecret::generate(&mut OsRng)).collect())
            .unwrap();
        store.mark_published(&publics).unwrap();
        assert_eq!(store.unused_de_count().unwrap(), 8);

        let successes = AtomicUsize::new(0);
        let reuses = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for worker in 0..16u64 {
                let store = Arc::clone(&store);
                let publics = &publics;
                let successes = &successes;
                let reuses = &reuses;
                scope.spawn(move || {
                    for public in publics {
                        match store.consume_de(public, SigningId(worker)) {
                            Ok(_) => {
                                successes.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(Error::NonceReuse(_)) => {
                                reuses.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) => panic!("unexpected error {}", e),
                        }
                    }
                });
            }
        });

        assert_eq!(successes.load(Ordering::SeqCst), 8);
        assert_eq!(reuses.load(Ordering::SeqCst), 8 * 15);
        assert_eq!(store.unused_de_count().unwrap(), 0);
    }
}
