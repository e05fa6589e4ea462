//! JSON-file secret store
//!
//! The whole store is one JSON snapshot guarded by a mutex. Every mutation
//! rewrites the snapshot to a temporary file and renames it over the old
//! one, so a crash leaves either the old or the new state on disk.

use super::{check_group_key_overwrite, DeRecord, DeStatus, GroupKey, SecretStore};
use crate::keygen::DkgSecrets;
use crate::sign::{DePublic, DeSecret};
use crate::{Error, GroupId, Result, SigningId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    dkg: BTreeMap<GroupId, DkgSecrets>,
    des: BTreeMap<String, DeRecord>,
    keys: BTreeMap<GroupId, GroupKey>,
}

/// Secret store persisted as a single JSON file
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let json = fs::read_to_string(&path)?;
            serde_json::from_str(&json)?
        } else {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            Snapshot::default()
        };

        info!(path = %path.display(), "Opened secret store");
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Snapshot>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("secret store lock poisoned".into()))
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "Secret store persisted");
        Ok(())
    }
}

impl SecretStore for FileStore {
    fn put_dkg(&self, secrets: DkgSecrets) -> Result<()> {
        let mut state = self.lock()?;
        let group_id = secrets.group_id;
        if state.dkg.contains_key(&group_id) {
            return Err(Error::DuplicateSubmission(format!("DKG secrets for group {}", group_id)));
        }
        state.dkg.insert(group_id, secrets);
        if let Err(e) = self.persist(&state) {
            state.dkg.remove(&group_id);
            return Err(e);
        }
        Ok(())
    }

    fn dkg(&self, group_id: GroupId) -> Result<Option<DkgSecrets>> {
        Ok(self.lock()?.dkg.get(&group_id).cloned())
    }

    fn delete_dkg(&self, group_id: GroupId) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(secrets) = state.dkg.remove(&group_id) {
            if let Err(e) = self.persist(&state) {
                state.dkg.insert(group_id, secrets);
                return Err(e);
            }
        }
        Ok(())
    }

    fn insert_des(&self, des: Vec<DeSecret>) -> Result<Vec<DePublic>> {
        let mut state = self.lock()?;
        let mut publics = Vec::with_capacity(des.len());
        for secret in des {
            let record = DeRecord::new(secret);
            publics.push(record.public.clone());
            state.des.insert(record.public.key(), record);
        }
        if let Err(e) = self.persist(&state) {
            for public in &publics {
                state.des.remove(&public.key());
            }
            return Err(e);
        }
        publics.sort_by_key(|public| public.key());
        Ok(publics)
    }

    fn unpublished_des(&self) -> Result<Vec<DePublic>> {
        // BTreeMap keys keep the pairs ordered
        Ok(self
            .lock()?
            .des
            .values()
            .filter(|record| record.is_pending())
            .map(|record| record.public.clone())
            .collect())
    }

    fn mark_published(&self, des: &[DePublic]) -> Result<()> {
        let mut state = self.lock()?;
        let mut marked = Vec::with_capacity(des.len());
        for public in des {
            let key = public.key();
            let record = state
                .des
                .get_mut(&key)
                .ok_or_else(|| Error::NotFound(format!("nonce pair {}", key)))?;
            if !record.published {
                record.published = true;
                marked.push(key);
            }
        }
        if marked.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.persist(&state) {
            for key in &marked {
                if let Some(record) = state.des.get_mut(key) {
                    record.published = false;
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn consume_de(&self, public: &DePublic, signing_id: SigningId) -> Result<DeSecret> {
        let mut state = self.lock()?;
        let record = state
            .des
            .get_mut(&public.key())
            .ok_or_else(|| Error::NotFound(format!("nonce pair {}", public.key())))?;
        let secret = record.consume(signing_id)?;
        // The consumed marker must reach disk before the secret is used. On
        // failure the pair stays consumed in memory and is never handed out.
        self.persist(&state)?;
        Ok(secret)
    }

    fn unused_de_count(&self) -> Result<usize> {
        Ok(self
            .lock()?
            .des
            .values()
            .filter(|record| record.is_available())
            .count())
    }

    fn des(&self) -> Result<Vec<(DePublic, DeStatus)>> {
        Ok(self
            .lock()?
            .des
            .values()
            .map(|record| (record.public.clone(), record.status))
            .collect())
    }

    fn set_group_key(&self, key: GroupKey) -> Result<()> {
        let mut state = self.lock()?;
        let group_id = key.group_id;
        if let Some(existing) = state.keys.get(&group_id) {
            return Err(check_group_key_overwrite(existing, &key));
        }
        state.keys.insert(group_id, key);
        if let Err(e) = self.persist(&state) {
            state.keys.remove(&group_id);
            return Err(e);
        }
        Ok(())
    }

    fn group_key(&self, group_id: GroupId) -> Result<Option<GroupKey>> {
        Ok(self.lock()?.keys.get(&group_id).cloned())
    }

    fn group_ids(&self) -> Result<Vec<GroupId>> {
        Ok(self.lock()?.keys.keys().copied().collect())
    }
}
