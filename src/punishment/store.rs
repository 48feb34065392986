//! Durable punishment store
//!
//! Maps (guild, member) to the active punishment record and flushes the
//! whole set to a schema-versioned YAML file. The store is pure data
//! plumbing: it never makes platform calls and is written only by the
//! lifecycle manager.

use crate::punishment::error::{PunishError, PunishResult};
use crate::punishment::record::{PunishKey, PunishmentRecord};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Current on-disk schema version
pub const SCHEMA_VERSION: u32 = 2;

/// On-disk layout: one record set per guild, keyed by member id, plus a
/// top-level schema stamp for the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    guilds: HashMap<u64, HashMap<u64, PunishmentRecord>>,
    // Members whose record is gone but who still owe a voice unmute
    #[serde(default)]
    pending_unmutes: Vec<PunishKey>,
}

/// In-memory view of the punishment set with YAML persistence
pub struct PunishmentStore {
    path: PathBuf,
    records: DashMap<PunishKey, PunishmentRecord>,
    pending_unmutes: DashSet<PunishKey>,
}

impl PunishmentStore {
    /// Create an empty store backed by `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: DashMap::new(),
            pending_unmutes: DashSet::new(),
        }
    }

    #[must_use]
    pub fn get(&self, key: PunishKey) -> Option<PunishmentRecord> {
        self.records.get(&key).map(|entry| entry.value().clone())
    }

    pub fn put(&self, key: PunishKey, record: PunishmentRecord) {
        self.records.insert(key, record);
    }

    pub fn delete(&self, key: PunishKey) -> Option<PunishmentRecord> {
        self.records.remove(&key).map(|(_, record)| record)
    }

    /// Snapshot of every stored punishment
    #[must_use]
    pub fn all(&self) -> Vec<(PunishKey, PunishmentRecord)> {
        self.records
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Note that a voice unmute is still owed for `key` even though its
    /// record is gone
    pub fn add_pending_unmute(&self, key: PunishKey) {
        self.pending_unmutes.insert(key);
    }

    /// Claim the owed unmute for `key`. Returns true at most once per
    /// owed unmute.
    pub fn take_pending_unmute(&self, key: PunishKey) -> bool {
        self.pending_unmutes.remove(&key).is_some()
    }

    /// Snapshot of members still owed a voice unmute
    #[must_use]
    pub fn pending_unmutes(&self) -> Vec<PunishKey> {
        self.pending_unmutes.iter().map(|entry| *entry.key()).collect()
    }

    /// Restore the store from disk, upgrading older schema versions in
    /// place. A missing file starts empty; an unreadable file or one
    /// stamped with a newer schema resets the store with a logged warning.
    pub async fn load(&self) -> PunishResult<()> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No punishment store on disk, starting empty");
                return Ok(());
            }
            Err(e) => return Err(PunishError::Store(e.to_string())),
        };

        let file: StoreFile = match serde_yaml::from_str(&contents) {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Punishment store is unreadable, resetting to empty"
                );
                self.records.clear();
                self.pending_unmutes.clear();
                return Ok(());
            }
        };

        if file.schema_version > SCHEMA_VERSION {
            warn!(
                found = file.schema_version,
                expected = SCHEMA_VERSION,
                "Punishment store written by a newer schema, resetting to empty"
            );
            self.records.clear();
            self.pending_unmutes.clear();
            return Ok(());
        }
        if file.schema_version < SCHEMA_VERSION {
            // Missing fields defaulted during deserialization; restamped
            // on the next persist.
            warn!(
                found = file.schema_version,
                expected = SCHEMA_VERSION,
                "Upgrading punishment store schema in place"
            );
        }

        self.records.clear();
        for (guild_id, members) in file.guilds {
            for (user_id, record) in members {
                self.records
                    .insert(PunishKey::new(guild_id, user_id), record);
            }
        }
        self.pending_unmutes.clear();
        for key in file.pending_unmutes {
            self.pending_unmutes.insert(key);
        }

        info!(
            path = %self.path.display(),
            records = self.records.len(),
            "Punishment store loaded"
        );
        Ok(())
    }

    /// Flush the full record set to disk (write-then-rename, single writer)
    pub async fn persist(&self) -> PunishResult<()> {
        let mut guilds: HashMap<u64, HashMap<u64, PunishmentRecord>> = HashMap::new();
        for entry in self.records.iter() {
            guilds
                .entry(entry.key().guild_id)
                .or_default()
                .insert(entry.key().user_id, entry.value().clone());
        }

        let file = StoreFile {
            schema_version: SCHEMA_VERSION,
            guilds,
            pending_unmutes: self.pending_unmutes.iter().map(|entry| *entry.key()).collect(),
        };
        let yaml = serde_yaml::to_string(&file).map_err(|e| PunishError::Store(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PunishError::Store(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, yaml)
            .await
            .map_err(|e| PunishError::Store(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| PunishError::Store(e.to_string()))?;

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
