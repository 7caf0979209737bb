//! Atomic, checksummed entity store with an authoritative root index.
//!
//! Layout: `<var>/registry/_INDEX.json`, one directory per entity type, one
//! file per entity named by id. Every mutation writes the entity via
//! temp-file + rename, appends to the registry operation log, and only then
//! rewrites the index atomically. On open, the store reconciles the index
//! against the directory: orphan entity files are re-indexed, stale index
//! entries are dropped, and both are logged as reconciliation events.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{ErrorKind, utc_timestamp};
use crate::io::audit::{AuditSink, RegistryLogRecord, RegistryOp};
use crate::io::paths::VarPaths;
use crate::io::{read_json, write_atomic_json};

/// A single registry entity record (`<registry>/<type>/<id>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub data: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
    pub checksum: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EntityRecord {
    /// SHA-256 hex over the canonical (key-sorted) JSON of the payload.
    pub fn compute_checksum(&self) -> String {
        checksum_of(&self.data)
    }
}

/// SHA-256 hex over the canonical JSON form of an entity payload.
pub fn checksum_of(data: &Map<String, Value>) -> String {
    // serde_json maps are ordered by key, so serialization is canonical.
    let canonical = serde_json::to_string(data).expect("object serialization cannot fail");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Root index of the registry (`_INDEX.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryIndex {
    pub version: String,
    pub last_updated: String,
    /// entity type -> ids present in the store.
    pub entities: BTreeMap<String, Vec<String>>,
    /// "type/id" -> latest stored checksum.
    pub checksums: BTreeMap<String, String>,
}

impl Default for RegistryIndex {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            last_updated: utc_timestamp(),
            entities: BTreeMap::new(),
            checksums: BTreeMap::new(),
        }
    }
}

impl RegistryIndex {
    fn key(entity_type: &str, entity_id: &str) -> String {
        format!("{entity_type}/{entity_id}")
    }

    fn contains(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entities
            .get(entity_type)
            .is_some_and(|ids| ids.iter().any(|id| id == entity_id))
    }

    fn add(&mut self, entity_type: &str, entity_id: &str, checksum: String) {
        let ids = self.entities.entry(entity_type.to_string()).or_default();
        if !ids.iter().any(|id| id == entity_id) {
            ids.push(entity_id.to_string());
            ids.sort();
        }
        self.checksums
            .insert(Self::key(entity_type, entity_id), checksum);
        self.last_updated = utc_timestamp();
    }

    fn remove(&mut self, entity_type: &str, entity_id: &str) {
        if let Some(ids) = self.entities.get_mut(entity_type) {
            ids.retain(|id| id != entity_id);
            if ids.is_empty() {
                self.entities.remove(entity_type);
            }
        }
        self.checksums.remove(&Self::key(entity_type, entity_id));
        self.last_updated = utc_timestamp();
    }

    pub fn checksum(&self, entity_type: &str, entity_id: &str) -> Option<&String> {
        self.checksums.get(&Self::key(entity_type, entity_id))
    }
}

/// Failures surfaced by registry store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity '{entity_id}' of type '{entity_type}' already exists")]
    Duplicate {
        entity_type: String,
        entity_id: String,
    },
    #[error("entity '{entity_id}' of type '{entity_type}' not found")]
    NotFound {
        entity_type: String,
        entity_id: String,
    },
    #[error(
        "checksum mismatch for '{entity_type}/{entity_id}': index {indexed}, computed {computed}"
    )]
    Integrity {
        entity_type: String,
        entity_id: String,
        indexed: String,
        computed: String,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Duplicate { .. } => ErrorKind::DuplicateEntity,
            StoreError::NotFound { .. } => ErrorKind::NotRegistered,
            StoreError::Integrity { .. } => ErrorKind::IntegrityError,
            StoreError::Io(_) => ErrorKind::IoError,
        }
    }
}

/// File-backed key/value store of typed entities.
///
/// The store is the only writer to its directory.
#[derive(Debug)]
pub struct RegistryStore {
    registry_dir: PathBuf,
    index_path: PathBuf,
    audit: AuditSink,
    index: RegistryIndex,
}

impl RegistryStore {
    /// Open the store, loading (or creating) the index and reconciling it
    /// against the files actually present.
    pub fn open(paths: &VarPaths, audit: AuditSink) -> Result<RegistryStore, StoreError> {
        fs::create_dir_all(&paths.registry_dir)
            .with_context(|| format!("create registry dir {}", paths.registry_dir.display()))
            .map_err(StoreError::Io)?;

        let index = if paths.registry_index_path.exists() {
            read_json(&paths.registry_index_path).map_err(StoreError::Io)?
        } else {
            RegistryIndex::default()
        };

        let mut store = RegistryStore {
            registry_dir: paths.registry_dir.clone(),
            index_path: paths.registry_index_path.clone(),
            audit,
            index,
        };
        store.reconcile()?;
        Ok(store)
    }

    /// Register a new entity. An id collision returns
    /// [`StoreError::Duplicate`] without modifying anything.
    pub fn register(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        data: Map<String, Value>,
    ) -> Result<EntityRecord, StoreError> {
        if self.index.contains(entity_type, entity_id)
            || self.entity_path(entity_type, entity_id).exists()
        {
            return Err(StoreError::Duplicate {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }

        let now = utc_timestamp();
        let mut record = EntityRecord {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            data,
            created_at: now.clone(),
            updated_at: now,
            checksum: String::new(),
            metadata: Map::new(),
        };
        record.checksum = record.compute_checksum();

        self.persist(&record, RegistryOp::Created)?;
        Ok(record)
    }

    /// Update an existing entity by merging top-level keys into its payload.
    pub fn update(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        data: Map<String, Value>,
    ) -> Result<EntityRecord, StoreError> {
        let mut record = self.read(entity_type, entity_id)?;
        for (key, value) in data {
            record.data.insert(key, value);
        }
        record.updated_at = utc_timestamp();
        record.checksum = record.compute_checksum();

        self.persist(&record, RegistryOp::Updated)?;
        Ok(record)
    }

    /// Remove an entity from the store and the index.
    pub fn deregister(&mut self, entity_type: &str, entity_id: &str) -> Result<(), StoreError> {
        // Existence check doubles as the NotFound path.
        let _ = self.read(entity_type, entity_id)?;
        let path = self.entity_path(entity_type, entity_id);
        fs::remove_file(&path)
            .with_context(|| format!("remove entity {}", path.display()))
            .map_err(StoreError::Io)?;

        self.audit
            .append_registry(&RegistryLogRecord::now(
                RegistryOp::Deleted,
                entity_type,
                entity_id,
                None,
            ))
            .map_err(StoreError::Io)?;

        self.index.remove(entity_type, entity_id);
        self.save_index()?;
        Ok(())
    }

    /// Read an entity record from disk.
    pub fn read(&self, entity_type: &str, entity_id: &str) -> Result<EntityRecord, StoreError> {
        let path = self.entity_path(entity_type, entity_id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
            });
        }
        read_json(&path).map_err(StoreError::Io)
    }

    /// List all entities of a type, ordered by id.
    ///
    /// Entities indexed but missing on disk are skipped; `open` logs and
    /// repairs such divergence on the next restart.
    pub fn list(&self, entity_type: &str) -> Result<Vec<EntityRecord>, StoreError> {
        let Some(ids) = self.index.entities.get(entity_type) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for id in ids {
            match self.read(entity_type, id) {
                Ok(record) => records.push(record),
                Err(StoreError::NotFound { .. }) => {
                    debug!(entity_type = %entity_type, entity_id = %id, "indexed entity missing on disk");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    /// Recompute an entity's checksum and compare it to the index.
    pub fn verify(&self, entity_type: &str, entity_id: &str) -> Result<(), StoreError> {
        let record = self.read(entity_type, entity_id)?;
        let computed = record.compute_checksum();
        let indexed = self
            .index
            .checksum(entity_type, entity_id)
            .cloned()
            .unwrap_or_default();
        if computed != indexed {
            return Err(StoreError::Integrity {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                indexed,
                computed,
            });
        }
        Ok(())
    }

    /// Current index snapshot.
    pub fn index(&self) -> &RegistryIndex {
        &self.index
    }

    fn entity_path(&self, entity_type: &str, entity_id: &str) -> PathBuf {
        self.registry_dir
            .join(entity_type)
            .join(format!("{entity_id}.json"))
    }

    /// Entity file first, then the log line, then the index. A crash between
    /// the steps is repaired by `reconcile` on the next open.
    fn persist(&mut self, record: &EntityRecord, op: RegistryOp) -> Result<(), StoreError> {
        let path = self.entity_path(&record.entity_type, &record.entity_id);
        write_atomic_json(&path, record).map_err(StoreError::Io)?;

        self.audit
            .append_registry(&RegistryLogRecord::now(
                op,
                &record.entity_type,
                &record.entity_id,
                Some(record.checksum.clone()),
            ))
            .map_err(StoreError::Io)?;

        self.index
            .add(&record.entity_type, &record.entity_id, record.checksum.clone());
        self.save_index()
    }

    fn save_index(&self) -> Result<(), StoreError> {
        write_atomic_json(&self.index_path, &self.index).map_err(StoreError::Io)
    }

    /// Bring the index in line with the files actually present.
    fn reconcile(&mut self) -> Result<(), StoreError> {
        let mut changed = false;

        // Orphan entity files: present on disk, absent from the index.
        for (entity_type, entity_id, path) in self.scan_entity_files()? {
            if self.index.contains(&entity_type, &entity_id) {
                continue;
            }
            let record: EntityRecord = read_json(&path).map_err(StoreError::Io)?;
            let checksum = record.compute_checksum();
            warn!(entity_type = %entity_type, entity_id = %entity_id, "re-indexing orphan entity file");
            self.audit
                .append_registry(&RegistryLogRecord::now(
                    RegistryOp::ReconciledOrphan,
                    &entity_type,
                    &entity_id,
                    Some(checksum.clone()),
                ))
                .map_err(StoreError::Io)?;
            self.index.add(&entity_type, &entity_id, checksum);
            changed = true;
        }

        // Stale index entries: indexed but missing on disk.
        let mut stale = Vec::new();
        for (entity_type, ids) in &self.index.entities {
            for id in ids {
                if !self.entity_path(entity_type, id).exists() {
                    stale.push((entity_type.clone(), id.clone()));
                }
            }
        }
        for (entity_type, entity_id) in stale {
            warn!(entity_type = %entity_type, entity_id = %entity_id, "dropping stale index entry");
            self.audit
                .append_registry(&RegistryLogRecord::now(
                    RegistryOp::ReconciledStale,
                    &entity_type,
                    &entity_id,
                    None,
                ))
                .map_err(StoreError::Io)?;
            self.index.remove(&entity_type, &entity_id);
            changed = true;
        }

        if changed {
            self.save_index()?;
        }
        Ok(())
    }

    fn scan_entity_files(&self) -> Result<Vec<(String, String, PathBuf)>, StoreError> {
        let mut found = Vec::new();
        let entries = fs::read_dir(&self.registry_dir)
            .with_context(|| format!("read registry dir {}", self.registry_dir.display()))
            .map_err(StoreError::Io)?;
        for entry in entries.flatten() {
            let type_dir = entry.path();
            if !type_dir.is_dir() {
                continue;
            }
            let entity_type = entry.file_name().to_string_lossy().to_string();
            let files = fs::read_dir(&type_dir)
                .with_context(|| format!("read type dir {}", type_dir.display()))
                .map_err(StoreError::Io)?;
            for file in files.flatten() {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == "json")
                    && let Some(stem) = path.file_stem()
                {
                    found.push((entity_type.clone(), stem.to_string_lossy().to_string(), path));
                }
            }
        }
        found.sort();
        Ok(found)
    }
}
