//! Persistent shard map store backed by redb.
//!
//! Every mutation runs in a single write transaction. Rows carry a version
//! counter: a mutation reads the row, checks the version against the copy
//! the caller holds, writes the new row with the next version and commits.
//! A mismatch aborts the transaction with `ConcurrencyConflict`, so two
//! writers touching different rows both succeed while two writers racing on
//! the same row produce exactly one winner.

use crate::snapshot::ShardMapSnapshot;
use crate::tables::{self, map_prefix, row_key};
use crate::types::{FORMAT_VERSION, MappingVersion, StoredManager, StoredMapping};
use redb::{Database, ReadTransaction, ReadableTable, Table, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardmap_common::{
    Error, Mapping, MappingId, MappingStatus, Range, Result, SchemaInfo, Shard, ShardId, ShardKey,
    ShardLocation, ShardMapInfo, ShardStatus,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANAGER_KEY: &str = "manager";

/// Error type for metadata store internals
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Domain(#[from] Error),
}

impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Domain(e) => e,
            StoreError::Bincode(e) => Self::Serialization(e.to_string()),
            StoreError::Io(e) => Self::Io(e),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

type RowTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Durable repository of shard maps, shards and range mappings
pub struct ShardMapStore {
    db: Database,
    path: PathBuf,
}

impl ShardMapStore {
    /// Check whether a store file exists at `path`
    #[must_use]
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(StoreError::from)?;
        let store = Self {
            db,
            path: path.to_path_buf(),
        };

        // Create all tables eagerly so later read txns don't fail
        store.write(|txn| {
            let _t = txn.open_table(tables::MANAGER)?;
            let _t = txn.open_table(tables::SHARD_MAPS)?;
            let _t = txn.open_table(tables::SHARDS)?;
            let _t = txn.open_table(tables::MAPPINGS)?;
            let _t = txn.open_table(tables::SCHEMA_INFO)?;
            Ok(())
        })?;

        debug!("Opened shard map store at {}", path.display());
        Ok(store)
    }

    /// Location of the store file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---- Manager ----

    /// Mark the store as an initialized shard map manager. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        self.write(|txn| {
            let mut manager = txn.open_table(tables::MANAGER)?;
            if get_row::<StoredManager>(&manager, MANAGER_KEY)?.is_none() {
                put_row(
                    &mut manager,
                    MANAGER_KEY,
                    &StoredManager {
                        format_version: FORMAT_VERSION,
                    },
                )?;
                info!("Initialized shard map manager store");
            }
            Ok(())
        })
    }

    pub fn is_initialized(&self) -> Result<bool> {
        self.read(|txn| {
            let manager = txn.open_table(tables::MANAGER)?;
            Ok(get_row::<StoredManager>(&manager, MANAGER_KEY)?.is_some())
        })
    }

    // ---- Shard maps ----

    /// Create a shard map for key type `K`
    pub fn create_shard_map<K: ShardKey>(&self, name: &str) -> Result<ShardMapInfo> {
        self.write(|txn| {
            require_initialized(&txn.open_table(tables::MANAGER)?)?;
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            if get_row::<ShardMapInfo>(&maps, name)?.is_some() {
                return Err(Error::ShardMapAlreadyExists(name.to_string()).into());
            }
            insert_map::<K>(&mut maps, name)
        })
    }

    /// Return the shard map if it exists, otherwise create it
    pub fn get_or_create_shard_map<K: ShardKey>(&self, name: &str) -> Result<ShardMapInfo> {
        self.write(|txn| {
            require_initialized(&txn.open_table(tables::MANAGER)?)?;
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            match get_row::<ShardMapInfo>(&maps, name)? {
                Some(info) => {
                    check_key_type::<K>(&info)?;
                    Ok(info)
                }
                None => insert_map::<K>(&mut maps, name),
            }
        })
    }

    pub fn get_shard_map(&self, name: &str) -> Result<Option<ShardMapInfo>> {
        self.read(|txn| {
            let maps = txn.open_table(tables::SHARD_MAPS)?;
            get_row(&maps, name)
        })
    }

    pub fn list_shard_maps(&self) -> Result<Vec<ShardMapInfo>> {
        self.read(|txn| {
            let maps = txn.open_table(tables::SHARD_MAPS)?;
            Ok(scan_prefix::<ShardMapInfo>(&maps, "")?
                .into_iter()
                .map(|(_, info)| info)
                .collect())
        })
    }

    /// Delete a shard map with all of its shards, mappings and schema info
    pub fn delete_shard_map(&self, name: &str) -> Result<()> {
        self.write(|txn| {
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            let manager = txn.open_table(tables::MANAGER)?;
            require_map(&maps, &manager, name)?;

            let prefix = map_prefix(name);
            let mut shards = txn.open_table(tables::SHARDS)?;
            remove_prefix(&mut shards, &prefix)?;
            let mut mappings = txn.open_table(tables::MAPPINGS)?;
            remove_prefix(&mut mappings, &prefix)?;
            let mut schema = txn.open_table(tables::SCHEMA_INFO)?;
            schema.remove(name)?;
            maps.remove(name)?;
            Ok(())
        })?;
        info!("Deleted shard map '{}'", name);
        Ok(())
    }

    // ---- Shards ----

    /// Register a shard with no mapping
    pub fn add_shard(&self, map: &str, location: ShardLocation) -> Result<Shard> {
        let shard = self.write(|txn| {
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
            let mut shards = txn.open_table(tables::SHARDS)?;
            let shard = insert_shard(&mut shards, map, location)?;
            bump_map(&mut maps, info)?;
            Ok(shard)
        })?;
        info!("Added shard {} at {} to '{}'", shard.id, shard.location, map);
        Ok(shard)
    }

    /// Register a shard and its first mapping in one transaction
    pub fn add_shard_with_mapping<K: ShardKey>(
        &self,
        map: &str,
        location: ShardLocation,
        range: Range<K>,
    ) -> Result<(Shard, Mapping<K>)> {
        let (shard, mapping) = self.write(|txn| {
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
            check_key_type::<K>(&info)?;

            let mut mappings = txn.open_table(tables::MAPPINGS)?;
            check_overlap(&mappings, map, &range)?;
            let mut shards = txn.open_table(tables::SHARDS)?;
            let shard = insert_shard(&mut shards, map, location)?;
            let mapping = insert_mapping(&mut mappings, map, range, shard.id)?;
            bump_map(&mut maps, info)?;
            Ok((shard, mapping))
        })?;
        info!(
            "Added shard {} at {} with range {} to '{}'",
            shard.id, shard.location, mapping.range, map
        );
        Ok((shard, mapping))
    }

    /// Remove a shard. Fails with `ShardNotEmpty` while any mapping
    /// references it and with `ConcurrencyConflict` if the shard changed
    /// since `shard` was read.
    pub fn remove_shard(&self, map: &str, shard: &Shard) -> Result<()> {
        self.write(|txn| {
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
            let mut shards = txn.open_table(tables::SHARDS)?;
            let key = row_key(map, shard.id);
            let Some(current) = get_row::<Shard>(&shards, &key)? else {
                return Err(conflict("shard", shard.id, shard.version, None));
            };

            let mappings = txn.open_table(tables::MAPPINGS)?;
            let referencing = scan_prefix::<StoredMapping>(&mappings, &map_prefix(map))?
                .into_iter()
                .filter(|(_, m)| m.shard_id == shard.id)
                .count();
            if referencing > 0 {
                return Err(Error::ShardNotEmpty {
                    shard_id: shard.id,
                    location: current.location.to_string(),
                    mappings: referencing,
                }
                .into());
            }
            if current.version != shard.version {
                return Err(conflict(
                    "shard",
                    shard.id,
                    shard.version,
                    Some(current.version),
                ));
            }

            shards.remove(key.as_str())?;
            bump_map(&mut maps, info)?;
            Ok(())
        })
        .inspect_err(warn_conflict)?;
        info!("Removed shard {} at {} from '{}'", shard.id, shard.location, map);
        Ok(())
    }

    /// Change a shard's status, compare-and-swap on its version
    pub fn set_shard_status(&self, map: &str, shard: &Shard, status: ShardStatus) -> Result<Shard> {
        let updated = self
            .write(|txn| {
                let mut maps = txn.open_table(tables::SHARD_MAPS)?;
                let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
                let mut shards = txn.open_table(tables::SHARDS)?;
                let key = row_key(map, shard.id);
                let current = get_row::<Shard>(&shards, &key)?;
                let mut current = match current {
                    Some(c) if c.version == shard.version => c,
                    other => {
                        return Err(conflict(
                            "shard",
                            shard.id,
                            shard.version,
                            other.map(|c| c.version),
                        ));
                    }
                };
                current.status = status;
                current.version += 1;
                put_row(&mut shards, &key, &current)?;
                bump_map(&mut maps, info)?;
                Ok(current)
            })
            .inspect_err(warn_conflict)?;
        debug!("Shard {} is now {:?}", updated.id, updated.status);
        Ok(updated)
    }

    pub fn get_shards(&self, map: &str) -> Result<Vec<Shard>> {
        self.read(|txn| {
            require_map(
                &txn.open_table(tables::SHARD_MAPS)?,
                &txn.open_table(tables::MANAGER)?,
                map,
            )?;
            let shards = txn.open_table(tables::SHARDS)?;
            Ok(scan_prefix::<Shard>(&shards, &map_prefix(map))?
                .into_iter()
                .map(|(_, shard)| shard)
                .collect())
        })
    }

    pub fn get_shard(&self, map: &str, id: ShardId) -> Result<Option<Shard>> {
        self.read(|txn| {
            let shards = txn.open_table(tables::SHARDS)?;
            get_row(&shards, &row_key(map, id))
        })
    }

    // ---- Mappings ----

    /// Map `range` to an existing shard. Fails with `RangeOverlap` if the
    /// range intersects any existing mapping.
    pub fn add_mapping<K: ShardKey>(
        &self,
        map: &str,
        range: Range<K>,
        shard_id: ShardId,
    ) -> Result<Mapping<K>> {
        let mapping = self.write(|txn| {
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
            check_key_type::<K>(&info)?;

            let shards = txn.open_table(tables::SHARDS)?;
            if get_row::<Shard>(&shards, &row_key(map, shard_id))?.is_none() {
                return Err(Error::ShardNotFound(shard_id).into());
            }
            let mut mappings = txn.open_table(tables::MAPPINGS)?;
            check_overlap(&mappings, map, &range)?;
            let mapping = insert_mapping(&mut mappings, map, range, shard_id)?;
            bump_map(&mut maps, info)?;
            Ok(mapping)
        })?;
        info!(
            "Mapped {} to shard {} in '{}'",
            mapping.range, mapping.shard_id, map
        );
        Ok(mapping)
    }

    /// Remove a mapping, compare-and-swap on its version
    pub fn remove_mapping<K: ShardKey>(&self, map: &str, mapping: &Mapping<K>) -> Result<()> {
        self.write(|txn| {
            let mut maps = txn.open_table(tables::SHARD_MAPS)?;
            let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
            let mut mappings = txn.open_table(tables::MAPPINGS)?;
            let key = row_key(map, mapping.id);
            let current = get_row::<StoredMapping>(&mappings, &key)?;
            match current {
                Some(c) if c.version == mapping.version => {}
                other => {
                    return Err(conflict(
                        "mapping",
                        mapping.id,
                        mapping.version,
                        other.map(|c| c.version),
                    ));
                }
            }
            mappings.remove(key.as_str())?;
            bump_map(&mut maps, info)?;
            Ok(())
        })
        .inspect_err(warn_conflict)?;
        info!("Removed mapping {} {} from '{}'", mapping.id, mapping.range, map);
        Ok(())
    }

    /// Change a mapping's status, compare-and-swap on its version
    pub fn set_mapping_status<K: ShardKey>(
        &self,
        map: &str,
        mapping: &Mapping<K>,
        status: MappingStatus,
    ) -> Result<Mapping<K>> {
        let updated = self
            .write(|txn| {
                let mut maps = txn.open_table(tables::SHARD_MAPS)?;
                let info = require_map(&maps, &txn.open_table(tables::MANAGER)?, map)?;
                let mut mappings = txn.open_table(tables::MAPPINGS)?;
                let key = row_key(map, mapping.id);
                let current = get_row::<StoredMapping>(&mappings, &key)?;
                let mut current = match current {
                    Some(c) if c.version == mapping.version => c,
                    other => {
                        return Err(conflict(
                            "mapping",
                            mapping.id,
                            mapping.version,
                            other.map(|c| c.version),
                        ));
                    }
                };
                current.status = status;
                current.version += 1;
                put_row(&mut mappings, &key, &current)?;
                bump_map(&mut maps, info)?;
                current.decode::<K>()
            })
            .inspect_err(warn_conflict)?;
        debug!(
            "Mapping {} {} is now {:?}",
            updated.id, updated.range, updated.status
        );
        Ok(updated)
    }

    /// Mark a mapping unavailable for routing before changing it
    pub fn take_mapping_offline<K: ShardKey>(
        &self,
        map: &str,
        mapping: &Mapping<K>,
    ) -> Result<Mapping<K>> {
        self.set_mapping_status(map, mapping, MappingStatus::Offline)
    }

    /// Make a mapping routable again
    pub fn bring_mapping_online<K: ShardKey>(
        &self,
        map: &str,
        mapping: &Mapping<K>,
    ) -> Result<Mapping<K>> {
        self.set_mapping_status(map, mapping, MappingStatus::Online)
    }

    /// All mappings of a shard map, sorted by low key
    pub fn get_mappings<K: ShardKey>(&self, map: &str) -> Result<Vec<Mapping<K>>> {
        self.read(|txn| {
            let info = require_map(
                &txn.open_table(tables::SHARD_MAPS)?,
                &txn.open_table(tables::MANAGER)?,
                map,
            )?;
            check_key_type::<K>(&info)?;
            let mut mappings = load_mappings::<K>(&txn.open_table(tables::MAPPINGS)?, map)?;
            mappings.sort_by(|a, b| a.range.low().cmp(b.range.low()));
            Ok(mappings)
        })
    }

    pub fn get_mapping<K: ShardKey>(&self, map: &str, id: MappingId) -> Result<Option<Mapping<K>>> {
        self.read(|txn| {
            let mappings = txn.open_table(tables::MAPPINGS)?;
            get_row::<StoredMapping>(&mappings, &row_key(map, id))?
                .map(|m| m.decode::<K>())
                .transpose()
        })
    }

    /// Current version and status of a mapping, `None` if it was removed
    pub fn mapping_version(&self, map: &str, id: MappingId) -> Result<Option<MappingVersion>> {
        self.read(|txn| {
            let mappings = txn.open_table(tables::MAPPINGS)?;
            Ok(
                get_row::<StoredMapping>(&mappings, &row_key(map, id))?.map(|m| MappingVersion {
                    version: m.version,
                    status: m.status,
                }),
            )
        })
    }

    /// Read shards, mappings and schema info of a shard map in one
    /// transaction
    pub fn load_snapshot<K: ShardKey>(&self, map: &str) -> Result<ShardMapSnapshot<K>> {
        self.read(|txn| {
            let info = require_map(
                &txn.open_table(tables::SHARD_MAPS)?,
                &txn.open_table(tables::MANAGER)?,
                map,
            )?;
            check_key_type::<K>(&info)?;
            let prefix = map_prefix(map);
            let shards = scan_prefix::<Shard>(&txn.open_table(tables::SHARDS)?, &prefix)?
                .into_iter()
                .map(|(_, shard)| shard)
                .collect();
            let mappings = load_mappings::<K>(&txn.open_table(tables::MAPPINGS)?, map)?;
            let schema = get_row::<SchemaInfo>(&txn.open_table(tables::SCHEMA_INFO)?, map)?;
            Ok(ShardMapSnapshot::new(info, shards, mappings, schema))
        })
    }

    // ---- Schema info ----

    pub fn put_schema_info(&self, map: &str, schema: &SchemaInfo) -> Result<()> {
        self.write(|txn| {
            require_map(
                &txn.open_table(tables::SHARD_MAPS)?,
                &txn.open_table(tables::MANAGER)?,
                map,
            )?;
            put_row(&mut txn.open_table(tables::SCHEMA_INFO)?, map, schema)
        })?;
        debug!("Stored schema info for '{}'", map);
        Ok(())
    }

    pub fn get_schema_info(&self, map: &str) -> Result<Option<SchemaInfo>> {
        self.read(|txn| get_row(&txn.open_table(tables::SCHEMA_INFO)?, map))
    }

    // ---- Teardown ----

    /// Remove every row, including the manager marker
    pub fn clear(&self) -> Result<()> {
        self.write(|txn| {
            for table_def in [
                tables::MANAGER,
                tables::SHARD_MAPS,
                tables::SHARDS,
                tables::MAPPINGS,
                tables::SCHEMA_INFO,
            ] {
                remove_prefix(&mut txn.open_table(table_def)?, "")?;
            }
            Ok(())
        })?;
        warn!("Cleared shard map store at {}", self.path.display());
        Ok(())
    }

    // ---- Transaction helpers ----

    fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> StoreResult<T>) -> Result<T> {
        let txn = self.db.begin_write().map_err(StoreError::from)?;
        // Dropping an uncommitted transaction aborts it
        let value = f(&txn)?;
        txn.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StoreResult<T>) -> Result<T> {
        let txn = self.db.begin_read().map_err(StoreError::from)?;
        Ok(f(&txn)?)
    }
}

// ---- Row helpers ----

fn get_row<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StoreResult<Option<T>> {
    match table.get(key)? {
        Some(val) => Ok(Some(bincode::deserialize(val.value())?)),
        None => Ok(None),
    }
}

fn put_row<T: Serialize + ?Sized>(table: &mut RowTable<'_>, key: &str, value: &T) -> StoreResult<()> {
    let bytes = bincode::serialize(value)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

fn scan_prefix<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> StoreResult<Vec<(String, T)>> {
    let mut result = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        let key = entry.0.value();
        if key.starts_with(prefix) {
            result.push((key.to_string(), bincode::deserialize(entry.1.value())?));
        }
    }
    Ok(result)
}

fn remove_prefix(table: &mut RowTable<'_>, prefix: &str) -> StoreResult<usize> {
    // Collect keys first, then delete
    let mut keys = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        let key = entry.0.value();
        if key.starts_with(prefix) {
            keys.push(key.to_string());
        }
    }
    for key in &keys {
        table.remove(key.as_str())?;
    }
    Ok(keys.len())
}

fn load_mappings<K: ShardKey>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    map: &str,
) -> StoreResult<Vec<Mapping<K>>> {
    scan_prefix::<StoredMapping>(table, &map_prefix(map))?
        .into_iter()
        .map(|(_, stored)| stored.decode::<K>())
        .collect()
}

// ---- Invariant helpers ----

fn require_initialized(manager: &impl ReadableTable<&'static str, &'static [u8]>) -> StoreResult<()> {
    if get_row::<StoredManager>(manager, MANAGER_KEY)?.is_none() {
        return Err(Error::ShardMapManagerNotInitialized.into());
    }
    Ok(())
}

fn require_map(
    maps: &impl ReadableTable<&'static str, &'static [u8]>,
    manager: &impl ReadableTable<&'static str, &'static [u8]>,
    map: &str,
) -> StoreResult<ShardMapInfo> {
    if let Some(info) = get_row::<ShardMapInfo>(maps, map)? {
        return Ok(info);
    }
    require_initialized(manager)?;
    Err(Error::ShardMapNotFound(map.to_string()).into())
}

fn check_key_type<K: ShardKey>(info: &ShardMapInfo) -> StoreResult<()> {
    if info.key_type != K::KEY_TYPE {
        return Err(Error::KeyTypeMismatch {
            map: info.name.clone(),
            expected: info.key_type.clone(),
            actual: K::KEY_TYPE.to_string(),
        }
        .into());
    }
    Ok(())
}

fn check_overlap<K: ShardKey>(
    mappings: &impl ReadableTable<&'static str, &'static [u8]>,
    map: &str,
    range: &Range<K>,
) -> StoreResult<()> {
    for existing in load_mappings::<K>(mappings, map)? {
        if existing.range.intersects(range) {
            return Err(Error::RangeOverlap {
                range: range.to_string(),
                existing: existing.range.to_string(),
                mapping_id: existing.id,
                shard_id: existing.shard_id,
            }
            .into());
        }
    }
    Ok(())
}

fn insert_map<K: ShardKey>(maps: &mut RowTable<'_>, name: &str) -> StoreResult<ShardMapInfo> {
    let info = ShardMapInfo {
        name: name.to_string(),
        key_type: K::KEY_TYPE.to_string(),
        version: 1,
    };
    put_row(maps, name, &info)?;
    info!("Created shard map '{}' with key type {}", name, K::KEY_TYPE);
    Ok(info)
}

fn insert_shard(
    shards: &mut RowTable<'_>,
    map: &str,
    location: ShardLocation,
) -> StoreResult<Shard> {
    let taken = scan_prefix::<Shard>(shards, &map_prefix(map))?
        .into_iter()
        .any(|(_, s)| s.location == location);
    if taken {
        return Err(Error::ShardLocationExists(location.to_string()).into());
    }
    let shard = Shard {
        id: ShardId::new(),
        location,
        status: ShardStatus::Active,
        version: 1,
    };
    put_row(shards, &row_key(map, shard.id), &shard)?;
    Ok(shard)
}

fn insert_mapping<K: ShardKey>(
    mappings: &mut RowTable<'_>,
    map: &str,
    range: Range<K>,
    shard_id: ShardId,
) -> StoreResult<Mapping<K>> {
    let mapping = Mapping {
        id: MappingId::new(),
        range,
        shard_id,
        status: MappingStatus::Online,
        version: 1,
    };
    let stored = StoredMapping::encode(&mapping)?;
    put_row(mappings, &row_key(map, mapping.id), &stored)?;
    Ok(mapping)
}

fn bump_map(maps: &mut RowTable<'_>, mut info: ShardMapInfo) -> StoreResult<u64> {
    info.version += 1;
    let name = info.name.clone();
    put_row(maps, &name, &info)?;
    Ok(info.version)
}

fn conflict(entity: &'static str, id: impl ToString, expected: u64, actual: Option<u64>) -> StoreError {
    Error::ConcurrencyConflict {
        entity,
        id: id.to_string(),
        expected,
        actual,
    }
    .into()
}

fn warn_conflict(e: &Error) {
    if let Error::ConcurrencyConflict { entity, id, .. } = e {
        warn!("Lost optimistic race on {} {}", entity, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    const MAP: &str = "CustomerIDShardMap";

    fn open_store() -> (TempDir, ShardMapStore) {
        let dir = TempDir::new().unwrap();
        let store = ShardMapStore::open(dir.path().join("manager.redb")).unwrap();
        store.initialize().unwrap();
        store.create_shard_map::<i32>(MAP).unwrap();
        (dir, store)
    }

    fn location(name: &str) -> ShardLocation {
        ShardLocation::new("localhost", name)
    }

    #[test]
    fn test_uninitialized_store() {
        let dir = TempDir::new().unwrap();
        let store = ShardMapStore::open(dir.path().join("manager.redb")).unwrap();
        assert!(!store.is_initialized().unwrap());
        assert!(matches!(
            store.create_shard_map::<i32>(MAP),
            Err(Error::ShardMapManagerNotInitialized)
        ));
        assert!(matches!(
            store.get_shards(MAP),
            Err(Error::ShardMapManagerNotInitialized)
        ));
    }

    #[test]
    fn test_create_shard_map_twice() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.create_shard_map::<i32>(MAP),
            Err(Error::ShardMapAlreadyExists(_))
        ));
        let info = store.get_or_create_shard_map::<i32>(MAP).unwrap();
        assert_eq!(info.key_type, "i32");
        assert!(matches!(
            store.get_or_create_shard_map::<String>(MAP),
            Err(Error::KeyTypeMismatch { .. })
        ));
        assert!(matches!(
            store.get_shards("missing"),
            Err(Error::ShardMapNotFound(_))
        ));
    }

    #[test]
    fn test_add_mapping_and_lookup() {
        let (_dir, store) = open_store();
        let a = store.add_shard(MAP, location("shard0")).unwrap();
        let b = store.add_shard(MAP, location("shard1")).unwrap();
        store
            .add_mapping(MAP, Range::new(100, 200).unwrap(), b.id)
            .unwrap();
        store
            .add_mapping(MAP, Range::new(0, 100).unwrap(), a.id)
            .unwrap();

        let mappings = store.get_mappings::<i32>(MAP).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(*mappings[0].range.low(), 0);

        let snapshot = store.load_snapshot::<i32>(MAP).unwrap();
        assert_eq!(snapshot.lookup(&150).unwrap().shard_id, b.id);
        assert!(matches!(
            snapshot.lookup(&250),
            Err(Error::MappingNotFound { .. })
        ));
    }

    #[test]
    fn test_overlapping_mapping_is_rejected() {
        let (_dir, store) = open_store();
        let a = store.add_shard(MAP, location("shard0")).unwrap();
        store
            .add_mapping(MAP, Range::new(0, 100).unwrap(), a.id)
            .unwrap();
        let before = store.get_mappings::<i32>(MAP).unwrap();

        for range in [
            Range::new(50, 150).unwrap(),
            Range::new(-10, 1).unwrap(),
            Range::unbounded(99),
        ] {
            let err = store.add_mapping(MAP, range, a.id).unwrap_err();
            assert!(matches!(err, Error::RangeOverlap { .. }), "{err}");
        }
        assert_eq!(store.get_mappings::<i32>(MAP).unwrap(), before);
    }

    #[test]
    fn test_random_disjoint_mappings_resolve_uniquely() {
        use rand::seq::SliceRandom;

        let (_dir, store) = open_store();
        let shard = store.add_shard(MAP, location("shard0")).unwrap();
        let mut bounds: Vec<(i32, i32)> = (0..20).map(|i| (i * 50, i * 50 + 30)).collect();
        bounds.shuffle(&mut rand::thread_rng());
        for (low, high) in &bounds {
            store
                .add_mapping(MAP, Range::new(*low, *high).unwrap(), shard.id)
                .unwrap();
        }

        let snapshot = store.load_snapshot::<i32>(MAP).unwrap();
        for key in -10..1_010 {
            let owner: Vec<_> = snapshot
                .mappings
                .iter()
                .filter(|m| m.range.contains(&key))
                .collect();
            match snapshot.lookup(&key) {
                Ok(found) => assert_eq!(vec![found], owner),
                Err(Error::MappingNotFound { .. }) => assert!(owner.is_empty()),
                Err(e) => panic!("unexpected error {e}"),
            }
        }
    }

    #[test]
    fn test_add_mapping_requires_shard() {
        let (_dir, store) = open_store();
        let err = store
            .add_mapping(MAP, Range::new(0, 10).unwrap(), ShardId::new())
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotFound(_)));
    }

    #[test]
    fn test_duplicate_location_is_rejected() {
        let (_dir, store) = open_store();
        store.add_shard(MAP, location("shard0")).unwrap();
        assert!(matches!(
            store.add_shard(MAP, location("shard0")),
            Err(Error::ShardLocationExists(_))
        ));
    }

    #[test]
    fn test_remove_shard_requires_empty() {
        let (_dir, store) = open_store();
        let (shard, mapping) = store
            .add_shard_with_mapping(MAP, location("shard0"), Range::new(0, 100).unwrap())
            .unwrap();
        assert!(matches!(
            store.remove_shard(MAP, &shard),
            Err(Error::ShardNotEmpty { mappings: 1, .. })
        ));

        store.remove_mapping(MAP, &mapping).unwrap();
        store.remove_shard(MAP, &shard).unwrap();
        assert!(store.get_shards(MAP).unwrap().is_empty());
    }

    #[test]
    fn test_add_shard_with_mapping_is_atomic() {
        let (_dir, store) = open_store();
        store
            .add_shard_with_mapping(MAP, location("shard0"), Range::new(0, 100).unwrap())
            .unwrap();
        let err = store
            .add_shard_with_mapping(MAP, location("shard1"), Range::new(50, 150).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::RangeOverlap { .. }));
        assert_eq!(store.get_shards(MAP).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_version_conflicts() {
        let (_dir, store) = open_store();
        let (_, mapping) = store
            .add_shard_with_mapping(MAP, location("shard0"), Range::new(0, 100).unwrap())
            .unwrap();

        let offline = store.take_mapping_offline(MAP, &mapping).unwrap();
        assert_eq!(offline.version, mapping.version + 1);
        assert!(matches!(
            store.remove_mapping(MAP, &mapping),
            Err(Error::ConcurrencyConflict {
                actual: Some(2),
                ..
            })
        ));

        let online = store.bring_mapping_online(MAP, &offline).unwrap();
        assert!(online.is_online());
        assert_eq!(
            store.mapping_version(MAP, mapping.id).unwrap(),
            Some(MappingVersion {
                version: 3,
                status: MappingStatus::Online
            })
        );
    }

    #[test]
    fn test_shard_status_cas() {
        let (_dir, store) = open_store();
        let shard = store.add_shard(MAP, location("shard0")).unwrap();
        let offline = store
            .set_shard_status(MAP, &shard, ShardStatus::Offline)
            .unwrap();
        assert!(!offline.is_active());
        assert!(matches!(
            store.set_shard_status(MAP, &shard, ShardStatus::Active),
            Err(Error::ConcurrencyConflict { .. })
        ));
        assert!(matches!(
            store.remove_shard(MAP, &shard),
            Err(Error::ConcurrencyConflict { .. })
        ));
        store.remove_shard(MAP, &offline).unwrap();
    }

    #[test]
    fn test_racing_updates_on_one_mapping() {
        let (_dir, store) = open_store();
        let (_, mapping) = store
            .add_shard_with_mapping(MAP, location("shard0"), Range::new(0, 100).unwrap())
            .unwrap();

        let store = Arc::new(store);
        let barrier = Arc::new(Barrier::new(2));
        let results: Vec<Result<Mapping<i32>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    let mapping = mapping.clone();
                    scope.spawn(move || {
                        barrier.wait();
                        store.take_mapping_offline(MAP, &mapping)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::ConcurrencyConflict { .. })))
            .count();
        assert_eq!((wins, conflicts), (1, 1));
    }

    #[test]
    fn test_concurrent_disjoint_adds_both_succeed() {
        let (_dir, store) = open_store();
        let store = Arc::new(store);
        let barrier = Arc::new(Barrier::new(2));
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = [(0, 100, "shard0"), (100, 200, "shard1")]
                .into_iter()
                .map(|(low, high, name)| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        store.add_shard_with_mapping(
                            MAP,
                            location(name),
                            Range::new(low, high).unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(store.get_mappings::<i32>(MAP).unwrap().len(), 2);
    }

    #[test]
    fn test_map_version_advances_on_mutation() {
        let (_dir, store) = open_store();
        let before = store.get_shard_map(MAP).unwrap().unwrap().version;
        store.add_shard(MAP, location("shard0")).unwrap();
        let after = store.get_shard_map(MAP).unwrap().unwrap().version;
        assert_eq!(after, before + 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manager.redb");
        {
            let store = ShardMapStore::open(&path).unwrap();
            store.initialize().unwrap();
            store.create_shard_map::<i64>(MAP).unwrap();
            store
                .add_shard_with_mapping(MAP, location("shard0"), Range::unbounded(0_i64))
                .unwrap();
            let mut schema = SchemaInfo::new();
            schema.add_reference("Regions");
            store.put_schema_info(MAP, &schema).unwrap();
        }

        let store = ShardMapStore::open(&path).unwrap();
        assert!(store.is_initialized().unwrap());
        let snapshot = store.load_snapshot::<i64>(MAP).unwrap();
        assert_eq!(snapshot.shards.len(), 1);
        assert!(snapshot.mappings[0].range.is_unbounded());
        assert!(snapshot.schema.unwrap().is_reference("regions"));
    }

    #[test]
    fn test_delete_and_clear() {
        let (_dir, store) = open_store();
        store
            .add_shard_with_mapping(MAP, location("shard0"), Range::new(0, 100).unwrap())
            .unwrap();
        store.create_shard_map::<String>("other").unwrap();

        store.delete_shard_map(MAP).unwrap();
        assert!(store.get_shard_map(MAP).unwrap().is_none());
        assert_eq!(store.list_shard_maps().unwrap().len(), 1);

        store.clear().unwrap();
        assert!(!store.is_initialized().unwrap());
        assert!(store.list_shard_maps().unwrap().is_empty());
    }
}
