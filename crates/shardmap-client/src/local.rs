//! Local-file connector
//!
//! Each physical store is a redb file at `<root>/<server>/<database>.redb`,
//! so shard data survives between process runs. Rows are kept in insertion
//! order under `table\0<sequence>` keys.

use crate::connector::{Connector, ShardConnection};
use crate::statement::Statement;
use crate::value::Row;
use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use shardmap_common::{Error, Result, ShardLocation};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// Key: "table\x00sequence", Value: bincode-encoded Row
const ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("rows");

// Key: table, Value: next sequence number
const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

fn storage(e: impl std::fmt::Display) -> Error {
    Error::storage(e.to_string())
}

fn table_prefix(table: &str) -> String {
    format!("{}\x00", table.to_ascii_lowercase())
}

/// Connector over redb files under a root directory
pub struct LocalConnector {
    root: PathBuf,
    /// redb allows one handle per file, so open databases are shared
    open: Mutex<HashMap<ShardLocation, Arc<Database>>>,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing the store at `location`
    #[must_use]
    pub fn store_path(&self, location: &ShardLocation) -> PathBuf {
        self.root
            .join(&location.server)
            .join(format!("{}.redb", location.database))
    }

    fn database(&self, location: &ShardLocation) -> Result<Arc<Database>> {
        let mut open = self.open.lock();
        if let Some(db) = open.get(location) {
            return Ok(Arc::clone(db));
        }
        let path = self.store_path(location);
        if !path.exists() {
            return Err(Error::connection(format!("store {location} does not exist")));
        }
        let db = Arc::new(Database::create(&path).map_err(storage)?);
        open.insert(location.clone(), Arc::clone(&db));
        Ok(db)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn open(&self, location: &ShardLocation) -> Result<Box<dyn ShardConnection>> {
        let db = self.database(location)?;
        Ok(Box::new(LocalConnection {
            location: location.clone(),
            db,
            closed: false,
        }))
    }

    async fn ping(&self, _server: &str) -> bool {
        self.root.is_dir()
    }

    async fn store_exists(&self, location: &ShardLocation) -> Result<bool> {
        Ok(self.store_path(location).exists())
    }

    async fn create_store(&self, location: &ShardLocation) -> Result<()> {
        let path = self.store_path(location);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(storage)?;
        let txn = db.begin_write().map_err(storage)?;
        {
            txn.open_table(ROWS).map_err(storage)?;
            txn.open_table(SEQUENCES).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;

        self.open.lock().insert(location.clone(), Arc::new(db));
        info!("Created store {} at {}", location, path.display());
        Ok(())
    }

    async fn drop_store(&self, location: &ShardLocation) -> Result<()> {
        self.open.lock().remove(location);
        let path = self.store_path(location);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!("Dropped store {} at {}", location, path.display());
        }
        Ok(())
    }
}

struct LocalConnection {
    location: ShardLocation,
    db: Arc<Database>,
    closed: bool,
}

impl LocalConnection {
    fn prepare(&self, text: &str) -> Result<Statement> {
        if self.closed {
            return Err(Error::connection("connection is closed"));
        }
        Statement::parse(text)
    }

    fn select(&self, table: &str) -> Result<Vec<Row>> {
        let txn = self.db.begin_read().map_err(storage)?;
        let rows = txn.open_table(ROWS).map_err(storage)?;
        let prefix = table_prefix(table);

        let mut result = Vec::new();
        for entry in rows.range(prefix.as_str()..).map_err(storage)? {
            let (key, value) = entry.map_err(storage)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            result.push(bincode::deserialize(value.value()).map_err(storage)?);
        }
        Ok(result)
    }

    fn insert(&self, table: &str, values: &Row) -> Result<u64> {
        let table = table.to_ascii_lowercase();
        let bytes = bincode::serialize(values).map_err(storage)?;

        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut sequences = txn.open_table(SEQUENCES).map_err(storage)?;
            let next = sequences
                .get(table.as_str())
                .map_err(storage)?
                .map_or(0, |v| v.value());
            sequences.insert(table.as_str(), next + 1).map_err(storage)?;

            let mut rows = txn.open_table(ROWS).map_err(storage)?;
            let key = format!("{table}\x00{next:020}");
            rows.insert(key.as_str(), bytes.as_slice())
                .map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(1)
    }

    fn delete(&self, table: &str) -> Result<u64> {
        let prefix = table_prefix(table);
        let txn = self.db.begin_write().map_err(storage)?;
        let removed = {
            let mut rows = txn.open_table(ROWS).map_err(storage)?;
            let mut keys = Vec::new();
            for entry in rows.range(prefix.as_str()..).map_err(storage)? {
                let (key, _) = entry.map_err(storage)?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                keys.push(key.value().to_string());
            }
            for key in &keys {
                rows.remove(key.as_str()).map_err(storage)?;
            }
            keys.len() as u64
        };
        txn.commit().map_err(storage)?;
        Ok(removed)
    }
}

#[async_trait]
impl ShardConnection for LocalConnection {
    fn location(&self) -> &ShardLocation {
        &self.location
    }

    async fn query(&mut self, text: &str) -> Result<Vec<Row>> {
        match self.prepare(text)? {
            Statement::Select { table } => self.select(&table),
            _ => Err(Error::query("statement does not return rows")),
        }
    }

    async fn execute(&mut self, text: &str) -> Result<u64> {
        let affected = match self.prepare(text)? {
            Statement::Insert { table, values } => self.insert(&table, &values)?,
            Statement::Delete { table } => self.delete(&table)?,
            Statement::Select { .. } => {
                return Err(Error::query("use query for SELECT statements"));
            }
        };
        debug!("{} row(s) affected on {}", affected, self.location);
        Ok(affected)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
