//! In-process connector
//!
//! Stores live in memory for the lifetime of the connector. Per-location
//! delays and failures can be injected, and servers marked unreachable, to
//! exercise routing retries and fan-out failure policies.

use crate::connector::{Connector, ShardConnection};
use crate::statement::Statement;
use crate::value::Row;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shardmap_common::{Error, Result, ShardLocation};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Rows of one store, keyed by lowercase table name
#[derive(Debug, Default)]
struct Tables {
    tables: BTreeMap<String, Vec<Row>>,
}

impl Tables {
    fn query(&self, statement: &Statement) -> Result<Vec<Row>> {
        match statement {
            Statement::Select { table } => Ok(self
                .tables
                .get(&table.to_ascii_lowercase())
                .cloned()
                .unwrap_or_default()),
            _ => Err(Error::query("statement does not return rows")),
        }
    }

    fn execute(&mut self, statement: Statement) -> Result<u64> {
        match statement {
            Statement::Insert { table, values } => {
                self.tables
                    .entry(table.to_ascii_lowercase())
                    .or_default()
                    .push(values);
                Ok(1)
            }
            Statement::Delete { table } => Ok(self
                .tables
                .remove(&table.to_ascii_lowercase())
                .map_or(0, |rows| rows.len() as u64)),
            Statement::Select { .. } => Err(Error::query("use query for SELECT statements")),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Faults {
    delay: Option<Duration>,
    failure: Option<String>,
}

#[derive(Default)]
struct Inner {
    stores: RwLock<HashMap<ShardLocation, Arc<Mutex<Tables>>>>,
    faults: RwLock<HashMap<ShardLocation, Faults>>,
    unreachable: RwLock<HashSet<String>>,
    live: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    drop_failures: Mutex<HashMap<ShardLocation, usize>>,
}

/// Connector over in-memory stores
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every statement against `location`
    pub fn inject_delay(&self, location: &ShardLocation, delay: Duration) {
        self.inner
            .faults
            .write()
            .entry(location.clone())
            .or_default()
            .delay = Some(delay);
    }

    /// Fail every statement against `location` with a query error
    pub fn inject_failure(&self, location: &ShardLocation, reason: impl Into<String>) {
        self.inner
            .faults
            .write()
            .entry(location.clone())
            .or_default()
            .failure = Some(reason.into());
    }

    /// Fail the next `times` drops of `location` with a connection error
    pub fn fail_drops(&self, location: &ShardLocation, times: usize) {
        self.inner
            .drop_failures
            .lock()
            .insert(location.clone(), times);
    }

    pub fn clear_faults(&self, location: &ShardLocation) {
        self.inner.faults.write().remove(location);
    }

    /// Refuse connections to every store on `server`
    pub fn set_unreachable(&self, server: &str, unreachable: bool) {
        let mut servers = self.inner.unreachable.write();
        if unreachable {
            servers.insert(server.to_string());
        } else {
            servers.remove(server);
        }
    }

    /// Connections opened and not yet dropped
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Connections opened since creation
    #[must_use]
    pub fn opened_connections(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Connections released through an explicit `close`
    #[must_use]
    pub fn closed_connections(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Locations of all provisioned stores
    #[must_use]
    pub fn stores(&self) -> Vec<ShardLocation> {
        self.inner.stores.read().keys().cloned().collect()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, location: &ShardLocation) -> Result<Box<dyn ShardConnection>> {
        if self.inner.unreachable.read().contains(&location.server) {
            return Err(Error::connection(format!(
                "server {} is unreachable",
                location.server
            )));
        }
        let store = self
            .inner
            .stores
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| Error::connection(format!("store {location} does not exist")))?;

        self.inner.live.fetch_add(1, Ordering::SeqCst);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            location: location.clone(),
            store,
            inner: Arc::clone(&self.inner),
            closed: false,
        }))
    }

    async fn ping(&self, server: &str) -> bool {
        !self.inner.unreachable.read().contains(server)
    }

    async fn store_exists(&self, location: &ShardLocation) -> Result<bool> {
        Ok(self.inner.stores.read().contains_key(location))
    }

    async fn create_store(&self, location: &ShardLocation) -> Result<()> {
        if self.inner.unreachable.read().contains(&location.server) {
            return Err(Error::connection(format!(
                "server {} is unreachable",
                location.server
            )));
        }
        self.inner
            .stores
            .write()
            .entry(location.clone())
            .or_default();
        debug!("Created in-memory store {}", location);
        Ok(())
    }

    async fn drop_store(&self, location: &ShardLocation) -> Result<()> {
        if let Some(remaining) = self.inner.drop_failures.lock().get_mut(location) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::connection(format!("lost connection dropping {location}")));
            }
        }
        if self.inner.stores.write().remove(location).is_some() {
            debug!("Dropped in-memory store {}", location);
        }
        Ok(())
    }
}

struct MemoryConnection {
    location: ShardLocation,
    store: Arc<Mutex<Tables>>,
    inner: Arc<Inner>,
    closed: bool,
}

impl MemoryConnection {
    async fn prepare(&self, text: &str) -> Result<Statement> {
        if self.closed {
            return Err(Error::connection("connection is closed"));
        }
        let faults = self.inner.faults.read().get(&self.location).cloned();
        if let Some(faults) = faults {
            if let Some(delay) = faults.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(reason) = faults.failure {
                return Err(Error::query(reason));
            }
        }
        Statement::parse(text)
    }
}

#[async_trait]
impl ShardConnection for MemoryConnection {
    fn location(&self) -> &ShardLocation {
        &self.location
    }

    async fn query(&mut self, text: &str) -> Result<Vec<Row>> {
        let statement = self.prepare(text).await?;
        self.store.lock().query(&statement)
    }

    async fn execute(&mut self, text: &str) -> Result<u64> {
        let statement = self.prepare(text).await?;
        self.store.lock().execute(statement)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn location() -> ShardLocation {
        ShardLocation::new("localhost", "shard0")
    }

    #[tokio::test]
    async fn test_insert_and_select() {
        let connector = MemoryConnector::new();
        connector.create_store(&location()).await.unwrap();

        let mut conn = connector.open(&location()).await.unwrap();
        assert_eq!(
            conn.execute("INSERT INTO Tenants VALUES (1, 'one')")
                .await
                .unwrap(),
            1
        );
        let rows = conn.query("select * from tenants").await.unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1), Value::from("one")]]);
        assert!(conn.query("SELECT * FROM Missing").await.unwrap().is_empty());

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(connector.closed_connections(), 1);
        assert!(matches!(
            conn.query("SELECT * FROM Tenants").await,
            Err(Error::Connection(_))
        ));
        drop(conn);
        assert_eq!(connector.live_connections(), 0);

        // Dropping without close does not count as a release
        drop(connector.open(&location()).await.unwrap());
        assert_eq!(connector.live_connections(), 0);
        assert_eq!(connector.closed_connections(), 1);
    }

    #[tokio::test]
    async fn test_open_missing_store() {
        let connector = MemoryConnector::new();
        assert!(matches!(
            connector.open(&location()).await,
            Err(Error::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_and_unreachable() {
        let connector = MemoryConnector::new();
        connector.create_store(&location()).await.unwrap();
        connector.inject_failure(&location(), "disk on fire");

        let mut conn = connector.open(&location()).await.unwrap();
        let err = conn.query("SELECT * FROM t").await.unwrap_err();
        assert!(err.to_string().contains("disk on fire"));

        connector.clear_faults(&location());
        assert!(conn.query("SELECT * FROM t").await.is_ok());

        connector.set_unreachable("localhost", true);
        assert!(!connector.ping("localhost").await);
        assert!(connector.open(&location()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_delay() {
        let connector = MemoryConnector::new();
        connector.create_store(&location()).await.unwrap();
        connector.inject_delay(&location(), Duration::from_secs(5));

        let mut conn = connector.open(&location()).await.unwrap();
        let start = tokio::time::Instant::now();
        conn.query("SELECT * FROM t").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_create_and_drop_are_idempotent() {
        let connector = MemoryConnector::new();
        connector.create_store(&location()).await.unwrap();
        connector.create_store(&location()).await.unwrap();
        assert_eq!(connector.stores().len(), 1);

        connector.drop_store(&location()).await.unwrap();
        connector.drop_store(&location()).await.unwrap();
        assert!(!connector.store_exists(&location()).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_drop_failures() {
        let connector = MemoryConnector::new();
        connector.create_store(&location()).await.unwrap();
        connector.fail_drops(&location(), 1);

        assert!(matches!(
            connector.drop_store(&location()).await,
            Err(Error::Connection(_))
        ));
        assert!(connector.store_exists(&location()).await.unwrap());
        connector.drop_store(&location()).await.unwrap();
        assert!(!connector.store_exists(&location()).await.unwrap());
    }
}
