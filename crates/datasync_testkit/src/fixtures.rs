//! Mock collaborators.
//!
//! Every mock records what it was asked to do and can be scripted to fail,
//! so tests can assert on both the calls and the error paths.

use datasync_runtime::{
    AssetLoader, AsyncDetail, CloudConnections, CloudDb, CloudServer, Database, Details,
    NetworkMonitor, ProgressDetail, Query, Store, StoreMetaData, StoreProvider, SyncError,
    SyncMode, SyncResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One recorded [`Store::sync`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCall {
    /// Targets passed in.
    pub targets: Vec<String>,
    /// Mode passed in.
    pub mode: SyncMode,
    /// Query passed in.
    pub query: Query,
    /// Wait passed in.
    pub wait: Duration,
}

/// A store that records sync calls and replays scripted results.
///
/// Successful syncs report a finished detail for every target through the
/// callback before returning.
#[derive(Default)]
pub struct MockStore {
    name: String,
    calls: Mutex<Vec<SyncCall>>,
    script: Mutex<VecDeque<SyncResult<()>>>,
    bound: Mutex<Option<Database>>,
    bind_count: AtomicUsize,
    in_sync: AtomicUsize,
    max_in_sync: AtomicUsize,
}

impl MockStore {
    /// Creates a store called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues the result of a future sync call.
    pub fn push_result(&self, result: SyncResult<()>) {
        self.script.lock().push_back(result);
    }

    /// Queues `n` copies of `error`.
    pub fn fail_times(&self, n: usize, error: SyncError) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Err(error.clone()));
        }
    }

    /// Returns every sync call so far.
    pub fn sync_calls(&self) -> Vec<SyncCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of sync calls so far.
    pub fn sync_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the database bound into the store.
    pub fn bound_database(&self) -> Option<Database> {
        self.bound.lock().clone()
    }

    /// Returns the number of successful binds.
    pub fn bind_count(&self) -> usize {
        self.bind_count.load(Ordering::SeqCst)
    }

    /// Returns the highest number of overlapping sync calls seen.
    pub fn max_concurrent_syncs(&self) -> usize {
        self.max_in_sync.load(Ordering::SeqCst)
    }
}

impl Store for MockStore {
    fn sync(
        &self,
        targets: &[String],
        mode: SyncMode,
        query: &Query,
        callback: Option<AsyncDetail>,
        wait: Duration,
    ) -> SyncResult<()> {
        let running = self.in_sync.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_sync.fetch_max(running, Ordering::SeqCst);
        self.calls.lock().push(SyncCall {
            targets: targets.to_vec(),
            mode,
            query: query.clone(),
            wait,
        });
        let result = self.script.lock().pop_front().unwrap_or(Ok(()));
        self.in_sync.fetch_sub(1, Ordering::SeqCst);
        result?;
        if let Some(callback) = callback {
            let details: Details = targets
                .iter()
                .map(|t| (t.clone(), ProgressDetail::finished()))
                .collect();
            callback(details);
        }
        Ok(())
    }

    fn is_bound(&self) -> bool {
        self.bound.lock().is_some()
    }

    fn bind(&self, database: &Database, _connections: CloudConnections) -> SyncResult<()> {
        *self.bound.lock() = Some(database.clone());
        self.bind_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Resolves [`MockStore`]s by store identity.
#[derive(Default)]
pub struct MockStoreProvider {
    stores: Mutex<HashMap<(i32, String, String), Arc<MockStore>>>,
    lookups: AtomicUsize,
}

impl MockStoreProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a store for `meta` and returns it.
    pub fn add_store(&self, meta: &StoreMetaData) -> Arc<MockStore> {
        let store = Arc::new(MockStore::new(meta.store_id.clone()));
        self.stores.lock().insert(Self::key(meta), Arc::clone(&store));
        store
    }

    /// Returns the store registered for `meta`.
    pub fn store(&self, meta: &StoreMetaData) -> Option<Arc<MockStore>> {
        self.stores.lock().get(&Self::key(meta)).cloned()
    }

    /// Returns the number of lookups so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn key(meta: &StoreMetaData) -> (i32, String, String) {
        (meta.user, meta.bundle_name.clone(), meta.store_id.clone())
    }
}

impl StoreProvider for MockStoreProvider {
    fn get_store(&self, meta: &StoreMetaData) -> Option<Arc<dyn Store>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.store(meta).map(|store| store as Arc<dyn Store>)
    }
}

/// Cloud database connection handed out by [`MockCloudServer`].
#[derive(Debug)]
pub struct MockCloudDb {
    database: String,
}

impl CloudDb for MockCloudDb {
    fn database(&self) -> &str {
        &self.database
    }
}

/// Asset loader handed out by [`MockCloudServer`].
#[derive(Debug)]
pub struct MockAssetLoader {
    bundle: String,
}

impl AssetLoader for MockAssetLoader {
    fn bundle(&self) -> &str {
        &self.bundle
    }
}

/// Cloud server whose connections can be switched off.
#[derive(Debug)]
pub struct MockCloudServer {
    cloud_db: AtomicBool,
    asset_loader: AtomicBool,
    connects: AtomicUsize,
}

impl MockCloudServer {
    /// Creates a server handing out both connections.
    pub fn new() -> Self {
        Self {
            cloud_db: AtomicBool::new(true),
            asset_loader: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
        }
    }

    /// Enables or disables cloud database connections.
    pub fn set_cloud_db_available(&self, available: bool) {
        self.cloud_db.store(available, Ordering::SeqCst);
    }

    /// Enables or disables asset loaders.
    pub fn set_asset_loader_available(&self, available: bool) {
        self.asset_loader.store(available, Ordering::SeqCst);
    }

    /// Returns the number of connection requests so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for MockCloudServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudServer for MockCloudServer {
    fn connect_cloud_db(&self, _token_id: u32, database: &Database) -> Option<Arc<dyn CloudDb>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.cloud_db.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(MockCloudDb {
            database: database.alias.clone(),
        }))
    }

    fn connect_asset_loader(
        &self,
        _token_id: u32,
        bundle: &str,
        _database: &Database,
    ) -> Option<Arc<dyn AssetLoader>> {
        if !self.asset_loader.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(MockAssetLoader {
            bundle: bundle.to_string(),
        }))
    }
}

/// Network monitor with a switchable answer.
#[derive(Debug)]
pub struct StaticNetwork {
    available: AtomicBool,
}

impl StaticNetwork {
    /// Creates a monitor reporting `available`.
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
        }
    }

    /// Changes the reported availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl NetworkMonitor for StaticNetwork {
    fn is_network_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// Builds a cloud database schema entry with `tables`.
pub fn database(name: &str, tables: &[&str]) -> Database {
    Database {
        name: name.to_string(),
        alias: format!("cloud_{name}"),
        tables: tables
            .iter()
            .map(|t| datasync_runtime::Table {
                name: t.to_string(),
                alias: format!("cloud_{t}"),
            })
            .collect(),
    }
}
