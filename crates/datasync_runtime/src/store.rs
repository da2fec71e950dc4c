//! Store handles and the cloud-side collaborators used to bind them.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Direction and conflict policy of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Send local changes only.
    Push,
    /// Receive remote changes only.
    Pull,
    /// Exchange in both directions.
    PushPull,
    /// Cloud sync, newest timestamp wins.
    CloudTimeFirst,
    /// Cloud sync, the cloud copy wins.
    CloudNativeFirst,
    /// Cloud sync, the local copy wins.
    CloudClientFirst,
}

impl SyncMode {
    /// Returns true for the cloud modes.
    pub fn is_cloud(self) -> bool {
        matches!(
            self,
            SyncMode::CloudTimeFirst | SyncMode::CloudNativeFirst | SyncMode::CloudClientFirst
        )
    }
}

/// Selection of what to sync within a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Tables to sync. Empty means every table.
    pub tables: Vec<String>,
    /// Optional row predicate understood by the store.
    pub condition: Option<String>,
}

impl Query {
    /// Selects whole tables.
    pub fn from_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            condition: None,
        }
    }

    /// Adds a row predicate.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Progress of a sync toward one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Accepted, not started.
    Prepared,
    /// Running.
    Processing,
    /// Done, successfully or not.
    Finished,
}

/// Per-target outcome of a sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressDetail {
    /// How far the sync got.
    pub progress: Progress,
    /// Final status once finished.
    pub result: SyncResult<()>,
}

impl ProgressDetail {
    /// A finished, successful detail.
    pub fn finished() -> Self {
        Self {
            progress: Progress::Finished,
            result: Ok(()),
        }
    }

    /// A finished, failed detail.
    pub fn failed(error: crate::SyncError) -> Self {
        Self {
            progress: Progress::Finished,
            result: Err(error),
        }
    }
}

/// Outcomes keyed by target (device id or store id).
pub type Details = BTreeMap<String, ProgressDetail>;

/// Completion callback of a sync.
pub type AsyncDetail = Arc<dyn Fn(Details) + Send + Sync>;

/// A table of a cloud database schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Local table name.
    pub name: String,
    /// Table name on the cloud side.
    pub alias: String,
}

/// A database of a cloud schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    /// Local store name.
    pub name: String,
    /// Database name on the cloud side.
    pub alias: String,
    /// Tables synced with the cloud.
    pub tables: Vec<Table>,
}

impl Database {
    /// Returns the names of every table.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

/// Identity of a local store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreMetaData {
    /// Owning user.
    pub user: i32,
    /// Owning bundle.
    pub bundle_name: String,
    /// Application id.
    pub app_id: String,
    /// Store id within the bundle.
    pub store_id: String,
    /// Application instance.
    pub instance_id: i32,
    /// Access token of the owner.
    pub token_id: u32,
    /// Device that created the store.
    pub device_id: String,
}

impl StoreMetaData {
    /// Prefix of every store record.
    pub const PREFIX: &'static str = "store_meta/";

    /// Creates store metadata for `bundle_name`/`store_id`.
    pub fn new(user: i32, bundle_name: impl Into<String>, store_id: impl Into<String>) -> Self {
        let bundle_name = bundle_name.into();
        Self {
            user,
            app_id: bundle_name.clone(),
            bundle_name,
            store_id: store_id.into(),
            ..Self::default()
        }
    }

    /// Sets the device id.
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Sets the application id.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Sets the token id.
    pub fn with_token(mut self, token_id: u32) -> Self {
        self.token_id = token_id;
        self
    }

    /// Sets the instance id.
    pub fn with_instance(mut self, instance_id: i32) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Returns the metadata key of this record.
    pub fn key(&self) -> String {
        format!(
            "{}{}/{}/{}/{}/{}",
            Self::PREFIX,
            self.device_id,
            self.user,
            self.bundle_name,
            self.store_id,
            self.instance_id
        )
    }
}

impl fmt::Display for StoreMetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.user, self.bundle_name, self.store_id)
    }
}

/// Connection to a cloud database.
pub trait CloudDb: Send + Sync {
    /// Returns the database this connection was opened for.
    fn database(&self) -> &str;
}

/// Loader for asset payloads referenced by cloud records.
pub trait AssetLoader: Send + Sync {
    /// Returns the bundle the loader serves.
    fn bundle(&self) -> &str;
}

/// Cloud dependencies bound into a store.
#[derive(Clone)]
pub struct CloudConnections {
    /// Cloud database connection.
    pub cloud_db: Arc<dyn CloudDb>,
    /// Asset loader.
    pub asset_loader: Arc<dyn AssetLoader>,
}

/// A handle to a concrete dataset.
pub trait Store: Send + Sync {
    /// Starts a sync toward `targets`.
    ///
    /// `callback` receives the per-target details when the sync finishes.
    /// A non-zero `wait` asks the store to block for up to that long.
    fn sync(
        &self,
        targets: &[String],
        mode: SyncMode,
        query: &Query,
        callback: Option<AsyncDetail>,
        wait: Duration,
    ) -> SyncResult<()>;

    /// Returns true once cloud dependencies are bound.
    fn is_bound(&self) -> bool;

    /// Binds cloud dependencies for `database`.
    fn bind(&self, database: &Database, connections: CloudConnections) -> SyncResult<()>;
}

/// Resolves store handles.
pub trait StoreProvider: Send + Sync {
    /// Opens or returns the store described by `meta`.
    fn get_store(&self, meta: &StoreMetaData) -> Option<Arc<dyn Store>>;
}

/// Provider of cloud connections.
pub trait CloudServer: Send + Sync {
    /// Connects to the cloud database backing `database`.
    fn connect_cloud_db(&self, token_id: u32, database: &Database) -> Option<Arc<dyn CloudDb>>;

    /// Creates an asset loader for `bundle`.
    fn connect_asset_loader(
        &self,
        token_id: u32,
        bundle: &str,
        database: &Database,
    ) -> Option<Arc<dyn AssetLoader>>;
}

/// Connectivity probe.
pub trait NetworkMonitor: Send + Sync {
    /// Returns true if the network is reachable.
    fn is_network_available(&self) -> bool;
}
