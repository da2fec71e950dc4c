//! Cloud account and schema records.

use datasync_runtime::Database;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cloud settings of one application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Application bundle.
    pub bundle_name: String,
    /// Application instance.
    pub instance_id: i32,
    /// Whether the user enabled cloud sync for the application.
    pub cloud_switch: bool,
}

/// Cloud account of a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInfo {
    /// Owning user.
    pub user: i32,
    /// Cloud account id.
    pub id: String,
    /// Master switch of cloud sync.
    pub enable_cloud: bool,
    /// Applications by bundle.
    pub apps: BTreeMap<String, AppInfo>,
}

impl CloudInfo {
    /// Prefix of every account record.
    pub const PREFIX: &'static str = "cloud_info/";

    /// Returns the key of `user`'s account record.
    pub fn key_of(user: i32) -> String {
        format!("{}{user}", Self::PREFIX)
    }

    /// Returns the key of this record.
    pub fn key(&self) -> String {
        Self::key_of(self.user)
    }

    /// Returns true if cloud sync is on for `bundle`.
    pub fn is_on(&self, bundle: &str) -> bool {
        self.enable_cloud && self.apps.get(bundle).is_some_and(|app| app.cloud_switch)
    }

    /// Returns the instance of `bundle`, 0 if unknown.
    pub fn instance_of(&self, bundle: &str) -> i32 {
        self.apps.get(bundle).map_or(0, |app| app.instance_id)
    }

    /// Adds or replaces an application.
    pub fn with_app(mut self, bundle: impl Into<String>, instance_id: i32, cloud_switch: bool) -> Self {
        let bundle_name = bundle.into();
        self.apps.insert(
            bundle_name.clone(),
            AppInfo {
                bundle_name,
                instance_id,
                cloud_switch,
            },
        );
        self
    }
}

/// Cloud schema of one application instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMeta {
    /// Schema version.
    pub version: i32,
    /// Application bundle.
    pub bundle_name: String,
    /// Databases synced with the cloud.
    pub databases: Vec<Database>,
}

impl SchemaMeta {
    /// Prefix of every schema record.
    pub const PREFIX: &'static str = "cloud_schema/";

    /// Returns the key of a schema record.
    pub fn key_of(user: i32, bundle: &str, instance_id: i32) -> String {
        format!("{}{user}/{bundle}/{instance_id}", Self::PREFIX)
    }

    /// Returns the prefix of `user`'s schemas of `bundle`, or of every
    /// bundle when `bundle` is empty.
    pub fn prefix_of(user: i32, bundle: &str) -> String {
        if bundle.is_empty() {
            format!("{}{user}/", Self::PREFIX)
        } else {
            format!("{}{user}/{bundle}/", Self::PREFIX)
        }
    }

    /// Returns the database backing `store`.
    pub fn database(&self, store: &str) -> Option<&Database> {
        self.databases.iter().find(|db| db.name == store)
    }
}
