//! Cloud sync requests.

use crate::sync_id::SyncIdGenerator;
use datasync_runtime::{AsyncDetail, Database, Details, ProgressDetail, Query, SyncError, SyncMode};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Target passed to [`Store::sync`](datasync_runtime::Store::sync) and key
/// of the details reported to callers.
pub const DEFAULT_ID: &str = "default";

/// A request to sync some stores of one user with the cloud.
///
/// An empty table list for a store means every table of its schema; an
/// empty store map means every store of the bundle; an empty bundle means
/// every bundle of the user.
#[derive(Clone)]
pub struct SyncInfo {
    sync_id: u64,
    user: i32,
    bundle_name: String,
    tables: BTreeMap<String, Vec<String>>,
    mode: SyncMode,
    wait: Duration,
    query: Option<Query>,
    callback: Option<AsyncDetail>,
    account_id: Option<String>,
}

impl SyncInfo {
    fn with_map(
        ids: &SyncIdGenerator,
        user: i32,
        bundle_name: impl Into<String>,
        tables: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self {
            sync_id: ids.generate(user),
            user,
            bundle_name: bundle_name.into(),
            tables,
            mode: SyncMode::CloudTimeFirst,
            wait: Duration::ZERO,
            query: None,
            callback: None,
            account_id: None,
        }
    }

    /// Syncs `tables` of one store; an empty `store` means every store.
    pub fn for_store<I, S>(
        ids: &SyncIdGenerator,
        user: i32,
        bundle_name: impl Into<String>,
        store: impl Into<String>,
        tables: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = store.into();
        let mut map = BTreeMap::new();
        if !store.is_empty() {
            map.insert(store, tables.into_iter().map(Into::into).collect());
        }
        Self::with_map(ids, user, bundle_name, map)
    }

    /// Syncs every table of `stores`.
    pub fn for_stores<I, S>(
        ids: &SyncIdGenerator,
        user: i32,
        bundle_name: impl Into<String>,
        stores: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = stores
            .into_iter()
            .map(|store| (store.into(), Vec::new()))
            .collect();
        Self::with_map(ids, user, bundle_name, map)
    }

    /// Syncs the given tables of each store.
    pub fn for_tables(
        ids: &SyncIdGenerator,
        user: i32,
        bundle_name: impl Into<String>,
        tables: BTreeMap<String, Vec<String>>,
    ) -> Self {
        Self::with_map(ids, user, bundle_name, tables)
    }

    /// Sets the sync mode.
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets how long each store may block.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets an explicit query used for every store.
    pub fn with_query(mut self, query: Query) -> Self {
        self.query = Some(query);
        self
    }

    /// Sets the completion callback.
    pub fn with_callback(mut self, callback: AsyncDetail) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Restricts the request to one cloud account.
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Returns the sync id.
    pub fn sync_id(&self) -> u64 {
        self.sync_id
    }

    /// Returns the user.
    pub fn user(&self) -> i32 {
        self.user
    }

    /// Returns the bundle, empty for every bundle.
    pub fn bundle_name(&self) -> &str {
        &self.bundle_name
    }

    /// Returns the requested stores and tables.
    pub fn tables(&self) -> &BTreeMap<String, Vec<String>> {
        &self.tables
    }

    /// Returns the sync mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Returns the wait.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Returns the completion callback.
    pub fn callback(&self) -> Option<&AsyncDetail> {
        self.callback.as_ref()
    }

    /// Returns the account filter.
    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    /// Returns true if `database` is part of the request.
    pub fn covers(&self, database: &Database) -> bool {
        self.tables.is_empty() || self.tables.contains_key(&database.name)
    }

    /// Returns the query for `database`.
    ///
    /// An explicit query wins; otherwise the requested tables of the store,
    /// or every table of the schema when none were requested.
    pub fn query_for(&self, database: &Database) -> Query {
        if let Some(query) = &self.query {
            return query.clone();
        }
        match self.tables.get(&database.name) {
            Some(tables) if !tables.is_empty() => Query::from_tables(tables.iter().cloned()),
            _ => Query::from_tables(database.table_names()),
        }
    }

    /// Reports `error` as the final outcome to the caller.
    pub fn set_error(&self, error: SyncError) {
        if let Some(callback) = &self.callback {
            let mut details = Details::new();
            details.insert(DEFAULT_ID.to_string(), ProgressDetail::failed(error));
            callback(details);
        }
    }
}

impl fmt::Debug for SyncInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncInfo")
            .field("sync_id", &format_args!("{:#x}", self.sync_id))
            .field("user", &self.user)
            .field("bundle_name", &self.bundle_name)
            .field("tables", &self.tables)
            .field("mode", &self.mode)
            .field("wait", &self.wait)
            .field("query", &self.query)
            .field("has_callback", &self.callback.is_some())
            .field("account_id", &self.account_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_runtime::Table;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn notes_db() -> Database {
        Database {
            name: "notes".into(),
            alias: "cloud_notes".into(),
            tables: vec![
                Table {
                    name: "note".into(),
                    alias: "cloud_note".into(),
                },
                Table {
                    name: "tag".into(),
                    alias: "cloud_tag".into(),
                },
            ],
        }
    }

    #[test]
    fn three_shapes() {
        let ids = SyncIdGenerator::new();
        let one = SyncInfo::for_store(&ids, 100, "app", "notes", ["note"]);
        assert_eq!(one.tables().get("notes"), Some(&vec!["note".to_string()]));

        let all = SyncInfo::for_store(&ids, 100, "app", "", Vec::<String>::new());
        assert!(all.tables().is_empty());

        let many = SyncInfo::for_stores(&ids, 100, "app", ["notes", "photos"]);
        assert_eq!(many.tables().len(), 2);
        assert!(many.tables().values().all(Vec::is_empty));

        let mut map = BTreeMap::new();
        map.insert("notes".to_string(), vec!["tag".to_string()]);
        let mapped = SyncInfo::for_tables(&ids, 100, "app", map);
        assert!(mapped.sync_id() > many.sync_id());
        assert!(SyncIdGenerator::belongs_to(mapped.sync_id(), 100));
    }

    #[test]
    fn query_resolution() {
        let ids = SyncIdGenerator::new();
        let db = notes_db();

        let requested = SyncInfo::for_store(&ids, 1, "app", "notes", ["tag"]);
        assert_eq!(requested.query_for(&db).tables, vec!["tag".to_string()]);

        let whole = SyncInfo::for_stores(&ids, 1, "app", ["notes"]);
        assert_eq!(whole.query_for(&db).tables, vec!["note".to_string(), "tag".to_string()]);

        let explicit = whole.with_query(Query::from_tables(["note"]).with_condition("id > 1"));
        assert_eq!(explicit.query_for(&db).condition.as_deref(), Some("id > 1"));
    }

    #[test]
    fn scope() {
        let ids = SyncIdGenerator::new();
        let db = notes_db();
        assert!(SyncInfo::for_stores(&ids, 1, "app", Vec::<String>::new()).covers(&db));
        assert!(!SyncInfo::for_stores(&ids, 1, "app", ["photos"]).covers(&db));
    }

    #[test]
    fn errors_reach_the_callback() {
        let ids = SyncIdGenerator::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let info = SyncInfo::for_stores(&ids, 1, "app", ["notes"])
            .with_callback(Arc::new(move |details: Details| *sink.lock() = Some(details)));
        info.set_error(SyncError::NetworkError);

        let details = seen.lock().take().unwrap();
        assert_eq!(details[DEFAULT_ID].result, Err(SyncError::NetworkError));
    }
}
