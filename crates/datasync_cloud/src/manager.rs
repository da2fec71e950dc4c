//! Admission, retry and cancellation of cloud sync tasks.

use crate::config::CloudSyncConfig;
use crate::event::{CloudEvent, CloudTopic, StoreInfo, SyncOptions};
use crate::info::{SyncInfo, DEFAULT_ID};
use crate::meta::{CloudInfo, SchemaMeta};
use crate::retry::{RetryScheduler, RetryState, Retryer};
use crate::sync_id::SyncIdGenerator;
use datasync_runtime::{
    AsyncDetail, CloudConnections, CloudServer, Details, EventBus, MetadataStore,
    MetadataStoreExt, NetworkMonitor, ProgressDetail, Store, StoreMetaData, StoreProvider,
    SubscriptionId, SyncError, SyncResult, TimerId, TimerService,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Admission key: one scheduled task per user and bundle.
type TaskKey = (i32, String);

struct ActiveTask {
    ticket: u64,
    timer: TimerId,
    info: SyncInfo,
}

/// Where a scheduled task is tracked until it starts.
#[derive(Debug, Clone)]
enum Slot {
    /// A caller's request, one per user and bundle.
    Request(TaskKey),
    /// A retry, one per sync id.
    Retry(u64),
}

fn task_key(info: &SyncInfo) -> TaskKey {
    (info.user(), info.bundle_name().to_string())
}

fn report_failure(callback: Option<&AsyncDetail>, error: SyncError) {
    if let Some(callback) = callback {
        let mut details = Details::new();
        details.insert(DEFAULT_ID.to_string(), ProgressDetail::failed(error));
        callback(details);
    }
}

/// Builder for [`CloudSyncManager`].
pub struct CloudSyncManagerBuilder {
    metadata: Option<Arc<dyn MetadataStore>>,
    stores: Option<Arc<dyn StoreProvider>>,
    network: Option<Arc<dyn NetworkMonitor>>,
    events: Option<Arc<dyn EventBus<CloudEvent>>>,
    cloud_server: Option<Arc<dyn CloudServer>>,
    ids: Option<Arc<SyncIdGenerator>>,
    local_device: String,
    config: CloudSyncConfig,
}

impl CloudSyncManagerBuilder {
    /// Sets the metadata store holding accounts, schemas and store records.
    pub fn metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Sets the store provider.
    pub fn stores(mut self, stores: Arc<dyn StoreProvider>) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Sets the network monitor.
    pub fn network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = Some(network);
        self
    }

    /// Sets the event bus.
    pub fn events(mut self, events: Arc<dyn EventBus<CloudEvent>>) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the cloud server. Without one no store can be resolved.
    pub fn cloud_server(mut self, server: Arc<dyn CloudServer>) -> Self {
        self.cloud_server = Some(server);
        self
    }

    /// Shares a sync id generator.
    pub fn ids(mut self, ids: Arc<SyncIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Sets the local device id used to find store records.
    pub fn local_device(mut self, device: impl Into<String>) -> Self {
        self.local_device = device.into();
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: CloudSyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the manager and subscribes its event handlers.
    ///
    /// Fails with [`SyncError::InvalidArgument`] if the metadata store, store
    /// provider, network monitor or event bus is missing.
    pub fn build(self) -> SyncResult<Arc<CloudSyncManager>> {
        let missing = |what: &str| SyncError::InvalidArgument(format!("missing {what}"));
        let metadata = self.metadata.ok_or_else(|| missing("metadata store"))?;
        let stores = self.stores.ok_or_else(|| missing("store provider"))?;
        let network = self.network.ok_or_else(|| missing("network monitor"))?;
        let events = self.events.ok_or_else(|| missing("event bus"))?;
        let ids = self.ids.unwrap_or_default();
        let cloud_server = self.cloud_server;
        let local_device = self.local_device;
        let config = self.config;

        Ok(Arc::new_cyclic(|self_ref: &Weak<CloudSyncManager>| {
            let weak = self_ref.clone();
            let local_change = events.subscribe(
                CloudTopic::LocalChange,
                Arc::new(move |event: &CloudEvent| {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_local_change(event);
                    }
                }),
            );
            let weak = self_ref.clone();
            let cloud_sync = events.subscribe(
                CloudTopic::CloudSync,
                Arc::new(move |event: &CloudEvent| {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_cloud_sync(event);
                    }
                }),
            );
            CloudSyncManager {
                self_ref: self_ref.clone(),
                ids,
                config,
                metadata,
                stores,
                network,
                events,
                cloud_server,
                local_device,
                subscriptions: vec![
                    (CloudTopic::LocalChange, local_change),
                    (CloudTopic::CloudSync, cloud_sync),
                ],
                executor: RwLock::new(None),
                actives: Mutex::new(HashMap::new()),
                retries: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
            }
        }))
    }
}

/// Schedules cloud syncs per user and bundle, retries them within a budget
/// and cancels them on request.
///
/// A task resolves the user's cloud account and schemas, then posts one
/// [`CloudEvent::CloudSync`] per database in scope; the manager's own
/// handler turns each of those into a [`Store::sync`] call.
pub struct CloudSyncManager {
    self_ref: Weak<CloudSyncManager>,
    ids: Arc<SyncIdGenerator>,
    config: CloudSyncConfig,
    metadata: Arc<dyn MetadataStore>,
    stores: Arc<dyn StoreProvider>,
    network: Arc<dyn NetworkMonitor>,
    events: Arc<dyn EventBus<CloudEvent>>,
    cloud_server: Option<Arc<dyn CloudServer>>,
    local_device: String,
    /// Handlers this manager added to the event bus.
    subscriptions: Vec<(CloudTopic, SubscriptionId)>,
    executor: RwLock<Option<Arc<dyn TimerService>>>,
    /// Requests scheduled but not yet started.
    actives: Mutex<HashMap<TaskKey, ActiveTask>>,
    /// Retries scheduled but not yet started, by sync id.
    retries: Mutex<HashMap<u64, ActiveTask>>,
    gates: Mutex<HashMap<TaskKey, Arc<Mutex<()>>>>,
}

impl CloudSyncManager {
    /// Creates a builder.
    pub fn builder() -> CloudSyncManagerBuilder {
        CloudSyncManagerBuilder {
            metadata: None,
            stores: None,
            network: None,
            events: None,
            cloud_server: None,
            ids: None,
            local_device: String::new(),
            config: CloudSyncConfig::default(),
        }
    }

    /// Binds the executor running scheduled tasks.
    pub fn bind(&self, executor: Arc<dyn TimerService>) {
        *self.executor.write() = Some(executor);
    }

    /// Returns the sync id generator.
    pub fn ids(&self) -> &Arc<SyncIdGenerator> {
        &self.ids
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CloudSyncConfig {
        &self.config
    }

    /// Returns the number of scheduled tasks, requests and retries, that
    /// have not started.
    pub fn active_tasks(&self) -> usize {
        let retries = self.retries.lock().len();
        self.actives.lock().len() + retries
    }

    /// Returns the number of requests with a retry pending.
    pub fn pending_retries(&self) -> usize {
        self.retries.lock().len()
    }

    fn executor(&self) -> SyncResult<Arc<dyn TimerService>> {
        self.executor
            .read()
            .clone()
            .ok_or_else(|| SyncError::NotInitialized("executor".into()))
    }

    /// Schedules `info` to run now.
    ///
    /// A request already scheduled for the same user and bundle is replaced;
    /// if it had not started, its caller gets [`SyncError::Busy`]. Pending
    /// retries of earlier requests are left alone. Fails with
    /// [`SyncError::NotInitialized`] if no executor is bound.
    pub fn do_cloud_sync(&self, info: SyncInfo) -> SyncResult<()> {
        let executor = self.executor()?;
        let key = task_key(&info);
        let sync_id = info.sync_id();
        let mut actives = self.actives.lock();
        let task = self.arm(&executor, Slot::Request(key.clone()), Duration::ZERO, 1, info)?;
        let superseded = actives.insert(key, task);
        drop(actives);
        if let Some(task) = superseded {
            if self.retire(&executor, &task) {
                task.info.set_error(SyncError::Busy(format!(
                    "sync {} superseded by sync {sync_id}",
                    task.info.sync_id()
                )));
            }
        }
        Ok(())
    }

    /// Cancels every scheduled task of `user`.
    ///
    /// Task bodies already running are not interrupted.
    pub fn stop_cloud_sync(&self, user: i32) -> SyncResult<()> {
        let executor = self.executor()?;
        let mut cancelled: Vec<ActiveTask> = Vec::new();
        {
            let mut retries = self.retries.lock();
            let mut actives = self.actives.lock();
            let keys: Vec<TaskKey> = actives
                .iter()
                .filter(|(_, task)| SyncIdGenerator::belongs_to(task.ticket, user))
                .map(|(key, _)| key.clone())
                .collect();
            cancelled.extend(keys.iter().filter_map(|key| actives.remove(key)));
            let ids: Vec<u64> = retries
                .keys()
                .copied()
                .filter(|id| SyncIdGenerator::belongs_to(*id, user))
                .collect();
            cancelled.extend(ids.iter().filter_map(|id| retries.remove(id)));
        }
        info!(user, cancelled = cancelled.len(), "cloud sync stopped");
        for task in &cancelled {
            self.retire(&executor, task);
        }
        Ok(())
    }

    /// Resolves the store of `meta`, binding cloud connections if needed.
    ///
    /// An unbound store is bound to its schema database once both a cloud
    /// database and an asset loader are available. With `must_bind`, a
    /// missing connection fails the lookup and leaves the store untouched;
    /// without it the store is returned unbound.
    pub fn get_store(
        &self,
        meta: &StoreMetaData,
        user: i32,
        must_bind: bool,
    ) -> SyncResult<Arc<dyn Store>> {
        let server = self
            .cloud_server
            .as_ref()
            .ok_or_else(|| SyncError::NotInitialized("cloud server".into()))?;
        let store = self
            .stores
            .get_store(meta)
            .ok_or_else(|| SyncError::NotFound(format!("store {meta}")))?;
        if store.is_bound() {
            return Ok(store);
        }

        let schema_key = SchemaMeta::key_of(user, &meta.bundle_name, meta.instance_id);
        let schema: SchemaMeta = self
            .metadata
            .load_meta(&schema_key, true)?
            .ok_or_else(|| SyncError::NotInitialized(format!("schema {schema_key}")))?;
        let database = schema
            .database(&meta.store_id)
            .ok_or_else(|| SyncError::NotFound(format!("database {} in {schema_key}", meta.store_id)))?;
        let cloud_db = server.connect_cloud_db(meta.token_id, database);
        let asset_loader = server.connect_asset_loader(meta.token_id, &meta.bundle_name, database);
        match (cloud_db, asset_loader) {
            (Some(cloud_db), Some(asset_loader)) => {
                store.bind(
                    database,
                    CloudConnections {
                        cloud_db,
                        asset_loader,
                    },
                )?;
                debug!(store = %meta, database = %database.alias, "store bound to cloud");
            }
            _ if must_bind => {
                return Err(SyncError::NotInitialized(format!(
                    "cloud connections of {meta} (token {:#x})",
                    meta.token_id
                )));
            }
            _ => warn!(store = %meta, "cloud connections incomplete, store left unbound"),
        }
        Ok(store)
    }

    /// Arms a timer running `info` after `delay`, tracked under `slot`.
    fn arm(
        &self,
        executor: &Arc<dyn TimerService>,
        slot: Slot,
        delay: Duration,
        attempt: u32,
        info: SyncInfo,
    ) -> SyncResult<ActiveTask> {
        let ticket = self.ids.generate(info.user());
        let sync_id = info.sync_id();
        let weak = self.self_ref.clone();
        let task_info = info.clone();
        let task_slot = slot.clone();
        let timer = executor.schedule(
            delay,
            Box::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.run_scheduled(&task_slot, ticket, attempt, task_info);
                }
            }),
        )?;
        debug!(?slot, sync_id, ticket, attempt, ?delay, "cloud sync task admitted");
        Ok(ActiveTask {
            ticket,
            timer,
            info,
        })
    }

    /// Cancels the timer of `task`. Returns false if it already fired.
    fn retire(&self, executor: &Arc<dyn TimerService>, task: &ActiveTask) -> bool {
        let removed = executor.remove_timer(task.timer);
        if removed {
            debug!(ticket = task.ticket, timer = %task.timer, "cloud sync task cancelled");
        }
        removed
    }

    fn gate(&self, key: &TaskKey) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.lock().entry(key.clone()).or_default())
    }

    fn run_scheduled(&self, slot: &Slot, ticket: u64, attempt: u32, info: SyncInfo) {
        match slot {
            Slot::Request(key) => {
                let mut actives = self.actives.lock();
                if actives.get(key).is_some_and(|task| task.ticket == ticket) {
                    actives.remove(key);
                }
            }
            Slot::Retry(sync_id) => {
                let mut retries = self.retries.lock();
                if retries.get(sync_id).is_some_and(|task| task.ticket == ticket) {
                    retries.remove(sync_id);
                }
            }
        }
        self.run_task(attempt, true, info);
    }

    /// Runs one attempt of a task: checks the account, the switches and the
    /// network, then posts a sync event per database in scope.
    fn run_task(&self, attempt: u32, auto_retry: bool, info: SyncInfo) {
        let gate = self.gate(&task_key(&info));
        let _running = gate.lock();
        let stale_retry = self.retries.lock().remove(&info.sync_id());
        if let (Some(task), Ok(executor)) = (stale_retry, self.executor()) {
            self.retire(&executor, &task);
        }

        let user = info.user();
        let sync_id = info.sync_id();
        let cloud = match self
            .metadata
            .load_meta::<CloudInfo>(&CloudInfo::key_of(user), true)
        {
            Ok(Some(cloud)) => cloud,
            Ok(None) => {
                warn!(user, sync_id, "no cloud info");
                info.set_error(SyncError::NotInitialized(format!("cloud info of user {user}")));
                return;
            }
            Err(e) => {
                warn!(user, sync_id, error = %e, "cloud info unreadable");
                info.set_error(e);
                return;
            }
        };

        let bundle = info.bundle_name();
        if !cloud.enable_cloud
            || info.account_id().is_some_and(|id| id != cloud.id)
            || (!bundle.is_empty() && !cloud.is_on(bundle))
        {
            debug!(user, bundle, sync_id, "cloud sync switched off");
            info.set_error(SyncError::Unopened(format!("{user}/{bundle}")));
            return;
        }

        if !self.network.is_network_available() {
            info.set_error(SyncError::NetworkError);
            return;
        }

        let scheduler: Weak<dyn RetryScheduler> = self.self_ref.clone();
        let retryer = Retryer::new(
            RetryState {
                attempt,
                info: info.clone(),
            },
            self.config.max_attempts,
            scheduler,
        );

        let prefix = SchemaMeta::prefix_of(user, bundle);
        let schemas: Vec<SchemaMeta> = match self.metadata.load_metas(&prefix, true) {
            Ok(schemas) => schemas,
            Err(e) => {
                warn!(user, bundle, error = %e, "schemas unreadable");
                Vec::new()
            }
        };
        if schemas.is_empty() {
            info!(user, bundle, sync_id, attempt, "no schema, requesting one");
            let request = CloudEvent::GetSchema {
                user,
                bundle_name: bundle.to_string(),
            };
            if let Err(e) = self.events.post(request) {
                warn!(user, bundle, error = %e, "schema request not posted");
            }
            retryer.retry(
                self.config.retry_interval,
                Err(SyncError::NotInitialized(format!("schema of {user}/{bundle}"))),
            );
            return;
        }

        let options = SyncOptions {
            mode: info.mode(),
            wait: info.wait(),
            auto_retry,
            callback: info.callback().cloned(),
        };
        let mut posted = 0usize;
        for schema in schemas.iter().filter(|s| cloud.is_on(&s.bundle_name)) {
            for database in schema.databases.iter().filter(|db| info.covers(db)) {
                let event = CloudEvent::CloudSync {
                    store: StoreInfo {
                        user: cloud.user,
                        bundle_name: schema.bundle_name.clone(),
                        store_name: database.name.clone(),
                        instance_id: cloud.instance_of(&schema.bundle_name),
                    },
                    options: options.clone(),
                    query: info.query_for(database),
                    retryer: retryer.clone(),
                };
                match self.events.post(event) {
                    Ok(()) => posted += 1,
                    Err(e) => warn!(user, store = %database.name, error = %e, "sync event not posted"),
                }
            }
        }
        debug!(user, bundle, sync_id, attempt, stores = posted, "cloud sync task ran");
    }

    fn on_cloud_sync(&self, event: &CloudEvent) {
        let CloudEvent::CloudSync {
            store,
            options,
            query,
            retryer,
        } = event
        else {
            return;
        };
        let key = StoreMetaData::new(store.user, store.bundle_name.clone(), store.store_name.clone())
            .with_instance(store.instance_id)
            .with_device(self.local_device.clone())
            .key();
        let meta: StoreMetaData = match self.metadata.load_meta(&key, false) {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!(user = store.user, bundle = %store.bundle_name, store = %store.store_name, "no store meta");
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "store meta unreadable");
                return;
            }
        };
        let handle = match self.get_store(&meta, store.user, true) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(store = %meta, error = %e, "store unavailable");
                return;
            }
        };

        let callback = if options.auto_retry {
            let retryer = retryer.clone();
            let config = self.config.clone();
            let caller = options.callback.clone();
            let wrapped: AsyncDetail = Arc::new(move |details: Details| {
                match details.values().find_map(|d| d.result.clone().err()) {
                    Some(error) => {
                        retryer.retry(config.interval_for(&error), Err(error));
                    }
                    None => {
                        if let Some(caller) = &caller {
                            caller(details);
                        }
                    }
                }
            });
            Some(wrapped)
        } else {
            options.callback.clone()
        };

        debug!(store = %meta, mode = ?options.mode, "store sync start");
        let targets = [DEFAULT_ID.to_string()];
        if let Err(error) = handle.sync(&targets, options.mode, query, callback, options.wait) {
            warn!(store = %meta, %error, "store sync failed");
            if options.auto_retry {
                retryer.retry(self.config.interval_for(&error), Err(error));
            } else {
                report_failure(options.callback.as_ref(), error);
            }
        }
    }

    fn on_local_change(&self, event: &CloudEvent) {
        let CloudEvent::LocalChange {
            store,
            options,
            query,
        } = event
        else {
            return;
        };
        let mut info = SyncInfo::for_store(
            &self.ids,
            store.user,
            store.bundle_name.clone(),
            store.store_name.clone(),
            Vec::<String>::new(),
        )
        .with_mode(options.mode)
        .with_wait(options.wait);
        if let Some(callback) = &options.callback {
            info = info.with_callback(Arc::clone(callback));
        }
        if let Some(query) = query {
            info = info.with_query(query.clone());
        }
        let attempt = self.config.client_start_attempt(options.auto_retry);
        debug!(user = store.user, store = %store.store_name, attempt, "local change, syncing now");
        self.run_task(attempt, options.auto_retry, info);
    }
}

impl RetryScheduler for CloudSyncManager {
    fn schedule_retry(&self, state: &RetryState, interval: Duration) -> SyncResult<bool> {
        let executor = self.executor()?;
        let sync_id = state.info.sync_id();
        let mut retries = self.retries.lock();
        if retries.contains_key(&sync_id) {
            return Ok(false);
        }
        let task = self.arm(
            &executor,
            Slot::Retry(sync_id),
            interval,
            state.attempt + 1,
            state.info.clone(),
        )?;
        retries.insert(sync_id, task);
        Ok(true)
    }
}

impl Drop for CloudSyncManager {
    fn drop(&mut self) {
        for (topic, id) in &self.subscriptions {
            self.events.remove_handler(*topic, *id);
        }
        let mut scheduled: Vec<ActiveTask> =
            self.actives.get_mut().drain().map(|(_, task)| task).collect();
        scheduled.extend(self.retries.get_mut().drain().map(|(_, task)| task));
        if let Some(executor) = self.executor.get_mut().take() {
            for task in scheduled {
                executor.remove_timer(task.timer);
            }
        }
    }
}
