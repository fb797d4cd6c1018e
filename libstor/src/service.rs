//! Backend services and the service registry.
//!
//! A [`StorageService`] is one configured, named instance of a storage
//! driver; the [`ServiceRegistry`] holds every service the process
//! dispatches operations to, plus the [`TaskTracker`] those operations are
//! scheduled on.  The actual driver implementations live outside this
//! crate — the core depends only on the [`StorageDriver`] capability
//! contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::context::Context;
use crate::error::StorError;
use crate::task::{Task, TaskId, TaskTracker, TaskValidator};
use crate::types::{
    Snapshot, Volume, VolumeAttachOpts, VolumeCreateOpts, VolumeDetachOpts, VolumeInspectOpts,
    VolumesOpts,
};

/// Capability contract every backend storage driver implements.
///
/// Drivers receive the derived request context — through which they can
/// resolve the bound service, instance identity, and local devices — and
/// return a result or an error.  The core imposes nothing else: retry and
/// backoff policy, wire protocols, and device discovery are all the
/// driver's business.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// The driver's name, used to key instance-identity and local-device
    /// maps (matched case-insensitively).
    fn name(&self) -> &str;

    /// List the volumes known to the backend.
    async fn volumes(&self, ctx: &Context, opts: &VolumesOpts) -> Result<Vec<Volume>, StorError>;

    /// Inspect a single volume by identifier.
    async fn volume_inspect(
        &self,
        ctx: &Context,
        volume_id: &str,
        opts: &VolumeInspectOpts,
    ) -> Result<Volume, StorError>;

    /// Create a new volume.
    async fn volume_create(
        &self,
        ctx: &Context,
        name: &str,
        opts: &VolumeCreateOpts,
    ) -> Result<Volume, StorError>;

    /// Copy an existing volume to a new one.
    async fn volume_copy(
        &self,
        ctx: &Context,
        volume_id: &str,
        volume_name: &str,
    ) -> Result<Volume, StorError>;

    /// Take a snapshot of a volume.
    async fn volume_snapshot(
        &self,
        ctx: &Context,
        volume_id: &str,
        snapshot_name: &str,
    ) -> Result<Snapshot, StorError>;

    /// Attach a volume to the context's instance.  Returns the updated
    /// volume and an optional driver-issued attachment token.
    async fn volume_attach(
        &self,
        ctx: &Context,
        volume_id: &str,
        opts: &VolumeAttachOpts,
    ) -> Result<(Volume, Option<String>), StorError>;

    /// Detach a volume from the context's instance.
    async fn volume_detach(
        &self,
        ctx: &Context,
        volume_id: &str,
        opts: &VolumeDetachOpts,
    ) -> Result<Volume, StorError>;

    /// Remove a volume.
    async fn volume_remove(&self, ctx: &Context, volume_id: &str) -> Result<(), StorError>;
}

/// One configured, named backend service.
pub struct StorageService {
    name: String,
    driver: Arc<dyn StorageDriver>,
    tracker: Arc<TaskTracker>,
}

impl StorageService {
    /// Create a service binding `name` to `driver`, scheduling its work on
    /// `tracker`.  Service names are case-insensitive and stored lowercased.
    pub fn new(name: &str, driver: Arc<dyn StorageDriver>, tracker: Arc<TaskTracker>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_lowercase(),
            driver,
            tracker,
        })
    }

    /// The service's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The driver backing this service.
    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Schedule `run` against this service as a tracked task.
    ///
    /// The work function receives the derived context and this service's
    /// handle; its result is validated by `validator` (if any) before the
    /// task is considered successful.
    pub fn task_execute<F, Fut>(
        self: &Arc<Self>,
        ctx: &Context,
        run: F,
        validator: Option<TaskValidator>,
    ) -> Arc<Task>
    where
        F: FnOnce(Context, Arc<StorageService>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, StorError>> + Send + 'static,
    {
        let svc = self.clone();
        self.tracker.execute(ctx, move |ctx| run(ctx, svc), validator)
    }
}

impl fmt::Debug for StorageService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageService")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// Every named backend service the process dispatches to.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<StorageService>>,
    tracker: Arc<TaskTracker>,
}

impl ServiceRegistry {
    /// Create an empty registry with a fresh task tracker.
    pub fn new() -> Self {
        Self::with_tracker(Arc::new(TaskTracker::new()))
    }

    /// Create an empty registry scheduling on an existing tracker.
    pub fn with_tracker(tracker: Arc<TaskTracker>) -> Self {
        Self {
            services: DashMap::new(),
            tracker,
        }
    }

    /// Register a named service for `driver` and return its handle.
    ///
    /// Re-registering a name replaces the previous service.
    pub fn register(&self, name: &str, driver: Arc<dyn StorageDriver>) -> Arc<StorageService> {
        let svc = StorageService::new(name, driver, self.tracker.clone());
        self.services.insert(svc.name().to_owned(), svc.clone());
        svc
    }

    /// Look a service up by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<Arc<StorageService>> {
        self.services.get(&name.to_lowercase()).map(|s| s.clone())
    }

    /// Every registered service, in no particular order.
    pub fn services(&self) -> Vec<Arc<StorageService>> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// The tracker all of this registry's services schedule on.
    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    /// Schedule `run` as a top-level task not bound to any one service
    /// (e.g. a fan-out aggregator body).
    pub fn task_execute<F, Fut>(
        &self,
        ctx: &Context,
        run: F,
        validator: Option<TaskValidator>,
    ) -> Arc<Task>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, StorError>> + Send + 'static,
    {
        self.tracker.execute(ctx, run, validator)
    }

    /// Block until every referenced task has reached a terminal state.
    pub async fn wait_all(&self, ids: &[TaskId]) {
        self.tracker.wait_all(ids).await;
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.len())
            .finish()
    }
}
