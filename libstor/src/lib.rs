//! # libstor — storage-orchestration core
//!
//! `libstor` is the request-scoped context propagation and concurrent
//! task-dispatch core of a storage-orchestration service: a uniform
//! volume/snapshot API fanned out across many heterogeneous backend
//! drivers.  It is built on the Tokio async runtime, with `tracing` for
//! observability and `thiserror` for structured errors.
//!
//! The transport layer, payload schemas, and concrete drivers live outside
//! this crate; they interact with the core through [`Context`],
//! [`TaskTracker`], and the [`StorageDriver`] contract.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: volumes, snapshots, instance identity, transactions. |
//! | [`error`] | [`StorError`] enum covering all failure modes, incl. partial-batch failure. |
//! | [`context`] | Immutable persistent request context: keyed bindings, copy-on-write logger, fallback join. |
//! | [`task`] | Task handles, the `Pending → Running → Succeeded/Failed` state machine, scheduling and wait-all. |
//! | [`service`] | [`StorageDriver`] capability contract, named services, the service registry. |
//! | [`dispatch`] | Volume operations: single-service wrappers and the multi-service fan-out aggregator. |
//!
//! ## Dispatching an operation
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use libstor::*;
//! # async fn example(registry: ServiceRegistry) {
//! let ctx = Context::background().require_tx();
//! let task = dispatch::volumes(&registry, &ctx, VolumesOpts::default(), None, None);
//! task.wait().await;
//! match task.error() {
//!     None => println!("all backends listed: {:?}", task.result()),
//!     Some(err) => eprintln!("partial failure: {err}"),
//! }
//! # }
//! ```

pub mod context;
pub mod dispatch;
pub mod error;
pub mod service;
pub mod task;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use context::{Carrier, Context, ContextValue, Key, LogFormat, LogLevel, LogSink, Logger};
pub use error::{BatchError, StorError};
pub use service::{ServiceRegistry, StorageDriver, StorageService};
pub use task::{Task, TaskId, TaskState, TaskTracker, TaskValidator};
pub use types::*;
