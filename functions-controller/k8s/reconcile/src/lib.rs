//! The reconciliation engine.
//!
//! A level-triggered convergence loop: watch events mark function keys dirty
//! in a deduplicating work queue; a fixed pool of workers drains the queue,
//! one key per worker at a time, reading the parent from a local cache,
//! ensuring its child resources, and writing back the status subresource when
//! it has semantically changed. Failed keys are requeued with exponential
//! backoff; the next observed cache change re-enqueues a key naturally even
//! after the retry budget is spent.
//!
//! ```text
//! [ watch ] -> [ Store + WorkQueue ] -> [ Reconciler ] -> [ ensure children ]
//!                                             |
//!                                             +-> [ status subresource ]
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
pub mod queue;
mod reconciler;
pub mod resources;
mod status;
pub mod sync;


pub use self::{
    cache::{FunctionIndex, Store},
    client::{Cluster, ClusterApi, EventSink, KubeCluster},
    queue::WorkQueue,
    reconciler::{run_workers, Policy, Reconciler, Settings},
    status::StatusWriter,
};
