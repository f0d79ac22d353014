//! Core types for the functions controller.
//!
//! This crate is independent of any Kubernetes client machinery. It defines
//! the condition state machine used to report convergence progress, the
//! namespace/name key used throughout the work queue and caches, and the
//! error taxonomy that drives retry decisions.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
mod error;
mod resource_id;

pub use self::{
    conditions::{Condition, ConditionManager, ConditionSet, ConditionStatus},
    error::{Error, Result},
    resource_id::ResourceId,
};

pub const CONTROLLER_NAME: &str = "functions-controller";
