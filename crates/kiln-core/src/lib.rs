#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! kiln-core - lifecycle orchestration for the kiln control plane
//!
//! This crate sequences the background control loops of one long-running
//! kiln service. Loops are registered as named activation hooks, held back
//! behind one-shot readiness gates until their data sources have loaded,
//! and then launched as worker pools under a shared cancellation tree.
//!
//! # Runtime Requirements
//!
//! Hook execution and loop launching spawn tokio tasks, so the entry points
//! [`lifecycle::LifecycleManager::run_activation_hooks`] and
//! [`launcher::ControlLoopLauncher::launch`] must be called from within a
//! tokio runtime.
//!
//! # Modules
//!
//! - [`readiness`]: one-shot readiness gates and the required/optional pair
//! - [`lifecycle`]: activation and pre-shutdown hook registry
//! - [`launcher`]: control-loop launcher, work queue and loop supervisor
//! - [`source`]: data-source abstraction and an in-memory implementation
//! - [`credentials`]: credential documents and the polling loader
//! - [`config`]: static controller configuration
//! - [`client`]: shared connection configuration
//! - [`backoff`]: requeue backoff policy

pub mod backoff;
pub mod client;
pub mod config;
pub mod credentials;
pub mod launcher;
pub mod lifecycle;
pub mod readiness;
pub mod source;

pub use client::ClientConfig;
pub use config::KilnConfig;
pub use lifecycle::{HookContext, HookError, LifecycleError, LifecycleManager};
pub use readiness::{GateError, GateRequirement, ReadinessGate, SyncGates};
