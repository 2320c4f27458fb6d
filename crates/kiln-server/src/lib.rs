#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! kiln-server - the kiln control-plane service
//!
//! Wires the lifecycle machinery of `kiln-core` into a runnable process:
//! it binds the embedded store ports and the HTTP listener, publishes a
//! credential document, registers one activation hook per control-loop
//! unit and signals the sync gates as its data sources load.
//!
//! [`run`] is the whole service. The `kiln-server` binary adds argument
//! parsing, logging and signal handling around it; tests and in-process
//! fleets call [`run_from_args`] directly.

pub mod feature_gates;
pub mod http;
pub mod metrics;
pub mod options;
pub mod server;
pub mod sources;
pub mod store;
pub mod units;

pub use options::ServerOptions;
pub use server::{run, run_from_args};
