#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

//! kiln-fleet - run fleets of kiln-server instances for integration tests
//!
//! A [`Fleet`] owns N independent service instances, each with its own
//! ports and directories. Instances start concurrently, either as
//! subprocesses in their own process group or as in-process tasks, and the
//! fleet is only handed back once every instance answered its readiness
//! probe. Teardown collects artifacts and metrics before terminating each
//! instance with SIGTERM.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_fleet::{Fleet, FleetOptions, InstanceConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fleet = Fleet::start(
//!     FleetOptions::from_env(),
//!     vec![InstanceConfig::new("main", "target/artifacts", "target/data")],
//! )
//! .await?;
//! let client = fleet.instances()[0].shard_config("my-test")?;
//! println!("serving at {}", client.server);
//! fleet.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod artifacts;
pub mod command;
pub mod error;
pub mod fleet;
pub mod instance;
pub mod logs;
pub mod ports;
pub mod spawn;
pub mod state;

pub use artifacts::Artifact;
pub use command::ServerCommand;
pub use error::{ArtifactError, FleetError, InstanceError};
pub use fleet::{Fleet, FleetOptions};
pub use instance::{InProcessServer, InstanceConfig, ServiceInstance};
pub use logs::{LogFilter, LogSink};
pub use state::InstanceState;
