//! Shared helpers for kiln-server integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_fleet::{FleetOptions, InstanceConfig, ServerCommand, ServiceInstance};
use tokio_util::sync::CancellationToken;

/// Fleet options running `kiln_server::run_from_args` inside the test.
pub fn in_process_options() -> FleetOptions {
    FleetOptions::default()
        .with_in_process_server(|args: Vec<String>, shutdown: CancellationToken| {
            kiln_server::run_from_args(args, shutdown)
        })
        .with_ready_timeout(Duration::from_secs(30))
}

/// Fleet options spawning the `kiln-server` binary built for this test run.
pub fn subprocess_options() -> FleetOptions {
    FleetOptions::default()
        .with_command(ServerCommand::Direct(PathBuf::from(env!(
            "CARGO_BIN_EXE_kiln-server"
        ))))
        .with_ready_timeout(Duration::from_secs(30))
}

/// Config for `name` with both roots under `root`.
pub fn config(root: &Path, name: &str) -> InstanceConfig {
    InstanceConfig::new(name, root.join("artifacts"), root.join("data"))
}

/// GET `path` on the instance's shard with its bearer token.
pub async fn get_shard(instance: &ServiceInstance, path: &str) -> (u16, String) {
    let config = instance.shard_config("integration").unwrap();
    let response = reqwest::Client::new()
        .get(config.url(path))
        .bearer_auth(config.token.as_deref().unwrap())
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

/// GET `path` on the instance's base address with its bearer token.
pub async fn get_base(instance: &ServiceInstance, path: &str) -> (u16, String) {
    let config = instance.base_config("integration").unwrap();
    let response = reqwest::Client::new()
        .get(config.url(path))
        .bearer_auth(config.token.as_deref().unwrap())
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}
