//! Command-line surface of `kiln-server`.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::feature_gates::FeatureGates;

/// Name of the root shard.
pub const ROOT_SHARD: &str = "root";

/// File name of the credential document inside the root directory.
pub const CREDENTIALS_FILE_NAME: &str = "admin.credentials";

/// kiln control-plane service.
#[derive(Debug, Clone, Parser)]
#[command(name = "kiln-server", version, about)]
pub struct ServerOptions {
    /// Directory holding all runtime state
    #[arg(long, default_value = ".kiln")]
    pub root_directory: PathBuf,

    /// Address the HTTP endpoints bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub bind_address: IpAddr,

    /// Port of the HTTP endpoints (0 picks a free port)
    #[arg(long, default_value_t = 6443)]
    pub secure_port: u16,

    /// Client port of the embedded store
    #[arg(long, default_value_t = 2379)]
    pub embedded_store_client_port: u16,

    /// Peer port of the embedded store
    #[arg(long, default_value_t = 2380)]
    pub embedded_store_peer_port: u16,

    /// Write-ahead log segment size of the embedded store
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub embedded_store_wal_size_bytes: u64,

    /// Where to write the credential document (default:
    /// <root-directory>/admin.credentials)
    #[arg(long)]
    pub credentials_path: Option<PathBuf>,

    /// Comma-separated Name=bool pairs, e.g. CacheReplication=true
    #[arg(long, default_value = "")]
    pub feature_gates: FeatureGates,

    /// Append one JSON line per HTTP request to this file
    #[arg(long)]
    pub audit_log_path: Option<PathBuf>,

    /// Controller configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Name of the shard this process serves
    #[arg(long, default_value = ROOT_SHARD)]
    pub shard_name: String,
}

impl ServerOptions {
    /// Parses options from an argument vector without the program name.
    ///
    /// # Errors
    ///
    /// Returns the clap error for unknown or malformed flags.
    pub fn try_from_args<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let argv = std::iter::once(OsString::from("kiln-server"))
            .chain(args.into_iter().map(Into::into));
        Self::try_parse_from(argv)
    }

    /// Effective credential document path.
    #[must_use]
    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(|| self.root_directory.join(CREDENTIALS_FILE_NAME))
    }

    /// Whether this process serves the root shard.
    #[must_use]
    pub fn is_root_shard(&self) -> bool {
        self.shard_name == ROOT_SHARD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_gates::Feature;

    #[test]
    fn test_fleet_style_arguments() {
        let options = ServerOptions::try_from_args([
            "--root-directory",
            "/tmp/kiln/a",
            "--secure-port=7443",
            "--embedded-store-client-port=7379",
            "--embedded-store-peer-port=7380",
            "--embedded-store-wal-size-bytes=5000",
            "--credentials-path=/tmp/kiln/a/admin.credentials",
            "--feature-gates=CacheReplication=true",
            "--audit-log-path",
            "/tmp/artifacts/kiln.audit",
        ])
        .unwrap();

        assert_eq!(options.secure_port, 7443);
        assert_eq!(options.embedded_store_wal_size_bytes, 5000);
        assert!(options.feature_gates.enabled(Feature::CacheReplication));
        assert_eq!(
            options.credentials_path(),
            PathBuf::from("/tmp/kiln/a/admin.credentials")
        );
        assert!(options.is_root_shard());
    }

    #[test]
    fn test_defaults() {
        let options = ServerOptions::try_from_args(["--root-directory", "/srv/kiln"]).unwrap();
        assert_eq!(
            options.credentials_path(),
            PathBuf::from("/srv/kiln/admin.credentials")
        );
        assert!(!options.feature_gates.enabled(Feature::CacheReplication));
        assert_eq!(options.log_level, "info");
    }

    #[test]
    fn test_bad_feature_gate_rejected() {
        assert!(ServerOptions::try_from_args(["--feature-gates=Bogus=true"]).is_err());
    }
}
