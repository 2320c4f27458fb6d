//! Embedded store placeholder holding the store ports and data directory.

use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Errors from bringing up the embedded store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store port could not be bound.
    #[error("failed to bind embedded store {role} port {addr}: {source}")]
    Bind {
        /// `client` or `peer`.
        role: &'static str,
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The data directory could not be created.
    #[error("failed to create embedded store directory {path}: {source}")]
    Directory {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Ports and directory reserved for the embedded store for as long as the
/// value lives.
#[derive(Debug)]
pub struct EmbeddedStore {
    client: TcpListener,
    peer: TcpListener,
    data_dir: PathBuf,
    wal_size_bytes: u64,
}

impl EmbeddedStore {
    /// Binds both ports on `bind` and creates `<root>/store`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a port is taken or the directory cannot be
    /// created.
    pub fn open(
        root: &Path,
        bind: IpAddr,
        client_port: u16,
        peer_port: u16,
        wal_size_bytes: u64,
    ) -> Result<Self, StoreError> {
        let data_dir = root.join("store");
        std::fs::create_dir_all(&data_dir).map_err(|source| StoreError::Directory {
            path: data_dir.clone(),
            source,
        })?;

        let bind_port = |role, port| {
            let addr = SocketAddr::new(bind, port);
            TcpListener::bind(addr).map_err(|source| StoreError::Bind { role, addr, source })
        };
        let client = bind_port("client", client_port)?;
        let peer = bind_port("peer", peer_port)?;

        let store = Self {
            client,
            peer,
            data_dir,
            wal_size_bytes,
        };
        info!(
            client = ?store.client_addr(),
            peer = ?store.peer_addr(),
            wal_size_bytes,
            "embedded store listening"
        );
        Ok(store)
    }

    /// Bound client address.
    #[must_use]
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client.local_addr().ok()
    }

    /// Bound peer address.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer.local_addr().ok()
    }

    /// Data directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Configured write-ahead log segment size.
    #[must_use]
    pub const fn wal_size_bytes(&self) -> u64 {
        self.wal_size_bytes
    }
}
