//! Process-wide port and directory reservations.
//!
//! Instances created concurrently, including by different fleets in the same
//! test binary, draw from one registry so two instances are never handed the
//! same port or data directory.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use tracing::trace;

use crate::error::InstanceError;

static RESERVED_PORTS: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(Mutex::default);
static CLAIMED_DIRS: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Mutex::default);

/// Attempts before giving up on finding an unreserved port.
const MAX_PROBES: usize = 64;

/// A reserved port, released on drop.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PortReservation {
    port: u16,
}

impl PortReservation {
    /// The reserved port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        RESERVED_PORTS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

/// Hands out free local ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortAllocator;

impl PortAllocator {
    /// Reserves a port that is currently free on 127.0.0.1 and not held by
    /// any other reservation in this process.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::NoFreePort`] if probing fails.
    pub fn reserve(self) -> Result<PortReservation, InstanceError> {
        for _ in 0..MAX_PROBES {
            let listener =
                TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(InstanceError::NoFreePort)?;
            let port = listener
                .local_addr()
                .map_err(InstanceError::NoFreePort)?
                .port();
            drop(listener);

            let mut reserved = RESERVED_PORTS
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if reserved.insert(port) {
                trace!(port, "reserved port");
                return Ok(PortReservation { port });
            }
        }
        Err(InstanceError::NoFreePort(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "every probed port was already reserved",
        )))
    }
}

/// Exclusive claim on a directory, released on drop.
#[derive(Debug)]
pub struct DirectoryClaim {
    path: PathBuf,
}

impl DirectoryClaim {
    /// Claims `path`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::DirectoryInUse`] if a live claim exists.
    pub fn claim(path: &Path) -> Result<Self, InstanceError> {
        let mut claimed = CLAIMED_DIRS.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.to_path_buf()) {
            return Err(InstanceError::DirectoryInUse(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// The claimed directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryClaim {
    fn drop(&mut self) {
        CLAIMED_DIRS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reservation_released_on_drop() {
        let reservation = PortAllocator.reserve().unwrap();
        let port = reservation.port();
        assert!(RESERVED_PORTS.lock().unwrap().contains(&port));
        drop(reservation);
        assert!(!RESERVED_PORTS.lock().unwrap().contains(&port));
    }

    #[test]
    fn test_directory_claim_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let claim = DirectoryClaim::claim(dir.path()).unwrap();
        assert!(matches!(
            DirectoryClaim::claim(dir.path()),
            Err(InstanceError::DirectoryInUse(_))
        ));
        drop(claim);
        assert!(DirectoryClaim::claim(dir.path()).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        #[cfg_attr(miri, ignore)]
        fn concurrent_reservations_never_collide(instances in 1usize..8) {
            let handles: Vec<_> = (0..instances)
                .map(|_| {
                    std::thread::spawn(|| {
                        (0..3)
                            .map(|_| PortAllocator.reserve().unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let reservations: Vec<PortReservation> = handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect();
            let unique: HashSet<u16> = reservations.iter().map(PortReservation::port).collect();
            prop_assert_eq!(unique.len(), 3 * instances);
        }
    }
}
