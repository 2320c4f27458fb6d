//! Process spawning and process-group signaling.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::InstanceError;

/// A spawned process with its child handle and PID.
pub struct SpawnedProcess {
    /// The child process handle.
    pub child: Child,
    /// The OS process ID, which is also its process group ID.
    pub pid: u32,
}

/// Spawns `program` as the leader of a new process group.
///
/// Stdout and stderr are piped so the caller can tee them.
///
/// # Errors
///
/// Returns [`InstanceError::Spawn`] if the process cannot be started and
/// [`InstanceError::MissingPid`] if it exited before its pid was read.
pub fn spawn(program: &Path, args: &[OsString]) -> Result<SpawnedProcess, InstanceError> {
    let mut cmd = Command::new(program);

    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(false);

    let child = cmd.spawn().map_err(|source| InstanceError::Spawn {
        command: program.display().to_string(),
        source,
    })?;

    let pid = child.id().ok_or(InstanceError::MissingPid)?;

    Ok(SpawnedProcess { child, pid })
}

/// Sends SIGTERM to every process in group `pgid`.
///
/// A group that no longer exists is not an error.
///
/// # Errors
///
/// Returns [`InstanceError::Signal`] for any other failure.
pub fn terminate_group(pgid: u32) -> Result<(), InstanceError> {
    let Ok(raw) = i32::try_from(pgid) else {
        return Err(InstanceError::Signal {
            pgid,
            source: Errno::EINVAL,
        });
    };
    match killpg(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(InstanceError::Signal { pgid, source }),
    }
}
