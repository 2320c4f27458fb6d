//! How the server executable is invoked.

use std::ffi::OsString;
use std::path::PathBuf;

/// Environment variable naming a prebuilt `kiln-server` binary.
pub const SERVER_BIN_ENV: &str = "KILN_SERVER_BIN";

/// Command line used to start one subprocess instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    /// Run a built binary directly.
    Direct(PathBuf),
    /// Build and run through `cargo run`. The server is a grandchild of the
    /// fleet, which is why instances get their own process group.
    CargoRun,
    /// Arbitrary program and leading arguments.
    Custom {
        /// Program to execute.
        program: PathBuf,
        /// Arguments placed before the instance arguments.
        args: Vec<OsString>,
    },
}

impl ServerCommand {
    /// [`SERVER_BIN_ENV`] if set, otherwise [`ServerCommand::CargoRun`].
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var_os(SERVER_BIN_ENV)
            .filter(|v| !v.is_empty())
            .map_or(Self::CargoRun, |bin| Self::Direct(PathBuf::from(bin)))
    }

    /// Program and arguments, followed by `instance_args`.
    #[must_use]
    pub fn command_line(&self, instance_args: &[String]) -> (PathBuf, Vec<OsString>) {
        let (program, mut args) = match self {
            Self::Direct(path) => (path.clone(), Vec::new()),
            Self::CargoRun => (
                PathBuf::from("cargo"),
                ["run", "-q", "-p", "kiln-server", "--"]
                    .into_iter()
                    .map(OsString::from)
                    .collect(),
            ),
            Self::Custom { program, args } => (program.clone(), args.clone()),
        };
        args.extend(instance_args.iter().map(OsString::from));
        (program, args)
    }
}
