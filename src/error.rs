use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub type Result<T, E = LauncherError> = std::result::Result<T, E>;

/// Failures surfaced by the installer and supervisor layers.
///
/// Installer methods emit a status event describing the failure and then
/// return one of these so the calling sequence can halt.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("the Python runtime is not installed; install it first")]
    RuntimeNotInstalled,

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("command `{command}` exited with status {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("no Python interpreter found in environment (tried {})", format_paths(.tried))]
    InterpreterNotFound { tried: Vec<PathBuf> },

    #[error("repository is not cloned at {0:?}")]
    RepoNotCloned(PathBuf),

    #[error("network error: {0}")]
    Network(String),

    #[error("no `{name}` worker process appeared after {attempts} attempts")]
    WorkerNotFound { name: String, attempts: u32 },

    #[error("command `{command}` timed out after {}s", .after.as_secs())]
    TimedOut { command: String, after: Duration },

    #[error("an operation for `{0}` is already in progress")]
    OperationInFlight(String),

    #[error("not enough disk space at {path:?}: {available_gb:.1} GB free, {required_gb:.1} GB required")]
    InsufficientDiskSpace {
        path: PathBuf,
        available_gb: f64,
        required_gb: f64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl LauncherError {
    /// Whether the user can fix this by running a missing step or retrying,
    /// as opposed to a malformed install that needs a reinstall.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LauncherError::RuntimeNotInstalled
                | LauncherError::NotInstalled(_)
                | LauncherError::RepoNotCloned(_)
                | LauncherError::Network(_)
                | LauncherError::WorkerNotFound { .. }
                | LauncherError::TimedOut { .. }
                | LauncherError::OperationInFlight(_)
                | LauncherError::InsufficientDiskSpace { .. }
        )
    }
}

impl From<reqwest::Error> for LauncherError {
    fn from(err: reqwest::Error) -> Self {
        LauncherError::Network(err.to_string())
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
