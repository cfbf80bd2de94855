use std::io;
use std::path::PathBuf;

/// Failures that can occur while driving a [`crate::task::Task`] or the
/// on-disk log store. IPC-visible "not found" conditions are sentinel
/// values (-1, false, empty strings), not `Err` — see `spec.md` §7.
#[derive(Debug, thiserror::Error)]
pub enum TaskdError {
    #[error("failed to create log directory {path}: {source}")]
    LogDirCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open log file {path}: {source}")]
    LogFileOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn {cmdline}: {source}")]
    Spawn {
        cmdline: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start task thread for {cmdline}: {source}")]
    ThreadSpawn {
        cmdline: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TaskdError>;
