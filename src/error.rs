//! Error types

use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the central server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server answered HTTP {0}")]
    Status(u16),

    #[error("server rejected request (code {code}): {msg}")]
    Api { code: i64, msg: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures executing a remotely issued task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task params are missing task_data")]
    MissingTaskData,

    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("refusing to write unsafe path {0}")]
    UnsafePath(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported task type '{0}'")]
    Unsupported(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("unknown service status '{0}'")]
    InvalidStatus(String),

    #[error("service {service} failed to start: {reason}")]
    ServiceStart { service: String, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TaskError {
    TaskError::Io {
        path: path.into(),
        source,
    }
}

/// The worker pool no longer accepts work.
#[derive(Debug, Error)]
#[error("worker pool is closed")]
pub struct PoolClosed;
