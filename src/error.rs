//! Error types for the importer, the watcher and the token flow.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Settings or import configuration missing or malformed. Fatal before any remote call.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication failed or the service could not be reached while connecting.
    #[error("Cannot connect to remote store: {0}")]
    RemoteConnect(String),

    /// A single-file run got a path that does not resolve to a configured subdirectory.
    #[error("Cannot resolve {path} against {root}: {reason}")]
    PathResolution {
        path: PathBuf,
        root: PathBuf,
        reason: String,
    },

    /// Source file could not be read. Skips that file only.
    #[error("Cannot read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote store rejected a call or the transport failed.
    #[error("Remote store error: {0}")]
    RemoteStore(String),

    #[error("Application {0} is already running and cannot run twice")]
    AlreadyRunning(String),

    /// The authorization service refused a token request or exchange.
    #[error("OAuth handshake failed: {0}")]
    Handshake(String),

    /// The user denied access or the callback carried no verifier.
    #[error("Access request was rejected: {0}")]
    Rejected(String),

    #[error("Timed out after {0:?} waiting for the authorization callback")]
    TimedOut(std::time::Duration),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Per-file errors are logged and skipped; everything else ends the run.
    pub fn is_per_file(&self) -> bool {
        matches!(self, Error::FileRead { .. } | Error::RemoteStore(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::RemoteStore(e.to_string())
    }
}

impl From<thrift::Error> for Error {
    fn from(e: thrift::Error) -> Self {
        Error::RemoteStore(format!("thrift protocol: {}", e))
    }
}

impl From<notify::Error> for Error {
    fn from(e: notify::Error) -> Self {
        Error::Watch(e.to_string())
    }
}
