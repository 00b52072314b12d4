//! Error types for chatrelay.

use std::path::PathBuf;

use thiserror::Error;

use crate::executor::ExecError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Data directory {} is locked by another instance", .0.display())]
    Locked(PathBuf),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn persistence(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Error::Persistence(format!("{}: {}", path.display(), err))
    }
}
