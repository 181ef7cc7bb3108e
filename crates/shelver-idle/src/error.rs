use std::path::PathBuf;

use shelver_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to read access log {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cursor store error: {0}")]
    Cursor(#[from] StateError),
}

pub type WatchResult<T> = Result<T, WatchError>;
