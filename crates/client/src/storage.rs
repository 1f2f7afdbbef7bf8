//! File-backed persistence for distributor state.
//!
//! State is stored as one JSON file per distributor under a working
//! directory.  Saves go through a temporary file followed by an atomic
//! rename, so a crash mid-write never clobbers the previous state.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use thiserror::Error;

const STORE_PREFIX: &str = "file";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot decode persisted state: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot persist state: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Persists one distributor's state in its working directory.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(dist_name: &str, working_dir: impl Into<PathBuf>) -> Self {
        let mut path = working_dir.into();
        path.push(format!("{STORE_PREFIX}-{dist_name}.json"));
        Self { path }
    }

    /// Loads the persisted state.  A store that was never saved yields
    /// `None`; anything else that keeps us from reading the state is an
    /// error, so callers can distinguish "fresh start" from "lost state".
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, StoreError> {
        tracing::info!(path = %self.path.display(), "attempting to load state");
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Saves the given state.
    pub fn save<T: Serialize>(&self, state: &T) -> Result<(), StoreError> {
        tracing::info!(path = %self.path.display(), "attempting to save state");
        let dir = self.path.parent().unwrap_or(std::path::Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut file, state)?;
        file.flush()?;
        file.persist(&self.path)?;
        Ok(())
    }
}
