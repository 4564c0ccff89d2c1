//! JSON file [`ConfigStore`]
//!
//! The whole store is one JSON object. Every write rewrites the file through a
//! temporary sibling that is renamed into place, so a crash leaves either the
//! old or the new contents.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use ticketline_core::session::ConfigStore;
use ticketline_domain::{Result, TicketlineError};
use tracing::{debug, instrument};

use crate::errors::InfraError;

#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    entries: RwLock<Map<String, Value>>,
    /// Serializes flushes so renames land in write order
    write_lock: tokio::sync::Mutex<()>,
}

impl FileConfigStore {
    /// Open the store at `path`; a missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::Persistence`] when the file cannot be read
    /// or does not hold a JSON object.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Map::new(),
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(TicketlineError::Persistence(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )))
                }
                Err(err) => {
                    return Err(TicketlineError::Persistence(format!(
                        "{} is not valid JSON: {err}",
                        path.display()
                    )))
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(InfraError::from(err).into()),
        };
        debug!(keys = entries.len(), "config_store_opened");
        Ok(Self { path, entries: RwLock::new(entries), write_lock: tokio::sync::Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let contents = serde_json::to_vec_pretty(&*self.entries.read())?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await.map_err(InfraError::from)?;

        let target = self.path.clone();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), InfraError> {
            let mut staging = NamedTempFile::new_in(&dir)?;
            staging.write_all(&contents)?;
            staging.as_file().sync_all()?;
            staging.persist(&target)?;
            Ok(())
        })
        .await
        .map_err(|err| TicketlineError::Internal(format!("store flush task failed: {err}")))?
        .map_err(TicketlineError::from)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_config(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        self.flush().await
    }
}
