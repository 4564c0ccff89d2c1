//! In-process [`ConfigStore`]

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use ticketline_domain::Result;

use super::ports::ConfigStore;

/// Map-backed store for tests and sessions that need not outlive the process
#[derive(Debug, Default)]
pub struct InMemoryConfigStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous read for assertions.
    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_config(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let store = InMemoryConfigStore::new();
        assert_eq!(store.get_config("session.error_count").await.unwrap(), None);

        store.set_config("session.error_count", json!(2)).await.unwrap();
        store.set_config("session.error_count", json!(3)).await.unwrap();
        assert_eq!(store.get_config("session.error_count").await.unwrap(), Some(json!(3)));
        assert_eq!(store.snapshot("session.error_count"), Some(json!(3)));
    }
}
