//! Ports consumed by the session authenticator

use async_trait::async_trait;
use serde_json::Value;
use ticketline_domain::{Result, SessionCredential};

/// Key/value configuration store used to persist session state
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Stored value for `key`, or `None` when the key was never written.
    async fn get_config(&self, key: &str) -> Result<Option<Value>>;

    async fn set_config(&self, key: &str, value: Value) -> Result<()>;
}

/// Produces a fresh credential by signing in against the identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self) -> Result<SessionCredential>;
}
