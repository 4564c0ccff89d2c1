//! Wiring of the production adapters into a ready [`TableClient`]

use std::sync::Arc;

use ticketline_core::session::{
    ConfigStore, FormLoginProvider, IdentityProvider, InMemoryConfigStore, SessionAuthenticator,
};
use ticketline_core::table::{RecordCursor, TableClient};
use ticketline_core::transport::{ProxySelector, Transport};
use ticketline_domain::{Result, TicketlineConfig};
use tracing::info;

use crate::http::ReqwestTransport;
use crate::store::FileConfigStore;

/// Shared client plus the cursor settings it was configured with
#[derive(Debug, Clone)]
pub struct Ticketline {
    client: Arc<TableClient>,
    config: TicketlineConfig,
}

impl Ticketline {
    /// Validate `config`, build the reqwest transport, session store,
    /// form-login identity provider and table client, and start the limiter
    /// monitor.
    ///
    /// # Errors
    ///
    /// Returns `TicketlineError::Config` for invalid settings and
    /// `TicketlineError::Persistence` when the session store cannot be opened.
    pub async fn connect(config: TicketlineConfig) -> Result<Self> {
        Self::connect_with(config, Arc::new(ReqwestTransport::new())).await
    }

    /// As [`Ticketline::connect`] over a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// See [`Ticketline::connect`].
    pub async fn connect_with(
        config: TicketlineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn ConfigStore> = match &config.store_path {
            Some(path) => Arc::new(FileConfigStore::open(path).await?),
            None => Arc::new(InMemoryConfigStore::new()),
        };
        let proxies = ProxySelector::new(&config.instance);
        let identity: Arc<dyn IdentityProvider> = Arc::new(FormLoginProvider::new(
            Arc::clone(&transport),
            config.auth.clone(),
            proxies.clone(),
            config.instance.request_timeout(),
        )?);
        let authenticator = Arc::new(
            SessionAuthenticator::new(
                &config.instance,
                &config.auth,
                Arc::clone(&transport),
                identity,
                store,
            )
            .with_proxy_selector(proxies.clone()),
        );
        let client = TableClient::from_config(&config, transport, authenticator)?
            .with_proxy_selector(proxies);
        client.start();

        info!(
            api_base = %config.instance.api_base(),
            persisted_session = config.store_path.is_some(),
            "ticketline_connected"
        );
        Ok(Self { client: Arc::new(client), config })
    }

    pub fn client(&self) -> &Arc<TableClient> {
        &self.client
    }

    pub const fn config(&self) -> &TicketlineConfig {
        &self.config
    }

    /// Cursor over `table` using the configured paging settings.
    pub fn cursor(&self, table: &str) -> RecordCursor {
        RecordCursor::with_settings(Arc::clone(&self.client), table, self.config.cursor.clone())
    }

    /// Stop the limiter; queued and new calls fail.
    pub async fn shutdown(&self) {
        self.client.stop().await;
    }
}
