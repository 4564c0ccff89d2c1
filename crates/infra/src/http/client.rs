use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use reqwest::redirect::Policy;
use reqwest::{Client as ReqwestClient, Method, Proxy};
use ticketline_core::transport::{HttpMethod, HttpRequest, HttpResponse, Transport};
use ticketline_domain::{Result, TicketlineError};
use tracing::debug;

use crate::errors::InfraError;

const DIRECT_ROUTE: &str = "direct";

/// [`Transport`] backed by reqwest.
///
/// Keeps one pooled client per proxy route. Redirects are never followed
/// here; the identity handshake walks them itself to collect cookies.
#[derive(Clone)]
pub struct ReqwestTransport {
    clients: Cache<String, ReqwestClient>,
    user_agent: String,
    accept_invalid_certs: bool,
}

impl ReqwestTransport {
    /// Start building a new transport.
    pub fn builder() -> ReqwestTransportBuilder {
        ReqwestTransportBuilder::default()
    }

    /// Convenience constructor with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Number of pooled clients currently cached.
    pub fn route_count(&self) -> u64 {
        self.clients.run_pending_tasks();
        self.clients.entry_count()
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<ReqwestClient> {
        let key = proxy.unwrap_or(DIRECT_ROUTE).to_string();
        self.clients
            .try_get_with(key, || self.build_client(proxy))
            .map_err(|err| (*err).clone())
    }

    fn build_client(&self, proxy: Option<&str>) -> Result<ReqwestClient> {
        let mut builder = ReqwestClient::builder()
            .redirect(Policy::none())
            .user_agent(self.user_agent.clone());

        builder = match proxy {
            Some(url) => {
                let route = Proxy::all(url).map_err(|err| {
                    TicketlineError::Config(format!("invalid proxy URL {url}: {err}"))
                })?;
                builder.proxy(route)
            }
            None => builder.no_proxy(),
        };

        if self.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        debug!(route = proxy.unwrap_or(DIRECT_ROUTE), "http_client_built");
        builder.build().map_err(|err| {
            let infra: InfraError = err.into();
            TicketlineError::from(infra)
        })
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = self.client_for(request.proxy.as_deref())?;
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
        };

        let mut builder = client.request(method.clone(), &request.url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        debug!(%method, proxied = request.proxy.is_some(), "sending HTTP request");
        let response = builder.send().await.map_err(|err| {
            let infra: InfraError = err.into();
            TicketlineError::from(infra)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|err| {
            let infra: InfraError = err.into();
            TicketlineError::from(infra)
        })?;
        debug!(%method, status, "received HTTP response");

        Ok(HttpResponse { status, headers, body })
    }
}

/// Builder for [`ReqwestTransport`].
#[derive(Debug)]
pub struct ReqwestTransportBuilder {
    max_routes: u64,
    idle_route_ttl: Duration,
    user_agent: String,
    accept_invalid_certs: bool,
}

impl Default for ReqwestTransportBuilder {
    fn default() -> Self {
        Self {
            max_routes: 16,
            idle_route_ttl: Duration::from_secs(600),
            user_agent: format!("ticketline/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: false,
        }
    }
}

impl ReqwestTransportBuilder {
    /// Upper bound on distinct proxy routes kept pooled.
    pub fn max_routes(mut self, routes: u64) -> Self {
        self.max_routes = routes.max(1);
        self
    }

    pub fn idle_route_ttl(mut self, ttl: Duration) -> Self {
        self.idle_route_ttl = ttl;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Allow self-signed certificates (test instances only).
    pub fn accept_invalid_certs(mut self, enabled: bool) -> Self {
        self.accept_invalid_certs = enabled;
        self
    }

    pub fn build(self) -> ReqwestTransport {
        ReqwestTransport {
            clients: Cache::builder()
                .max_capacity(self.max_routes)
                .time_to_idle(self.idle_route_ttl)
                .build(),
            user_agent: self.user_agent,
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}
