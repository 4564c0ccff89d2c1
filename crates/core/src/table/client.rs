//! Table API client
//!
//! Every call passes through the same stack, outermost first:
//!
//! 1. the session authenticator supplies cookie and token headers;
//! 2. the rate limiter paces the call and retries throttled or transient
//!    failures;
//! 3. the circuit breaker short-circuits while the upstream is failing;
//! 4. the transport performs the HTTP exchange.
//!
//! Only upstream faults (5xx, 429, network errors) count against the
//! breaker. Client errors pass through it as successes and are mapped to
//! typed errors afterwards; a 401 or 403 also invalidates the session.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use ticketline_common::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, HealthStatus, Priority, RateLimiter,
    RateLimiterMetrics, ResilienceError,
};
use ticketline_domain::constants::{
    HEADER_TOTAL_COUNT, PARAM_DISPLAY_VALUE, PARAM_FIELDS, PARAM_LIMIT, PARAM_OFFSET, PARAM_QUERY,
    RESULT_KEY,
};
use ticketline_domain::{
    DisplayValueMode, InstanceConfig, Record, Result, TicketlineConfig, TicketlineError,
};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use super::policy::TableRetryPolicy;
use crate::session::SessionAuthenticator;
use crate::settings::{breaker_config, limiter_config};
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, ProxySelector, Transport};

/// Parameters of one page read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub table: String,
    /// Encoded query, empty for all rows
    pub query: String,
    pub offset: usize,
    pub limit: usize,
    pub fields: Option<Vec<String>>,
    pub display_value: DisplayValueMode,
}

impl ListRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            query: String::new(),
            offset: 0,
            limit: 100,
            fields: None,
            display_value: DisplayValueMode::All,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    #[must_use]
    pub const fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Option<Vec<String>>) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub const fn with_display_value(mut self, mode: DisplayValueMode) -> Self {
        self.display_value = mode;
        self
    }
}

/// One page of rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Record>,
    /// Server-side match count, when the response carried one
    pub total_count: Option<u64>,
}

/// Limiter and breaker state together
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientMetrics {
    pub limiter: RateLimiterMetrics,
    pub breaker: CircuitBreakerMetrics,
}

pub struct TableClient {
    api_base: String,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    authenticator: Arc<SessionAuthenticator>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    proxies: ProxySelector,
    policy: TableRetryPolicy,
}

impl fmt::Debug for TableClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableClient")
            .field("api_base", &self.api_base)
            .field("breaker", &self.breaker.state())
            .field("queue_size", &self.limiter.queue_size())
            .finish_non_exhaustive()
    }
}

impl TableClient {
    pub fn new(
        instance: &InstanceConfig,
        transport: Arc<dyn Transport>,
        authenticator: Arc<SessionAuthenticator>,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            api_base: instance.api_base(),
            timeout: instance.request_timeout(),
            transport,
            authenticator,
            limiter,
            breaker,
            proxies: ProxySelector::new(instance),
            policy: TableRetryPolicy,
        }
    }

    /// Client with limiter and breaker built from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::Config`] for invalid resilience settings.
    pub fn from_config(
        config: &TicketlineConfig,
        transport: Arc<dyn Transport>,
        authenticator: Arc<SessionAuthenticator>,
    ) -> Result<Self> {
        let limiter = RateLimiter::new(limiter_config(&config.rate_limit)?)
            .map_err(|e| TicketlineError::Config(e.to_string()))?;
        let breaker = CircuitBreaker::new(breaker_config(&config.circuit_breaker)?)
            .map_err(|e| TicketlineError::Config(e.to_string()))?;
        Ok(Self::new(&config.instance, transport, authenticator, limiter, breaker))
    }

    #[must_use]
    pub fn with_proxy_selector(mut self, proxies: ProxySelector) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn authenticator(&self) -> &Arc<SessionAuthenticator> {
        &self.authenticator
    }

    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Start the limiter's health monitor.
    pub fn start(&self) {
        self.limiter.start();
    }

    /// Stop the limiter; queued and new calls fail.
    pub async fn stop(&self) {
        self.limiter.stop().await;
    }

    pub fn metrics(&self) -> ClientMetrics {
        ClientMetrics { limiter: self.limiter.metrics(), breaker: self.breaker.metrics() }
    }

    pub fn health_status(&self) -> HealthStatus {
        self.limiter.health_status()
    }

    pub fn queue_size(&self) -> usize {
        self.limiter.queue_size()
    }

    /// Force the breaker closed.
    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    /// Read one page of `request.table`.
    ///
    /// # Errors
    ///
    /// Returns the classified transport, auth, breaker or remote error, or
    /// [`TicketlineError::RemoteQuery`] for a body without a `result` array.
    #[instrument(skip(self, request), fields(table = %request.table, offset = request.offset))]
    pub async fn list(&self, request: &ListRequest, priority: Priority) -> Result<Page> {
        let mut url = self.table_url(&request.table, None)?;
        {
            let mut pairs = url.query_pairs_mut();
            if !request.query.is_empty() {
                pairs.append_pair(PARAM_QUERY, &request.query);
            }
            pairs
                .append_pair(PARAM_LIMIT, &request.limit.to_string())
                .append_pair(PARAM_OFFSET, &request.offset.to_string())
                .append_pair(PARAM_DISPLAY_VALUE, &request.display_value.to_string());
            if let Some(fields) = request.fields.as_ref().filter(|f| !f.is_empty()) {
                pairs.append_pair(PARAM_FIELDS, &fields.join(","));
            }
        }

        let response = self.send(HttpMethod::Get, url.as_str(), None, priority).await?;
        let total_count = response.header(HEADER_TOTAL_COUNT).and_then(|v| v.trim().parse().ok());
        let rows = match result_of(&response)? {
            Value::Array(rows) => rows.into_iter().map(Record::from_wire).collect::<Result<_>>()?,
            other => {
                return Err(TicketlineError::RemoteQuery {
                    status: response.status,
                    message: format!("expected a result array, got {other}"),
                })
            }
        };
        let page = Page { rows, total_count };
        info!(rows = page.rows.len(), total_count = ?page.total_count, "page_fetched");
        Ok(page)
    }

    /// Fetch one row by `sys_id`.
    ///
    /// # Errors
    ///
    /// As [`TableClient::list`]; a missing row is `Ok(None)`.
    pub async fn get(
        &self,
        table: &str,
        sys_id: &str,
        display_value: DisplayValueMode,
        priority: Priority,
    ) -> Result<Option<Record>> {
        let request = ListRequest::new(table)
            .with_query(format!("{}={sys_id}", ticketline_domain::constants::SYS_ID))
            .with_page(0, 1)
            .with_display_value(display_value);
        Ok(self.list(&request, priority).await?.rows.into_iter().next())
    }

    /// Insert a row and return the server's copy.
    ///
    /// # Errors
    ///
    /// As [`TableClient::list`].
    #[instrument(skip(self, payload), fields(table = %table, fields = payload.len()))]
    pub async fn create(
        &self,
        table: &str,
        payload: Map<String, Value>,
        priority: Priority,
    ) -> Result<Record> {
        let url = self.table_url(table, None)?;
        let response =
            self.send(HttpMethod::Post, url.as_str(), Some(Value::Object(payload)), priority).await?;
        let record = Record::from_wire(result_of(&response)?)?;
        info!(sys_id = record.sys_id().unwrap_or_default(), "record_created");
        Ok(record)
    }

    /// Write `payload` to an existing row and return the server's copy.
    ///
    /// # Errors
    ///
    /// As [`TableClient::list`].
    #[instrument(skip(self, payload), fields(table = %table, fields = payload.len()))]
    pub async fn update(
        &self,
        table: &str,
        sys_id: &str,
        payload: Map<String, Value>,
        priority: Priority,
    ) -> Result<Record> {
        let url = self.table_url(table, Some(sys_id))?;
        let response =
            self.send(HttpMethod::Put, url.as_str(), Some(Value::Object(payload)), priority).await?;
        let record = Record::from_wire(result_of(&response)?)?;
        debug!("record_updated");
        Ok(record)
    }

    /// # Errors
    ///
    /// As [`TableClient::list`].
    #[instrument(skip(self), fields(table = %table))]
    pub async fn delete(&self, table: &str, sys_id: &str, priority: Priority) -> Result<()> {
        let url = self.table_url(table, Some(sys_id))?;
        self.send(HttpMethod::Delete, url.as_str(), None, priority).await?;
        debug!("record_deleted");
        Ok(())
    }

    fn table_url(&self, table: &str, sys_id: Option<&str>) -> Result<Url> {
        let mut raw = format!("{}/table/{}", self.api_base, urlencoding::encode(table));
        if let Some(id) = sys_id {
            raw.push('/');
            raw.push_str(&urlencoding::encode(id));
        }
        Url::parse(&raw).map_err(|e| TicketlineError::Config(format!("invalid table URL {raw}: {e}")))
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<Value>,
        priority: Priority,
    ) -> Result<HttpResponse> {
        let credential = self.authenticator.authenticate().await?;
        let request_id = Uuid::new_v4();

        let mut request = HttpRequest::new(method, url)
            .with_headers(credential.request_headers())
            .with_header("X-Request-Id", request_id.to_string())
            .with_header("Accept", "application/json")
            .with_timeout(self.timeout)
            .with_proxy(self.proxies.select(url));
        if let Some(body) = &body {
            request = request.with_json_body(body);
        }
        debug!(%request_id, method = %method, url, "table_request");

        let outcome = self
            .limiter
            .execute(priority, &self.policy, || {
                let request = request.clone();
                async move {
                    self.breaker
                        .execute(|| async move {
                            let response = self.transport.send(request).await?;
                            match upstream_fault(&response) {
                                Some(err) => Err(err),
                                None => Ok(response),
                            }
                        })
                        .await
                        .map_err(flatten)
                }
            })
            .await;
        let response = outcome.map_err(flatten)?;

        match TicketlineError::from_status(response.status, error_message(&response.body)) {
            None => Ok(response),
            Some(err @ TicketlineError::Authentication(_)) => {
                warn!(%request_id, status = response.status, "session_rejected");
                self.authenticator.invalidate().await;
                Err(err)
            }
            Some(err) => {
                debug!(%request_id, status = response.status, error = %err, "request_rejected");
                Err(err)
            }
        }
    }
}

/// Statuses that count as upstream failures inside the breaker.
fn upstream_fault(response: &HttpResponse) -> Option<TicketlineError> {
    match response.status {
        429 | 500..=599 => {
            TicketlineError::from_status(response.status, error_message(&response.body))
        }
        _ => None,
    }
}

fn flatten(err: ResilienceError<TicketlineError>) -> TicketlineError {
    match err {
        ResilienceError::CircuitOpen => {
            TicketlineError::CircuitOpen("upstream is failing, call rejected".into())
        }
        ResilienceError::LimiterStopped => {
            TicketlineError::InvalidState("rate limiter is stopped".into())
        }
        ResilienceError::OperationFailed { source } => source,
    }
}

fn result_of(response: &HttpResponse) -> Result<Value> {
    let mut body: Value = response.json()?;
    match body.get_mut(RESULT_KEY).map(Value::take) {
        Some(result) => Ok(result),
        None => Err(TicketlineError::RemoteQuery {
            status: response.status,
            message: format!("response has no {RESULT_KEY} member"),
        }),
    }
}

/// `error.message` (plus `error.detail`) from a table API error body, or
/// the raw body.
fn error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let message = error.and_then(|e| e.get("message")).and_then(Value::as_str);
    let detail = error.and_then(|e| e.get("detail")).and_then(Value::as_str);
    match (message, detail) {
        (Some(m), Some(d)) if !d.is_empty() => format!("{m}: {d}"),
        (Some(m), _) => m.to_string(),
        _ if body.trim().is_empty() => "empty response body".to_string(),
        _ => body.trim().to_string(),
    }
}
