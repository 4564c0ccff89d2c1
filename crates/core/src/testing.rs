//! In-memory doubles for the transport and identity ports

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use ticketline_domain::{Result, SessionCookie, SessionCredential, TicketlineError};

use crate::session::IdentityProvider;
use crate::transport::{HttpRequest, HttpResponse, Transport};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;
type Matcher = dyn Fn(&HttpRequest) -> bool + Send + Sync;

/// Transport answering from a closure and recording every request
pub struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<HttpRequest>>,
    gate: Option<(Box<Matcher>, Arc<Semaphore>)>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        Self { handler: Box::new(handler), requests: Mutex::new(Vec::new()), gate: None }
    }

    /// Hold matching requests after recording them until `gate` hands out a
    /// permit; each held request consumes one.
    pub fn hold<M>(mut self, matches: M, gate: Arc<Semaphore>) -> Self
    where
        M: Fn(&HttpRequest) -> bool + Send + Sync + 'static,
    {
        self.gate = Some((Box::new(matches), gate));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request.clone());
        if let Some((matches, gate)) = &self.gate {
            if matches(&request) {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| TicketlineError::Transport("gate closed".into()))?;
                permit.forget();
            }
        }
        (self.handler)(&request)
    }
}

/// Identity provider issuing numbered credentials (`S1`, `S2`, ...)
#[derive(Debug, Default)]
pub struct CountingIdentityProvider {
    sign_ins: AtomicUsize,
    fail: bool,
}

impl CountingIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose every sign-in fails with an authentication error.
    pub fn failing() -> Self {
        Self { sign_ins: AtomicUsize::new(0), fail: true }
    }

    pub fn sign_ins(&self) -> usize {
        self.sign_ins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for CountingIdentityProvider {
    async fn sign_in(&self) -> Result<SessionCredential> {
        let n = self.sign_ins.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::task::yield_now().await;
        if self.fail {
            return Err(TicketlineError::Authentication("invalid credentials".into()));
        }
        let mut credential = SessionCredential::new(
            vec![SessionCookie { name: "JSESSIONID".into(), value: format!("S{n}") }],
            chrono::Utc::now(),
        );
        credential.session_id = Some(format!("S{n}"));
        credential.token = Some(format!("tok-{n}"));
        Ok(credential)
    }
}
