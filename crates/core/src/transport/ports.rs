//! HTTP transport port
//!
//! The core never talks to the network directly; adapters in the infra crate
//! implement [`Transport`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use ticketline_domain::{Result, TicketlineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound request, fully resolved (headers, proxy route, timeout)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
    /// Proxy URL, or `None` for a direct connection
    pub proxy: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(120),
            proxy: None,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.headers.extend(headers);
        self
    }

    /// JSON body with matching `Content-Type` and `Accept` headers.
    #[must_use]
    pub fn with_json_body(self, body: &serde_json::Value) -> Self {
        let mut request = self
            .with_header("Content-Type", "application/json")
            .with_header("Accept", "application/json");
        request.body = Some(body.to_string());
        request
    }

    /// `application/x-www-form-urlencoded` body from name/value pairs.
    #[must_use]
    pub fn with_form_body<'a, I>(self, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let encoded = fields
            .into_iter()
            .map(|(name, value)| {
                format!("{}={}", urlencoding::encode(name), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&");
        let mut request = self.with_header("Content-Type", "application/x-www-form-urlencoded");
        request.body = Some(encoded);
        request
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self { status, headers: Vec::new(), body: body.into() }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    /// Every value of a repeated header such as `Set-Cookie`.
    pub fn header_values<'a: 'b, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + 'b {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub const fn is_redirect(&self) -> bool {
        self.status >= 300 && self.status < 400
    }

    /// # Errors
    ///
    /// Returns [`TicketlineError::Internal`] when the body is not valid JSON
    /// for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(TicketlineError::from)
    }
}

/// Sends one request and returns the raw response
///
/// Implementations return `Ok` for every HTTP status and reserve `Err` for
/// failures below HTTP: [`TicketlineError::Timeout`] when the request timeout
/// elapses and [`TicketlineError::Transport`] for connection failures.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_body_is_url_encoded() {
        let request = HttpRequest::new(HttpMethod::Post, "https://idp.example.com/login")
            .with_form_body([("user_name", "admin"), ("user_password", "p@ss word&")]);
        assert_eq!(request.body.as_deref(), Some("user_name=admin&user_password=p%40ss%20word%26"));
        assert!(request
            .headers
            .contains(&("Content-Type".into(), "application/x-www-form-urlencoded".into())));
    }

    /// Validates `HttpResponse::header_values` behavior for the repeated
    /// header scenario.
    ///
    /// Assertions:
    /// - Confirms lookup ignores header name case.
    /// - Confirms repeated headers are all returned in order.
    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = HttpResponse::new(302, "")
            .with_header("Set-Cookie", "a=1; Path=/")
            .with_header("set-cookie", "b=2")
            .with_header("Location", "/next");
        assert_eq!(response.header("location"), Some("/next"));
        assert_eq!(response.header_values("SET-COOKIE").collect::<Vec<_>>(), ["a=1; Path=/", "b=2"]);
        assert!(response.is_redirect());
        assert!(!response.is_success());
    }
}
