//! Form-based sign-in against the identity provider
//!
//! The handshake walks the redirect chain from the configured login URL to
//! the sign-in form, submits the credentials together with the form's hidden
//! inputs, follows the post-login redirects, and collects every cookie set on
//! the way. The session token is scraped from the landing page (or taken from
//! an `X-UserToken` response header).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use ticketline_domain::constants::HEADER_USER_TOKEN;
use ticketline_domain::{AuthConfig, Result, SessionCookie, SessionCredential, TicketlineError};
use tracing::{debug, info, instrument};
use url::Url;

use super::ports::IdentityProvider;
use crate::transport::{HttpMethod, HttpRequest, HttpResponse, ProxySelector, Transport};

static FORM_ACTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<form\b[^>]*?\baction\s*=\s*["']([^"']*)["']"#)
        .expect("FORM_ACTION should compile - this is a bug")
});

static INPUT_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<input\b[^>]*>").expect("INPUT_TAG should compile - this is a bug")
});

static TAG_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(name|value|type)\s*=\s*["']([^"']*)["']"#)
        .expect("TAG_ATTR should compile - this is a bug")
});

/// Cookies accumulated across hops; later values replace earlier ones.
#[derive(Debug, Default)]
struct CookieJar {
    cookies: Vec<SessionCookie>,
}

impl CookieJar {
    fn absorb(&mut self, response: &HttpResponse) {
        for raw in response.header_values("set-cookie") {
            let pair = raw.split(';').next().unwrap_or_default();
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() {
                continue;
            }
            self.cookies.retain(|c| c.name != name);
            if !value.is_empty() {
                self.cookies.push(SessionCookie { name: name.to_string(), value: value.to_string() });
            }
        }
    }

    fn header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.cookies.iter().find(|c| c.name == name).map(|c| c.value.as_str())
    }
}

struct Hop {
    url: String,
    response: HttpResponse,
}

/// [`IdentityProvider`] for HTML sign-in forms
pub struct FormLoginProvider {
    transport: Arc<dyn Transport>,
    auth: AuthConfig,
    proxies: ProxySelector,
    timeout: Duration,
    token_pattern: Regex,
}

impl FormLoginProvider {
    /// # Errors
    ///
    /// Returns [`TicketlineError::Config`] when `auth.token_pattern` is not a
    /// valid regular expression.
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: AuthConfig,
        proxies: ProxySelector,
        timeout: Duration,
    ) -> Result<Self> {
        let token_pattern = Regex::new(&auth.token_pattern).map_err(|e| {
            TicketlineError::Config(format!("auth.token_pattern is not a valid regex: {e}"))
        })?;
        let proxies = match &auth.login_url {
            Some(login_url) => proxies.with_identity_url(login_url),
            None => proxies,
        };
        Ok(Self { transport, auth, proxies, timeout, token_pattern })
    }

    /// Send `request` and follow redirects until a 2xx response. Every
    /// redirect target joins the direct hosts in `proxies`.
    async fn follow(
        &self,
        mut request: HttpRequest,
        jar: &mut CookieJar,
        proxies: &mut ProxySelector,
    ) -> Result<Hop> {
        let mut token_header = None;
        for hop in 0..=self.auth.max_redirects {
            let url = request.url.clone();
            request.headers.retain(|(name, _)| !name.eq_ignore_ascii_case("cookie"));
            if let Some(cookie) = jar.header() {
                request.headers.push(("Cookie".to_string(), cookie));
            }
            request.proxy = proxies.select(&url);
            request.timeout = self.timeout;

            let response = self.transport.send(request.clone()).await.map_err(|e| {
                TicketlineError::Authentication(format!("identity request to {} failed: {e}", host(&url)))
            })?;
            debug!(hop, host = %host(&url), status = response.status, "handshake_hop");
            jar.absorb(&response);
            if let Some(token) = response.header(HEADER_USER_TOKEN) {
                token_header = Some(token.to_string());
            }

            if response.is_redirect() {
                let location = response.header("location").ok_or_else(|| {
                    TicketlineError::Authentication(format!(
                        "redirect without location from {}",
                        host(&url)
                    ))
                })?;
                let next = resolve(&url, location)?;
                *proxies = std::mem::take(proxies).with_identity_url(&next);
                if !matches!(response.status, 307 | 308) {
                    request.method = HttpMethod::Get;
                    request.body = None;
                    request.headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
                }
                request.url = next;
                continue;
            }

            if !response.is_success() {
                return Err(TicketlineError::Authentication(format!(
                    "identity provider returned HTTP {} at {}",
                    response.status,
                    host(&url)
                )));
            }

            let mut response = response;
            if let Some(token) = token_header {
                if response.header(HEADER_USER_TOKEN).is_none() {
                    response.headers.push((HEADER_USER_TOKEN.to_string(), token));
                }
            }
            return Ok(Hop { url, response });
        }
        Err(TicketlineError::Authentication(format!(
            "more than {} redirects during sign-in",
            self.auth.max_redirects
        )))
    }

    fn form_fields(&self, page: &str, username: &str, password: &str) -> Vec<(String, String)> {
        let mut fields: Vec<(String, String)> = hidden_inputs(page)
            .into_iter()
            .filter(|(name, _)| name != &self.auth.username_field && name != &self.auth.password_field)
            .collect();
        fields.push((self.auth.username_field.clone(), username.to_string()));
        fields.push((self.auth.password_field.clone(), password.to_string()));
        fields
    }

    fn extract_token(&self, landing: &HttpResponse) -> Option<String> {
        self.token_pattern
            .captures(&landing.body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .or_else(|| landing.header(HEADER_USER_TOKEN).map(str::to_string))
            .filter(|token| !token.is_empty())
    }
}

#[async_trait]
impl IdentityProvider for FormLoginProvider {
    #[instrument(skip(self))]
    async fn sign_in(&self) -> Result<SessionCredential> {
        let missing = |what: &str| TicketlineError::Authentication(format!("auth.{what} is not configured"));
        let login_url = self.auth.login_url.as_deref().ok_or_else(|| missing("login_url"))?;
        let username = self.auth.username.as_deref().ok_or_else(|| missing("username"))?;
        let password = self.auth.password.as_deref().ok_or_else(|| missing("password"))?;

        let mut jar = CookieJar::default();
        let mut proxies = self.proxies.clone();
        let form_page = self
            .follow(HttpRequest::new(HttpMethod::Get, login_url), &mut jar, &mut proxies)
            .await?;

        let action = match FORM_ACTION.captures(&form_page.response.body).and_then(|c| c.get(1)) {
            Some(action) if !action.as_str().is_empty() => resolve(&form_page.url, action.as_str())?,
            _ => form_page.url.clone(),
        };
        let fields = self.form_fields(&form_page.response.body, username, password);
        let submit = HttpRequest::new(HttpMethod::Post, action)
            .with_form_body(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let landing = self.follow(submit, &mut jar, &mut proxies).await?;

        let Some(session_id) = jar.get(&self.auth.session_cookie).map(str::to_string) else {
            return Err(TicketlineError::Authentication(format!(
                "sign-in did not issue the {} session cookie",
                self.auth.session_cookie
            )));
        };

        let now = Utc::now();
        let mut credential = SessionCredential::new(jar.cookies, now);
        credential.session_id = Some(session_id);
        credential.token = self.extract_token(&landing.response);
        credential.expires_at = self
            .auth
            .session_max_age_secs
            .and_then(|secs| chrono::Duration::try_seconds(i64::try_from(secs).ok()?))
            .map(|max_age| now + max_age);

        info!(
            cookies = credential.cookies.len(),
            has_token = credential.token.is_some(),
            "identity_handshake_completed"
        );
        Ok(credential)
    }
}

/// `(name, value)` of every `<input type="hidden">` on the page.
fn hidden_inputs(page: &str) -> Vec<(String, String)> {
    INPUT_TAG
        .find_iter(page)
        .filter_map(|tag| {
            let (mut name, mut value, mut hidden) = (None, String::new(), false);
            for attr in TAG_ATTR.captures_iter(tag.as_str()) {
                match attr[1].to_ascii_lowercase().as_str() {
                    "name" => name = Some(attr[2].to_string()),
                    "value" => value = attr[2].to_string(),
                    _ => hidden = attr[2].eq_ignore_ascii_case("hidden"),
                }
            }
            name.filter(|_| hidden).map(|name| (name, value))
        })
        .collect()
}

fn resolve(base: &str, location: &str) -> Result<String> {
    let base = Url::parse(base)
        .map_err(|e| TicketlineError::Authentication(format!("invalid URL {base}: {e}")))?;
    base.join(location)
        .map(String::from)
        .map_err(|e| TicketlineError::Authentication(format!("invalid redirect {location}: {e}")))
}

fn host(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "<invalid>".to_string())
}
