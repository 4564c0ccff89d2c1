//! Signed-in session state persisted between runs.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::HEADER_USER_TOKEN;

/// Outcome of the most recent validation of a credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    #[default]
    Unknown,
}

crate::impl_domain_status_conversions!(ValidationStatus {
    Valid => "valid",
    Invalid => "invalid",
    Unknown => "unknown",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
}

/// Cookies, headers and token produced by the identity handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub cookies: Vec<SessionCookie>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_validated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub validation_status: ValidationStatus,
}

impl SessionCredential {
    pub fn new(cookies: Vec<SessionCookie>, created_at: DateTime<Utc>) -> Self {
        Self {
            cookies,
            headers: BTreeMap::new(),
            token: None,
            session_id: None,
            created_at,
            expires_at: None,
            last_validated: None,
            validation_status: ValidationStatus::Unknown,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Usable only while validated and not expired.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.validation_status == ValidationStatus::Valid && !self.is_expired(now)
    }

    /// Whether the last successful validation is recent enough to skip a
    /// probe.
    pub fn validated_within(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Some(validated) = self.last_validated else {
            return false;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        self.is_usable(now) && validated + ttl > now
    }

    pub fn mark_valid(&mut self, now: DateTime<Utc>) {
        self.validation_status = ValidationStatus::Valid;
        self.last_validated = Some(now);
    }

    pub fn mark_invalid(&mut self) {
        self.validation_status = ValidationStatus::Invalid;
    }

    /// `Cookie` header value (`a=1; b=2`), if any cookies were issued.
    pub fn cookie_header(&self) -> Option<String> {
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

    /// Headers every authenticated request carries.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> =
            self.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(cookie) = self.cookie_header() {
            headers.push(("Cookie".to_string(), cookie));
        }
        if let Some(token) = &self.token {
            headers.push((HEADER_USER_TOKEN.to_string(), token.clone()));
        }
        headers
    }
}
