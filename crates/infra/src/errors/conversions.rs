//! Conversions from external infrastructure errors into domain errors.

use std::io::Error as IoError;

use reqwest::Error as HttpError;
use tempfile::PersistError;
use ticketline_domain::TicketlineError;

/// Error newtype that keeps conversions on the infrastructure side and can be
/// converted back into the domain error.
#[derive(Debug)]
pub struct InfraError(pub TicketlineError);

impl From<InfraError> for TicketlineError {
    fn from(value: InfraError) -> Self {
        value.0
    }
}

impl From<TicketlineError> for InfraError {
    fn from(value: TicketlineError) -> Self {
        Self(value)
    }
}

trait IntoTicketlineError {
    fn into_ticketline(self) -> TicketlineError;
}

/* -------------------------------------------------------------------------- */
/* reqwest::Error → TicketlineError */
/* -------------------------------------------------------------------------- */

impl IntoTicketlineError for HttpError {
    fn into_ticketline(self) -> TicketlineError {
        let target = self.url().map(|u| format!("{}{}", u.host_str().unwrap_or(""), u.path()));
        let target = target.unwrap_or_else(|| "request".to_string());

        if self.is_timeout() {
            return TicketlineError::Timeout(format!("{target} timed out"));
        }

        #[cfg(not(target_arch = "wasm32"))]
        if self.is_connect() {
            return TicketlineError::Transport(format!("connection to {target} failed"));
        }

        if self.is_builder() {
            return TicketlineError::Config(format!("invalid HTTP request: {self}"));
        }

        if let Some(status) = self.status() {
            let code = status.as_u16();
            let message =
                format!("HTTP {} {}", code, status.canonical_reason().unwrap_or("unknown status"));
            if let Some(mapped) = TicketlineError::from_status(code, message) {
                return mapped;
            }
        }

        TicketlineError::Transport(self.to_string())
    }
}

impl From<HttpError> for InfraError {
    fn from(value: HttpError) -> Self {
        Self(value.into_ticketline())
    }
}

/* -------------------------------------------------------------------------- */
/* std::io::Error / tempfile → TicketlineError */
/* -------------------------------------------------------------------------- */

impl IntoTicketlineError for IoError {
    fn into_ticketline(self) -> TicketlineError {
        TicketlineError::Persistence(format!("{:?}: {self}", self.kind()))
    }
}

impl From<IoError> for InfraError {
    fn from(value: IoError) -> Self {
        Self(value.into_ticketline())
    }
}

impl From<PersistError> for InfraError {
    fn from(value: PersistError) -> Self {
        Self(value.error.into_ticketline())
    }
}

/* -------------------------------------------------------------------------- */
/* Tests */
/* -------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::time::Duration;

    use reqwest::{Client, StatusCode};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn io_error_maps_to_persistence() {
        let err = IoError::new(ErrorKind::PermissionDenied, "read-only volume");
        let mapped: TicketlineError = InfraError::from(err).into();
        match mapped {
            TicketlineError::Persistence(msg) => {
                assert!(msg.contains("PermissionDenied"));
                assert!(msg.contains("read-only volume"));
            }
            other => panic!("expected persistence error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_status_503_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(StatusCode::SERVICE_UNAVAILABLE))
            .mount(&server)
            .await;

        let client = Client::builder().no_proxy().build().unwrap();
        let error = client.get(server.uri()).send().await.unwrap().error_for_status().unwrap_err();

        let mapped: TicketlineError = InfraError::from(error).into();
        match mapped {
            TicketlineError::RateLimited(msg) => assert!(msg.contains("503")),
            other => panic!("expected rate limited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_response_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = Client::builder().no_proxy().build().unwrap();
        let error = client
            .get(server.uri())
            .timeout(Duration::from_millis(50))
            .send()
            .await
            .unwrap_err();

        let mapped: TicketlineError = InfraError::from(error).into();
        assert!(matches!(mapped, TicketlineError::Timeout(_)), "got {mapped:?}");
    }
}
