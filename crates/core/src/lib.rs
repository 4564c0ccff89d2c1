//! # Ticketline Core
//!
//! Client logic for the ticketing platform's table API, independent of any
//! concrete HTTP stack or storage.
//!
//! This crate contains:
//! - The encoded query builder
//! - Session authentication and the identity handshake
//! - The table client (session, rate limiter, breaker, transport)
//! - The record cursor
//!
//! ## Architecture Principles
//! - Depends only on `ticketline-common` and `ticketline-domain`
//! - Network and persistence go through the [`Transport`] and
//!   [`ConfigStore`] ports; adapters live in `ticketline-infra`

pub mod query;
pub mod session;
pub mod settings;
pub mod table;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use query::{EncodedQuery, Operator};
pub use session::{
    AuthState, ConfigStore, FormLoginProvider, IdentityProvider, InMemoryConfigStore,
    SessionAuthenticator,
};
pub use settings::{breaker_config, limiter_config};
pub use table::{ClientMetrics, ListRequest, Page, RecordCursor, TableClient, TableRetryPolicy};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, ProxySelector, Transport};
