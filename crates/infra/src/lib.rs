//! # Ticketline Infrastructure
//!
//! Infrastructure implementations of core ports.
//!
//! This crate contains:
//! - The reqwest HTTP transport
//! - The JSON file session store
//! - The configuration loader
//! - Tracing subscriber setup
//!
//! ## Architecture
//! - Implements traits defined in `ticketline-core`
//! - Contains all "impure" code (network, filesystem, environment)

pub mod bootstrap;
pub mod config;
pub mod errors;
pub mod http;
pub mod observability;
pub mod store;

// Re-export commonly used items
pub use bootstrap::Ticketline;
pub use config::ConfigLoader;
pub use errors::InfraError;
pub use http::{ReqwestTransport, ReqwestTransportBuilder};
pub use observability::init_tracing;
pub use store::FileConfigStore;
