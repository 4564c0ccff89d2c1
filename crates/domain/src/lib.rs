//! # Ticketline Domain
//!
//! Domain types shared by every Ticketline crate.
//!
//! This crate contains:
//! - Table data types (`FieldValue`, `Record`, `SessionCredential`)
//! - Domain error types and Result definitions
//! - Configuration structures
//! - Table API constants
//!
//! ## Architecture
//! - No dependencies on other Ticketline crates
//! - Only external dependencies allowed
//! - Pure domain models and data structures

pub mod config;
pub mod constants;
pub mod errors;
pub mod macros;
pub mod types;

// Re-export commonly used items
pub use config::*;
pub use errors::*;
pub use types::*;
