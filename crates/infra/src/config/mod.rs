//! Configuration loading
//!
//! This module builds the client configuration from files and environment
//! variables.

pub mod loader;

// Re-export commonly used items
pub use loader::{load, load_from_file, ConfigLoader};
