//! Session authentication: ports, identity handshake and the authenticator

pub mod handshake;
pub mod ports;
pub mod service;
pub mod store;

pub use handshake::FormLoginProvider;
pub use ports::{ConfigStore, IdentityProvider};
pub use service::{keys, AuthState, SessionAuthenticator};
pub use store::InMemoryConfigStore;
