//! Outbound HTTP boundary: the transport port and proxy routing

pub mod ports;
pub mod proxy;

pub use ports::{HttpMethod, HttpRequest, HttpResponse, Transport};
pub use proxy::ProxySelector;
