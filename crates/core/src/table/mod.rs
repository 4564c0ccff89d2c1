//! Table access: the resilient client and the record cursor built on it

pub mod client;
pub mod cursor;
pub mod policy;

pub use client::{ClientMetrics, ListRequest, Page, TableClient};
pub use cursor::RecordCursor;
pub use policy::TableRetryPolicy;
