//! Table data types

pub mod field_value;
pub mod record;
pub mod session;

pub use field_value::{DisplayValueMode, FieldInput, FieldValue, WireField};
pub use record::Record;
pub use session::{SessionCookie, SessionCredential, ValidationStatus};
