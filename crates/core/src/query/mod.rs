//! Encoded query grammar of the table API

pub mod builder;
pub mod operator;

pub use builder::EncodedQuery;
pub use operator::Operator;
