//! Display/FromStr for string-backed status enums
//!
//! Persisted and configured enums (session validation status, display-value
//! mode) travel as lowercase strings. This macro keeps both directions in one
//! mapping table.
//!
//! # Example
//!
//! ```rust
//! use ticketline_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum ProbeOutcome {
//!     Accepted,
//!     Rejected,
//! }
//!
//! impl_domain_status_conversions!(ProbeOutcome {
//!     Accepted => "accepted",
//!     Rejected => "rejected",
//! });
//!
//! assert_eq!(ProbeOutcome::Accepted.to_string(), "accepted");
//! assert_eq!("REJECTED".parse::<ProbeOutcome>(), Ok(ProbeOutcome::Rejected));
//! ```

/// Implements `Display` and case-insensitive `FromStr` for a fieldless enum.
///
/// Parse failures return a `String` naming the enum and the rejected input.
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                $(if s.eq_ignore_ascii_case($str) {
                    return Ok(Self::$variant);
                })+
                Err(format!("Invalid {}: {}", stringify!($enum_name), s))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use crate::types::{DisplayValueMode, ValidationStatus};

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ValidationStatus::Valid.to_string(), "valid");
        assert_eq!(DisplayValueMode::All.to_string(), "all");
    }

    #[test]
    fn parse_ignores_case() {
        assert_eq!(ValidationStatus::from_str("INVALID"), Ok(ValidationStatus::Invalid));
        assert_eq!(DisplayValueMode::from_str("True"), Ok(DisplayValueMode::Display));
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = ValidationStatus::from_str("stale").unwrap_err();
        assert!(err.contains("Invalid ValidationStatus: stale"));
        assert!(ValidationStatus::from_str("").is_err());
    }
}
