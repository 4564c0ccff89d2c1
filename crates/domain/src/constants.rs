//! Table API constants
//!
//! Parameter names and identifiers shared by the encoder, cursor and
//! transport layers.

/// Identity field every table row carries
pub const SYS_ID: &str = "sys_id";

// Query-string parameters understood by the table API
pub const PARAM_QUERY: &str = "sysparm_query";
pub const PARAM_LIMIT: &str = "sysparm_limit";
pub const PARAM_OFFSET: &str = "sysparm_offset";
pub const PARAM_FIELDS: &str = "sysparm_fields";
pub const PARAM_DISPLAY_VALUE: &str = "sysparm_display_value";

// Headers
pub const HEADER_TOTAL_COUNT: &str = "X-Total-Count";
pub const HEADER_USER_TOKEN: &str = "X-UserToken";

/// Envelope key wrapping every table API response body
pub const RESULT_KEY: &str = "result";
