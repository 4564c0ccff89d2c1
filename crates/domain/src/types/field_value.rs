//! One table cell: canonical value, display value and reference link.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TicketlineError};

/// Date-time layout the table API uses for `glide_date_time` columns
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// The `{value, display_value, link}` triple carried on the wire.
///
/// Also the serialized form of a [`FieldValue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireField {
    pub value: Value,
    #[serde(default)]
    pub display_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// How a cell was supplied: a bare datum or a full wire triple.
///
/// Deserializing a response cell picks [`FieldInput::Wire`] only for objects
/// that are exactly a triple; everything else is kept as a raw datum.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldInput {
    Wire(WireField),
    Raw(Value),
}

/// Which representation the table API returns for each cell
/// (`sysparm_display_value`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayValueMode {
    /// Canonical values only
    Value,
    /// Display values only
    Display,
    /// Full `{value, display_value, link}` triples
    #[default]
    All,
}

crate::impl_domain_status_conversions!(DisplayValueMode {
    Value => "false",
    Display => "true",
    All => "all",
});

#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    name: String,
    value: Value,
    display_value: Option<Value>,
    link: Option<String>,
    dirty: bool,
}

impl FieldValue {
    pub fn new(name: impl Into<String>, input: FieldInput) -> Self {
        match input {
            FieldInput::Wire(wire) => Self::from_wire(name, wire),
            FieldInput::Raw(value) => Self::from_raw(name, value),
        }
    }

    pub fn from_raw(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            display_value: None,
            link: None,
            dirty: false,
        }
    }

    pub fn from_wire(name: impl Into<String>, wire: WireField) -> Self {
        Self {
            name: name.into(),
            value: wire.value,
            display_value: wire.display_value,
            link: wire.link,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn get_value(&self) -> &Value {
        &self.value
    }

    /// Display value, falling back to the canonical value when none is set.
    pub fn get_display_value(&self) -> &Value {
        self.display_value.as_ref().unwrap_or(&self.value)
    }

    pub fn get_link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Value as a string slice, when the datum is a string.
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// Replace the canonical value.
    ///
    /// Clears the display value so it is re-derived from the new value.
    pub fn set_value(&mut self, value: impl Into<Value>) {
        self.value = value.into();
        self.display_value = None;
        self.dirty = true;
    }

    /// Store a date-time in the table API's `YYYY-MM-DD HH:MM:SS` layout.
    pub fn set_date(&mut self, at: DateTime<Utc>) {
        self.set_value(at.format(DATE_TIME_FORMAT).to_string());
    }

    pub fn set_display_value(&mut self, display_value: impl Into<Value>) {
        self.display_value = Some(display_value.into());
        self.dirty = true;
    }

    pub fn set_link(&mut self, link: impl Into<String>) {
        self.link = Some(link.into());
        self.dirty = true;
    }

    /// Whether the value, display value or link was mutated since load.
    pub const fn changed(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// True for absent values, empty strings and empty sequences.
    ///
    /// `0` and `false` are real values and are not nil.
    pub fn nil(&self) -> bool {
        match &self.value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn serialize(&self) -> WireField {
        WireField {
            value: self.value.clone(),
            display_value: Some(self.get_display_value().clone()),
            link: self.link.clone(),
        }
    }

    /// Interpret the value as a UTC instant.
    ///
    /// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` and epoch
    /// milliseconds (as a number or a digit string).
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::Conversion`] for nil or unparsable values.
    pub fn as_date(&self) -> Result<DateTime<Utc>> {
        match &self.value {
            Value::String(raw) => parse_date_str(raw.trim()).ok_or_else(|| {
                TicketlineError::Conversion(format!(
                    "field '{}' value '{raw}' is not a date",
                    self.name
                ))
            }),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| {
                    TicketlineError::Conversion(format!(
                        "field '{}' timestamp {n} is out of range",
                        self.name
                    ))
                }),
            other => Err(TicketlineError::Conversion(format!(
                "field '{}' of type {} cannot be read as a date",
                self.name,
                json_type_name(other)
            ))),
        }
    }
}

fn parse_date_str(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = NaiveDateTime::parse_from_str(raw, DATE_TIME_FORMAT) {
        return Some(at.and_utc());
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        return day.and_hms_opt(0, 0, 0).map(|at| at.and_utc());
    }
    if raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
    }
    None
}

const fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
