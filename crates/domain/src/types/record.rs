//! A table row: field name to [`FieldValue`].

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::field_value::{FieldInput, FieldValue, WireField};
use crate::constants::SYS_ID;
use crate::errors::{Result, TicketlineError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from one row object of a table API response.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::RemoteQuery`] when the row is not an object.
    pub fn from_wire(row: Value) -> Result<Self> {
        let Value::Object(map) = row else {
            return Err(TicketlineError::RemoteQuery {
                status: 200,
                message: format!("expected a row object, got {row}"),
            });
        };
        Self::from_map(map)
    }

    fn from_map(map: Map<String, Value>) -> Result<Self> {
        let mut fields = BTreeMap::new();
        for (name, cell) in map {
            let input: FieldInput = serde_json::from_value(cell)?;
            fields.insert(name.clone(), FieldValue::new(name, input));
        }
        Ok(Self { fields })
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut FieldValue> {
        self.fields.get_mut(field)
    }

    /// Stage a value, creating the field when the row does not carry it yet.
    pub fn set_value(&mut self, field: &str, value: impl Into<Value>) {
        self.fields
            .entry(field.to_string())
            .or_insert_with(|| FieldValue::from_raw(field, Value::Null))
            .set_value(value);
    }

    /// Server-assigned identity, when present.
    pub fn sys_id(&self) -> Option<&str> {
        self.fields.get(SYS_ID).and_then(FieldValue::as_str).filter(|id| !id.is_empty())
    }

    pub fn changed(&self) -> bool {
        self.fields.values().any(FieldValue::changed)
    }

    /// Canonical values of dirty fields, ready for a write request body.
    pub fn dirty_payload(&self) -> Map<String, Value> {
        self.fields
            .values()
            .filter(|f| f.changed())
            .map(|f| (f.name().to_string(), f.get_value().clone()))
            .collect()
    }

    pub fn mark_clean(&mut self) {
        self.fields.values_mut().for_each(FieldValue::mark_clean);
    }

    /// Overwrite local fields with a fresh server copy and clear dirty flags.
    pub fn merge(&mut self, server: Self) {
        self.fields.extend(server.fields);
        self.mark_clean();
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldValue> {
        self.fields.values()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn serialize(&self) -> BTreeMap<String, WireField> {
        self.fields.iter().map(|(name, field)| (name.clone(), field.serialize())).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn incident_row() -> Value {
        json!({
            "sys_id": {"value": "a1", "display_value": "a1"},
            "number": {"value": "INC0010001", "display_value": "INC0010001"},
            "state": {"value": "1", "display_value": "New"},
            "caller_id": {"value": "u9", "display_value": "Abel Tuter", "link": "https://x/u9"}
        })
    }

    /// Validates `Record::from_wire` behavior for the display-all row scenario.
    ///
    /// Assertions:
    /// - Confirms identity and display values are exposed.
    /// - Confirms a freshly loaded row has no dirty fields.
    #[test]
    fn from_wire_reads_triples() {
        let record = Record::from_wire(incident_row()).unwrap();
        assert_eq!(record.sys_id(), Some("a1"));
        assert_eq!(record.get("state").unwrap().get_display_value(), &json!("New"));
        assert!(!record.changed());
        assert!(record.dirty_payload().is_empty());
    }

    /// Validates `Record::dirty_payload` behavior for the partial update
    /// scenario.
    ///
    /// Assertions:
    /// - Ensures only mutated and newly staged fields are included.
    /// - Ensures `merge` clears dirty flags.
    #[test]
    fn dirty_payload_only_includes_changes() {
        let mut record = Record::from_wire(incident_row()).unwrap();
        record.set_value("state", "2");
        record.set_value("work_notes", "Escalated");

        let payload = record.dirty_payload();
        assert_eq!(payload.len(), 2);
        assert_eq!(payload["state"], json!("2"));
        assert_eq!(payload["work_notes"], json!("Escalated"));

        record.merge(Record::from_wire(json!({"state": {"value": "2", "display_value": "In Progress"}})).unwrap());
        assert!(!record.changed());
        assert_eq!(record.get("state").unwrap().get_display_value(), &json!("In Progress"));
    }

    /// Validates `Record::from_wire` behavior for the non-object row scenario.
    ///
    /// Assertions:
    /// - Confirms a remote query error is returned.
    #[test]
    fn from_wire_rejects_non_objects() {
        assert!(matches!(
            Record::from_wire(json!(["a"])),
            Err(TicketlineError::RemoteQuery { .. })
        ));
    }
}
