//! Client-side record reconciliation
//!
//! Applies `table_update` messages to a local copy of the subscribed view.
//! Every operation is idempotent, so at-least-once delivery converges.

use tracing::warn;

use tablewatch_common::{Operation, Row, DEFAULT_ID_FIELD};

use crate::protocol::{TableUpdate, UpdateType};

/// Ordered records keyed by their id field
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecordSet {
    id_field: String,
    records: Vec<Row>,
}

impl Default for ClientRecordSet {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FIELD)
    }
}

impl ClientRecordSet {
    pub fn new(id_field: &str) -> Self {
        Self {
            id_field: id_field.to_string(),
            records: Vec::new(),
        }
    }

    pub fn from_rows(id_field: &str, rows: Vec<Row>) -> Self {
        Self {
            id_field: id_field.to_string(),
            records: rows,
        }
    }

    pub fn records(&self) -> &[Row] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &serde_json::Value) -> Option<&Row> {
        self.position(id).map(|idx| &self.records[idx])
    }

    fn position(&self, id: &serde_json::Value) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.get(&self.id_field) == Some(id))
    }

    /// Apply one update; returns whether the set changed
    pub fn apply(&mut self, update: &TableUpdate) -> bool {
        match update.update_type {
            UpdateType::PollingRefresh => self.replace(&update.data),
            UpdateType::DatabaseTrigger => match update.operation {
                Some(op) => self.apply_trigger(op, &update.data),
                None => {
                    warn!(channel = %update.channel_id, "Trigger update without an operation");
                    false
                }
            },
        }
    }

    /// Replace the whole collection with a snapshot
    pub fn replace(&mut self, data: &serde_json::Value) -> bool {
        let Some(items) = data.as_array() else {
            warn!("Refresh payload is not an array");
            return false;
        };
        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            match item.as_object() {
                Some(row) => rows.push(row.clone()),
                None => {
                    warn!(item = %item, "Refresh payload holds a non-object record");
                    return false;
                }
            }
        }
        if rows == self.records {
            return false;
        }
        self.records = rows;
        true
    }

    /// Apply a single row change
    pub fn apply_trigger(&mut self, operation: Operation, data: &serde_json::Value) -> bool {
        let Some(record) = data.as_object() else {
            warn!(%operation, "Trigger payload is not an object");
            return false;
        };
        let Some(id) = record.get(&self.id_field).filter(|v| !v.is_null()) else {
            warn!(%operation, id_field = %self.id_field, "Trigger payload has no id");
            return false;
        };

        match (operation, self.position(id)) {
            (Operation::Insert, None) => {
                self.records.push(record.clone());
                true
            }
            (Operation::Update, Some(idx)) => {
                let existing = &mut self.records[idx];
                let before = existing.clone();
                existing.extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));
                *existing != before
            }
            (Operation::Delete, Some(idx)) => {
                self.records.remove(idx);
                true
            }
            (Operation::Insert | Operation::Update | Operation::Delete, _) => false,
            (Operation::Unknown, _) => {
                warn!(id = %id, "Ignoring unknown trigger operation");
                false
            }
        }
    }
}
