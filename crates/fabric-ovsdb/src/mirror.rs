//! Local mirror of the switch's configuration tables.

use std::collections::HashMap;

use serde_json::Value;

use crate::{OvsError, OvsResult};

/// One table row as sent by the switch: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// A single row change from a monitor notification.
#[derive(Debug, Clone, Default)]
pub struct RowUpdate {
    /// Previous contents (present on modify/delete).
    pub old: Option<Row>,
    /// New contents (present on insert/modify; absent means the row is gone).
    pub new: Option<Row>,
}

/// A batch of row changes, keyed by table then row uuid.
#[derive(Debug, Clone, Default)]
pub struct TableUpdates {
    pub updates: HashMap<String, HashMap<String, RowUpdate>>,
}

impl TableUpdates {
    /// Parses the `<table-updates>` object of a monitor reply or update
    /// notification.
    pub fn from_value(value: &Value) -> OvsResult<Self> {
        let tables = value
            .as_object()
            .ok_or_else(|| OvsError::protocol("table-updates is not an object"))?;

        let mut updates = HashMap::new();
        for (table, rows_value) in tables {
            let rows_obj = rows_value
                .as_object()
                .ok_or_else(|| OvsError::protocol(format!("rows of {} not an object", table)))?;

            let mut rows = HashMap::new();
            for (uuid, change) in rows_obj {
                let old = change
                    .get("old")
                    .and_then(Value::as_object)
                    .filter(|r| !r.is_empty())
                    .cloned();
                let new = change
                    .get("new")
                    .and_then(Value::as_object)
                    .filter(|r| !r.is_empty())
                    .cloned();
                rows.insert(uuid.clone(), RowUpdate { old, new });
            }
            updates.insert(table.clone(), rows);
        }
        Ok(TableUpdates { updates })
    }
}

/// A row that disappeared from the mirror, reported to the update task so it
/// can react (bridge self-healing).
#[derive(Debug, Clone)]
pub struct RemovedRow {
    pub table: String,
    pub uuid: String,
    pub row: Row,
}

/// The mirrored table state.
///
/// Owned and mutated exclusively by the client's update task; every other
/// component reads it through the client's accessor methods. Alongside the
/// raw rows a name-to-uuid index per table is maintained incrementally, so
/// resolving a port name never scans the table.
#[derive(Debug, Default)]
pub struct TableMirror {
    tables: HashMap<String, HashMap<String, Row>>,
    names: HashMap<String, HashMap<String, String>>,
}

impl TableMirror {
    /// Creates an empty mirror.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all mirrored state (used when a session is re-established and a
    /// fresh snapshot is about to arrive).
    pub fn clear(&mut self) {
        self.tables.clear();
        self.names.clear();
    }

    /// Applies a batch of row changes, returning the rows that were removed.
    pub fn apply(&mut self, updates: &TableUpdates) -> Vec<RemovedRow> {
        let mut removed = Vec::new();

        for (table, rows) in &updates.updates {
            for (uuid, change) in rows {
                match &change.new {
                    Some(new_row) => self.insert_row(table, uuid, new_row.clone()),
                    None => {
                        if let Some(old) = self.remove_row(table, uuid) {
                            removed.push(RemovedRow {
                                table: table.clone(),
                                uuid: uuid.clone(),
                                row: old,
                            });
                        }
                    }
                }
            }
        }

        removed
    }

    fn insert_row(&mut self, table: &str, uuid: &str, row: Row) {
        let names = self.names.entry(table.to_string()).or_default();
        let rows = self.tables.entry(table.to_string()).or_default();

        // A renamed row must not leave its old name pointing at the uuid.
        if let Some(prev) = rows.get(uuid) {
            if let Some(prev_name) = row_name(prev) {
                if row_name(&row) != Some(prev_name) {
                    names.remove(prev_name);
                }
            }
        }
        if let Some(name) = row_name(&row) {
            names.insert(name.to_string(), uuid.to_string());
        }
        rows.insert(uuid.to_string(), row);
    }

    fn remove_row(&mut self, table: &str, uuid: &str) -> Option<Row> {
        let row = self.tables.get_mut(table)?.remove(uuid)?;
        if let Some(name) = row_name(&row) {
            if let Some(names) = self.names.get_mut(table) {
                // Only drop the mapping if it still points at this row.
                if names.get(name).map(String::as_str) == Some(uuid) {
                    names.remove(name);
                }
            }
        }
        Some(row)
    }

    /// Resolves a row name to its server-assigned uuid.
    pub fn uuid_of(&self, table: &str, name: &str) -> Option<&str> {
        self.names.get(table)?.get(name).map(String::as_str)
    }

    /// Returns a row by uuid.
    pub fn row(&self, table: &str, uuid: &str) -> Option<&Row> {
        self.tables.get(table)?.get(uuid)
    }

    /// Returns the uuid of the root `Open_vSwitch` row, if mirrored.
    pub fn root_uuid(&self) -> Option<&str> {
        self.tables
            .get("Open_vSwitch")?
            .keys()
            .next()
            .map(String::as_str)
    }

    /// Returns the number of rows mirrored for a table.
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map(HashMap::len).unwrap_or(0)
    }

    /// Iterates over the rows of a table.
    pub fn rows(&self, table: &str) -> impl Iterator<Item = (&str, &Row)> {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(uuid, row)| (uuid.as_str(), row)))
    }
}

fn row_name(row: &Row) -> Option<&str> {
    row.get("name").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn updates(value: Value) -> TableUpdates {
        TableUpdates::from_value(&value).unwrap()
    }

    #[test]
    fn test_parse_insert_and_delete() {
        let batch = updates(json!({
            "Port": {
                "uuid-1": {"new": {"name": "ovs1234567", "tag": 5}},
                "uuid-2": {"old": {"name": "gone"}},
            }
        }));

        let port = &batch.updates["Port"];
        assert!(port["uuid-1"].new.is_some());
        assert!(port["uuid-1"].old.is_none());
        assert!(port["uuid-2"].new.is_none());
        assert_eq!(
            port["uuid-2"].old.as_ref().unwrap()["name"],
            json!("gone")
        );
    }

    #[test]
    fn test_empty_new_row_means_delete() {
        // Some servers send "new": {} instead of omitting it
        let batch = updates(json!({
            "Port": {"uuid-1": {"old": {"name": "p"}, "new": {}}}
        }));
        assert!(batch.updates["Port"]["uuid-1"].new.is_none());
    }

    #[test]
    fn test_apply_maintains_rows_and_index() {
        let mut mirror = TableMirror::new();
        mirror.apply(&updates(json!({
            "Bridge": {"b-uuid": {"new": {"name": "fabric0"}}},
            "Port": {"p-uuid": {"new": {"name": "vxlan-10.0.0.2"}}},
        })));

        assert_eq!(mirror.uuid_of("Bridge", "fabric0"), Some("b-uuid"));
        assert_eq!(mirror.uuid_of("Port", "vxlan-10.0.0.2"), Some("p-uuid"));
        assert_eq!(mirror.table_len("Port"), 1);
        assert!(mirror.row("Port", "p-uuid").is_some());
    }

    #[test]
    fn test_apply_delete_reports_removed() {
        let mut mirror = TableMirror::new();
        mirror.apply(&updates(json!({
            "Bridge": {"b-uuid": {"new": {"name": "fabric0"}}}
        })));

        let removed = mirror.apply(&updates(json!({
            "Bridge": {"b-uuid": {"old": {"name": "fabric0"}}}
        })));

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].table, "Bridge");
        assert_eq!(removed[0].row["name"], json!("fabric0"));
        assert_eq!(mirror.uuid_of("Bridge", "fabric0"), None);
        assert_eq!(mirror.table_len("Bridge"), 0);
    }

    #[test]
    fn test_apply_rename_updates_index() {
        let mut mirror = TableMirror::new();
        mirror.apply(&updates(json!({
            "Port": {"p-uuid": {"new": {"name": "before"}}}
        })));
        mirror.apply(&updates(json!({
            "Port": {"p-uuid": {"new": {"name": "after"}}}
        })));

        assert_eq!(mirror.uuid_of("Port", "before"), None);
        assert_eq!(mirror.uuid_of("Port", "after"), Some("p-uuid"));
    }

    #[test]
    fn test_root_uuid() {
        let mut mirror = TableMirror::new();
        assert!(mirror.root_uuid().is_none());
        mirror.apply(&updates(json!({
            "Open_vSwitch": {"root-uuid": {"new": {"bridges": ["set", []]}}}
        })));
        assert_eq!(mirror.root_uuid(), Some("root-uuid"));
    }

    #[test]
    fn test_clear() {
        let mut mirror = TableMirror::new();
        mirror.apply(&updates(json!({
            "Port": {"p": {"new": {"name": "x"}}}
        })));
        mirror.clear();
        assert_eq!(mirror.table_len("Port"), 0);
        assert_eq!(mirror.uuid_of("Port", "x"), None);
    }
}
