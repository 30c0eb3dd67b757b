use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Column name → value for one row (or one primary key).
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("table name is required")]
    MissingTable,

    #[error("{0} op requires a primary key")]
    MissingKey(OpKind),

    #[error("insert key column {column:?} disagrees with values")]
    KeyMismatch { column: String },

    #[error("update op has no values to write")]
    EmptyUpdate,
}

/// One staged row operation. Serialized as
/// `{"type": "...", "table": "...", "values": {...}, "pk": {...}}`.
///
/// Several ops may target the same row; they are never merged locally and
/// the server replays them in ledger order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitOp {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub table: String,
    #[serde(default)]
    pub values: Row,
    #[serde(default, rename = "pk", skip_serializing_if = "Option::is_none")]
    pub key: Option<Row>,
}

impl CommitOp {
    pub fn insert(table: impl Into<String>, values: Row) -> Self {
        Self {
            kind: OpKind::Insert,
            table: table.into(),
            values,
            key: None,
        }
    }

    pub fn update(table: impl Into<String>, key: Row, values: Row) -> Self {
        Self {
            kind: OpKind::Update,
            table: table.into(),
            values,
            key: Some(key),
        }
    }

    pub fn delete(table: impl Into<String>, key: Row) -> Self {
        Self {
            kind: OpKind::Delete,
            table: table.into(),
            values: Row::new(),
            key: Some(key),
        }
    }

    /// Check the key invariant: update/delete carry a non-empty key; an
    /// insert key, when present, must agree with `values`.
    pub fn validate(&self) -> Result<(), OpError> {
        if self.table.trim().is_empty() {
            return Err(OpError::MissingTable);
        }
        match self.kind {
            OpKind::Insert => {
                if let Some(key) = &self.key {
                    for (column, value) in key {
                        if self.values.get(column) != Some(value) {
                            return Err(OpError::KeyMismatch {
                                column: column.clone(),
                            });
                        }
                    }
                }
            }
            OpKind::Update | OpKind::Delete => {
                if self.key.as_ref().map_or(true, |k| k.is_empty()) {
                    return Err(OpError::MissingKey(self.kind));
                }
                if self.kind == OpKind::Update && self.values.is_empty() {
                    return Err(OpError::EmptyUpdate);
                }
            }
        }
        Ok(())
    }

    /// One-line description: `insert items [id=1] name="x"`.
    pub fn summary(&self) -> String {
        let key_text = self
            .key
            .as_ref()
            .map(|k| {
                k.iter()
                    .map(|(c, v)| format!("{c}={}", render_value(v)))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        let values_text = self
            .values
            .iter()
            .filter(|(c, _)| self.key.as_ref().map_or(true, |k| !k.contains_key(*c)))
            .map(|(c, v)| format!("{c}={}", render_value(v)))
            .collect::<Vec<_>>()
            .join(" ");

        let mut out = format!("{} {}", self.kind, self.table);
        if !key_text.is_empty() {
            out.push_str(&format!(" [{key_text}]"));
        }
        if !values_text.is_empty() {
            out.push(' ');
            out.push_str(&values_text);
        }
        out
    }
}

fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn wire_shape_uses_type_and_pk() {
        let op = CommitOp::update("items", row(json!({"id": 1})), row(json!({"name": "x"})));
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["type"], "update");
        assert_eq!(v["table"], "items");
        assert_eq!(v["pk"]["id"], 1);
        assert_eq!(v["values"]["name"], "x");
    }

    #[test]
    fn insert_omits_pk_on_the_wire() {
        let op = CommitOp::insert("items", row(json!({"id": 1, "name": "x"})));
        let text = serde_json::to_string(&op).unwrap();
        assert!(!text.contains("\"pk\""));
    }

    #[test]
    fn decodes_server_op_without_values() {
        let op: CommitOp =
            serde_json::from_str(r#"{"type":"delete","table":"t","pk":{"id":3}}"#).unwrap();
        assert_eq!(op.kind, OpKind::Delete);
        assert!(op.values.is_empty());
        assert!(op.validate().is_ok());
    }

    #[test]
    fn update_and_delete_require_key() {
        let mut op = CommitOp::update("t", Row::new(), row(json!({"a": 1})));
        assert_eq!(op.validate(), Err(OpError::MissingKey(OpKind::Update)));
        op.key = None;
        assert_eq!(op.validate(), Err(OpError::MissingKey(OpKind::Update)));

        let del = CommitOp::delete("t", Row::new());
        assert_eq!(del.validate(), Err(OpError::MissingKey(OpKind::Delete)));
    }

    #[test]
    fn update_without_values_is_rejected() {
        let op = CommitOp::update("t", row(json!({"id": 1})), Row::new());
        assert_eq!(op.validate(), Err(OpError::EmptyUpdate));
    }

    #[test]
    fn insert_key_must_agree_with_values() {
        let mut op = CommitOp::insert("t", row(json!({"id": 1, "name": "x"})));
        op.key = Some(row(json!({"id": 1})));
        assert!(op.validate().is_ok());

        op.key = Some(row(json!({"id": 2})));
        assert_eq!(
            op.validate(),
            Err(OpError::KeyMismatch {
                column: "id".into()
            })
        );
    }

    #[test]
    fn blank_table_is_rejected() {
        let op = CommitOp::insert("  ", row(json!({"id": 1})));
        assert_eq!(op.validate(), Err(OpError::MissingTable));
    }

    #[test]
    fn summary_separates_key_from_values() {
        let op = CommitOp::update(
            "items",
            row(json!({"id": 7})),
            row(json!({"id": 7, "name": "bolt"})),
        );
        assert_eq!(op.summary(), r#"update items [id=7] name="bolt""#);
    }
}
