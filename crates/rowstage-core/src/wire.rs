//! Request and response bodies exchanged with the remote authority under
//! `/api/v1`. Field names follow the server's JSON exactly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::WorkContext;
use crate::op::{CommitOp, Row};

// ── Heads and tables ──

/// Any response that carries only the resulting branch head
/// (`/head`, `/commit`, `/sync`, `/conflicts/resolve`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashResponse {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
}

// ── Mutations ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub expected_head: String,
    pub commit_message: String,
    pub ops: Vec<CommitOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub expected_head: String,
}

impl SyncRequest {
    pub fn new(ctx: &WorkContext, expected_head: &str) -> Self {
        Self {
            target_id: ctx.target_id.clone(),
            db_name: ctx.db_name.clone(),
            branch_name: ctx.branch_name.clone(),
            expected_head: expected_head.to_string(),
        }
    }
}

// ── Conflicts ──

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictSummaryEntry {
    pub table: String,
    #[serde(default)]
    pub schema_conflicts: u32,
    #[serde(default)]
    pub data_conflicts: u32,
    #[serde(default)]
    pub constraint_violations: u32,
}

impl ConflictSummaryEntry {
    pub fn is_clear(&self) -> bool {
        self.schema_conflicts == 0 && self.data_conflicts == 0 && self.constraint_violations == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    Ours,
    Theirs,
}

impl ResolveStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ours => "ours",
            Self::Theirs => "theirs",
        }
    }
}

impl std::str::FromStr for ResolveStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            other => Err(format!("strategy must be 'ours' or 'theirs', got {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveConflictsRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub expected_head: String,
    pub table: String,
    pub strategy: ResolveStrategy,
}

// ── Previews ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewCloneRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub table: String,
    pub template_pk: Row,
    pub new_pks: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewBatchGenerateRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub table: String,
    pub template_pk: Row,
    pub new_pks: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_values: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreviewBulkUpdateRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub table: String,
    pub tsv_data: String,
}

/// The three preview endpoints share one response shape.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewRequest {
    Clone(PreviewCloneRequest),
    BatchGenerate(PreviewBatchGenerateRequest),
    BulkUpdate(PreviewBulkUpdateRequest),
}

impl PreviewRequest {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Clone(_) => "/preview/clone",
            Self::BatchGenerate(_) => "/preview/batch_generate",
            Self::BulkUpdate(_) => "/preview/bulk_update",
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Clone(r) => &r.table,
            Self::BatchGenerate(r) => &r.table,
            Self::BulkUpdate(r) => &r.table,
        }
    }

    pub fn context(&self) -> WorkContext {
        let (t, d, b) = match self {
            Self::Clone(r) => (&r.target_id, &r.db_name, &r.branch_name),
            Self::BatchGenerate(r) => (&r.target_id, &r.db_name, &r.branch_name),
            Self::BulkUpdate(r) => (&r.target_id, &r.db_name, &r.branch_name),
        };
        WorkContext::new(t.as_str(), d.as_str(), b.as_str())
    }
}

/// Row-indexed validation failure inside a preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviewError {
    pub row_index: usize,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreviewResponse {
    #[serde(default)]
    pub ops: Vec<CommitOp>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<PreviewError>,
}

// ── Approval requests ──

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitRequestRequest {
    pub target_id: String,
    pub db_name: String,
    pub branch_name: String,
    pub expected_head: String,
    pub summary_ja: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitRequestResponse {
    pub request_id: String,
    #[serde(default)]
    pub submitted_main_hash: String,
    #[serde(default)]
    pub submitted_work_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestSummary {
    pub request_id: String,
    pub work_branch: String,
    #[serde(default)]
    pub submitted_main_hash: String,
    #[serde(default)]
    pub submitted_work_hash: String,
    #[serde(default)]
    pub summary_ja: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproveRequest {
    pub target_id: String,
    pub db_name: String,
    pub request_id: String,
    pub merge_message_ja: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApproveResponse {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_branch: Option<String>,
}

impl ApproveResponse {
    /// The server sends `""` when no follow-up branch was created.
    pub fn next_branch(&self) -> Option<&str> {
        self.next_branch.as_deref().filter(|b| !b.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectRequest {
    pub target_id: String,
    pub db_name: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectResponse {
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn preview_response_tolerates_missing_lists() {
        let resp: PreviewResponse =
            serde_json::from_str(r#"{"ops":[{"type":"insert","table":"t","values":{"id":1}}]}"#)
                .unwrap();
        assert_eq!(resp.ops.len(), 1);
        assert!(resp.warnings.is_empty());
        assert!(resp.errors.is_empty());
    }

    #[test]
    fn empty_next_branch_reads_as_none() {
        let resp: ApproveResponse =
            serde_json::from_str(r#"{"hash":"h3","next_branch":""}"#).unwrap();
        assert_eq!(resp.next_branch(), None);

        let resp: ApproveResponse =
            serde_json::from_str(r#"{"hash":"h3","next_branch":"wi/ProjectA/02"}"#).unwrap();
        assert_eq!(resp.next_branch(), Some("wi/ProjectA/02"));
    }

    #[test]
    fn clone_request_omits_unset_change_fields() {
        let req = PreviewCloneRequest {
            target_id: "local".into(),
            db_name: "shop".into(),
            branch_name: "wi/a/01".into(),
            table: "items".into(),
            template_pk: json!({"id": 1}).as_object().cloned().unwrap(),
            new_pks: vec![json!(2), json!(3)],
            change_column: None,
            change_value: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("change_column").is_none());
        assert!(v.get("change_value").is_none());
        assert_eq!(v["new_pks"], json!([2, 3]));
    }

    #[test]
    fn strategy_parses_and_serializes_lowercase() {
        assert_eq!("ours".parse::<ResolveStrategy>(), Ok(ResolveStrategy::Ours));
        assert!("mine".parse::<ResolveStrategy>().is_err());
        assert_eq!(
            serde_json::to_value(ResolveStrategy::Theirs).unwrap(),
            json!("theirs")
        );
    }

    #[test]
    fn entry_is_clear_only_when_every_count_is_zero() {
        let mut e = ConflictSummaryEntry {
            table: "items".into(),
            ..Default::default()
        };
        assert!(e.is_clear());
        e.constraint_violations = 1;
        assert!(!e.is_clear());
    }
}
