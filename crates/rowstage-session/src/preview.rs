//! Preview-then-apply: the remote computes candidate ops, the user inspects
//! them, and only `apply` moves them into the draft.

use rowstage_core::{
    CommitOp, OpError, PreviewBatchGenerateRequest, PreviewBulkUpdateRequest, PreviewCloneRequest,
    PreviewError, PreviewRequest, PreviewResponse, Row, WorkContext,
};
use serde_json::Value;
use thiserror::Error;

use crate::state::guard::ContextToken;

/// Local input problems, raised before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreviewValidationError {
    #[error("table is required")]
    EmptyTable,

    #[error("template primary key is required")]
    EmptyTemplateKey,

    #[error("at least one new primary key is required")]
    NoNewKeys,

    #[error("{values} change values for {keys} new keys")]
    CountMismatch { keys: usize, values: usize },

    #[error("change values given without a change column")]
    MissingChangeColumn,

    #[error("TSV input is empty")]
    EmptyTsv,
}

/// What to generate candidate ops from.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewTemplate {
    /// Copy one row under several new keys, optionally overriding a column.
    Clone {
        table: String,
        template_pk: Row,
        new_pks: Vec<Value>,
        change_column: Option<String>,
        change_value: Option<Value>,
    },
    /// Like `Clone`, with a per-row value for the change column.
    BatchGenerate {
        table: String,
        template_pk: Row,
        new_pks: Vec<Value>,
        change_column: Option<String>,
        change_values: Option<Vec<Value>>,
    },
    /// Key column plus update columns, tab separated, header first.
    BulkUpdate { table: String, tsv: String },
}

impl PreviewTemplate {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Clone { .. } => "clone",
            Self::BatchGenerate { .. } => "batch",
            Self::BulkUpdate { .. } => "bulk",
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Clone { table, .. }
            | Self::BatchGenerate { table, .. }
            | Self::BulkUpdate { table, .. } => table,
        }
    }

    pub fn validate(&self) -> Result<(), PreviewValidationError> {
        if self.table().trim().is_empty() {
            return Err(PreviewValidationError::EmptyTable);
        }
        match self {
            Self::Clone {
                template_pk,
                new_pks,
                ..
            } => check_keys(template_pk, new_pks),
            Self::BatchGenerate {
                template_pk,
                new_pks,
                change_column,
                change_values,
                ..
            } => {
                check_keys(template_pk, new_pks)?;
                if let Some(values) = change_values {
                    if change_column.as_deref().map_or(true, |c| c.trim().is_empty()) {
                        return Err(PreviewValidationError::MissingChangeColumn);
                    }
                    if values.len() != new_pks.len() {
                        return Err(PreviewValidationError::CountMismatch {
                            keys: new_pks.len(),
                            values: values.len(),
                        });
                    }
                }
                Ok(())
            }
            Self::BulkUpdate { tsv, .. } => {
                if tsv.trim().is_empty() {
                    Err(PreviewValidationError::EmptyTsv)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Validate, then build the request for `ctx`.
    pub fn to_request(&self, ctx: &WorkContext) -> Result<PreviewRequest, PreviewValidationError> {
        self.validate()?;
        let req = match self.clone() {
            Self::Clone {
                table,
                template_pk,
                new_pks,
                change_column,
                change_value,
            } => PreviewRequest::Clone(PreviewCloneRequest {
                target_id: ctx.target_id.clone(),
                db_name: ctx.db_name.clone(),
                branch_name: ctx.branch_name.clone(),
                table,
                template_pk,
                new_pks,
                change_column,
                change_value,
            }),
            Self::BatchGenerate {
                table,
                template_pk,
                new_pks,
                change_column,
                change_values,
            } => PreviewRequest::BatchGenerate(PreviewBatchGenerateRequest {
                target_id: ctx.target_id.clone(),
                db_name: ctx.db_name.clone(),
                branch_name: ctx.branch_name.clone(),
                table,
                template_pk,
                new_pks,
                change_column,
                change_values,
            }),
            Self::BulkUpdate { table, tsv } => PreviewRequest::BulkUpdate(PreviewBulkUpdateRequest {
                target_id: ctx.target_id.clone(),
                db_name: ctx.db_name.clone(),
                branch_name: ctx.branch_name.clone(),
                table,
                tsv_data: tsv,
            }),
        };
        Ok(req)
    }
}

fn check_keys(template_pk: &Row, new_pks: &[Value]) -> Result<(), PreviewValidationError> {
    if template_pk.is_empty() {
        return Err(PreviewValidationError::EmptyTemplateKey);
    }
    if new_pks.is_empty() {
        return Err(PreviewValidationError::NoNewKeys);
    }
    Ok(())
}

/// Candidates returned by the remote, waiting for apply or discard.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedPreview {
    pub kind: &'static str,
    pub table: String,
    pub candidates: Vec<CommitOp>,
    pub warnings: Vec<String>,
    pub errors: Vec<PreviewError>,
    pub token: ContextToken,
}

impl StagedPreview {
    pub fn is_applicable(&self) -> bool {
        self.errors.is_empty()
    }

    /// First candidate that fails local op validation.
    pub fn first_invalid(&self) -> Option<(usize, OpError)> {
        self.candidates
            .iter()
            .enumerate()
            .find_map(|(i, op)| op.validate().err().map(|e| (i, e)))
    }
}

/// Holds at most one staged preview. Never touches the draft itself.
#[derive(Debug, Default)]
pub struct PreviewStager {
    staged: Option<StagedPreview>,
}

impl PreviewStager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staged(&self) -> Option<&StagedPreview> {
        self.staged.as_ref()
    }

    /// Replace whatever was staged with `resp`.
    pub fn stage(
        &mut self,
        template: &PreviewTemplate,
        token: ContextToken,
        resp: PreviewResponse,
    ) -> &StagedPreview {
        self.staged.insert(StagedPreview {
            kind: template.kind(),
            table: template.table().to_string(),
            candidates: resp.ops,
            warnings: resp.warnings,
            errors: resp.errors,
            token,
        })
    }

    /// Hand over the candidates if there are no errors. On error the
    /// preview stays staged so it can still be inspected.
    pub fn take_applicable(&mut self) -> Option<Result<Vec<CommitOp>, usize>> {
        let staged = self.staged.as_ref()?;
        if !staged.is_applicable() {
            return Some(Err(staged.errors.len()));
        }
        self.staged.take().map(|s| Ok(s.candidates))
    }

    /// Drop the staged preview. Returns whether anything was staged.
    pub fn discard(&mut self) -> bool {
        self.staged.take().is_some()
    }
}
