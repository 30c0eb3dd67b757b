use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dispatch key for remote failures. `code` strings outside the known set
/// land in `Unknown`; `Transport` never comes from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Forbidden,
    NotFound,
    StaleHead,
    MergeConflictsPresent,
    SchemaConflictsPresent,
    ConstraintViolationsPresent,
    PreconditionFailed,
    Internal,
    Transport,
    Unknown,
}

impl ErrorKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "FORBIDDEN" => Self::Forbidden,
            "NOT_FOUND" => Self::NotFound,
            "STALE_HEAD" => Self::StaleHead,
            "MERGE_CONFLICTS_PRESENT" => Self::MergeConflictsPresent,
            "SCHEMA_CONFLICTS_PRESENT" => Self::SchemaConflictsPresent,
            "CONSTRAINT_VIOLATIONS_PRESENT" => Self::ConstraintViolationsPresent,
            "PRECONDITION_FAILED" => Self::PreconditionFailed,
            "INTERNAL" => Self::Internal,
            "TRANSPORT" => Self::Transport,
            _ => Self::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::StaleHead => "STALE_HEAD",
            Self::MergeConflictsPresent => "MERGE_CONFLICTS_PRESENT",
            Self::SchemaConflictsPresent => "SCHEMA_CONFLICTS_PRESENT",
            Self::ConstraintViolationsPresent => "CONSTRAINT_VIOLATIONS_PRESENT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::Internal => "INTERNAL",
            Self::Transport => "TRANSPORT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// A failed remote call. `code` is kept verbatim so unknown codes survive
/// for display; `message` is user-facing text only.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code().to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Decode a response body. Anything that is not a `{"error": {...}}`
    /// envelope becomes `INTERNAL` carrying `fallback_message`.
    pub fn from_body(body: &str, fallback_message: &str) -> Self {
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(env) => env.error.into(),
            Err(_) => Self::new(ErrorKind::Internal, fallback_message),
        }
    }
}

/// Wire shape: `{"error": {"code": "...", "message": "...", "details": ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<ErrorDetail> for ApiError {
    fn from(d: ErrorDetail) -> Self {
        Self {
            kind: ErrorKind::from_code(&d.code),
            code: d.code,
            message: d.message,
            details: d.details,
        }
    }
}

impl From<&ApiError> for ErrorEnvelope {
    fn from(e: &ApiError) -> Self {
        Self {
            error: ErrorDetail {
                code: e.code.clone(),
                message: e.message.clone(),
                details: e.details.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_both_ways() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::Forbidden,
            ErrorKind::NotFound,
            ErrorKind::StaleHead,
            ErrorKind::MergeConflictsPresent,
            ErrorKind::SchemaConflictsPresent,
            ErrorKind::ConstraintViolationsPresent,
            ErrorKind::PreconditionFailed,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_code_is_preserved() {
        let body = r#"{"error":{"code":"RATE_LIMITED","message":"slow down"}}"#;
        let err = ApiError::from_body(body, "Too Many Requests");
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.code, "RATE_LIMITED");
        assert_eq!(err.message, "slow down");
    }

    #[test]
    fn envelope_details_survive() {
        let body = r#"{"error":{"code":"STALE_HEAD","message":"expected_head mismatch","details":{"actual_head":"h9"}}}"#;
        let err = ApiError::from_body(body, "Conflict");
        assert_eq!(err.kind, ErrorKind::StaleHead);
        assert_eq!(err.details.unwrap()["actual_head"], "h9");
    }

    #[test]
    fn non_json_body_falls_back_to_internal() {
        let err = ApiError::from_body("<html>bad gateway</html>", "Bad Gateway");
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.code, "INTERNAL");
        assert_eq!(err.message, "Bad Gateway");
    }

    #[test]
    fn display_shows_code_and_message() {
        let err = ApiError::new(ErrorKind::Forbidden, "write operations on main branch are forbidden");
        assert_eq!(
            err.to_string(),
            "FORBIDDEN: write operations on main branch are forbidden"
        );
    }
}
