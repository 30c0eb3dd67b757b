use std::time::Duration;

use rowstage_core::{
    ApiError, ApproveRequest, ApproveResponse, CommitRequest, ConflictSummaryEntry, HashResponse,
    PreviewRequest, PreviewResponse, RejectRequest, RejectResponse, RequestSummary,
    ResolveConflictsRequest, SubmitRequestRequest, SubmitRequestResponse, SyncRequest, TableInfo,
    WorkContext,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Remote;

const API_PREFIX: &str = "/api/v1";

/// Blocking JSON-over-HTTP client. Non-2xx responses are read, not raised,
/// so the server's error envelope reaches the caller intact.
pub struct HttpRemote {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &rowstage_store::Config) -> Self {
        Self::new(&config.base_url, config.timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        endpoint_url(&self.base_url, path)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, &str)]) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut req = self.agent.get(&url);
        for (k, v) in params {
            if !v.is_empty() {
                req = req.query(*k, *v);
            }
        }
        tracing::debug!("GET {url}");
        let resp = req.call().map_err(transport_error)?;
        read_response(resp)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = self.url(path);
        let payload = serde_json::to_string(body)
            .map_err(|e| ApiError::new(rowstage_core::ErrorKind::InvalidArgument, e.to_string()))?;
        tracing::debug!("POST {url}");
        let resp = self
            .agent
            .post(&url)
            .header("Content-Type", "application/json")
            .send(payload)
            .map_err(transport_error)?;
        read_response(resp)
    }
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}{API_PREFIX}{path}", base_url.trim_end_matches('/'))
}

fn context_params(ctx: &WorkContext) -> [(&'static str, &str); 3] {
    [
        ("target_id", ctx.target_id.as_str()),
        ("db_name", ctx.db_name.as_str()),
        ("branch_name", ctx.branch_name.as_str()),
    ]
}

fn transport_error(e: ureq::Error) -> ApiError {
    ApiError::transport(e.to_string())
}

fn read_response<T: DeserializeOwned>(
    mut resp: ureq::http::Response<ureq::Body>,
) -> Result<T, ApiError> {
    let status = resp.status();
    let reason = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    let text = resp.body_mut().read_to_string().map_err(transport_error)?;
    decode_body(status.is_success(), &reason, &text)
}

/// Decode a response body: success bodies into `T`, everything else through
/// the error envelope (falling back to `INTERNAL` with the status text).
fn decode_body<T: DeserializeOwned>(success: bool, reason: &str, text: &str) -> Result<T, ApiError> {
    if !success {
        return Err(ApiError::from_body(text, reason));
    }
    serde_json::from_str(text).map_err(|e| {
        ApiError::new(
            rowstage_core::ErrorKind::Internal,
            format!("unexpected response body: {e}"),
        )
    })
}

impl Remote for HttpRemote {
    fn get_head(&self, ctx: &WorkContext) -> Result<String, ApiError> {
        let resp: HashResponse = self.get("/head", &context_params(ctx))?;
        Ok(resp.hash)
    }

    fn list_tables(&self, ctx: &WorkContext) -> Result<Vec<TableInfo>, ApiError> {
        self.get("/tables", &context_params(ctx))
    }

    fn commit(&self, req: &CommitRequest) -> Result<HashResponse, ApiError> {
        self.post("/commit", req)
    }

    fn sync(&self, req: &SyncRequest) -> Result<HashResponse, ApiError> {
        self.post("/sync", req)
    }

    fn preview(&self, req: &PreviewRequest) -> Result<PreviewResponse, ApiError> {
        match req {
            PreviewRequest::Clone(body) => self.post(req.path(), body),
            PreviewRequest::BatchGenerate(body) => self.post(req.path(), body),
            PreviewRequest::BulkUpdate(body) => self.post(req.path(), body),
        }
    }

    fn get_conflicts(&self, ctx: &WorkContext) -> Result<Vec<ConflictSummaryEntry>, ApiError> {
        self.get("/conflicts", &context_params(ctx))
    }

    fn resolve_conflicts(&self, req: &ResolveConflictsRequest) -> Result<HashResponse, ApiError> {
        self.post("/conflicts/resolve", req)
    }

    fn submit_request(
        &self,
        req: &SubmitRequestRequest,
    ) -> Result<SubmitRequestResponse, ApiError> {
        self.post("/request/submit", req)
    }

    fn list_requests(
        &self,
        target_id: &str,
        db_name: &str,
    ) -> Result<Vec<RequestSummary>, ApiError> {
        self.get("/requests", &[("target_id", target_id), ("db_name", db_name)])
    }

    fn approve_request(&self, req: &ApproveRequest) -> Result<ApproveResponse, ApiError> {
        self.post("/request/approve", req)
    }

    fn reject_request(&self, req: &RejectRequest) -> Result<RejectResponse, ApiError> {
        self.post("/request/reject", req)
    }
}
