//! Client side of the remote authority. Everything that talks to the
//! database server goes through [`Remote`]; the session layer never sees
//! HTTP.

pub mod http;
pub mod memory;

use std::sync::Arc;

use rowstage_core::{
    ApiError, ApproveRequest, ApproveResponse, CommitRequest, ConflictSummaryEntry, HashResponse,
    PreviewRequest, PreviewResponse, RejectRequest, RejectResponse, RequestSummary,
    ResolveConflictsRequest, SubmitRequestRequest, SubmitRequestResponse, SyncRequest, TableInfo,
    WorkContext,
};

pub use http::HttpRemote;
pub use memory::{Endpoint, MemoryRemote};

/// Operations offered by the remote authority under `/api/v1`.
///
/// Every mutating call carries an expected head and fails with
/// `STALE_HEAD` when the branch has moved.
pub trait Remote: Send + Sync {
    fn get_head(&self, ctx: &WorkContext) -> Result<String, ApiError>;
    fn list_tables(&self, ctx: &WorkContext) -> Result<Vec<TableInfo>, ApiError>;
    fn commit(&self, req: &CommitRequest) -> Result<HashResponse, ApiError>;
    fn sync(&self, req: &SyncRequest) -> Result<HashResponse, ApiError>;
    fn preview(&self, req: &PreviewRequest) -> Result<PreviewResponse, ApiError>;
    fn get_conflicts(&self, ctx: &WorkContext) -> Result<Vec<ConflictSummaryEntry>, ApiError>;
    fn resolve_conflicts(&self, req: &ResolveConflictsRequest) -> Result<HashResponse, ApiError>;
    fn submit_request(&self, req: &SubmitRequestRequest)
        -> Result<SubmitRequestResponse, ApiError>;
    fn list_requests(&self, target_id: &str, db_name: &str)
        -> Result<Vec<RequestSummary>, ApiError>;
    fn approve_request(&self, req: &ApproveRequest) -> Result<ApproveResponse, ApiError>;
    fn reject_request(&self, req: &RejectRequest) -> Result<RejectResponse, ApiError>;
}

impl<R: Remote + ?Sized> Remote for Arc<R> {
    fn get_head(&self, ctx: &WorkContext) -> Result<String, ApiError> {
        (**self).get_head(ctx)
    }
    fn list_tables(&self, ctx: &WorkContext) -> Result<Vec<TableInfo>, ApiError> {
        (**self).list_tables(ctx)
    }
    fn commit(&self, req: &CommitRequest) -> Result<HashResponse, ApiError> {
        (**self).commit(req)
    }
    fn sync(&self, req: &SyncRequest) -> Result<HashResponse, ApiError> {
        (**self).sync(req)
    }
    fn preview(&self, req: &PreviewRequest) -> Result<PreviewResponse, ApiError> {
        (**self).preview(req)
    }
    fn get_conflicts(&self, ctx: &WorkContext) -> Result<Vec<ConflictSummaryEntry>, ApiError> {
        (**self).get_conflicts(ctx)
    }
    fn resolve_conflicts(&self, req: &ResolveConflictsRequest) -> Result<HashResponse, ApiError> {
        (**self).resolve_conflicts(req)
    }
    fn submit_request(
        &self,
        req: &SubmitRequestRequest,
    ) -> Result<SubmitRequestResponse, ApiError> {
        (**self).submit_request(req)
    }
    fn list_requests(
        &self,
        target_id: &str,
        db_name: &str,
    ) -> Result<Vec<RequestSummary>, ApiError> {
        (**self).list_requests(target_id, db_name)
    }
    fn approve_request(&self, req: &ApproveRequest) -> Result<ApproveResponse, ApiError> {
        (**self).approve_request(req)
    }
    fn reject_request(&self, req: &RejectRequest) -> Result<RejectResponse, ApiError> {
        (**self).reject_request(req)
    }
}
