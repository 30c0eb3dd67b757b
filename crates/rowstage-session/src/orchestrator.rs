//! The session: one work context, its draft, and the state machine that
//! decides what may happen next.
//!
//! Every remote operation is split in two. `begin_*` checks preconditions,
//! moves into the transient state, and returns a [`Ticket`] holding the
//! request plus the context identity at issue time. The caller runs the
//! request (on any thread) and hands the result to `complete_*`, which
//! applies it only if the ticket is still current. The `&dyn Remote`
//! wrappers do both halves inline.

use rowstage_core::{
    ApiError, ApproveRequest, CommitOp, CommitRequest, ConflictSummaryEntry, HashResponse, OpError,
    PreviewRequest, PreviewResponse, RejectRequest, RejectResponse, RequestSummary,
    ResolveConflictsRequest, ResolveStrategy, SubmitRequestRequest, SubmitRequestResponse,
    SyncRequest, TableInfo, WorkContext,
};
use rowstage_ledger::{DraftLedger, LedgerError};
use rowstage_remote::Remote;
use thiserror::Error;

use crate::preview::{PreviewStager, PreviewTemplate, PreviewValidationError, StagedPreview};
use crate::state::guard::{ContextGuard, ContextToken};
use crate::state::machine::{
    ConflictVerdict, SessionEvent, SessionMachine, SessionState, TransitionError,
};

// ── Outcomes ──

/// Remote operations that hold the session until they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Commit,
    Sync,
    Preview,
    Resolve,
    Recheck,
    Submit,
    Approve,
    Reject,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Sync => "sync",
            Self::Preview => "preview",
            Self::Resolve => "resolve",
            Self::Recheck => "recheck",
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejections raised locally, before any network call. None of them
/// changes the session, except `Transition`, which a completion can raise
/// after its result was already recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("{0} already in progress")]
    Busy(Operation),

    #[error("cannot {action} while {state}")]
    IllegalState {
        action: &'static str,
        state: SessionState,
    },

    #[error("select a target, database, and branch first")]
    ContextIncomplete,

    #[error("select a target and database first")]
    DatabaseNotSelected,

    #[error("branch {0} is read-only")]
    ProtectedBranch(String),

    #[error("branch head unknown; refresh first")]
    HeadUnknown,

    #[error("nothing to commit")]
    EmptyDraft,

    #[error("discard draft before {0}")]
    DraftNotEmpty(&'static str),

    #[error("summary is required")]
    EmptySummary,

    #[error("request id is required")]
    EmptyRequestId,

    #[error("table {0} has schema conflicts and cannot be resolved here")]
    SchemaConflictTable(String),

    #[error("table {0} has no recorded conflicts")]
    UnknownConflictTable(String),

    #[error("no preview staged")]
    NoPreview,

    #[error("preview has {0} row errors; drop it and fix the input")]
    PreviewHasErrors(usize),

    #[error("preview candidate {index} is malformed: {error}")]
    InvalidCandidate { index: usize, error: OpError },

    #[error(transparent)]
    InvalidOp(#[from] OpError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    InvalidPreview(#[from] PreviewValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// How an operation ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Applied; `state` is the state afterwards.
    Applied {
        state: SessionState,
        message: Option<String>,
    },
    /// Refused before reaching the remote.
    Rejected(PreconditionError),
    /// The context changed while the request was in flight.
    Discarded,
}

impl Outcome {
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Applied { message, .. } => message.clone(),
            Self::Rejected(e) => Some(e.to_string()),
            Self::Discarded => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl From<PreconditionError> for Outcome {
    fn from(e: PreconditionError) -> Self {
        Self::Rejected(e)
    }
}

/// An issued request and the context it was issued under.
#[derive(Debug, Clone)]
pub struct Ticket<R> {
    token: ContextToken,
    op: Option<Operation>,
    request: R,
}

impl<R> Ticket<R> {
    pub fn request(&self) -> &R {
        &self.request
    }

    pub fn token(&self) -> &ContextToken {
        &self.token
    }
}

/// Remote result of a resolve: the new head plus the follow-up summary.
/// `remaining` is `None` when the summary could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub hash: String,
    pub remaining: Option<Vec<ConflictSummaryEntry>>,
}

/// Approve carries a default merge message when none is given.
pub fn default_merge_message(request_id: &str) -> String {
    format!("承認マージ: {request_id}")
}

fn default_commit_message(op_count: usize) -> String {
    format!("auto commit ({op_count} ops)")
}

// ── Session ──

/// Single-writer session state. All mutation goes through `&mut self`.
pub struct Session {
    guard: ContextGuard,
    ledger: DraftLedger,
    machine: SessionMachine,
    head: Option<String>,
    tables: Vec<String>,
    conflicts: Vec<ConflictSummaryEntry>,
    preview: PreviewStager,
    pending_preview: Option<PreviewTemplate>,
    submitted: Option<SubmitRequestResponse>,
    protected_branch: String,
    in_flight: Option<Operation>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("context", self.guard.context())
            .field("state", &self.machine.state())
            .field("head", &self.head)
            .field("ops", &self.ledger.len())
            .finish()
    }
}

impl Session {
    /// Open a session over an already-loaded ledger. A non-empty draft
    /// resumes in `DraftEditing`.
    pub fn new(
        context: WorkContext,
        ledger: DraftLedger,
        protected_branch: impl Into<String>,
    ) -> Self {
        let machine = SessionMachine::resume(ledger.is_empty());
        Self {
            guard: ContextGuard::new(context),
            ledger,
            machine,
            head: None,
            tables: Vec::new(),
            conflicts: Vec::new(),
            preview: PreviewStager::new(),
            pending_preview: None,
            submitted: None,
            protected_branch: protected_branch.into(),
            in_flight: None,
        }
    }

    // ── Accessors ──

    pub fn context(&self) -> &WorkContext {
        self.guard.context()
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.machine.last_error()
    }

    pub fn request_pending(&self) -> bool {
        self.machine.request_pending()
    }

    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    pub fn ops(&self) -> &[CommitOp] {
        self.ledger.ops()
    }

    pub fn ledger(&self) -> &DraftLedger {
        &self.ledger
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn conflicts(&self) -> &[ConflictSummaryEntry] {
        &self.conflicts
    }

    pub fn staged_preview(&self) -> Option<&StagedPreview> {
        self.preview.staged()
    }

    pub fn submitted(&self) -> Option<&SubmitRequestResponse> {
        self.submitted.as_ref()
    }

    pub fn in_flight(&self) -> Option<Operation> {
        self.in_flight
    }

    pub fn protected_branch(&self) -> &str {
        &self.protected_branch
    }

    /// Capture the current context identity for a guarded read.
    pub fn token(&self) -> ContextToken {
        self.guard.token()
    }

    // ── Shared checks ──

    fn applied(&self, message: Option<String>) -> Outcome {
        Outcome::Applied {
            state: self.machine.state(),
            message,
        }
    }

    fn fail(&mut self, message: String) -> Outcome {
        self.machine.set_error(message.clone());
        self.applied(Some(message))
    }

    /// Drive the machine. A refused event leaves the state as it was and
    /// is reported to the caller instead of passing as success.
    fn fire(&mut self, event: SessionEvent) -> Result<SessionState, PreconditionError> {
        self.machine.fire(event).map_err(|e| {
            tracing::warn!("{e}");
            PreconditionError::from(e)
        })
    }

    fn check_idle_slot(&self) -> Result<(), PreconditionError> {
        match self.in_flight {
            Some(op) => Err(PreconditionError::Busy(op)),
            None => Ok(()),
        }
    }

    fn check_writable_context(&self) -> Result<(), PreconditionError> {
        let ctx = self.guard.context();
        if !ctx.is_complete() {
            return Err(PreconditionError::ContextIncomplete);
        }
        if ctx.is_on_branch(&self.protected_branch) {
            return Err(PreconditionError::ProtectedBranch(ctx.branch_name.clone()));
        }
        Ok(())
    }

    fn check_state(
        &self,
        action: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), PreconditionError> {
        let state = self.machine.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(PreconditionError::IllegalState { action, state })
        }
    }

    fn known_head(&self) -> Result<String, PreconditionError> {
        self.head.clone().ok_or(PreconditionError::HeadUnknown)
    }

    fn issue<R>(&mut self, op: Operation, request: R) -> Ticket<R> {
        self.in_flight = Some(op);
        Ticket {
            token: self.guard.token(),
            op: Some(op),
            request,
        }
    }

    /// Admit a completion. Frees the in-flight slot when the ticket is
    /// current; a stale ticket leaves everything alone.
    fn admit<R>(&mut self, ticket: &Ticket<R>, what: &str) -> bool {
        if self.guard.admit(&ticket.token, what, ()).is_none() {
            return false;
        }
        if ticket.op.is_some() && self.in_flight == ticket.op {
            self.in_flight = None;
        }
        true
    }

    // ── Context ──

    /// Switch to `context`. The draft is discarded and the session returns
    /// to `Idle`; results still in flight for the old context are dropped.
    pub fn switch_context(&mut self, context: WorkContext) -> Outcome {
        if &context == self.guard.context() {
            return self.applied(None);
        }
        tracing::info!("switching context {} → {}", self.guard.context(), context);
        self.guard.switch(context);
        self.ledger.clear();
        self.preview.discard();
        self.pending_preview = None;
        self.head = None;
        self.tables.clear();
        self.conflicts.clear();
        self.submitted = None;
        self.in_flight = None;
        self.machine.set_request_pending(false);
        if let Err(refused) = self.fire(SessionEvent::ContextSwitched) {
            return refused.into();
        }
        self.applied(None)
    }

    pub fn set_target(&mut self, target_id: &str) -> Outcome {
        let next = self.guard.context().with_target(target_id);
        self.switch_context(next)
    }

    pub fn set_database(&mut self, db_name: &str) -> Outcome {
        let next = self.guard.context().with_database(db_name);
        self.switch_context(next)
    }

    pub fn set_branch(&mut self, branch_name: &str) -> Outcome {
        let next = self.guard.context().with_branch(branch_name);
        self.switch_context(next)
    }

    // ── Guarded reads ──

    /// Apply a head read issued under `token`.
    pub fn complete_head_refresh(
        &mut self,
        token: &ContextToken,
        result: Result<String, ApiError>,
    ) -> Outcome {
        let Some(result) = self.guard.admit(token, "head", result) else {
            return Outcome::Discarded;
        };
        match result {
            Ok(hash) => {
                self.head = Some(hash);
                if self.machine.state() == SessionState::StaleHeadDetected {
                    let draft_empty = self.ledger.is_empty();
                    if let Err(refused) = self.fire(SessionEvent::HeadRefreshed { draft_empty }) {
                        return refused.into();
                    }
                }
                self.applied(None)
            }
            Err(e) => self.fail(format!("head refresh failed: {e}")),
        }
    }

    /// Apply a table-list read issued under `token`.
    pub fn complete_tables_refresh(
        &mut self,
        token: &ContextToken,
        result: Result<Vec<TableInfo>, ApiError>,
    ) -> Outcome {
        let Some(result) = self.guard.admit(token, "table list", result) else {
            return Outcome::Discarded;
        };
        match result {
            Ok(tables) => {
                self.tables = tables.into_iter().map(|t| t.name).collect();
                self.applied(None)
            }
            Err(e) => self.fail(format!("table list failed: {e}")),
        }
    }

    /// Apply a conflict-summary read issued under `token`. Only replaces the
    /// cached list; state changes go through re-check.
    pub fn complete_conflicts_refresh(
        &mut self,
        token: &ContextToken,
        result: Result<Vec<ConflictSummaryEntry>, ApiError>,
    ) -> Outcome {
        let Some(result) = self.guard.admit(token, "conflict summary", result) else {
            return Outcome::Discarded;
        };
        match result {
            Ok(entries) => {
                self.conflicts = entries;
                self.applied(None)
            }
            Err(e) => self.fail(format!("conflict summary failed: {e}")),
        }
    }

    pub fn refresh_head(&mut self, remote: &dyn Remote) -> Outcome {
        if !self.guard.context().is_complete() {
            return PreconditionError::ContextIncomplete.into();
        }
        let token = self.guard.token();
        let result = remote.get_head(token.context());
        self.complete_head_refresh(&token, result)
    }

    pub fn refresh_tables(&mut self, remote: &dyn Remote) -> Outcome {
        if !self.guard.context().is_complete() {
            return PreconditionError::ContextIncomplete.into();
        }
        let token = self.guard.token();
        let result = remote.list_tables(token.context());
        self.complete_tables_refresh(&token, result)
    }

    pub fn refresh_conflicts(&mut self, remote: &dyn Remote) -> Outcome {
        if !self.guard.context().is_complete() {
            return PreconditionError::ContextIncomplete.into();
        }
        let token = self.guard.token();
        let result = remote.get_conflicts(token.context());
        self.complete_conflicts_refresh(&token, result)
    }

    // ── Draft editing ──

    /// Append one op to the draft.
    pub fn stage(&mut self, op: CommitOp) -> Outcome {
        if let Err(e) = self.check_idle_slot() {
            return e.into();
        }
        if let Err(e) = self.check_writable_context() {
            return e.into();
        }
        if let Err(e) = self.check_state("edit", &[SessionState::Idle, SessionState::DraftEditing]) {
            return e.into();
        }
        if let Err(e) = op.validate() {
            return PreconditionError::from(e).into();
        }
        tracing::debug!("staging {}", op.summary());
        self.ledger.append(op);
        if let Err(refused) = self.fire(SessionEvent::OpStaged) {
            return refused.into();
        }
        self.applied(None)
    }

    /// Remove the op at `index`. Removing the last op falls back to `Idle`.
    pub fn unstage(&mut self, index: usize) -> Outcome {
        if let Err(e) = self.check_idle_slot() {
            return e.into();
        }
        if let Err(e) = self.check_state(
            "remove ops",
            &[SessionState::DraftEditing, SessionState::StaleHeadDetected],
        ) {
            return e.into();
        }
        let removed = match self.ledger.remove(index) {
            Ok(op) => op,
            Err(e) => return PreconditionError::from(e).into(),
        };
        if self.ledger.is_empty() {
            if let Err(refused) = self.fire(SessionEvent::DraftEmptied) {
                return refused.into();
            }
        }
        self.applied(Some(format!("removed {}", removed.summary())))
    }

    /// Throw the whole draft away.
    pub fn discard_draft(&mut self) -> Outcome {
        if let Err(e) = self.check_idle_slot() {
            return e.into();
        }
        if let Err(e) = self.check_state(
            "discard the draft",
            &[
                SessionState::Idle,
                SessionState::DraftEditing,
                SessionState::StaleHeadDetected,
            ],
        ) {
            return e.into();
        }
        let n = self.ledger.len();
        self.ledger.clear();
        if n > 0 {
            if let Err(refused) = self.fire(SessionEvent::DraftEmptied) {
                return refused.into();
            }
        }
        self.applied(Some(format!("discarded {n} ops")))
    }

    // ── Commit ──

    pub fn begin_commit(&mut self, message: &str) -> Result<Ticket<CommitRequest>, Outcome> {
        self.check_idle_slot()?;
        self.check_writable_context()?;
        if self.ledger.is_empty() {
            return Err(PreconditionError::EmptyDraft.into());
        }
        self.check_state("commit", &[SessionState::DraftEditing])?;
        let expected_head = self.known_head()?;

        let ctx = self.guard.context().clone();
        let commit_message = if message.trim().is_empty() {
            default_commit_message(self.ledger.len())
        } else {
            message.to_string()
        };
        let request = CommitRequest {
            target_id: ctx.target_id,
            db_name: ctx.db_name,
            branch_name: ctx.branch_name,
            expected_head,
            commit_message,
            ops: self.ledger.ops().to_vec(),
        };
        self.fire(SessionEvent::CommitStarted)?;
        Ok(self.issue(Operation::Commit, request))
    }

    pub fn complete_commit(
        &mut self,
        ticket: Ticket<CommitRequest>,
        result: Result<HashResponse, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "commit result") {
            return Outcome::Discarded;
        }
        match result {
            Ok(resp) => {
                let n = ticket.request.ops.len();
                tracing::info!(
                    "committed {n} ops on {} → {}",
                    ticket.token.context(),
                    resp.hash
                );
                self.ledger.clear();
                self.head = Some(resp.hash.clone());
                if let Err(refused) = self.fire(SessionEvent::CommitSucceeded) {
                    return refused.into();
                }
                self.applied(Some(format!("committed {n} ops ({})", resp.hash)))
            }
            Err(e) => {
                if let Err(refused) = self.fire(SessionEvent::CommitFailed(e.kind)) {
                    return refused.into();
                }
                self.fail(format!("commit failed: {e}"))
            }
        }
    }

    pub fn commit(&mut self, remote: &dyn Remote, message: &str) -> Outcome {
        let ticket = match self.begin_commit(message) {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.commit(ticket.request());
        self.complete_commit(ticket, result)
    }

    // ── Sync ──

    pub fn begin_sync(&mut self) -> Result<Ticket<SyncRequest>, Outcome> {
        self.check_idle_slot()?;
        self.check_writable_context()?;
        if !self.ledger.is_empty() {
            return Err(PreconditionError::DraftNotEmpty("syncing").into());
        }
        self.check_state("sync", &[SessionState::Idle])?;
        let head = self.known_head()?;
        let request = SyncRequest::new(self.guard.context(), &head);
        self.fire(SessionEvent::SyncStarted)?;
        Ok(self.issue(Operation::Sync, request))
    }

    pub fn complete_sync(
        &mut self,
        ticket: Ticket<SyncRequest>,
        result: Result<HashResponse, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "sync result") {
            return Outcome::Discarded;
        }
        match result {
            Ok(resp) => {
                tracing::info!("synced {} → {}", ticket.token.context(), resp.hash);
                self.head = Some(resp.hash.clone());
                self.conflicts.clear();
                if let Err(refused) = self.fire(SessionEvent::SyncSucceeded) {
                    return refused.into();
                }
                self.applied(Some(format!("synced ({})", resp.hash)))
            }
            Err(e) => {
                if let Err(refused) = self.fire(SessionEvent::SyncFailed(e.kind)) {
                    return refused.into();
                }
                self.fail(format!("sync failed: {e}"))
            }
        }
    }

    pub fn sync(&mut self, remote: &dyn Remote) -> Outcome {
        let ticket = match self.begin_sync() {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.sync(ticket.request());
        let outcome = self.complete_sync(ticket, result);
        if self.machine.state().is_conflicted() {
            let token = self.guard.token();
            let summary = remote.get_conflicts(token.context());
            if let Ok(entries) = summary {
                self.conflicts = entries;
            }
        }
        outcome
    }

    // ── Conflicts ──

    /// Resolve data conflicts of one table. A table already known to carry
    /// schema conflicts is refused here and escalates the session.
    pub fn begin_resolve(
        &mut self,
        table: &str,
        strategy: ResolveStrategy,
    ) -> Result<Ticket<ResolveConflictsRequest>, Outcome> {
        self.check_idle_slot()?;
        self.check_writable_context()?;
        self.check_state("resolve conflicts", &[SessionState::MergeConflictsPresent])?;
        if let Some(entry) = self.conflicts.iter().find(|e| e.table == table) {
            if entry.schema_conflicts > 0 {
                self.fire(SessionEvent::ResolveFailed(
                    rowstage_core::ErrorKind::SchemaConflictsPresent,
                ))?;
                let msg = PreconditionError::SchemaConflictTable(table.to_string()).to_string();
                return Err(self.fail(msg));
            }
        } else if !self.conflicts.is_empty() {
            return Err(PreconditionError::UnknownConflictTable(table.to_string()).into());
        }
        let expected_head = self.known_head()?;
        let ctx = self.guard.context().clone();
        let request = ResolveConflictsRequest {
            target_id: ctx.target_id,
            db_name: ctx.db_name,
            branch_name: ctx.branch_name,
            expected_head,
            table: table.to_string(),
            strategy,
        };
        Ok(self.issue(Operation::Resolve, request))
    }

    pub fn complete_resolve(
        &mut self,
        ticket: Ticket<ResolveConflictsRequest>,
        result: Result<Resolved, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "resolve result") {
            return Outcome::Discarded;
        }
        match result {
            Ok(resolved) => {
                let req = &ticket.request;
                tracing::info!(
                    "resolved {} with {} on {} → {}",
                    req.table,
                    req.strategy.as_str(),
                    ticket.token.context(),
                    resolved.hash
                );
                self.head = Some(resolved.hash);
                self.conflicts = resolved.remaining.unwrap_or_default();
                let verdict = ConflictVerdict::from_summary(&self.conflicts);
                if let Err(refused) = self.fire(SessionEvent::ResolveSettled(verdict)) {
                    return refused.into();
                }
                self.applied(Some(format!(
                    "resolved {} ({})",
                    req.table,
                    req.strategy.as_str()
                )))
            }
            Err(e) => {
                if let Err(refused) = self.fire(SessionEvent::ResolveFailed(e.kind)) {
                    return refused.into();
                }
                self.fail(format!("resolve failed: {e}"))
            }
        }
    }

    pub fn resolve(
        &mut self,
        remote: &dyn Remote,
        table: &str,
        strategy: ResolveStrategy,
    ) -> Outcome {
        let ticket = match self.begin_resolve(table, strategy) {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.resolve_conflicts(ticket.request()).map(|resp| Resolved {
            hash: resp.hash,
            remaining: remote.get_conflicts(ticket.token().context()).ok(),
        });
        self.complete_resolve(ticket, result)
    }

    /// Re-read the conflict summary. The only way out of the escalated
    /// conflict states.
    pub fn begin_recheck(&mut self) -> Result<Ticket<WorkContext>, Outcome> {
        self.check_idle_slot()?;
        if !self.guard.context().is_complete() {
            return Err(PreconditionError::ContextIncomplete.into());
        }
        self.check_state(
            "re-check conflicts",
            &[
                SessionState::MergeConflictsPresent,
                SessionState::SchemaConflictDetected,
                SessionState::ConstraintViolationDetected,
            ],
        )?;
        let ctx = self.guard.context().clone();
        Ok(self.issue(Operation::Recheck, ctx))
    }

    /// A failed read counts as "no merge in progress".
    pub fn complete_recheck(
        &mut self,
        ticket: Ticket<WorkContext>,
        result: Result<Vec<ConflictSummaryEntry>, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "conflict summary") {
            return Outcome::Discarded;
        }
        self.conflicts = match result {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("conflict re-check failed, treating as resolved: {e}");
                Vec::new()
            }
        };
        let verdict = ConflictVerdict::from_summary(&self.conflicts);
        if let Err(refused) = self.fire(SessionEvent::RecheckSettled(verdict)) {
            return refused.into();
        }
        let message = match verdict {
            ConflictVerdict::Clear => "no conflicts remain".to_string(),
            _ => format!("{} tables still conflicted", self.conflicts.len()),
        };
        self.applied(Some(message))
    }

    pub fn recheck(&mut self, remote: &dyn Remote) -> Outcome {
        let ticket = match self.begin_recheck() {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.get_conflicts(ticket.request());
        let outcome = self.complete_recheck(ticket, result);
        if self.machine.state() == SessionState::Idle {
            // The merge was abandoned or finished server side; the head moved.
            let refreshed = self.refresh_head(remote);
            if refreshed.message().is_some() {
                return refreshed;
            }
        }
        outcome
    }

    // ── Preview ──

    pub fn begin_preview(
        &mut self,
        template: PreviewTemplate,
    ) -> Result<Ticket<PreviewRequest>, Outcome> {
        self.check_idle_slot()?;
        self.check_writable_context()?;
        self.check_state("preview", &[SessionState::Idle, SessionState::DraftEditing])?;
        let request = template
            .to_request(self.guard.context())
            .map_err(PreconditionError::from)?;
        self.pending_preview = Some(template);
        self.fire(SessionEvent::PreviewStarted)?;
        Ok(self.issue(Operation::Preview, request))
    }

    /// Stage the remote's candidates. The draft is untouched either way.
    pub fn complete_preview(
        &mut self,
        ticket: Ticket<PreviewRequest>,
        result: Result<PreviewResponse, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "preview") {
            return Outcome::Discarded;
        }
        let template = self.pending_preview.take();
        let draft_empty = self.ledger.is_empty();
        if let Err(refused) = self.fire(SessionEvent::PreviewSettled { draft_empty }) {
            return refused.into();
        }
        match (result, template) {
            (Ok(resp), Some(template)) => {
                let staged = self.preview.stage(&template, ticket.token, resp);
                let message = format!(
                    "{} candidate ops, {} warnings, {} errors",
                    staged.candidates.len(),
                    staged.warnings.len(),
                    staged.errors.len()
                );
                self.applied(Some(message))
            }
            (Ok(_), None) => self.applied(None),
            (Err(e), _) => self.fail(format!("preview failed: {e}")),
        }
    }

    pub fn preview(&mut self, remote: &dyn Remote, template: PreviewTemplate) -> Outcome {
        let ticket = match self.begin_preview(template) {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.preview(ticket.request());
        self.complete_preview(ticket, result)
    }

    /// Move staged candidates into the draft. Refused while the preview
    /// carries row errors; a preview with no candidates just goes away.
    pub fn apply_preview(&mut self) -> Outcome {
        if let Err(e) = self.check_idle_slot() {
            return e.into();
        }
        if let Err(e) = self.check_state(
            "apply a preview",
            &[SessionState::Idle, SessionState::DraftEditing],
        ) {
            return e.into();
        }
        if let Some(staged) = self.preview.staged() {
            if !self.guard.is_current(&staged.token) {
                self.preview.discard();
                return PreconditionError::NoPreview.into();
            }
            if staged.is_applicable() {
                if let Some((index, error)) = staged.first_invalid() {
                    return PreconditionError::InvalidCandidate { index, error }.into();
                }
            }
        }
        let ops = match self.preview.take_applicable() {
            None => return PreconditionError::NoPreview.into(),
            Some(Err(n)) => return PreconditionError::PreviewHasErrors(n).into(),
            Some(Ok(ops)) => ops,
        };
        if ops.is_empty() {
            return self.applied(Some("nothing to apply".to_string()));
        }
        let n = ops.len();
        self.ledger.extend(ops);
        if let Err(refused) = self.fire(SessionEvent::OpStaged) {
            return refused.into();
        }
        self.applied(Some(format!("applied {n} ops")))
    }

    /// Drop the staged preview. Safe to call with nothing staged.
    pub fn discard_preview(&mut self) -> Outcome {
        if self.preview.discard() {
            self.applied(Some("preview dropped".to_string()))
        } else {
            self.applied(None)
        }
    }

    // ── Approval requests ──

    pub fn begin_submit(
        &mut self,
        summary: &str,
    ) -> Result<Ticket<SubmitRequestRequest>, Outcome> {
        self.check_idle_slot()?;
        self.check_writable_context()?;
        if !self.ledger.is_empty() {
            return Err(PreconditionError::DraftNotEmpty("submitting").into());
        }
        self.check_state("submit", &[SessionState::Idle])?;
        if summary.trim().is_empty() {
            return Err(PreconditionError::EmptySummary.into());
        }
        let expected_head = self.known_head()?;
        let ctx = self.guard.context().clone();
        let request = SubmitRequestRequest {
            target_id: ctx.target_id,
            db_name: ctx.db_name,
            branch_name: ctx.branch_name,
            expected_head,
            summary_ja: summary.trim().to_string(),
        };
        Ok(self.issue(Operation::Submit, request))
    }

    pub fn complete_submit(
        &mut self,
        ticket: Ticket<SubmitRequestRequest>,
        result: Result<SubmitRequestResponse, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "submit result") {
            return Outcome::Discarded;
        }
        match result {
            Ok(resp) => {
                tracing::info!(
                    "submitted {} from {}",
                    resp.request_id,
                    ticket.token.context()
                );
                if !resp.submitted_work_hash.is_empty() {
                    self.head = Some(resp.submitted_work_hash.clone());
                }
                let message = format!("submitted {}", resp.request_id);
                self.submitted = Some(resp);
                self.machine.set_request_pending(true);
                self.applied(Some(message))
            }
            Err(e) => {
                if let Err(refused) = self.fire(SessionEvent::SubmitFailed(e.kind)) {
                    return refused.into();
                }
                self.fail(format!("submit failed: {e}"))
            }
        }
    }

    pub fn submit(&mut self, remote: &dyn Remote, summary: &str) -> Outcome {
        let ticket = match self.begin_submit(summary) {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.submit_request(ticket.request());
        self.complete_submit(ticket, result)
    }

    /// Pending requests for the current target and database.
    pub fn list_requests(&self, remote: &dyn Remote) -> Result<Vec<RequestSummary>, Outcome> {
        let ctx = self.guard.context();
        if ctx.target_id.is_empty() || ctx.db_name.is_empty() {
            return Err(PreconditionError::DatabaseNotSelected.into());
        }
        remote
            .list_requests(&ctx.target_id, &ctx.db_name)
            .map_err(|e| Outcome::Applied {
                state: self.machine.state(),
                message: Some(format!("request list failed: {e}")),
            })
    }

    fn check_request_target(&self, request_id: &str) -> Result<(), PreconditionError> {
        self.check_idle_slot()?;
        let ctx = self.guard.context();
        if ctx.target_id.is_empty() || ctx.db_name.is_empty() {
            return Err(PreconditionError::DatabaseNotSelected);
        }
        if request_id.trim().is_empty() {
            return Err(PreconditionError::EmptyRequestId);
        }
        Ok(())
    }

    /// Approve another branch's request. Independent of the draft.
    pub fn begin_approve(
        &mut self,
        request_id: &str,
        merge_message: Option<&str>,
    ) -> Result<Ticket<ApproveRequest>, Outcome> {
        self.check_request_target(request_id)?;
        let ctx = self.guard.context().clone();
        let request = ApproveRequest {
            target_id: ctx.target_id,
            db_name: ctx.db_name,
            request_id: request_id.to_string(),
            merge_message_ja: merge_message
                .filter(|m| !m.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| default_merge_message(request_id)),
        };
        Ok(self.issue(Operation::Approve, request))
    }

    /// A returned `next_branch` becomes the working branch.
    pub fn complete_approve(
        &mut self,
        ticket: Ticket<ApproveRequest>,
        result: Result<rowstage_core::ApproveResponse, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "approve result") {
            return Outcome::Discarded;
        }
        match result {
            Ok(resp) => {
                let id = &ticket.request.request_id;
                tracing::info!("approved {id} → {}", resp.hash);
                self.clear_submitted(id);
                match resp.next_branch() {
                    Some(next) => {
                        let next = next.to_string();
                        self.set_branch(&next);
                        self.applied(Some(format!("approved {id}; now on {next}")))
                    }
                    None => self.applied(Some(format!("approved {id} ({})", resp.hash))),
                }
            }
            Err(e) => self.fail(format!("approve failed: {e}")),
        }
    }

    pub fn approve(
        &mut self,
        remote: &dyn Remote,
        request_id: &str,
        merge_message: Option<&str>,
    ) -> Outcome {
        let ticket = match self.begin_approve(request_id, merge_message) {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.approve_request(ticket.request());
        self.complete_approve(ticket, result)
    }

    pub fn begin_reject(&mut self, request_id: &str) -> Result<Ticket<RejectRequest>, Outcome> {
        self.check_request_target(request_id)?;
        let ctx = self.guard.context().clone();
        let request = RejectRequest {
            target_id: ctx.target_id,
            db_name: ctx.db_name,
            request_id: request_id.to_string(),
        };
        Ok(self.issue(Operation::Reject, request))
    }

    pub fn complete_reject(
        &mut self,
        ticket: Ticket<RejectRequest>,
        result: Result<RejectResponse, ApiError>,
    ) -> Outcome {
        if !self.admit(&ticket, "reject result") {
            return Outcome::Discarded;
        }
        match result {
            Ok(resp) => {
                let id = &ticket.request.request_id;
                tracing::info!("rejected {id} ({})", resp.status);
                self.clear_submitted(id);
                self.applied(Some(format!("rejected {id}")))
            }
            Err(e) => self.fail(format!("reject failed: {e}")),
        }
    }

    pub fn reject(&mut self, remote: &dyn Remote, request_id: &str) -> Outcome {
        let ticket = match self.begin_reject(request_id) {
            Ok(t) => t,
            Err(o) => return o,
        };
        let result = remote.reject_request(ticket.request());
        self.complete_reject(ticket, result)
    }

    fn clear_submitted(&mut self, request_id: &str) {
        if self
            .submitted
            .as_ref()
            .is_some_and(|s| s.request_id == request_id)
        {
            self.submitted = None;
            self.machine.set_request_pending(false);
        }
    }
}
