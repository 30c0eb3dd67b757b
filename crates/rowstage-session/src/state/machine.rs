use rowstage_core::{ConflictSummaryEntry, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── States ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    DraftEditing,
    Previewing,
    Committing,
    Syncing,
    MergeConflictsPresent,
    SchemaConflictDetected,
    ConstraintViolationDetected,
    StaleHeadDetected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::DraftEditing => "draft_editing",
            Self::Previewing => "previewing",
            Self::Committing => "committing",
            Self::Syncing => "syncing",
            Self::MergeConflictsPresent => "merge_conflicts_present",
            Self::SchemaConflictDetected => "schema_conflict_detected",
            Self::ConstraintViolationDetected => "constraint_violation_detected",
            Self::StaleHeadDetected => "stale_head_detected",
        }
    }

    /// A remote mutation is in flight; other mutating actions are disabled.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Previewing | Self::Committing | Self::Syncing)
    }

    /// New ops may be appended to the draft.
    pub fn allows_staging(&self) -> bool {
        matches!(self, Self::Idle | Self::DraftEditing)
    }

    /// A merge with the protected branch is stopped on conflicts.
    pub fn is_conflicted(&self) -> bool {
        matches!(
            self,
            Self::MergeConflictsPresent
                | Self::SchemaConflictDetected
                | Self::ConstraintViolationDetected
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Conflict verdicts ──

/// What a conflict summary says about the merge in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictVerdict {
    Clear,
    Data,
    Schema,
    Constraint,
}

impl ConflictVerdict {
    /// Schema conflicts outrank constraint violations, which outrank data
    /// conflicts.
    pub fn from_summary(entries: &[ConflictSummaryEntry]) -> Self {
        if entries.iter().any(|e| e.schema_conflicts > 0) {
            Self::Schema
        } else if entries.iter().any(|e| e.constraint_violations > 0) {
            Self::Constraint
        } else if entries.iter().any(|e| e.data_conflicts > 0) {
            Self::Data
        } else {
            Self::Clear
        }
    }

    fn state(self) -> SessionState {
        match self {
            Self::Clear => SessionState::Idle,
            Self::Data => SessionState::MergeConflictsPresent,
            Self::Schema => SessionState::SchemaConflictDetected,
            Self::Constraint => SessionState::ConstraintViolationDetected,
        }
    }
}

// ── Events ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    OpStaged,
    DraftEmptied,
    PreviewStarted,
    PreviewSettled { draft_empty: bool },
    CommitStarted,
    CommitSucceeded,
    CommitFailed(ErrorKind),
    SyncStarted,
    SyncSucceeded,
    SyncFailed(ErrorKind),
    SubmitFailed(ErrorKind),
    ResolveSettled(ConflictVerdict),
    ResolveFailed(ErrorKind),
    RecheckSettled(ConflictVerdict),
    HeadRefreshed { draft_empty: bool },
    ContextSwitched,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpStaged => "op_staged",
            Self::DraftEmptied => "draft_emptied",
            Self::PreviewStarted => "preview_started",
            Self::PreviewSettled { .. } => "preview_settled",
            Self::CommitStarted => "commit_started",
            Self::CommitSucceeded => "commit_succeeded",
            Self::CommitFailed(_) => "commit_failed",
            Self::SyncStarted => "sync_started",
            Self::SyncSucceeded => "sync_succeeded",
            Self::SyncFailed(_) => "sync_failed",
            Self::SubmitFailed(_) => "submit_failed",
            Self::ResolveSettled(_) => "resolve_settled",
            Self::ResolveFailed(_) => "resolve_failed",
            Self::RecheckSettled(_) => "recheck_settled",
            Self::HeadRefreshed { .. } => "head_refreshed",
            Self::ContextSwitched => "context_switched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event {event} is not legal in state {state}")]
    IllegalEvent {
        state: SessionState,
        event: &'static str,
    },

    #[error("invalid transition: {from} → {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

// ── Valid transitions ──

const VALID_TRANSITIONS: &[(SessionState, &[SessionState])] = {
    use SessionState::*;
    &[
        (
            Idle,
            &[
                Idle,
                DraftEditing,
                Previewing,
                Syncing,
                MergeConflictsPresent,
                SchemaConflictDetected,
                ConstraintViolationDetected,
                StaleHeadDetected,
            ],
        ),
        (DraftEditing, &[DraftEditing, Idle, Previewing, Committing]),
        (Previewing, &[Idle, DraftEditing]),
        (Committing, &[Idle, DraftEditing, StaleHeadDetected]),
        (
            Syncing,
            &[
                Idle,
                MergeConflictsPresent,
                SchemaConflictDetected,
                ConstraintViolationDetected,
                StaleHeadDetected,
            ],
        ),
        (
            MergeConflictsPresent,
            &[
                Idle,
                MergeConflictsPresent,
                SchemaConflictDetected,
                ConstraintViolationDetected,
                StaleHeadDetected,
            ],
        ),
        (
            SchemaConflictDetected,
            &[
                Idle,
                MergeConflictsPresent,
                SchemaConflictDetected,
                ConstraintViolationDetected,
            ],
        ),
        (
            ConstraintViolationDetected,
            &[
                Idle,
                MergeConflictsPresent,
                SchemaConflictDetected,
                ConstraintViolationDetected,
            ],
        ),
        (StaleHeadDetected, &[StaleHeadDetected, Idle, DraftEditing]),
    ]
};

fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

/// Sync and submit share one error mapping.
fn merge_failure_state(kind: ErrorKind) -> SessionState {
    match kind {
        ErrorKind::MergeConflictsPresent => SessionState::MergeConflictsPresent,
        ErrorKind::SchemaConflictsPresent => SessionState::SchemaConflictDetected,
        ErrorKind::ConstraintViolationsPresent => SessionState::ConstraintViolationDetected,
        ErrorKind::StaleHead => SessionState::StaleHeadDetected,
        _ => SessionState::Idle,
    }
}

fn baseline(draft_empty: bool) -> SessionState {
    if draft_empty {
        SessionState::Idle
    } else {
        SessionState::DraftEditing
    }
}

/// Pure transition function. Returns the next state or names the illegal
/// (state, event) pair.
pub fn transition(
    state: SessionState,
    event: &SessionEvent,
) -> Result<SessionState, TransitionError> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (state, event) {
        (_, E::ContextSwitched) => S::Idle,

        (S::Idle | S::DraftEditing, E::OpStaged) => S::DraftEditing,
        (S::DraftEditing, E::DraftEmptied) => S::Idle,
        (S::StaleHeadDetected, E::DraftEmptied) => S::StaleHeadDetected,

        (S::Idle | S::DraftEditing, E::PreviewStarted) => S::Previewing,
        (S::Previewing, E::PreviewSettled { draft_empty }) => baseline(*draft_empty),

        (S::DraftEditing, E::CommitStarted) => S::Committing,
        (S::Committing, E::CommitSucceeded) => S::Idle,
        (S::Committing, E::CommitFailed(ErrorKind::StaleHead)) => S::StaleHeadDetected,
        (S::Committing, E::CommitFailed(_)) => S::DraftEditing,

        (S::Idle, E::SyncStarted) => S::Syncing,
        (S::Syncing, E::SyncSucceeded) => S::Idle,
        (S::Syncing, E::SyncFailed(kind)) => merge_failure_state(*kind),
        (S::Idle, E::SubmitFailed(kind)) => merge_failure_state(*kind),

        (S::MergeConflictsPresent, E::ResolveSettled(verdict)) => verdict.state(),
        (S::MergeConflictsPresent, E::ResolveFailed(kind)) => match kind {
            ErrorKind::SchemaConflictsPresent => S::SchemaConflictDetected,
            ErrorKind::ConstraintViolationsPresent => S::ConstraintViolationDetected,
            ErrorKind::StaleHead => S::StaleHeadDetected,
            _ => S::MergeConflictsPresent,
        },
        (
            S::MergeConflictsPresent | S::SchemaConflictDetected | S::ConstraintViolationDetected,
            E::RecheckSettled(verdict),
        ) => verdict.state(),

        (S::StaleHeadDetected, E::HeadRefreshed { draft_empty }) => baseline(*draft_empty),

        _ => {
            return Err(TransitionError::IllegalEvent {
                state,
                event: event.name(),
            })
        }
    };
    if !is_valid_transition(state, next) {
        return Err(TransitionError::InvalidTransition {
            from: state,
            to: next,
        });
    }
    Ok(next)
}

// ── Machine ──

/// Current state plus the flags that ride alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMachine {
    state: SessionState,
    request_pending: bool,
    last_error: Option<String>,
    version: u64,
}

impl SessionMachine {
    /// Initial state for a session whose draft may already hold ops.
    pub fn resume(draft_empty: bool) -> Self {
        Self {
            state: baseline(draft_empty),
            request_pending: false,
            last_error: None,
            version: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn request_pending(&self) -> bool {
        self.request_pending
    }

    pub fn set_request_pending(&mut self, pending: bool) {
        self.request_pending = pending;
    }

    /// Bumped on every accepted event.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply `event`. Clears `last_error`; callers set any message after.
    pub fn fire(&mut self, event: SessionEvent) -> Result<SessionState, TransitionError> {
        let next = transition(self.state, &event)?;
        if next != self.state {
            tracing::debug!("session {} → {} on {}", self.state, next, event.name());
        }
        self.state = next;
        self.last_error = None;
        self.version += 1;
        Ok(next)
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent as E;
    use SessionState as S;

    fn entry(schema: u32, data: u32, constraint: u32) -> ConflictSummaryEntry {
        ConflictSummaryEntry {
            table: "t".into(),
            schema_conflicts: schema,
            data_conflicts: data,
            constraint_violations: constraint,
        }
    }

    #[test]
    fn first_op_enters_draft_editing() {
        assert_eq!(transition(S::Idle, &E::OpStaged), Ok(S::DraftEditing));
        assert_eq!(transition(S::DraftEditing, &E::DraftEmptied), Ok(S::Idle));
    }

    #[test]
    fn preview_returns_to_baseline() {
        assert_eq!(transition(S::DraftEditing, &E::PreviewStarted), Ok(S::Previewing));
        assert_eq!(
            transition(S::Previewing, &E::PreviewSettled { draft_empty: false }),
            Ok(S::DraftEditing)
        );
        assert_eq!(
            transition(S::Previewing, &E::PreviewSettled { draft_empty: true }),
            Ok(S::Idle)
        );
    }

    #[test]
    fn commit_failures_split_on_stale_head() {
        assert_eq!(
            transition(S::Committing, &E::CommitFailed(ErrorKind::StaleHead)),
            Ok(S::StaleHeadDetected)
        );
        assert_eq!(
            transition(S::Committing, &E::CommitFailed(ErrorKind::Internal)),
            Ok(S::DraftEditing)
        );
        assert_eq!(transition(S::Committing, &E::CommitSucceeded), Ok(S::Idle));
    }

    #[test]
    fn sync_error_mapping() {
        let cases = [
            (ErrorKind::MergeConflictsPresent, S::MergeConflictsPresent),
            (ErrorKind::SchemaConflictsPresent, S::SchemaConflictDetected),
            (ErrorKind::ConstraintViolationsPresent, S::ConstraintViolationDetected),
            (ErrorKind::StaleHead, S::StaleHeadDetected),
            (ErrorKind::Transport, S::Idle),
            (ErrorKind::Unknown, S::Idle),
        ];
        for (kind, expected) in cases {
            assert_eq!(transition(S::Syncing, &E::SyncFailed(kind)), Ok(expected));
            assert_eq!(transition(S::Idle, &E::SubmitFailed(kind)), Ok(expected));
        }
    }

    #[test]
    fn sync_requires_idle() {
        let err = transition(S::DraftEditing, &E::SyncStarted).unwrap_err();
        assert_eq!(
            err,
            TransitionError::IllegalEvent {
                state: S::DraftEditing,
                event: "sync_started"
            }
        );
        assert!(err.to_string().contains("draft_editing"));
    }

    #[test]
    fn resolve_error_escalates_or_stays() {
        assert_eq!(
            transition(
                S::MergeConflictsPresent,
                &E::ResolveFailed(ErrorKind::SchemaConflictsPresent)
            ),
            Ok(S::SchemaConflictDetected)
        );
        assert_eq!(
            transition(S::MergeConflictsPresent, &E::ResolveFailed(ErrorKind::Internal)),
            Ok(S::MergeConflictsPresent)
        );
    }

    #[test]
    fn escalated_states_leave_only_through_recheck() {
        assert!(transition(S::SchemaConflictDetected, &E::ResolveSettled(ConflictVerdict::Clear)).is_err());
        assert!(transition(S::SchemaConflictDetected, &E::SyncStarted).is_err());
        assert_eq!(
            transition(
                S::SchemaConflictDetected,
                &E::RecheckSettled(ConflictVerdict::Clear)
            ),
            Ok(S::Idle)
        );
        assert_eq!(
            transition(
                S::ConstraintViolationDetected,
                &E::RecheckSettled(ConflictVerdict::Data)
            ),
            Ok(S::MergeConflictsPresent)
        );
    }

    #[test]
    fn stale_head_refresh_picks_baseline() {
        assert_eq!(
            transition(S::StaleHeadDetected, &E::HeadRefreshed { draft_empty: false }),
            Ok(S::DraftEditing)
        );
        assert_eq!(
            transition(S::StaleHeadDetected, &E::HeadRefreshed { draft_empty: true }),
            Ok(S::Idle)
        );
        assert!(transition(S::Idle, &E::HeadRefreshed { draft_empty: true }).is_err());
    }

    #[test]
    fn context_switch_resets_everywhere() {
        for s in [
            S::Idle,
            S::DraftEditing,
            S::Previewing,
            S::Committing,
            S::Syncing,
            S::MergeConflictsPresent,
            S::SchemaConflictDetected,
            S::ConstraintViolationDetected,
            S::StaleHeadDetected,
        ] {
            assert_eq!(transition(s, &E::ContextSwitched), Ok(S::Idle));
        }
    }

    #[test]
    fn transient_states_reject_new_work() {
        for s in [S::Previewing, S::Committing, S::Syncing] {
            assert!(s.is_transient());
            assert!(transition(s, &E::OpStaged).is_err());
            assert!(transition(s, &E::CommitStarted).is_err());
            assert!(transition(s, &E::PreviewStarted).is_err());
        }
    }

    #[test]
    fn verdict_precedence() {
        assert_eq!(ConflictVerdict::from_summary(&[]), ConflictVerdict::Clear);
        assert_eq!(
            ConflictVerdict::from_summary(&[entry(0, 3, 0)]),
            ConflictVerdict::Data
        );
        assert_eq!(
            ConflictVerdict::from_summary(&[entry(0, 3, 1)]),
            ConflictVerdict::Constraint
        );
        assert_eq!(
            ConflictVerdict::from_summary(&[entry(0, 0, 1), entry(1, 0, 0)]),
            ConflictVerdict::Schema
        );
    }

    #[test]
    fn fire_clears_error_and_bumps_version() {
        let mut m = SessionMachine::resume(true);
        m.set_error("boom");
        assert_eq!(m.fire(E::OpStaged), Ok(S::DraftEditing));
        assert_eq!(m.last_error(), None);
        assert_eq!(m.version(), 1);
    }

    #[test]
    fn illegal_fire_keeps_state_and_error() {
        let mut m = SessionMachine::resume(false);
        m.set_error("still here");
        assert!(m.fire(E::SyncStarted).is_err());
        assert_eq!(m.state(), S::DraftEditing);
        assert_eq!(m.last_error(), Some("still here"));
        assert_eq!(m.version(), 0);
    }
}
