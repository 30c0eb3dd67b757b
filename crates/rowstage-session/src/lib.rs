pub mod orchestrator;
pub mod preview;
pub mod state;

pub use orchestrator::{Operation, Outcome, PreconditionError, Resolved, Session, Ticket};
pub use preview::{PreviewStager, PreviewTemplate, PreviewValidationError, StagedPreview};
pub use state::guard::{ContextGuard, ContextToken};
pub use state::machine::{
    transition, ConflictVerdict, SessionEvent, SessionMachine, SessionState, TransitionError,
};
