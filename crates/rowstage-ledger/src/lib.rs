pub mod ledger;
pub mod meta;
pub mod paths;
pub mod snapshot;

pub use ledger::{DraftLedger, LedgerError};
pub use meta::{list_sessions, SessionMeta};
pub use paths::SessionPaths;
pub use snapshot::{FileSnapshot, MemorySnapshot, SnapshotStore};
