pub mod context;
pub mod error;
pub mod op;
pub mod wire;

pub use context::WorkContext;
pub use error::{ApiError, ErrorKind};
pub use op::{CommitOp, OpError, OpKind, Row};
pub use wire::*;
