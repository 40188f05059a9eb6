//! Per-conversation execution state.

pub mod manager;
pub mod model;

pub use manager::{ConversationLocks, SessionManager};
pub use model::{ContinuationKind, PendingContinuation, Session, SessionStatus};
