//! Session and pending-continuation records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::model::ReplyType;

/// Variable that always holds the most recent accepted reply.
pub const LAST_REPLY: &str = "last_reply";

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Abandoned,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "abandoned" => Ok(Self::Abandoned),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// One execution of a pinned flow version for one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub conversation_id: String,
    pub flow_id: Uuid,
    pub flow_version: i64,
    /// Node the session is parked on. `None` once the session has ended.
    pub current_node: Option<String>,
    /// Opaque token embedded in outbound forms and echoed back in form replies.
    pub token: String,
    pub status: SessionStatus,
    pub variables: BTreeMap<String, String>,
    /// Consecutive failed send rounds on the current node.
    pub dispatch_failures: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(conversation_id: &str, flow_id: Uuid, flow_version: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            flow_id,
            flow_version,
            current_node: None,
            token: Uuid::new_v4().simple().to_string(),
            status: SessionStatus::Active,
            variables: BTreeMap::new(),
            dispatch_failures: 0,
            last_error: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.variables.insert(name.to_string(), value.to_string());
    }

    /// Move to a terminal status, clearing the execution pointer.
    pub fn finish(&mut self, status: SessionStatus, error: Option<String>, now: DateTime<Utc>) {
        self.status = status;
        self.current_node = None;
        if error.is_some() {
            self.last_error = error;
        }
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Why a continuation was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuationKind {
    /// A `waitForReply` node awaiting input.
    Wait,
    /// A `delay` node sleeping until its deadline.
    Delay,
    /// A `sendMessage` node whose send failed.
    DispatchRetry,
}

impl fmt::Display for ContinuationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Wait => "wait",
            Self::Delay => "delay",
            Self::DispatchRetry => "dispatch_retry",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ContinuationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "delay" => Ok(Self::Delay),
            "dispatch_retry" => Ok(Self::DispatchRetry),
            other => Err(format!("unknown continuation kind: {other}")),
        }
    }
}

/// A parked session waiting for input or a timer. At most one per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingContinuation {
    pub id: Uuid,
    pub session_id: Uuid,
    pub conversation_id: String,
    pub node_id: String,
    pub kind: ContinuationKind,
    /// `None` for waits without a timeout.
    pub deadline: Option<DateTime<Utc>>,
    pub reply_type: Option<ReplyType>,
    pub created_at: DateTime<Utc>,
}

impl PendingContinuation {
    pub fn new(
        session: &Session,
        node_id: &str,
        kind: ContinuationKind,
        deadline: Option<DateTime<Utc>>,
        reply_type: Option<ReplyType>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            conversation_id: session.conversation_id.clone(),
            node_id: node_id.to_string(),
            kind,
            deadline,
            reply_type,
            created_at: Utc::now(),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}
