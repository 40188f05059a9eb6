//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::fields::FieldMapping;
use crate::flow::model::{Flow, FlowGraph, FlowVersion};
use crate::inbound::event::{EventOutcome, InboundEventRecord};
use crate::session::model::{PendingContinuation, Session};

/// Backend-agnostic database trait covering flows, sessions and intake.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Flows ───────────────────────────────────────────────────────

    async fn insert_flow(&self, flow: &Flow) -> Result<(), DatabaseError>;

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>, DatabaseError>;

    /// All flows, optionally restricted to one account, oldest first.
    async fn list_flows(&self, account_id: Option<&str>) -> Result<Vec<Flow>, DatabaseError>;

    /// Overwrite the working draft and edge counter.
    async fn update_flow_draft(
        &self,
        id: Uuid,
        draft: &FlowGraph,
        next_edge_seq: i64,
    ) -> Result<(), DatabaseError>;

    /// Returns `false` when no such flow exists.
    async fn set_flow_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError>;

    /// Highest published version number, or 0.
    async fn max_flow_version(&self, flow_id: Uuid) -> Result<i64, DatabaseError>;

    /// Persist a new version and its field mappings, then make it current.
    ///
    /// Mappings are written before the version becomes current, and the
    /// previously current version is marked deprecated. A failed attempt
    /// leaves no mappings behind, so it can be retried under the same number.
    async fn publish_flow_version(
        &self,
        version: &FlowVersion,
        mappings: &[FieldMapping],
    ) -> Result<(), DatabaseError>;

    async fn get_flow_version(
        &self,
        flow_id: Uuid,
        version: i64,
    ) -> Result<Option<FlowVersion>, DatabaseError>;

    async fn get_field_mappings(
        &self,
        flow_id: Uuid,
        version: i64,
    ) -> Result<Vec<FieldMapping>, DatabaseError>;

    /// Current versions of enabled, published flows, ordered by flow id.
    async fn list_trigger_candidates(&self) -> Result<Vec<FlowVersion>, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    /// Fails with `DatabaseError::Constraint` if the conversation already
    /// has an active session.
    async fn insert_session(&self, session: &Session) -> Result<(), DatabaseError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError>;

    async fn get_active_session(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Session>, DatabaseError>;

    /// Sessions of a conversation, newest first.
    async fn list_sessions(&self, conversation_id: &str) -> Result<Vec<Session>, DatabaseError>;

    async fn update_session(&self, session: &Session) -> Result<(), DatabaseError>;

    // ── Continuations ───────────────────────────────────────────────

    /// Arm a continuation, replacing any existing one for the same session.
    async fn upsert_continuation(
        &self,
        continuation: &PendingContinuation,
    ) -> Result<(), DatabaseError>;

    async fn get_continuation(
        &self,
        id: Uuid,
    ) -> Result<Option<PendingContinuation>, DatabaseError>;

    async fn get_session_continuation(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PendingContinuation>, DatabaseError>;

    async fn delete_session_continuations(&self, session_id: Uuid) -> Result<(), DatabaseError>;

    /// Continuations with a deadline at or before `now`, earliest first.
    async fn due_continuations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingContinuation>, DatabaseError>;

    // ── Inbound events ──────────────────────────────────────────────

    /// Insert a pending intake record. Returns `false` if the
    /// (conversation id, provider message id) pair was already recorded.
    async fn record_inbound_event(
        &self,
        record: &InboundEventRecord,
    ) -> Result<bool, DatabaseError>;

    async fn get_inbound_event(
        &self,
        conversation_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<InboundEventRecord>, DatabaseError>;

    async fn finish_inbound_event(
        &self,
        conversation_id: &str,
        provider_message_id: &str,
        outcome: EventOutcome,
        error: Option<&str>,
        unmapped: &[String],
    ) -> Result<(), DatabaseError>;

    /// Records still `pending` that were received before `before`.
    async fn stale_inbound_events(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEventRecord>, DatabaseError>;
}
