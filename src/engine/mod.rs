//! Flow engine: intake, per-conversation serialization and session routing.
//!
//! Every inbound event (provider message or synthetic timeout) goes through
//! [`Engine::record`] for deduplication and then [`Engine::process`], which
//! holds the conversation lock while the interpreter runs.

pub mod condition;
pub mod interpreter;
pub mod render;
pub mod sweep;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatch::MessageDispatcher;
use crate::error::{Error, FlowError, TransitionError};
use crate::flow::FlowStore;
use crate::flow::model::{FlowSnapshot, NodeKind};
use crate::inbound::{
    EventOutcome, FormTokenCheck, InboundEvent, InboundEventRecord, IntakeOutcome,
    check_form_token,
};
use crate::session::model::SessionStatus;
use crate::session::{Session, SessionManager};
use crate::store::Database;

use self::interpreter::{Handled, Interpreter};

pub use interpreter::reply_is_valid;
pub use sweep::{SweepReport, spawn_sweeper};

/// How a processed event is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Disposition {
    outcome: EventOutcome,
    error: Option<String>,
    unmapped: Vec<String>,
}

impl Disposition {
    fn processed() -> Self {
        Self {
            outcome: EventOutcome::Processed,
            error: None,
            unmapped: Vec::new(),
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            outcome: EventOutcome::Rejected,
            error: Some(reason),
            unmapped: Vec::new(),
        }
    }
}

pub struct Engine {
    db: Arc<dyn Database>,
    flows: FlowStore,
    sessions: SessionManager,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        db: Arc<dyn Database>,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            flows: FlowStore::new(Arc::clone(&db)),
            sessions: SessionManager::new(Arc::clone(&db)),
            db,
            dispatcher,
            config,
        }
    }

    pub fn flows(&self) -> &FlowStore {
        &self.flows
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn interpreter<'a>(
        &'a self,
        snapshot: &'a FlowSnapshot,
        now: DateTime<Utc>,
    ) -> Interpreter<'a> {
        Interpreter {
            sessions: &self.sessions,
            dispatcher: self.dispatcher.as_ref(),
            config: &self.config,
            snapshot,
            now,
        }
    }

    // ── Intake ──────────────────────────────────────────────────────

    /// Durably record an event. Duplicates (same conversation and provider
    /// message id) are reported and must not be processed again.
    pub async fn record(&self, event: &InboundEvent) -> Result<IntakeOutcome, Error> {
        let record = InboundEventRecord::pending(event.clone());
        if self.db.record_inbound_event(&record).await? {
            debug!(
                conversation_id = %event.conversation_id,
                message_id = %event.provider_message_id,
                kind = %event.kind(),
                "Inbound event recorded"
            );
            Ok(IntakeOutcome::Accepted)
        } else {
            debug!(
                conversation_id = %event.conversation_id,
                message_id = %event.provider_message_id,
                "Duplicate inbound event dropped"
            );
            Ok(IntakeOutcome::Duplicate)
        }
    }

    /// Record and, when new, process an event inline.
    pub async fn ingest(&self, event: InboundEvent) -> Result<IntakeOutcome, Error> {
        self.ingest_at(event, Utc::now()).await
    }

    pub(crate) async fn ingest_at(
        &self,
        event: InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<IntakeOutcome, Error> {
        let outcome = self.record(&event).await?;
        if outcome == IntakeOutcome::Accepted {
            self.process_at(&event, now).await?;
        }
        Ok(outcome)
    }

    /// Process a recorded event under its conversation lock.
    ///
    /// Records that are no longer pending are skipped, so a sweep replay
    /// racing the original handler is harmless.
    pub async fn process(&self, event: &InboundEvent) -> Result<(), Error> {
        self.process_at(event, Utc::now()).await
    }

    pub(crate) async fn process_at(
        &self,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let _guard = self.sessions.lock(&event.conversation_id).await;

        if let Some(record) = self
            .db
            .get_inbound_event(&event.conversation_id, &event.provider_message_id)
            .await?
            && record.outcome != EventOutcome::Pending
        {
            debug!(
                conversation_id = %event.conversation_id,
                message_id = %event.provider_message_id,
                outcome = %record.outcome,
                "Event already handled"
            );
            return Ok(());
        }

        match self.handle(event, now).await {
            Ok(disposition) => {
                self.db
                    .finish_inbound_event(
                        &event.conversation_id,
                        &event.provider_message_id,
                        disposition.outcome,
                        disposition.error.as_deref(),
                        &disposition.unmapped,
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(
                    conversation_id = %event.conversation_id,
                    message_id = %event.provider_message_id,
                    error = %e,
                    "Event handling failed"
                );
                self.db
                    .finish_inbound_event(
                        &event.conversation_id,
                        &event.provider_message_id,
                        EventOutcome::Failed,
                        Some(&e.to_string()),
                        &[],
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn handle(&self, event: &InboundEvent, now: DateTime<Utc>) -> Result<Disposition, Error> {
        let active = self.sessions.active(&event.conversation_id).await?;

        if let FormTokenCheck::Rejected(reason) = check_form_token(event, active.as_ref()) {
            warn!(
                conversation_id = %event.conversation_id,
                message_id = %event.provider_message_id,
                reason = %reason,
                "Form reply rejected"
            );
            return Ok(Disposition::rejected(reason));
        }

        if let Some(mut session) = active {
            return self.resume(&mut session, event, now).await;
        }

        if event.is_timeout() {
            debug!(
                conversation_id = %event.conversation_id,
                "Timeout for a finished session ignored"
            );
            return Ok(Disposition::processed());
        }

        let Some(text) = event.reply_text() else {
            return Ok(Disposition::processed());
        };
        match self.match_trigger(text).await? {
            Some((flow_id, version)) => {
                info!(
                    conversation_id = %event.conversation_id,
                    flow_id = %flow_id,
                    version,
                    "Keyword matched, starting flow"
                );
                self.begin(&event.conversation_id, flow_id, version, now).await?;
            }
            None => debug!(
                conversation_id = %event.conversation_id,
                "No session and no trigger match"
            ),
        }
        Ok(Disposition::processed())
    }

    async fn resume(
        &self,
        session: &mut Session,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<Disposition, Error> {
        let snapshot = match self
            .flows
            .get_flow(session.flow_id, Some(session.flow_version))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(Error::Flow(FlowError::VersionNotFound { .. })) => {
                let fault = TransitionError::MissingNode {
                    flow_id: session.flow_id,
                    version: session.flow_version,
                    node_id: session.current_node.clone().unwrap_or_default(),
                };
                error!(session_id = %session.id, error = %fault, "Pinned flow version is gone");
                session.finish(SessionStatus::Error, Some(fault.to_string()), now);
                self.sessions.save(session).await?;
                return Ok(Disposition::processed());
            }
            Err(e) => return Err(e),
        };

        let handled = self.interpreter(&snapshot, now).resume(session, event).await?;
        let mut disposition = Disposition::processed();
        if let Handled::Advanced { unmapped } = handled {
            disposition.unmapped = unmapped;
        }
        Ok(disposition)
    }

    /// First enabled, published flow (by flow id) whose trigger keyword matches.
    async fn match_trigger(&self, text: &str) -> Result<Option<(Uuid, i64)>, Error> {
        let candidates = self.flows.trigger_candidates().await?;
        Ok(candidates.into_iter().find_map(|candidate| {
            let trigger = candidate.graph.trigger()?;
            match &trigger.kind {
                NodeKind::Trigger(props) if props.matches(text) => {
                    Some((candidate.flow_id, candidate.version))
                }
                _ => None,
            }
        }))
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Start a session on the flow's current published version.
    pub async fn start_session(
        &self,
        flow_id: Uuid,
        conversation_id: &str,
    ) -> Result<Session, Error> {
        let _guard = self.sessions.lock(conversation_id).await;

        let flow = self.flows.get_draft(flow_id).await?;
        if !flow.enabled {
            return Err(FlowError::Disabled { id: flow_id }.into());
        }
        let version = flow
            .published_version
            .ok_or(FlowError::NotPublished { id: flow_id })?;

        self.begin(conversation_id, flow_id, version, Utc::now()).await
    }

    /// Caller holds the conversation lock.
    async fn begin(
        &self,
        conversation_id: &str,
        flow_id: Uuid,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<Session, Error> {
        let snapshot = self.flows.get_flow(flow_id, Some(version)).await?;
        let mut session = self.sessions.create(conversation_id, flow_id, version).await?;
        self.interpreter(&snapshot, now).start(&mut session).await?;
        Ok(session)
    }
}
