//! Timer sweep: fires expired continuations and replays stuck intake records.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::inbound::{EventOutcome, InboundEvent, IntakeOutcome};
use crate::session::model::SessionStatus;

use super::Engine;

/// Continuations and stale records handled per sweep.
const SWEEP_BATCH: usize = 256;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired continuations turned into timeout events.
    pub fired: usize,
    /// Pending intake records re-processed.
    pub replayed: usize,
    pub failed: usize,
}

impl Engine {
    pub async fn tick(&self) -> Result<SweepReport, Error> {
        self.tick_at(Utc::now()).await
    }

    /// Run one sweep as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<SweepReport, Error> {
        let mut report = SweepReport::default();

        for continuation in self.sessions.due(now, SWEEP_BATCH).await? {
            let event = InboundEvent::timeout(
                &continuation.conversation_id,
                continuation.id,
                continuation.session_id,
                &continuation.node_id,
            );
            match self.ingest_at(event.clone(), now).await {
                Ok(IntakeOutcome::Accepted) => report.fired += 1,
                Ok(IntakeOutcome::Duplicate) => {
                    self.settle_duplicate(&event, continuation.id, now).await?
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        continuation_id = %continuation.id,
                        session_id = %continuation.session_id,
                        error = %e,
                        "Timeout handling failed"
                    );
                }
            }
        }

        let cutoff = now
            - chrono::Duration::from_std(self.config.stale_event_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        for record in self.db.stale_inbound_events(cutoff, SWEEP_BATCH).await? {
            warn!(
                conversation_id = %record.event.conversation_id,
                message_id = %record.event.provider_message_id,
                received_at = %record.received_at,
                "Replaying stale inbound event"
            );
            match self.process_at(&record.event, now).await {
                Ok(()) => report.replayed += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        message_id = %record.event.provider_message_id,
                        error = %e,
                        "Replay failed"
                    );
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                fired = report.fired,
                replayed = report.replayed,
                failed = report.failed,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    /// A due continuation whose timeout event already reached a final outcome
    /// would otherwise be offered again on every sweep. When handling that
    /// timeout failed, the parked session can never move again, so it ends
    /// as `error`.
    async fn settle_duplicate(
        &self,
        event: &InboundEvent,
        continuation_id: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let record = self
            .db
            .get_inbound_event(&event.conversation_id, &event.provider_message_id)
            .await?;
        let Some(record) = record.filter(|r| r.outcome != EventOutcome::Pending) else {
            debug!(%continuation_id, "Timeout still pending, left for replay");
            return Ok(());
        };

        let _guard = self.sessions.lock(&event.conversation_id).await;
        let Some(continuation) = self.sessions.continuation(continuation_id).await? else {
            return Ok(());
        };

        if record.outcome == EventOutcome::Failed
            && let Some(mut session) = self.sessions.get(continuation.session_id).await?
            && session.is_active()
        {
            let reason = format!(
                "timeout on node {} could not be handled: {}",
                continuation.node_id,
                record.error.as_deref().unwrap_or("unknown error")
            );
            error!(
                %continuation_id,
                session_id = %session.id,
                error = %reason,
                "Ending session stranded by a failed timeout"
            );
            session.finish(SessionStatus::Error, Some(reason), now);
            return self.sessions.save(&mut session).await;
        }

        warn!(
            %continuation_id,
            session_id = %continuation.session_id,
            outcome = %record.outcome,
            "Dropping continuation whose timeout was already handled"
        );
        self.sessions.disarm(continuation.session_id).await
    }
}

/// Spawn the background sweep.
pub fn spawn_sweeper(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = engine.tick().await {
                error!(error = %e, "Sweep failed");
            }
        }
    })
}
