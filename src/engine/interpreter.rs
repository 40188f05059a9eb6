//! Flow Interpreter: drives one session through its pinned flow version.
//!
//! `sendMessage`, `trigger` and `condition` nodes execute immediately and
//! chain; `waitForReply`, `delay` and failed sends park the session behind a
//! pending continuation and return.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::dispatch::{MessageDispatcher, RenderedMessage};
use crate::error::{DispatchError, Error, TransitionError};
use crate::fields::FieldMapper;
use crate::flow::model::{
    FALSE_BRANCH, FlowSnapshot, MAX_SCHEDULE_SECS, Node, NodeKind, ReplyType, TIMEOUT_BRANCH,
    TRUE_BRANCH, WaitForReplyProps,
};
use crate::inbound::event::{EventPayload, InboundEvent};
use crate::session::SessionManager;
use crate::session::model::{ContinuationKind, LAST_REPLY, Session, SessionStatus};

use super::{condition, render};

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Parked,
    Ended(SessionStatus),
}

/// What an inbound event did to an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// The session moved past its parked node.
    Advanced { unmapped: Vec<String> },
    /// The reply failed validation; the prompt was re-sent and the wait re-armed.
    Reprompted,
    /// The session was parked on a failed send; the send was retried.
    Resent,
    /// Not applicable to the session's current state.
    Ignored,
}

/// Whether a reply satisfies a `waitForReply` type constraint.
pub fn reply_is_valid(reply_type: ReplyType, text: &str) -> bool {
    let text = text.trim();
    match reply_type {
        ReplyType::Text => !text.is_empty(),
        ReplyType::Number => text.parse::<f64>().is_ok_and(f64::is_finite),
        ReplyType::Email => EMAIL.is_match(text),
    }
}

pub(crate) struct Interpreter<'a> {
    pub sessions: &'a SessionManager,
    pub dispatcher: &'a dyn MessageDispatcher,
    pub config: &'a EngineConfig,
    pub snapshot: &'a FlowSnapshot,
    pub now: DateTime<Utc>,
}

impl Interpreter<'_> {
    fn mapper(&self) -> FieldMapper<'_> {
        FieldMapper::new(&self.snapshot.mappings)
    }

    fn after(&self, node_id: &str, secs: u64) -> Result<DateTime<Utc>, TransitionError> {
        Some(secs)
            .filter(|s| *s <= MAX_SCHEDULE_SECS)
            .and_then(|s| i64::try_from(s).ok())
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| self.now.checked_add_signed(d))
            .ok_or_else(|| TransitionError::DeadlineOutOfRange {
                node_id: node_id.to_string(),
                secs,
            })
    }

    fn missing_node(&self, node_id: &str) -> TransitionError {
        TransitionError::MissingNode {
            flow_id: self.snapshot.flow_id,
            version: self.snapshot.version,
            node_id: node_id.to_string(),
        }
    }

    /// Enter a freshly created session at its trigger node.
    pub async fn start(&self, session: &mut Session) -> Result<(), Error> {
        match self.snapshot.graph.trigger() {
            Some(trigger) => {
                let trigger_id = trigger.id.clone();
                self.run(session, &trigger_id).await
            }
            None => {
                self.fail(session, &self.missing_node("trigger"));
                self.sessions.save(session).await
            }
        }
    }

    /// Apply an inbound event to an active session parked on a node.
    pub async fn resume(
        &self,
        session: &mut Session,
        event: &InboundEvent,
    ) -> Result<Handled, Error> {
        let Some(node_id) = session.current_node.clone() else {
            return Ok(Handled::Ignored);
        };
        let Some(node) = self.snapshot.graph.node(&node_id) else {
            self.fail(session, &self.missing_node(&node_id));
            self.sessions.save(session).await?;
            return Ok(Handled::Ignored);
        };

        if let EventPayload::Timeout {
            continuation_id, ..
        } = &event.payload
        {
            return self.expire(session, node, *continuation_id).await;
        }

        match &node.kind {
            NodeKind::WaitForReply(props) => {
                self.accept_reply(session, node, props, event).await
            }
            NodeKind::SendMessage(_) => {
                info!(
                    session_id = %session.id,
                    node_id = %node.id,
                    "Inbound message while parked on failed send, re-sending"
                );
                self.run(session, &node_id).await?;
                Ok(Handled::Resent)
            }
            _ => {
                debug!(
                    session_id = %session.id,
                    node_id = %node.id,
                    node_type = node.type_tag(),
                    "Ignoring inbound message while parked"
                );
                Ok(Handled::Ignored)
            }
        }
    }

    /// Handle a synthetic timeout for the continuation armed on `node`.
    async fn expire(
        &self,
        session: &mut Session,
        node: &Node,
        continuation_id: uuid::Uuid,
    ) -> Result<Handled, Error> {
        let continuation = match self.sessions.continuation(continuation_id).await? {
            Some(c) if c.session_id == session.id && c.node_id == node.id => c,
            _ => {
                debug!(session_id = %session.id, %continuation_id, "Stale timeout ignored");
                return Ok(Handled::Ignored);
            }
        };
        self.sessions.disarm(session.id).await?;
        let graph = &self.snapshot.graph;

        match continuation.kind {
            ContinuationKind::Wait => match graph.branch(&node.id, TIMEOUT_BRANCH) {
                Some(edge) => {
                    info!(
                        session_id = %session.id,
                        node_id = %node.id,
                        "Wait expired, following timeout edge"
                    );
                    let target = edge.target.clone();
                    self.run(session, &target).await?;
                }
                None => {
                    info!(
                        session_id = %session.id,
                        node_id = %node.id,
                        "Wait expired, session abandoned"
                    );
                    self.end(session, SessionStatus::Abandoned).await?;
                }
            },
            ContinuationKind::Delay => match graph.next_edge(&node.id, None) {
                Some(edge) => {
                    let target = edge.target.clone();
                    self.run(session, &target).await?;
                }
                None => self.end(session, SessionStatus::Completed).await?,
            },
            ContinuationKind::DispatchRetry => {
                let node_id = node.id.clone();
                self.run(session, &node_id).await?;
            }
        }
        Ok(Handled::Advanced {
            unmapped: Vec::new(),
        })
    }

    async fn accept_reply(
        &self,
        session: &mut Session,
        node: &Node,
        props: &WaitForReplyProps,
        event: &InboundEvent,
    ) -> Result<Handled, Error> {
        let mut unmapped = Vec::new();

        let reply = match &event.payload {
            EventPayload::FormReply { fields, .. } => {
                let translated = self.mapper().translate(fields);
                if !translated.unmapped.is_empty() {
                    warn!(
                        session_id = %session.id,
                        flow_id = %self.snapshot.flow_id,
                        version = self.snapshot.version,
                        unmapped = ?translated.unmapped,
                        "Form reply carried unmapped fields"
                    );
                }
                for (label, value) in &translated.values {
                    session.set_variable(label, value);
                }
                unmapped = translated.unmapped;
                serde_json::to_string(&translated.values).unwrap_or_default()
            }
            _ => {
                let text = event.reply_text().unwrap_or_default().trim();
                if let Some(reply_type) = props.reply_type
                    && !reply_is_valid(reply_type, text)
                {
                    return self.reprompt(session, node, props, reply_type).await;
                }
                text.to_string()
            }
        };

        session.set_variable(LAST_REPLY, &reply);
        if let Some(variable) = &props.variable {
            session.set_variable(variable, &reply);
        }
        self.sessions.disarm(session.id).await?;

        match self.snapshot.graph.next_edge(&node.id, event.discriminator()) {
            Some(edge) => {
                let target = edge.target.clone();
                self.run(session, &target).await?;
            }
            None => self.end(session, SessionStatus::Completed).await?,
        }
        Ok(Handled::Advanced { unmapped })
    }

    async fn reprompt(
        &self,
        session: &mut Session,
        node: &Node,
        props: &WaitForReplyProps,
        reply_type: ReplyType,
    ) -> Result<Handled, Error> {
        debug!(
            session_id = %session.id,
            node_id = %node.id,
            %reply_type,
            "Reply failed validation"
        );
        if let Some(prompt) = &node.content {
            let message = RenderedMessage::Text {
                body: render::substitute(prompt, session),
            };
            if let Err(e) = self.dispatcher.send(&session.conversation_id, &message).await {
                warn!(session_id = %session.id, error = %e, "Re-prompt send failed");
            }
        }
        let deadline = match props.timeout_secs.map(|s| self.after(&node.id, s)).transpose() {
            Ok(deadline) => deadline,
            Err(e) => {
                self.fail(session, &e);
                self.sessions.save(session).await?;
                return Ok(Handled::Ignored);
            }
        };
        self.sessions
            .arm(session, &node.id, ContinuationKind::Wait, deadline, Some(reply_type))
            .await?;
        self.sessions.save(session).await?;
        Ok(Handled::Reprompted)
    }

    /// Walk from `from` until the session parks or ends, then persist it.
    async fn run(&self, session: &mut Session, from: &str) -> Result<(), Error> {
        match self.walk(session, from).await {
            Ok(Stop::Parked) => {}
            Ok(Stop::Ended(status)) => {
                session.finish(status, None, self.now);
                info!(session_id = %session.id, %status, "Session ended");
            }
            Err(Error::Transition(e)) => self.fail(session, &e),
            Err(e) => return Err(e),
        }
        self.sessions.save(session).await
    }

    async fn walk(&self, session: &mut Session, from: &str) -> Result<Stop, Error> {
        let graph = &self.snapshot.graph;
        let mut node_id = from.to_string();

        for _ in 0..self.config.max_steps_per_event {
            let node = graph
                .node(&node_id)
                .ok_or_else(|| self.missing_node(&node_id))?;
            session.current_node = Some(node.id.clone());
            debug!(
                session_id = %session.id,
                node_id = %node.id,
                node_type = node.type_tag(),
                "Entering node"
            );

            let next = match &node.kind {
                NodeKind::Trigger(_) => graph
                    .next_edge(&node.id, None)
                    .ok_or_else(|| TransitionError::DeadTrigger {
                        node_id: node.id.clone(),
                    })?,
                NodeKind::SendMessage(props) => {
                    let message =
                        render::render(&node.id, &props.message, session, self.mapper());
                    match self.dispatcher.send(&session.conversation_id, &message).await {
                        Ok(delivery_id) => {
                            debug!(
                                session_id = %session.id,
                                node_id = %node.id,
                                %delivery_id,
                                "Message sent"
                            );
                            session.dispatch_failures = 0;
                            match graph.next_edge(&node.id, None) {
                                Some(edge) => edge,
                                None => return Ok(Stop::Ended(SessionStatus::Completed)),
                            }
                        }
                        Err(e) => return self.dispatch_failed(session, node, e).await,
                    }
                }
                NodeKind::WaitForReply(props) => {
                    let deadline = props
                        .timeout_secs
                        .map(|s| self.after(&node.id, s))
                        .transpose()?;
                    self.sessions
                        .arm(session, &node.id, ContinuationKind::Wait, deadline, props.reply_type)
                        .await?;
                    return Ok(Stop::Parked);
                }
                NodeKind::Condition(props) => {
                    let branch = if condition::check(props, session, self.mapper()) {
                        TRUE_BRANCH
                    } else {
                        FALSE_BRANCH
                    };
                    debug!(
                        session_id = %session.id,
                        node_id = %node.id,
                        branch,
                        "Condition evaluated"
                    );
                    graph
                        .branch(&node.id, branch)
                        .ok_or_else(|| TransitionError::MissingBranch {
                            node_id: node.id.clone(),
                            branch: branch.to_string(),
                        })?
                }
                NodeKind::Delay(props) => {
                    let deadline = self.after(&node.id, props.duration_secs)?;
                    self.sessions
                        .arm(session, &node.id, ContinuationKind::Delay, Some(deadline), None)
                        .await?;
                    return Ok(Stop::Parked);
                }
            };
            node_id = next.target.clone();
        }

        Err(TransitionError::StepLimit {
            limit: self.config.max_steps_per_event,
        }
        .into())
    }

    async fn dispatch_failed(
        &self,
        session: &mut Session,
        node: &Node,
        err: DispatchError,
    ) -> Result<Stop, Error> {
        session.dispatch_failures += 1;
        session.last_error = Some(format!("send on node {} failed: {err}", node.id));
        error!(
            session_id = %session.id,
            node_id = %node.id,
            rounds = session.dispatch_failures,
            error = %err,
            "Dispatch failed"
        );

        if session.dispatch_failures >= self.config.max_dispatch_rounds {
            return Ok(Stop::Ended(SessionStatus::Error));
        }

        let mut wait = self.config.dispatch_retry_after;
        if let DispatchError::RateLimited {
            retry_after: Some(after),
        } = err
        {
            wait = wait.max(after);
        }
        let deadline = self.after(&node.id, wait.as_secs())?;
        self.sessions
            .arm(session, &node.id, ContinuationKind::DispatchRetry, Some(deadline), None)
            .await?;
        Ok(Stop::Parked)
    }

    fn fail(&self, session: &mut Session, err: &TransitionError) {
        error!(
            session_id = %session.id,
            flow_id = %self.snapshot.flow_id,
            version = self.snapshot.version,
            error = %err,
            "Structural fault, session failed"
        );
        session.finish(SessionStatus::Error, Some(err.to_string()), self.now);
    }

    async fn end(&self, session: &mut Session, status: SessionStatus) -> Result<(), Error> {
        session.finish(status, None, self.now);
        info!(session_id = %session.id, %status, "Session ended");
        self.sessions.save(session).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::dispatch::LogDispatcher;
    use crate::flow::model::{DelayProps, Edge, FlowGraph, TriggerProps};
    use crate::store::{Database, LibSqlBackend};

    /// Start a session on a graph that never went through publish checks.
    async fn start_unchecked(far: Node) -> Session {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let sessions = SessionManager::new(Arc::clone(&db));
        let config = EngineConfig::default();
        let snapshot = FlowSnapshot {
            flow_id: Uuid::new_v4(),
            version: 1,
            graph: FlowGraph {
                nodes: vec![
                    Node::new("start", NodeKind::Trigger(TriggerProps::default())),
                    far,
                ],
                edges: vec![Edge {
                    source: "start".into(),
                    target: "far".into(),
                    discriminator: None,
                    sequence: 1,
                }],
            },
            mappings: Vec::new(),
        };
        let mut session = sessions.create("whatsapp:1", snapshot.flow_id, 1).await.unwrap();
        let interpreter = Interpreter {
            sessions: &sessions,
            dispatcher: &LogDispatcher,
            config: &config,
            snapshot: &snapshot,
            now: Utc::now(),
        };
        interpreter.start(&mut session).await.unwrap();
        assert!(sessions.current_continuation(session.id).await.unwrap().is_none());
        session
    }

    #[tokio::test]
    async fn out_of_range_schedules_fail_the_session() {
        let wait = Node::new(
            "far",
            NodeKind::WaitForReply(WaitForReplyProps {
                timeout_secs: Some(u64::MAX),
                ..Default::default()
            }),
        );
        let session = start_unchecked(wait).await;
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.last_error.unwrap().contains("beyond the supported range"));

        let delay = Node::new(
            "far",
            NodeKind::Delay(DelayProps {
                duration_secs: 400_000_000_000,
            }),
        );
        let session = start_unchecked(delay).await;
        assert_eq!(session.status, SessionStatus::Error);
    }

    #[test]
    fn reply_validation() {
        assert!(reply_is_valid(ReplyType::Text, " hi "));
        assert!(!reply_is_valid(ReplyType::Text, "   "));
        assert!(reply_is_valid(ReplyType::Number, "42.5"));
        assert!(!reply_is_valid(ReplyType::Number, "forty"));
        assert!(!reply_is_valid(ReplyType::Number, "inf"));
        assert!(reply_is_valid(ReplyType::Email, "ana@example.com"));
        assert!(!reply_is_valid(ReplyType::Email, "ana@example"));
        assert!(!reply_is_valid(ReplyType::Email, "not an email"));
    }
}
