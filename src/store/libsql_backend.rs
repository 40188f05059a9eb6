//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC text so they compare correctly as strings.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::fields::FieldMapping;
use crate::flow::model::{Flow, FlowGraph, FlowStatus, FlowVersion};
use crate::inbound::event::{EventOutcome, InboundEvent, InboundEventRecord};
use crate::session::model::{PendingContinuation, Session};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Write a version's mappings, then its version row.
    async fn insert_version_rows(
        &self,
        flow_id: &str,
        version: &FlowVersion,
        mappings: &[FieldMapping],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for m in mappings {
            conn.execute(
                "INSERT INTO field_mappings
                    (flow_id, version, node_id, component_id, label, field_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    flow_id,
                    m.version,
                    m.node_id.as_str(),
                    m.component_id.as_str(),
                    m.label.as_str(),
                    m.field_name.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("publish_flow_version mapping: {e}")))?;
        }

        let graph = to_json(&version.graph, "publish_flow_version graph")?;
        conn.execute(
            &format!("INSERT INTO flow_versions ({VERSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
            params![
                flow_id,
                version.version,
                version.status.to_string(),
                graph,
                ts(&version.published_at)
            ],
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DatabaseError::Constraint(format!(
                    "flow {} version {} already exists",
                    version.flow_id, version.version
                ))
            } else {
                DatabaseError::Query(format!("publish_flow_version: {e}"))
            }
        })?;
        Ok(())
    }

    /// Delete mappings of a version that has no version row.
    async fn purge_orphan_mappings(
        &self,
        flow_id: &str,
        version: i64,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM field_mappings
                 WHERE flow_id = ?1 AND version = ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM flow_versions WHERE flow_id = ?1 AND version = ?2
                   )",
                params![flow_id, version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_orphan_mappings: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: invalid uuid {s:?}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn text(row: &libsql::Row, idx: i32, ctx: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{ctx} column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, ctx: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{ctx} column {idx}: {e}")))
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

const FLOW_COLUMNS: &str =
    "id, account_id, name, enabled, published_version, draft, next_edge_seq, created_at, updated_at";

/// Column order matches FLOW_COLUMNS.
fn row_to_flow(row: &libsql::Row) -> Result<Flow, DatabaseError> {
    let id: String = text(row, 0, "flow")?;
    let draft: String = text(row, 5, "flow")?;
    let created: String = text(row, 7, "flow")?;
    let updated: String = text(row, 8, "flow")?;
    Ok(Flow {
        id: parse_uuid(&id, "flows.id")?,
        account_id: text(row, 1, "flow")?,
        name: text(row, 2, "flow")?,
        enabled: int(row, 3, "flow")? != 0,
        published_version: row.get::<i64>(4).ok(),
        draft: from_json(&draft, "flows.draft")?,
        next_edge_seq: int(row, 6, "flow")?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const VERSION_COLUMNS: &str = "flow_id, version, status, graph, published_at";

fn row_to_version(row: &libsql::Row) -> Result<FlowVersion, DatabaseError> {
    let flow_id: String = text(row, 0, "flow_version")?;
    let status: String = text(row, 2, "flow_version")?;
    let graph: String = text(row, 3, "flow_version")?;
    let published: String = text(row, 4, "flow_version")?;
    Ok(FlowVersion {
        flow_id: parse_uuid(&flow_id, "flow_versions.flow_id")?,
        version: int(row, 1, "flow_version")?,
        status: parse_enum::<FlowStatus>(&status)?,
        graph: from_json(&graph, "flow_versions.graph")?,
        published_at: parse_datetime(&published),
    })
}

const SESSION_COLUMNS: &str = "id, conversation_id, flow_id, flow_version, current_node, token, status, variables, dispatch_failures, last_error, started_at, completed_at, updated_at";

fn row_to_session(row: &libsql::Row) -> Result<Session, DatabaseError> {
    let id: String = text(row, 0, "session")?;
    let flow_id: String = text(row, 2, "session")?;
    let status: String = text(row, 6, "session")?;
    let variables: String = text(row, 7, "session")?;
    let started: String = text(row, 10, "session")?;
    let completed: Option<String> = row.get::<String>(11).ok();
    let updated: String = text(row, 12, "session")?;
    Ok(Session {
        id: parse_uuid(&id, "sessions.id")?,
        conversation_id: text(row, 1, "session")?,
        flow_id: parse_uuid(&flow_id, "sessions.flow_id")?,
        flow_version: int(row, 3, "session")?,
        current_node: row.get::<String>(4).ok(),
        token: text(row, 5, "session")?,
        status: parse_enum(&status)?,
        variables: from_json(&variables, "sessions.variables")?,
        dispatch_failures: int(row, 8, "session")?.max(0) as u32,
        last_error: row.get::<String>(9).ok(),
        started_at: parse_datetime(&started),
        completed_at: parse_optional_datetime(&completed),
        updated_at: parse_datetime(&updated),
    })
}

const CONTINUATION_COLUMNS: &str =
    "id, session_id, conversation_id, node_id, kind, deadline, reply_type, created_at";

fn row_to_continuation(row: &libsql::Row) -> Result<PendingContinuation, DatabaseError> {
    let id: String = text(row, 0, "continuation")?;
    let session_id: String = text(row, 1, "continuation")?;
    let kind: String = text(row, 4, "continuation")?;
    let deadline: Option<String> = row.get::<String>(5).ok();
    let reply_type = match row.get::<String>(6).ok() {
        Some(s) => Some(parse_enum(&s)?),
        None => None,
    };
    let created: String = text(row, 7, "continuation")?;
    Ok(PendingContinuation {
        id: parse_uuid(&id, "pending_continuations.id")?,
        session_id: parse_uuid(&session_id, "pending_continuations.session_id")?,
        conversation_id: text(row, 2, "continuation")?,
        node_id: text(row, 3, "continuation")?,
        kind: parse_enum(&kind)?,
        deadline: parse_optional_datetime(&deadline),
        reply_type,
        created_at: parse_datetime(&created),
    })
}

const EVENT_COLUMNS: &str = "conversation_id, provider_message_id, payload, received_at, processed_at, outcome, error, unmapped";

fn row_to_event_record(row: &libsql::Row) -> Result<InboundEventRecord, DatabaseError> {
    let payload: String = text(row, 2, "inbound_event")?;
    let received: String = text(row, 3, "inbound_event")?;
    let processed: Option<String> = row.get::<String>(4).ok();
    let outcome: String = text(row, 5, "inbound_event")?;
    let unmapped: String = text(row, 7, "inbound_event")?;
    Ok(InboundEventRecord {
        event: InboundEvent {
            conversation_id: text(row, 0, "inbound_event")?,
            provider_message_id: text(row, 1, "inbound_event")?,
            payload: from_json(&payload, "inbound_events.payload")?,
        },
        received_at: parse_datetime(&received),
        processed_at: parse_optional_datetime(&processed),
        outcome: parse_enum(&outcome)?,
        error: row.get::<String>(6).ok(),
        unmapped: from_json(&unmapped, "inbound_events.unmapped")?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Flows ───────────────────────────────────────────────────────

    async fn insert_flow(&self, flow: &Flow) -> Result<(), DatabaseError> {
        let draft = to_json(&flow.draft, "insert_flow draft")?;
        self.conn()
            .execute(
                &format!("INSERT INTO flows ({FLOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    flow.id.to_string(),
                    flow.account_id.as_str(),
                    flow.name.as_str(),
                    flow.enabled as i64,
                    opt_int(flow.published_version),
                    draft,
                    flow.next_edge_seq,
                    ts(&flow.created_at),
                    ts(&flow.updated_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_flow: {e}")))?;
        debug!(flow_id = %flow.id, "Inserted flow");
        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_flow: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_flow(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_flow: {e}"))),
        }
    }

    async fn list_flows(&self, account_id: Option<&str>) -> Result<Vec<Flow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FLOW_COLUMNS} FROM flows WHERE ?1 IS NULL OR account_id = ?1 ORDER BY created_at ASC"
                ),
                params![opt_text(account_id)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_flows: {e}")))?;

        let mut flows = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_flow(&row) {
                Ok(flow) => flows.push(flow),
                Err(e) => tracing::warn!("Skipping flow row: {e}"),
            }
        }
        Ok(flows)
    }

    async fn update_flow_draft(
        &self,
        id: Uuid,
        draft: &FlowGraph,
        next_edge_seq: i64,
    ) -> Result<(), DatabaseError> {
        let draft = to_json(draft, "update_flow_draft")?;
        let n = self
            .conn()
            .execute(
                "UPDATE flows SET draft = ?1, next_edge_seq = ?2, updated_at = ?3 WHERE id = ?4",
                params![draft, next_edge_seq, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_flow_draft: {e}")))?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "flow".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_flow_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError> {
        let n = self
            .conn()
            .execute(
                "UPDATE flows SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, ts(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_flow_enabled: {e}")))?;
        Ok(n > 0)
    }

    async fn max_flow_version(&self, flow_id: Uuid) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(version), 0) FROM flow_versions WHERE flow_id = ?1",
                params![flow_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("max_flow_version: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => int(&row, 0, "max_flow_version"),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("max_flow_version: {e}"))),
        }
    }

    async fn publish_flow_version(
        &self,
        version: &FlowVersion,
        mappings: &[FieldMapping],
    ) -> Result<(), DatabaseError> {
        let flow_id = version.flow_id.to_string();

        // Rows left by an earlier attempt that never got its version row.
        self.purge_orphan_mappings(&flow_id, version.version).await?;

        if let Err(e) = self.insert_version_rows(&flow_id, version, mappings).await {
            self.purge_orphan_mappings(&flow_id, version.version).await?;
            return Err(e);
        }

        let conn = self.conn();
        conn.execute(
            "UPDATE flow_versions SET status = 'deprecated'
             WHERE flow_id = ?1 AND version <> ?2 AND status = 'published'",
            params![flow_id.as_str(), version.version],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("publish_flow_version deprecate: {e}")))?;

        conn.execute(
            "UPDATE flows SET published_version = ?1, updated_at = ?2 WHERE id = ?3",
            params![version.version, ts(&Utc::now()), flow_id.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("publish_flow_version pointer: {e}")))?;

        Ok(())
    }

    async fn get_flow_version(
        &self,
        flow_id: Uuid,
        version: i64,
    ) -> Result<Option<FlowVersion>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM flow_versions WHERE flow_id = ?1 AND version = ?2"
                ),
                params![flow_id.to_string(), version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_flow_version: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_version(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_flow_version: {e}"))),
        }
    }

    async fn get_field_mappings(
        &self,
        flow_id: Uuid,
        version: i64,
    ) -> Result<Vec<FieldMapping>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT node_id, component_id, label, field_name FROM field_mappings
                 WHERE flow_id = ?1 AND version = ?2 ORDER BY rowid ASC",
                params![flow_id.to_string(), version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_field_mappings: {e}")))?;

        let mut mappings = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            mappings.push(FieldMapping {
                flow_id,
                version,
                node_id: text(&row, 0, "field_mapping")?,
                component_id: text(&row, 1, "field_mapping")?,
                label: text(&row, 2, "field_mapping")?,
                field_name: text(&row, 3, "field_mapping")?,
            });
        }
        Ok(mappings)
    }

    async fn list_trigger_candidates(&self) -> Result<Vec<FlowVersion>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT v.flow_id, v.version, v.status, v.graph, v.published_at
                 FROM flows f JOIN flow_versions v
                   ON v.flow_id = f.id AND v.version = f.published_version
                 WHERE f.enabled = 1
                 ORDER BY f.id ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_trigger_candidates: {e}")))?;

        let mut versions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_version(&row) {
                Ok(v) => versions.push(v),
                Err(e) => tracing::warn!("Skipping flow version row: {e}"),
            }
        }
        Ok(versions)
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let variables = to_json(&session.variables, "insert_session variables")?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    session.id.to_string(),
                    session.conversation_id.as_str(),
                    session.flow_id.to_string(),
                    session.flow_version,
                    opt_text(session.current_node.as_deref()),
                    session.token.as_str(),
                    session.status.to_string(),
                    variables,
                    session.dispatch_failures as i64,
                    opt_text(session.last_error.as_deref()),
                    ts(&session.started_at),
                    opt_ts(&session.completed_at),
                    ts(&session.updated_at)
                ],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DatabaseError::Constraint(format!(
                        "conversation {} already has an active session",
                        session.conversation_id
                    ))
                } else {
                    DatabaseError::Query(format!("insert_session: {e}"))
                }
            })?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session: {e}"))),
        }
    }

    async fn get_active_session(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE conversation_id = ?1 AND status = 'active'"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_session: {e}"))),
        }
    }

    async fn list_sessions(&self, conversation_id: &str) -> Result<Vec<Session>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE conversation_id = ?1 ORDER BY started_at DESC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sessions: {e}")))?;

        let mut sessions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_session(&row) {
                Ok(s) => sessions.push(s),
                Err(e) => tracing::warn!("Skipping session row: {e}"),
            }
        }
        Ok(sessions)
    }

    async fn update_session(&self, session: &Session) -> Result<(), DatabaseError> {
        let variables = to_json(&session.variables, "update_session variables")?;
        self.conn()
            .execute(
                "UPDATE sessions SET current_node = ?1, status = ?2, variables = ?3,
                     dispatch_failures = ?4, last_error = ?5, completed_at = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    opt_text(session.current_node.as_deref()),
                    session.status.to_string(),
                    variables,
                    session.dispatch_failures as i64,
                    opt_text(session.last_error.as_deref()),
                    opt_ts(&session.completed_at),
                    ts(&session.updated_at),
                    session.id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session: {e}")))?;
        Ok(())
    }

    // ── Continuations ───────────────────────────────────────────────

    async fn upsert_continuation(
        &self,
        continuation: &PendingContinuation,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM pending_continuations WHERE session_id = ?1",
            params![continuation.session_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_continuation clear: {e}")))?;

        conn.execute(
            &format!(
                "INSERT INTO pending_continuations ({CONTINUATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            params![
                continuation.id.to_string(),
                continuation.session_id.to_string(),
                continuation.conversation_id.as_str(),
                continuation.node_id.as_str(),
                continuation.kind.to_string(),
                opt_ts(&continuation.deadline),
                opt_text(continuation.reply_type.map(|r| r.to_string()).as_deref()),
                ts(&continuation.created_at)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_continuation: {e}")))?;
        Ok(())
    }

    async fn get_continuation(
        &self,
        id: Uuid,
    ) -> Result<Option<PendingContinuation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTINUATION_COLUMNS} FROM pending_continuations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_continuation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_continuation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_continuation: {e}"))),
        }
    }

    async fn get_session_continuation(
        &self,
        session_id: Uuid,
    ) -> Result<Option<PendingContinuation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONTINUATION_COLUMNS} FROM pending_continuations WHERE session_id = ?1"
                ),
                params![session_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session_continuation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_continuation(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session_continuation: {e}"))),
        }
    }

    async fn delete_session_continuations(&self, session_id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM pending_continuations WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session_continuations: {e}")))?;
        Ok(())
    }

    async fn due_continuations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingContinuation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONTINUATION_COLUMNS} FROM pending_continuations
                     WHERE deadline IS NOT NULL AND deadline <= ?1
                     ORDER BY deadline ASC LIMIT ?2"
                ),
                params![ts(&now), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_continuations: {e}")))?;

        let mut due = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_continuation(&row) {
                Ok(c) => due.push(c),
                Err(e) => tracing::warn!("Skipping continuation row: {e}"),
            }
        }
        Ok(due)
    }

    // ── Inbound events ──────────────────────────────────────────────

    async fn record_inbound_event(
        &self,
        record: &InboundEventRecord,
    ) -> Result<bool, DatabaseError> {
        let payload = to_json(&record.event.payload, "record_inbound_event payload")?;
        let unmapped = to_json(&record.unmapped, "record_inbound_event unmapped")?;
        let n = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO inbound_events
                    (conversation_id, provider_message_id, kind, payload, received_at, processed_at, outcome, error, unmapped)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.event.conversation_id.as_str(),
                    record.event.provider_message_id.as_str(),
                    record.event.kind().to_string(),
                    payload,
                    ts(&record.received_at),
                    opt_ts(&record.processed_at),
                    record.outcome.to_string(),
                    opt_text(record.error.as_deref()),
                    unmapped
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_inbound_event: {e}")))?;
        Ok(n > 0)
    }

    async fn get_inbound_event(
        &self,
        conversation_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<InboundEventRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM inbound_events
                     WHERE conversation_id = ?1 AND provider_message_id = ?2"
                ),
                params![conversation_id, provider_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_inbound_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_event_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_inbound_event: {e}"))),
        }
    }

    async fn finish_inbound_event(
        &self,
        conversation_id: &str,
        provider_message_id: &str,
        outcome: EventOutcome,
        error: Option<&str>,
        unmapped: &[String],
    ) -> Result<(), DatabaseError> {
        let unmapped = to_json(&unmapped, "finish_inbound_event unmapped")?;
        self.conn()
            .execute(
                "UPDATE inbound_events SET outcome = ?1, error = ?2, unmapped = ?3, processed_at = ?4
                 WHERE conversation_id = ?5 AND provider_message_id = ?6",
                params![
                    outcome.to_string(),
                    opt_text(error),
                    unmapped,
                    ts(&Utc::now()),
                    conversation_id,
                    provider_message_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_inbound_event: {e}")))?;
        Ok(())
    }

    async fn stale_inbound_events(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEventRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM inbound_events
                     WHERE outcome = 'pending' AND received_at < ?1
                     ORDER BY received_at ASC LIMIT ?2"
                ),
                params![ts(&before), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stale_inbound_events: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_event_record(&row) {
                Ok(r) => records.push(r),
                Err(e) => tracing::warn!("Skipping inbound event row: {e}"),
            }
        }
        Ok(records)
    }
}
