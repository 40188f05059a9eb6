//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "flow_definitions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                published_version INTEGER,
                draft TEXT NOT NULL,
                next_edge_seq INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flows_account ON flows(account_id);

            CREATE TABLE IF NOT EXISTS flow_versions (
                flow_id TEXT NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                graph TEXT NOT NULL,
                published_at TEXT NOT NULL,
                PRIMARY KEY (flow_id, version)
            );

            CREATE TABLE IF NOT EXISTS field_mappings (
                flow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                component_id TEXT NOT NULL,
                label TEXT NOT NULL,
                field_name TEXT NOT NULL,
                PRIMARY KEY (flow_id, version, node_id, component_id),
                UNIQUE (flow_id, version, field_name)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "session_runtime",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                flow_version INTEGER NOT NULL,
                current_node TEXT,
                token TEXT NOT NULL,
                status TEXT NOT NULL,
                variables TEXT NOT NULL DEFAULT '{}',
                dispatch_failures INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_conversation ON sessions(conversation_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
                ON sessions(conversation_id) WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS pending_continuations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                deadline TEXT,
                reply_type TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_continuations_deadline
                ON pending_continuations(deadline);

            CREATE TABLE IF NOT EXISTS inbound_events (
                conversation_id TEXT NOT NULL,
                provider_message_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                received_at TEXT NOT NULL,
                processed_at TEXT,
                outcome TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                unmapped TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (conversation_id, provider_message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_events_outcome
                ON inbound_events(outcome, received_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "flows",
            "flow_versions",
            "field_mappings",
            "sessions",
            "pending_continuations",
            "inbound_events",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().unwrap().version);
    }

    #[tokio::test]
    async fn one_active_session_per_conversation() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO sessions (id, conversation_id, flow_id, flow_version, token, status, started_at, updated_at)
                      VALUES (?1, 'c1', 'f', 1, 't', ?2, '2026-01-01', '2026-01-01')";
        conn.execute(insert, libsql::params!["s1", "active"]).await.unwrap();
        conn.execute(insert, libsql::params!["s2", "completed"]).await.unwrap();
        conn.execute(insert, libsql::params!["s3", "abandoned"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["s4", "active"]).await.is_err());
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "flow_definitions");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "session_runtime");
    }
}
