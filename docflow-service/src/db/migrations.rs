//! Database schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Create every table and index if missing.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Document status records (written only by the orchestrator after upload)
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            filepath TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            progress INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            total_pages INTEGER,
            chunks_count INTEGER NOT NULL DEFAULT 0,
            processing_duration REAL,
            error_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

        -- Append-only stage audit trail
        CREATE TABLE IF NOT EXISTS processing_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            status TEXT NOT NULL,
            message TEXT,
            duration REAL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_processing_logs_document ON processing_logs(document_id);

        -- Durable task queue
        CREATE TABLE IF NOT EXISTS task_queue (
            id TEXT PRIMARY KEY,
            task_name TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '[]',
            kwargs TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending',
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            next_retry_at TEXT,
            result TEXT,
            error_message TEXT,
            heartbeat_at TEXT,
            unique_key TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_task_queue_status ON task_queue(status);
        CREATE INDEX IF NOT EXISTS idx_task_queue_next_retry ON task_queue(next_retry_at);

        -- Chunks written by the storing stage
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);

        -- Embeddings as little-endian f32 BLOBs
        CREATE TABLE IF NOT EXISTS chunk_embeddings (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        );
        "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: format!("Failed to create schema: {}", e),
    })?;

    run_task_lease_migration(conn)?;

    Ok(())
}

/// Migration: heartbeat and uniqueness columns on task_queue
fn run_task_lease_migration(conn: &Connection) -> ServiceResult<()> {
    let has_heartbeat: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('task_queue') WHERE name='heartbeat_at'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .unwrap_or(0)
        > 0;

    if !has_heartbeat {
        conn.execute_batch(
            r#"
            ALTER TABLE task_queue ADD COLUMN heartbeat_at TEXT;
            ALTER TABLE task_queue ADD COLUMN unique_key TEXT;
            "#,
        )
        .map_err(|e| DatabaseError::Migration {
            message: format!("Failed to add task lease columns: {}", e),
        })?;
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_task_queue_unique_key ON task_queue(unique_key);",
    )
    .map_err(|e| DatabaseError::Migration {
        message: format!("Failed to index task unique keys: {}", e),
    })?;

    Ok(())
}
