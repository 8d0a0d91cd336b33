use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an existing pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Spaces: one row per messaging-service room
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS spaces (
            room_id TEXT PRIMARY KEY,
            space_name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Messages: immutable once ingested. parent_id NULL means thread root.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            space_id TEXT NOT NULL,
            message_id TEXT NOT NULL UNIQUE,
            parent_id TEXT,
            person_id TEXT NOT NULL,
            person_email TEXT NOT NULL,
            text TEXT NOT NULL,
            created INTEGER NOT NULL,
            FOREIGN KEY (space_id) REFERENCES spaces(room_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embeddings: one fixed-dimension vector per message
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            message_id TEXT PRIMARY KEY,
            vector BLOB NOT NULL,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (message_id) REFERENCES messages(message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Thread labels: one row per labeled message. solution_message_id is
    // replicated across every row of a thread by reconciliation.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS thread_labels (
            message_id TEXT PRIMARY KEY,
            label TEXT NOT NULL CHECK (label IN ('question', 'answer', 'clarification')),
            confidence_score REAL,
            solution_message_id TEXT,
            reviewed INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (message_id) REFERENCES messages(message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Checkpoints: incremental-sync high-water mark per room
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            room_id TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_parent_id ON messages(parent_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_space_id ON messages(space_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_thread_labels_solution ON thread_labels(solution_message_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
