use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;

/// Find and embed messages that are missing or have stale embeddings.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let pending = find_pending_messages(&pool, &model_name, limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  messages needing embeddings: {}", pending.len());
        pool.close().await;
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all messages up to date");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) = embed_batches(config, &pool, provider.as_ref(), &pending, batch_size).await;

    println!("embed pending");
    println!("  total pending: {}", pending.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all embeddings and regenerate for every message.
///
/// Useful when switching embedding models or dimensions. The similarity
/// index must be rebuilt afterwards (`index build`).
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    sqlx::query("DELETE FROM embeddings").execute(&pool).await?;

    println!("embed rebuild — cleared existing embeddings");

    let all = find_pending_messages(&pool, provider.model_name(), None).await?;

    if all.is_empty() {
        println!("  no messages to embed");
        pool.close().await;
        return Ok(());
    }

    let (embedded, failed) = embed_batches(config, &pool, provider.as_ref(), &all, batch_size).await;

    println!("embed rebuild");
    println!("  total messages: {}", all.len());
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Re-normalization pass: rescale every stored vector to unit length without
/// touching the provider. The only mutation embeddings ever see after
/// creation.
pub async fn run_embed_normalize(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let rows = sqlx::query("SELECT message_id, vector FROM embeddings ORDER BY message_id")
        .fetch_all(&pool)
        .await?;

    if rows.is_empty() {
        println!("embed normalize");
        println!("  no stored embeddings");
        pool.close().await;
        return Ok(());
    }

    let mut updated = 0u64;
    for row in &rows {
        let message_id: String = row.get("message_id");
        let blob: Vec<u8> = row.get("vector");
        let mut vec = embedding::blob_to_vec(&blob);
        embedding::l2_normalize(&mut vec);
        let normalized = embedding::vec_to_blob(&vec);

        if normalized != blob {
            sqlx::query("UPDATE embeddings SET vector = ? WHERE message_id = ?")
                .bind(&normalized)
                .bind(&message_id)
                .execute(&pool)
                .await?;
            updated += 1;
        }
    }

    println!("embed normalize");
    println!("  vectors checked: {}", rows.len());
    println!("  vectors rescaled: {}", updated);

    pool.close().await;
    Ok(())
}

struct PendingMessage {
    message_id: String,
    text: String,
    text_hash: String,
}

async fn embed_batches(
    config: &Config,
    pool: &SqlitePool,
    provider: &dyn embedding::EmbeddingProvider,
    pending: &[PendingMessage],
    batch_size: usize,
) -> (u64, u64) {
    let model_name = provider.model_name().to_string();
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match embedding::embed_texts(provider, &config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    let blob = embedding::vec_to_blob(vec);
                    let stored = upsert_embedding(
                        pool,
                        &item.message_id,
                        &model_name,
                        provider.dims(),
                        &item.text_hash,
                        &blob,
                    )
                    .await;
                    match stored {
                        Ok(()) => embedded += 1,
                        Err(e) => {
                            eprintln!(
                                "Warning: failed to store embedding for {}: {}",
                                item.message_id, e
                            );
                            failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    (embedded, failed)
}

async fn find_pending_messages(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingMessage>> {
    let max = limit.unwrap_or(usize::MAX);
    // SQLite treats a negative LIMIT as unbounded
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);

    // Messages with no embedding row, a stale text hash, or an old model
    let rows = sqlx::query(
        r#"
        SELECT m.message_id, m.text
        FROM messages m
        LEFT JOIN embeddings e ON e.message_id = m.message_id AND e.model = ?
        WHERE e.message_id IS NULL
        ORDER BY m.created, m.message_id
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    let mut results: Vec<PendingMessage> = rows
        .iter()
        .map(|row| {
            let text: String = row.get("text");
            let text_hash = hash_text(&text);
            PendingMessage {
                message_id: row.get("message_id"),
                text,
                text_hash,
            }
        })
        .collect();

    // Stale rows: text changed under an existing embedding (should not happen
    // for immutable messages, but rebuilds after hand-edits do occur)
    let stale = sqlx::query(
        r#"
        SELECT m.message_id, m.text, e.text_hash AS stored_hash
        FROM messages m
        JOIN embeddings e ON e.message_id = m.message_id AND e.model = ?
        ORDER BY m.created, m.message_id
        "#,
    )
    .bind(model)
    .fetch_all(pool)
    .await?;

    for row in &stale {
        if results.len() >= max {
            break;
        }
        let text: String = row.get("text");
        let stored_hash: String = row.get("stored_hash");
        let text_hash = hash_text(&text);
        if text_hash != stored_hash {
            results.push(PendingMessage {
                message_id: row.get("message_id"),
                text,
                text_hash,
            });
        }
    }

    Ok(results)
}

async fn upsert_embedding(
    pool: &SqlitePool,
    message_id: &str,
    model: &str,
    dims: usize,
    text_hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO embeddings (message_id, vector, dims, model, text_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(message_id) DO UPDATE SET
            vector = excluded.vector,
            dims = excluded.dims,
            model = excluded.model,
            text_hash = excluded.text_hash,
            created_at = excluded.created_at
        "#,
    )
    .bind(message_id)
    .bind(blob)
    .bind(dims as i64)
    .bind(model)
    .bind(text_hash)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_skips_already_embedded_messages() {
        let pool = crate::db::connect_memory().await.unwrap();
        sqlx::query("INSERT INTO spaces (room_id, space_name) VALUES ('room-1', 'Test')")
            .execute(&pool)
            .await
            .unwrap();
        for (id, text) in [("m1", "first"), ("m2", "second")] {
            sqlx::query(
                "INSERT INTO messages (id, space_id, message_id, person_id, person_email, text, created)
                 VALUES (?, 'room-1', ?, 'p', 'p@example.com', ?, 1)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(id)
            .bind(text)
            .execute(&pool)
            .await
            .unwrap();
        }

        upsert_embedding(&pool, "m1", "test-model", 3, &hash_text("first"), &[0u8; 12])
            .await
            .unwrap();

        let pending = find_pending_messages(&pool, "test-model", None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "m2");
    }

    #[tokio::test]
    async fn stale_hash_marks_message_pending_again() {
        let pool = crate::db::connect_memory().await.unwrap();
        sqlx::query("INSERT INTO spaces (room_id, space_name) VALUES ('room-1', 'Test')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, space_id, message_id, person_id, person_email, text, created)
             VALUES (?, 'room-1', 'm1', 'p', 'p@example.com', 'current text', 1)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .execute(&pool)
        .await
        .unwrap();

        upsert_embedding(&pool, "m1", "test-model", 3, &hash_text("old text"), &[0u8; 12])
            .await
            .unwrap();

        let pending = find_pending_messages(&pool, "test-model", None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "m1");
    }
}
