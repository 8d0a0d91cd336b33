//! Ingestion orchestration.
//!
//! Coordinates a sync: connector → normalization → upsert → checkpoint.
//! Messages are immutable once stored (`ON CONFLICT DO NOTHING`), so re-syncs
//! never rewrite history; incremental syncs resume from the per-room
//! checkpoint.

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use std::path::Path;
use uuid::Uuid;

use crate::config::Config;
use crate::connector_rooms::{load_archive, RoomsClient};
use crate::db;
use crate::models::MessageItem;

/// `sync rooms` — pull every configured room (or just `room_filter`) from
/// the messaging API.
pub async fn run_sync_rooms(config: &Config, room_filter: Option<&str>, full: bool) -> Result<()> {
    if config.rooms.rooms.is_empty() {
        bail!("No rooms configured. Add [[rooms.rooms]] entries to the config.");
    }

    let client = RoomsClient::new(&config.rooms)?;
    let pool = db::connect(config).await?;

    for room in &config.rooms.rooms {
        if let Some(filter) = room_filter {
            if room.room_id != filter {
                continue;
            }
        }

        ensure_space(&pool, &room.room_id, &room.name).await?;

        let checkpoint = if full {
            None
        } else {
            get_checkpoint(&pool, &room.room_id).await?
        };

        let items = client.fetch_messages(&room.room_id, checkpoint).await?;
        let summary = store_items(&pool, &items).await?;
        set_checkpoint(&pool, &room.room_id, summary.max_created.or(checkpoint)).await?;

        println!("sync rooms ({})", room.name);
        println!("  fetched: {} messages", items.len());
        println!("  inserted: {}", summary.inserted);
        println!("  skipped (already stored): {}", summary.skipped);
        println!("  skipped (empty text): {}", summary.empty);
        if let Some(cp) = summary.max_created {
            println!("  checkpoint: {}", cp.format("%Y-%m-%dT%H:%M:%SZ"));
        }
    }

    println!("ok");
    pool.close().await;
    Ok(())
}

/// `sync archive <path>` — ingest a local JSON export through the same
/// normalize/upsert path as the live API.
pub async fn run_sync_archive(config: &Config, path: &Path) -> Result<()> {
    let items = load_archive(path)?;
    let pool = db::connect(config).await?;

    // Archives can span rooms; make sure each one has a space row
    let mut seen_rooms: Vec<&str> = Vec::new();
    for item in &items {
        if !seen_rooms.contains(&item.room_id.as_str()) {
            seen_rooms.push(&item.room_id);
            let name = config
                .rooms
                .rooms
                .iter()
                .find(|r| r.room_id == item.room_id)
                .map(|r| r.name.as_str())
                .unwrap_or("Unknown Space");
            ensure_space(&pool, &item.room_id, name).await?;
        }
    }

    let summary = store_items(&pool, &items).await?;

    println!("sync archive ({})", path.display());
    println!("  fetched: {} messages", items.len());
    println!("  inserted: {}", summary.inserted);
    println!("  skipped (already stored): {}", summary.skipped);
    println!("  skipped (empty text): {}", summary.empty);
    println!("ok");

    pool.close().await;
    Ok(())
}

#[derive(Debug, Default)]
pub struct StoreSummary {
    pub inserted: u64,
    pub skipped: u64,
    pub empty: u64,
    pub max_created: Option<DateTime<Utc>>,
}

/// Upsert a batch of normalized items in one transaction. Empty-text
/// messages (deleted or media-only) are skipped with a warning.
pub async fn store_items(pool: &SqlitePool, items: &[MessageItem]) -> Result<StoreSummary> {
    let mut summary = StoreSummary::default();
    let mut tx = pool.begin().await?;

    for item in items {
        let text = match item.text.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => {
                eprintln!("Warning: skipping message {} (empty text)", item.message_id);
                summary.empty += 1;
                continue;
            }
        };

        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, space_id, message_id, parent_id, person_id, person_email, text, created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&item.room_id)
        .bind(&item.message_id)
        .bind(&item.parent_id)
        .bind(&item.person_id)
        .bind(&item.person_email)
        .bind(text)
        .bind(item.created.timestamp())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            summary.inserted += 1;
        } else {
            summary.skipped += 1;
        }

        if summary.max_created.map(|m| item.created > m).unwrap_or(true) {
            summary.max_created = Some(item.created);
        }
    }

    tx.commit().await?;
    Ok(summary)
}

pub async fn ensure_space(pool: &SqlitePool, room_id: &str, name: &str) -> Result<()> {
    sqlx::query("INSERT INTO spaces (room_id, space_name) VALUES (?, ?) ON CONFLICT(room_id) DO NOTHING")
        .bind(room_id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

async fn get_checkpoint(pool: &SqlitePool, room_id: &str) -> Result<Option<DateTime<Utc>>> {
    let cursor: Option<String> =
        sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(pool)
            .await?;

    Ok(cursor
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single()))
}

async fn set_checkpoint(
    pool: &SqlitePool,
    room_id: &str,
    cursor: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(cursor) = cursor else {
        return Ok(());
    };
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (room_id, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(room_id) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(room_id)
    .bind(cursor.timestamp().to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
