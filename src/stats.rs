//! Database statistics and health overview.
//!
//! A quick summary of what's stored: spaces, messages, embedding coverage,
//! label coverage, and per-room sync checkpoints. Used by `triage stats` to
//! give confidence that ingestion, embedding, and labeling are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct SpaceStats {
    space_name: String,
    message_count: i64,
    root_count: i64,
    labeled_roots: i64,
    last_sync_ts: Option<i64>,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await?;

    let total_roots: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE parent_id IS NULL")
            .fetch_one(&pool)
            .await?;

    let labeled_roots: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages m
         JOIN thread_labels tl ON tl.message_id = m.message_id
         WHERE m.parent_id IS NULL",
    )
    .fetch_one(&pool)
    .await?;

    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(&pool)
        .await?;

    let solved_threads: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT solution_message_id) FROM thread_labels
         WHERE solution_message_id IS NOT NULL",
    )
    .fetch_one(&pool)
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("thread-triage — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:   {}", config.db.path.display());
    println!("  Size:       {}", format_bytes(db_size));
    println!();
    println!("  Messages:   {}", total_messages);
    println!("  Threads:    {}", total_roots);
    println!(
        "  Labeled:    {} / {} ({}%)",
        labeled_roots,
        total_roots,
        if total_roots > 0 {
            (labeled_roots * 100) / total_roots
        } else {
            0
        }
    );
    println!(
        "  Embedded:   {} / {} ({}%)",
        total_embedded,
        total_messages,
        if total_messages > 0 {
            (total_embedded * 100) / total_messages
        } else {
            0
        }
    );
    println!("  Solved:     {} threads with a solution message", solved_threads);

    // Per-space breakdown
    let space_rows = sqlx::query(
        r#"
        SELECT
            s.room_id,
            s.space_name,
            COUNT(m.message_id) AS message_count,
            COALESCE(SUM(CASE WHEN m.parent_id IS NULL THEN 1 ELSE 0 END), 0) AS root_count,
            COALESCE(SUM(CASE WHEN m.parent_id IS NULL AND tl.message_id IS NOT NULL THEN 1 ELSE 0 END), 0) AS labeled_roots
        FROM spaces s
        LEFT JOIN messages m ON m.space_id = s.room_id
        LEFT JOIN thread_labels tl ON tl.message_id = m.message_id
        GROUP BY s.room_id
        ORDER BY message_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let checkpoint_rows = sqlx::query("SELECT room_id, updated_at FROM checkpoints")
        .fetch_all(&pool)
        .await?;

    let mut space_stats: Vec<SpaceStats> = Vec::new();
    for row in &space_rows {
        let room_id: String = row.get("room_id");
        let last_sync_ts = checkpoint_rows
            .iter()
            .find(|cp| {
                let cp_room: String = cp.get("room_id");
                cp_room == room_id
            })
            .map(|cp| cp.get::<i64, _>("updated_at"));

        space_stats.push(SpaceStats {
            space_name: row.get("space_name"),
            message_count: row.get("message_count"),
            root_count: row.get("root_count"),
            labeled_roots: row.get("labeled_roots"),
            last_sync_ts,
        });
    }

    if !space_stats.is_empty() {
        println!();
        println!("  By space:");
        println!(
            "  {:<28} {:>8} {:>8} {:>8}   {}",
            "SPACE", "MSGS", "THREADS", "LABELED", "LAST SYNC"
        );
        println!("  {}", "-".repeat(72));

        for s in &space_stats {
            let sync_display = match s.last_sync_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<28} {:>8} {:>8} {:>8}   {}",
                s.space_name, s.message_count, s.root_count, s.labeled_roots, sync_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
