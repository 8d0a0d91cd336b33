//! Thread labeling job.
//!
//! Polls for unlabeled thread roots in fixed-size batches, sends each batch
//! to the LLM classifier as one prompt, parses the JSON reply, and hands the
//! entries to reconciliation. Processing is single-threaded and
//! batch-oriented: one classifier call, one transaction, one fixed delay,
//! repeat. A failed call or an unparsable reply is a soft failure — the
//! batch is skipped, its roots stay unlabeled, and the job retries them
//! after the delay.

use anyhow::Result;
use sqlx::SqlitePool;
use std::fmt::Write as _;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::llm::{strip_code_fences, GeminiClient, TextGenerator};
use crate::models::{LabelEntry, Message, Thread};
use crate::reconcile;
use crate::threads;

/// Outcome of one polling step.
#[derive(Debug)]
pub enum BatchResult {
    /// No unlabeled roots remain.
    Done,
    /// A batch was classified and merged.
    Labeled(reconcile::BatchOutcome),
    /// Classifier call failed or returned garbage; batch skipped.
    SoftFailure,
}

/// `label run` — classify until no unlabeled roots remain (or one batch with
/// `--once`).
pub async fn run_labeler(config: &Config, once: bool) -> Result<()> {
    let generator = GeminiClient::new(
        &config.labeler.model,
        config.labeler.max_retries,
        config.labeler.timeout_secs,
    )?;
    let pool = db::connect(config).await?;
    let delay = Duration::from_secs(config.labeler.retry_delay_secs);

    loop {
        let result = run_once(&pool, &generator, config.labeler.batch_size).await?;

        match result {
            BatchResult::Done => {
                println!("All threads are already labeled.");
                break;
            }
            BatchResult::Labeled(outcome) => {
                print_status(&pool, outcome.inserted, outcome.rejected.len()).await?;
            }
            BatchResult::SoftFailure => {
                eprintln!("Warning: skipping batch, will retry after delay");
            }
        }

        if once {
            break;
        }

        // Fixed inter-batch delay keeps us under the classifier's rate limit
        tokio::time::sleep(delay).await;
    }

    pool.close().await;
    Ok(())
}

/// One polling step: fetch a batch of unlabeled roots, classify, reconcile.
pub async fn run_once(
    pool: &SqlitePool,
    generator: &dyn TextGenerator,
    batch_size: usize,
) -> Result<BatchResult> {
    let roots = fetch_unlabeled_roots(pool, batch_size).await?;
    if roots.is_empty() {
        return Ok(BatchResult::Done);
    }

    let mut batch = Vec::with_capacity(roots.len());
    for root in &roots {
        if let Some(thread) = threads::fetch_thread(pool, &root.message_id).await? {
            batch.push(thread);
        }
    }

    let prompt = format_prompt(&batch);

    let reply = match generator.generate(&prompt).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Warning: classifier call failed: {}", e);
            return Ok(BatchResult::SoftFailure);
        }
    };

    let entries = match parse_reply(&reply) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Warning: could not parse classifier reply: {}", e);
            eprintln!("  reply snippet: {}", snippet(&reply, 500));
            return Ok(BatchResult::SoftFailure);
        }
    };

    let outcome = reconcile::apply_batch(pool, &entries, &batch).await?;
    Ok(BatchResult::Labeled(outcome))
}

/// Thread roots that have no label row yet, oldest first.
pub async fn fetch_unlabeled_roots(pool: &SqlitePool, limit: usize) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        r#"
        SELECT m.message_id, m.space_id, m.parent_id, m.person_id, m.person_email, m.text, m.created
        FROM messages m
        LEFT JOIN thread_labels tl ON tl.message_id = m.message_id
        WHERE m.parent_id IS NULL AND tl.message_id IS NULL
        ORDER BY m.created, m.message_id
        LIMIT ?
        "#,
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(threads::row_to_message).collect())
}

/// Build the batch classification prompt. Each message carries its external
/// id so the reply can be joined back; the contract is a bare JSON list.
pub fn format_prompt(batch: &[Thread]) -> String {
    let mut prompt = String::from(
        "You will receive multiple message threads. Each thread contains a conversation \
         consisting of a parent message and its replies.\n\n\
         For each message in a thread, assign a label: 'question', 'clarification', or 'answer'.\n\
         There must be at most one 'answer' per thread, and it should have the highest confidence score.\n\
         Include a confidence_score (between 0.0 and 1.0) for each label.\n\n\
         Return your answer as a JSON list like:\n\
         [{\"message_id\": \"abc123\", \"label\": \"question\", \"confidence_score\": 0.93}, \
         {\"message_id\": \"def456\", \"label\": \"answer\", \"confidence_score\": 0.98}]\n\n\
         Important: Use the original message_id exactly as shown in the input.\n\n",
    );

    for (i, thread) in batch.iter().enumerate() {
        let _ = writeln!(prompt, "Thread {}:", i + 1);
        let mut position = 1;
        let _ = writeln!(
            prompt,
            "{}. (Parent) {} [message_id: {}]",
            position,
            thread.root.text.trim(),
            thread.root.message_id
        );
        for child in &thread.children {
            position += 1;
            let _ = writeln!(
                prompt,
                "{}. (Reply) {} [message_id: {}]",
                position,
                child.text.trim(),
                child.message_id
            );
        }
        prompt.push('\n');
    }

    prompt
}

/// Parse the classifier's JSON-list reply, tolerating a markdown code fence.
pub fn parse_reply(text: &str) -> Result<Vec<LabelEntry>> {
    let clean = strip_code_fences(text);
    let entries: Vec<LabelEntry> = serde_json::from_str(clean)?;
    for entry in &entries {
        if !(0.0..=1.0).contains(&entry.confidence_score) {
            anyhow::bail!(
                "confidence_score {} for {} outside [0, 1]",
                entry.confidence_score,
                entry.message_id
            );
        }
    }
    Ok(entries)
}

async fn print_status(pool: &SqlitePool, inserted: usize, rejected: usize) -> Result<()> {
    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE parent_id IS NULL")
            .fetch_one(pool)
            .await?;
    let labeled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages m
         JOIN thread_labels tl ON tl.message_id = m.message_id
         WHERE m.parent_id IS NULL",
    )
    .fetch_one(pool)
    .await?;

    println!(
        "labeled batch: {} entries merged, {} rejected | {}/{} roots labeled, {} remaining",
        inserted,
        rejected,
        labeled,
        total,
        total - labeled
    );
    Ok(())
}

fn snippet(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGenerator;
    use crate::models::Label;
    use sqlx::Row;

    async fn seed_thread(pool: &SqlitePool, root: &str, children: &[&str]) {
        sqlx::query("INSERT OR IGNORE INTO spaces (room_id, space_name) VALUES ('room-1', 'Test')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, space_id, message_id, person_id, person_email, text, created)
             VALUES (?, 'room-1', ?, 'p', 'p@example.com', 'how do I fix X?', 1)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(root)
        .execute(pool)
        .await
        .unwrap();
        for (i, child) in children.iter().enumerate() {
            sqlx::query(
                "INSERT INTO messages (id, space_id, message_id, parent_id, person_id, person_email, text, created)
                 VALUES (?, 'room-1', ?, ?, 'p', 'p@example.com', 'try Y', ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(child)
            .bind(root)
            .bind(i as i64 + 2)
            .execute(pool)
            .await
            .unwrap();
        }
    }

    #[test]
    fn parse_reply_accepts_fenced_json() {
        let entries = parse_reply(
            "```json\n[{\"message_id\": \"a\", \"label\": \"answer\", \"confidence_score\": 0.9}]\n```",
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label, Label::Answer);
    }

    #[test]
    fn parse_reply_defaults_missing_confidence() {
        let entries =
            parse_reply("[{\"message_id\": \"a\", \"label\": \"question\"}]").unwrap();
        assert!((entries[0].confidence_score - 0.95).abs() < 1e-9);
    }

    #[test]
    fn parse_reply_rejects_garbage() {
        assert!(parse_reply("the threads look fine to me").is_err());
    }

    #[test]
    fn parse_reply_rejects_out_of_range_confidence() {
        assert!(parse_reply(
            "[{\"message_id\": \"a\", \"label\": \"answer\", \"confidence_score\": 1.7}]"
        )
        .is_err());
    }

    #[test]
    fn parse_reply_rejects_unknown_label() {
        assert!(parse_reply(
            "[{\"message_id\": \"a\", \"label\": \"solution\", \"confidence_score\": 0.5}]"
        )
        .is_err());
    }

    #[test]
    fn prompt_carries_every_message_id() {
        let pool_msgs = |id: &str, parent: Option<&str>| crate::models::Message {
            message_id: id.to_string(),
            space_id: "room-1".to_string(),
            parent_id: parent.map(|p| p.to_string()),
            person_id: "p".to_string(),
            person_email: "p@example.com".to_string(),
            text: format!("body {}", id),
            created: 0,
        };
        let thread = Thread {
            root: pool_msgs("root-1", None),
            children: vec![pool_msgs("child-1", Some("root-1"))],
        };

        let prompt = format_prompt(&[thread]);
        assert!(prompt.contains("[message_id: root-1]"));
        assert!(prompt.contains("[message_id: child-1]"));
        assert!(prompt.contains("at most one 'answer' per thread"));
    }

    #[tokio::test]
    async fn soft_failure_leaves_roots_unlabeled_then_retry_succeeds() {
        let pool = crate::db::connect_memory().await.unwrap();
        seed_thread(&pool, "r1", &["c1"]).await;

        let generator = ScriptedGenerator::new(vec![
            Ok("I cannot label these threads, sorry.".to_string()),
            Ok(r#"[{"message_id": "r1", "label": "question", "confidence_score": 0.9},
                   {"message_id": "c1", "label": "answer", "confidence_score": 0.8}]"#
                .to_string()),
        ]);

        // First pass: unparsable reply, nothing written
        let result = run_once(&pool, &generator, 5).await.unwrap();
        assert!(matches!(result, BatchResult::SoftFailure));
        assert_eq!(fetch_unlabeled_roots(&pool, 5).await.unwrap().len(), 1);

        // Retry: same roots come back and label cleanly
        let result = run_once(&pool, &generator, 5).await.unwrap();
        match result {
            BatchResult::Labeled(outcome) => assert_eq!(outcome.inserted, 2),
            other => panic!("expected Labeled, got {:?}", other),
        }
        assert!(fetch_unlabeled_roots(&pool, 5).await.unwrap().is_empty());

        let solution: Option<String> = sqlx::query(
            "SELECT solution_message_id FROM thread_labels WHERE message_id = 'r1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("solution_message_id");
        assert_eq!(solution.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn done_when_no_unlabeled_roots() {
        let pool = crate::db::connect_memory().await.unwrap();
        let generator = ScriptedGenerator::new(vec![]);
        let result = run_once(&pool, &generator, 5).await.unwrap();
        assert!(matches!(result, BatchResult::Done));
    }
}
