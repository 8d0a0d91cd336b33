//! Label reconciliation.
//!
//! Merges classifier (or reviewer) label output into stored state and
//! recomputes each thread's solution message: among `answer`-labeled rows the
//! highest-confidence one wins, and its id is replicated onto every row of
//! the thread. A thread with no answer carries NULL everywhere.
//!
//! Entries referencing message ids that are not in the store are rejected and
//! logged, never inserted; the rest of the batch still lands. The whole batch
//! commits as one transaction.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;

use crate::models::{Label, LabelEntry, Thread};

/// Outcome of merging one classifier batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub rejected: Vec<String>,
}

/// Pick the solution message among `(message_id, confidence)` answer
/// candidates: highest confidence, ties broken toward the smaller message id
/// so reconciliation is deterministic.
pub fn select_solution(candidates: &[(String, f64)]) -> Option<String> {
    candidates
        .iter()
        .max_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.cmp(&a.0))
        })
        .map(|(id, _)| id.clone())
}

/// Split entries into those whose message id is known to the store and those
/// that must be rejected.
pub fn partition_known(
    entries: &[LabelEntry],
    known_ids: &HashSet<String>,
) -> (Vec<LabelEntry>, Vec<String>) {
    let mut valid = Vec::new();
    let mut rejected = Vec::new();
    for entry in entries {
        if known_ids.contains(&entry.message_id) {
            valid.push(entry.clone());
        } else {
            rejected.push(entry.message_id.clone());
        }
    }
    (valid, rejected)
}

/// Merge one classifier batch covering `threads` into the store.
pub async fn apply_batch(
    pool: &SqlitePool,
    entries: &[LabelEntry],
    threads: &[Thread],
) -> Result<BatchOutcome> {
    let known = fetch_known_ids(pool, entries).await?;
    let (valid, rejected) = partition_known(entries, &known);

    for id in &rejected {
        eprintln!("Warning: classifier returned unknown message_id {}, entry dropped", id);
    }

    let mut tx = pool.begin().await?;

    for entry in &valid {
        upsert_label(&mut tx, &entry.message_id, entry.label, entry.confidence_score, false)
            .await?;
    }

    // Solution per thread, from this batch's answer entries
    for thread in threads {
        let member_ids: HashSet<String> = thread.message_ids().into_iter().collect();
        let answers: Vec<(String, f64)> = valid
            .iter()
            .filter(|e| e.label == Label::Answer && member_ids.contains(&e.message_id))
            .map(|e| (e.message_id.clone(), e.confidence_score))
            .collect();

        let solution = select_solution(&answers);
        set_solution(&mut tx, &thread.message_ids(), solution.as_deref()).await?;
    }

    tx.commit().await?;

    Ok(BatchOutcome {
        inserted: valid.len(),
        rejected,
    })
}

/// Upsert one label row. Insert if absent, replace label/confidence/reviewed
/// otherwise; the solution column is owned by [`set_solution`].
pub async fn upsert_label(
    conn: &mut SqliteConnection,
    message_id: &str,
    label: Label,
    confidence: f64,
    reviewed: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO thread_labels (message_id, label, confidence_score, reviewed)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(message_id) DO UPDATE SET
            label = excluded.label,
            confidence_score = excluded.confidence_score,
            reviewed = excluded.reviewed
        "#,
    )
    .bind(message_id)
    .bind(label.as_str())
    .bind(confidence)
    .bind(reviewed)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Recompute a thread's solution from committed rows: among `answer`-labeled
/// rows of the thread pick the highest-confidence one and replicate its id.
/// Used by the review path after updates have been applied.
pub async fn recompute_solution(
    conn: &mut SqliteConnection,
    thread_member_ids: &[String],
) -> Result<Option<String>> {
    let placeholders = placeholders(thread_member_ids.len());
    let sql = format!(
        "SELECT message_id, confidence_score FROM thread_labels
         WHERE label = 'answer' AND message_id IN ({})",
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for id in thread_member_ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(&mut *conn).await?;

    let answers: Vec<(String, f64)> = rows
        .iter()
        .map(|row| {
            let id: String = row.get("message_id");
            let confidence: Option<f64> = row.get("confidence_score");
            (id, confidence.unwrap_or(0.0))
        })
        .collect();

    let solution = select_solution(&answers);
    set_solution(conn, thread_member_ids, solution.as_deref()).await?;
    Ok(solution)
}

/// Write the same solution id (or NULL) onto every labeled row of a thread.
async fn set_solution(
    conn: &mut SqliteConnection,
    thread_member_ids: &[String],
    solution: Option<&str>,
) -> Result<()> {
    if thread_member_ids.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "UPDATE thread_labels SET solution_message_id = ? WHERE message_id IN ({})",
        placeholders(thread_member_ids.len())
    );

    let mut query = sqlx::query(&sql).bind(solution);
    for id in thread_member_ids {
        query = query.bind(id);
    }
    query.execute(&mut *conn).await?;

    Ok(())
}

async fn fetch_known_ids(pool: &SqlitePool, entries: &[LabelEntry]) -> Result<HashSet<String>> {
    if entries.is_empty() {
        return Ok(HashSet::new());
    }

    let sql = format!(
        "SELECT message_id FROM messages WHERE message_id IN ({})",
        placeholders(entries.len())
    );

    let mut query = sqlx::query(&sql);
    for entry in entries {
        query = query.bind(&entry.message_id);
    }
    let rows = query.fetch_all(pool).await?;

    Ok(rows.iter().map(|r| r.get::<String, _>("message_id")).collect())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn entry(id: &str, label: Label, confidence: f64) -> LabelEntry {
        LabelEntry {
            message_id: id.to_string(),
            label,
            confidence_score: confidence,
        }
    }

    fn thread(root: &str, children: &[&str]) -> Thread {
        let msg = |id: &str, parent: Option<&str>, created: i64| Message {
            message_id: id.to_string(),
            space_id: "room-1".to_string(),
            parent_id: parent.map(|p| p.to_string()),
            person_id: "p".to_string(),
            person_email: "p@example.com".to_string(),
            text: String::new(),
            created,
        };
        Thread {
            root: msg(root, None, 0),
            children: children
                .iter()
                .enumerate()
                .map(|(i, c)| msg(c, Some(root), i as i64 + 1))
                .collect(),
        }
    }

    async fn seed(pool: &SqlitePool, threads: &[Thread]) {
        sqlx::query("INSERT INTO spaces (room_id, space_name) VALUES ('room-1', 'Test Space')")
            .execute(pool)
            .await
            .unwrap();
        for t in threads {
            let mut all = vec![t.root.clone()];
            all.extend(t.children.clone());
            for m in all {
                sqlx::query(
                    "INSERT INTO messages (id, space_id, message_id, parent_id, person_id, person_email, text, created)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(&m.space_id)
                .bind(&m.message_id)
                .bind(&m.parent_id)
                .bind(&m.person_id)
                .bind(&m.person_email)
                .bind(&m.text)
                .bind(m.created)
                .execute(pool)
                .await
                .unwrap();
            }
        }
    }

    async fn label_rows(pool: &SqlitePool) -> Vec<(String, String, Option<String>)> {
        let rows = sqlx::query(
            "SELECT message_id, label, solution_message_id FROM thread_labels ORDER BY message_id",
        )
        .fetch_all(pool)
        .await
        .unwrap();
        rows.iter()
            .map(|r| (r.get("message_id"), r.get("label"), r.get("solution_message_id")))
            .collect()
    }

    #[test]
    fn select_solution_picks_highest_confidence() {
        let solution = select_solution(&[
            ("c1".to_string(), 0.9),
            ("c2".to_string(), 0.95),
        ]);
        assert_eq!(solution.as_deref(), Some("c2"));
    }

    #[test]
    fn select_solution_tie_breaks_on_message_id() {
        let solution = select_solution(&[
            ("zz".to_string(), 0.9),
            ("aa".to_string(), 0.9),
        ]);
        assert_eq!(solution.as_deref(), Some("aa"));
    }

    #[test]
    fn select_solution_empty_is_none() {
        assert_eq!(select_solution(&[]), None);
    }

    #[tokio::test]
    async fn duplicate_answers_resolve_to_best_confidence() {
        let pool = crate::db::connect_memory().await.unwrap();
        let t = thread("r", &["c1", "c2"]);
        seed(&pool, std::slice::from_ref(&t)).await;

        let outcome = apply_batch(
            &pool,
            &[
                entry("r", Label::Question, 0.93),
                entry("c1", Label::Answer, 0.9),
                entry("c2", Label::Answer, 0.95),
            ],
            &[t],
        )
        .await
        .unwrap();

        assert_eq!(outcome.inserted, 3);
        assert!(outcome.rejected.is_empty());

        for (_, _, solution) in label_rows(&pool).await {
            assert_eq!(solution.as_deref(), Some("c2"));
        }
    }

    #[tokio::test]
    async fn no_answer_clears_solution() {
        let pool = crate::db::connect_memory().await.unwrap();
        let t = thread("r", &["c1"]);
        seed(&pool, std::slice::from_ref(&t)).await;

        // First batch marks c1 as the answer
        apply_batch(
            &pool,
            &[
                entry("r", Label::Question, 0.9),
                entry("c1", Label::Answer, 0.8),
            ],
            std::slice::from_ref(&t),
        )
        .await
        .unwrap();

        // Relabeling c1 as clarification leaves the thread answerless
        apply_batch(
            &pool,
            &[
                entry("r", Label::Question, 0.9),
                entry("c1", Label::Clarification, 0.7),
            ],
            std::slice::from_ref(&t),
        )
        .await
        .unwrap();

        for (_, _, solution) in label_rows(&pool).await {
            assert_eq!(solution, None);
        }
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_but_batch_lands() {
        let pool = crate::db::connect_memory().await.unwrap();
        let t = thread("r", &["c1"]);
        seed(&pool, std::slice::from_ref(&t)).await;

        let outcome = apply_batch(
            &pool,
            &[
                entry("r", Label::Question, 0.9),
                entry("zzz", Label::Answer, 0.99),
                entry("c1", Label::Answer, 0.8),
            ],
            &[t],
        )
        .await
        .unwrap();

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.rejected, vec!["zzz".to_string()]);

        let rows = label_rows(&pool).await;
        assert_eq!(rows.len(), 2);
        for (_, _, solution) in rows {
            assert_eq!(solution.as_deref(), Some("c1"));
        }
    }

    #[tokio::test]
    async fn reapplying_a_batch_is_idempotent() {
        let pool = crate::db::connect_memory().await.unwrap();
        let t = thread("r", &["c1", "c2"]);
        seed(&pool, std::slice::from_ref(&t)).await;

        let batch = [
            entry("r", Label::Question, 0.93),
            entry("c1", Label::Clarification, 0.6),
            entry("c2", Label::Answer, 0.97),
        ];

        apply_batch(&pool, &batch, std::slice::from_ref(&t)).await.unwrap();
        let first = label_rows(&pool).await;

        apply_batch(&pool, &batch, std::slice::from_ref(&t)).await.unwrap();
        let second = label_rows(&pool).await;

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn recompute_uses_committed_rows_only() {
        let pool = crate::db::connect_memory().await.unwrap();
        let t = thread("r", &["c1", "c2"]);
        seed(&pool, std::slice::from_ref(&t)).await;

        let mut tx = pool.begin().await.unwrap();
        upsert_label(&mut tx, "r", Label::Question, 0.9, true).await.unwrap();
        upsert_label(&mut tx, "c1", Label::Answer, 0.7, true).await.unwrap();
        upsert_label(&mut tx, "c2", Label::Answer, 0.85, true).await.unwrap();
        let solution = recompute_solution(&mut tx, &t.message_ids()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(solution.as_deref(), Some("c2"));
        for (_, _, sol) in label_rows(&pool).await {
            assert_eq!(sol.as_deref(), Some("c2"));
        }
    }
}
