//! Query assistant.
//!
//! Embeds a free-text question, searches the similarity index for the
//! nearest prior thread roots, and walks the candidates in descending score
//! order until one has a labeled answer. Optionally passes the stored answer
//! through the LLM to rephrase it for the new question; a failed or
//! unparsable rephrase degrades to the raw stored answer. When no candidate
//! thread has an answer the assistant says so rather than guessing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::index::SimilarityIndex;
use crate::llm::{strip_code_fences, GeminiClient, TextGenerator};

/// The thread the index matched, with its stored answer.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadMatch {
    pub thread_id: String,
    pub thread_question: String,
    pub answer: String,
    pub follow_ups: Vec<String>,
    /// Raw similarity score from the index.
    pub similarity: f32,
}

/// Parsed LLM rephrasing of a stored answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantReply {
    pub response: String,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// What the assistant concluded for one query.
#[derive(Debug)]
pub enum QueryOutcome {
    /// Too few meaningful keywords to search on.
    TooVague,
    /// No indexed thread with a confirmed answer was close enough.
    NoMatch,
    /// A prior thread answers this, optionally rephrased.
    Match {
        matched: ThreadMatch,
        rephrased: Option<AssistantReply>,
    },
}

/// Run the full query path against an already-loaded index.
pub async fn answer_query(
    pool: &SqlitePool,
    index: &SimilarityIndex,
    config: &Config,
    generator: Option<&dyn TextGenerator>,
    query: &str,
) -> Result<QueryOutcome> {
    if is_query_too_vague(query, config.assistant.min_keywords) {
        return Ok(QueryOutcome::TooVague);
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let query_vec = embedding::embed_query(provider.as_ref(), &config.embedding, query).await?;

    let matched = find_thread_match(pool, index, &query_vec, config.assistant.top_k).await?;

    let Some(matched) = matched else {
        return Ok(QueryOutcome::NoMatch);
    };

    let rephrased = match generator {
        Some(generator) if config.assistant.rephrase => {
            rephrase(generator, query, &matched).await
        }
        _ => None,
    };

    Ok(QueryOutcome::Match { matched, rephrased })
}

/// Walk index candidates in descending similarity order and return the first
/// thread that has a committed `answer` row.
pub async fn find_thread_match(
    pool: &SqlitePool,
    index: &SimilarityIndex,
    query_vec: &[f32],
    top_k: usize,
) -> Result<Option<ThreadMatch>> {
    for hit in index.search(query_vec, top_k) {
        let root_text: Option<String> =
            sqlx::query_scalar("SELECT text FROM messages WHERE message_id = ?")
                .bind(&hit.message_id)
                .fetch_optional(pool)
                .await?;

        let Some(thread_question) = root_text else {
            eprintln!(
                "Warning: index entry {} has no stored message, skipping",
                hit.message_id
            );
            continue;
        };

        let rows = sqlx::query(
            r#"
            SELECT m.text, tl.label
            FROM messages m
            LEFT JOIN thread_labels tl ON tl.message_id = m.message_id
            WHERE m.parent_id = ?
            ORDER BY m.created, m.message_id
            "#,
        )
        .bind(&hit.message_id)
        .fetch_all(pool)
        .await?;

        let mut answer: Option<String> = None;
        let mut follow_ups: Vec<String> = Vec::new();

        for row in &rows {
            let text: String = row.get("text");
            let label: Option<String> = row.get("label");
            match label.as_deref() {
                Some("answer") if answer.is_none() => answer = Some(text),
                Some("answer") | Some("clarification") => follow_ups.push(text),
                _ => {}
            }
        }

        if let Some(answer) = answer {
            return Ok(Some(ThreadMatch {
                thread_id: hit.message_id,
                thread_question,
                answer,
                follow_ups,
                similarity: hit.score,
            }));
        }
    }

    Ok(None)
}

/// Ask the LLM to fit the stored answer to the new question. Errors and
/// malformed replies degrade to `None`; the caller still has the raw answer.
pub async fn rephrase(
    generator: &dyn TextGenerator,
    query: &str,
    matched: &ThreadMatch,
) -> Option<AssistantReply> {
    let prompt = build_rephrase_prompt(query, matched);

    let raw = match generator.generate(&prompt).await {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Warning: rephrase call failed: {}", e);
            return None;
        }
    };

    match serde_json::from_str::<AssistantReply>(strip_code_fences(&raw)) {
        Ok(reply) => Some(reply),
        Err(e) => {
            eprintln!("Warning: could not parse rephrase reply: {}", e);
            None
        }
    }
}

fn build_rephrase_prompt(query: &str, matched: &ThreadMatch) -> String {
    let mut prompt = String::from(
        "You are a helpful AI support assistant.\n\n\
         You will be given a user's question and a possibly related past support \
         answer (which may contain personal names, links, or escalation suggestions).\n\n\
         Assess how well the past answer fits the new question:\n\
         1. Strong match: rewrite it cleanly and professionally, keep helpful links, \
         omit personal names and escalation text.\n\
         2. Somewhat related: say it may not be exactly what they are looking for, \
         but include any useful info.\n\
         3. Irrelevant: respond as if you are the first person assisting and politely \
         ask for clarification.\n\n\
         Do not mention past threads or that this is a rephrased answer. Reply naturally.\n\n\
         Return valid JSON: {\"response\": \"...\", \"confidence_score\": 0.73, \
         \"reasoning\": \"why the past answer was or was not relevant\"}\n\
         The confidence_score must be close to 1.0 for strong matches, 0.4-0.6 for \
         partial relevance, and below 0.4 if the answer is mostly irrelevant.\n\n---\n\n",
    );

    prompt.push_str(&format!("User's question:\n{}\n\n", query.trim()));
    prompt.push_str(&format!(
        "Possible answer from past support:\n{}\n",
        matched.answer.trim()
    ));

    if !matched.follow_ups.is_empty() {
        prompt.push_str("\nOther notes from the thread:\n");
        for note in &matched.follow_ups {
            prompt.push_str(&format!("- {}\n", note.trim()));
        }
    }

    prompt.push_str(
        "\nNow write your final reply to the user, with confidence_score and reasoning as described.",
    );

    prompt
}

/// A query with too few non-stopword tokens cannot be searched meaningfully.
pub fn is_query_too_vague(query: &str, min_keywords: usize) -> bool {
    const STOPWORDS: &[&str] = &[
        "the", "is", "in", "on", "of", "to", "a", "and", "what", "how", "why", "when", "need",
        "some", "information",
    ];

    let keywords = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .count();

    keywords < min_keywords
}

/// `query "<text>"` — CLI entry point.
pub async fn run_query(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    no_rephrase: bool,
) -> Result<()> {
    let mut config = config.clone();
    if let Some(k) = top_k {
        config.assistant.top_k = k;
    }
    if no_rephrase {
        config.assistant.rephrase = false;
    }

    let index = SimilarityIndex::load(&config.index)?;
    let pool = db::connect(&config).await?;

    let generator = if config.assistant.rephrase {
        Some(GeminiClient::new(
            &config.labeler.model,
            config.labeler.max_retries,
            config.labeler.timeout_secs,
        )?)
    } else {
        None
    };

    let outcome = answer_query(
        &pool,
        &index,
        &config,
        generator.as_ref().map(|g| g as &dyn TextGenerator),
        query,
    )
    .await?;

    match outcome {
        QueryOutcome::TooVague => {
            println!(
                "Your question seems a bit unclear. Could you provide more details so I can help better?"
            );
        }
        QueryOutcome::NoMatch => {
            println!("no relevant thread found");
        }
        QueryOutcome::Match { matched, rephrased } => {
            println!("matched thread: {}", matched.thread_id);
            println!("  similarity: {:.4}", matched.similarity);
            println!("  question: {}", matched.thread_question.replace('\n', " "));
            println!("  stored answer: {}", matched.answer.replace('\n', " "));
            for note in &matched.follow_ups {
                println!("  note: {}", note.replace('\n', " "));
            }
            if let Some(reply) = rephrased {
                println!();
                println!("assistant: {}", reply.response);
                println!("  confidence: {:.2}", reply.confidence_score);
                if !reply.reasoning.is_empty() {
                    println!("  reasoning: {}", reply.reasoning);
                }
            }
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedGenerator;

    #[test]
    fn vague_queries_are_flagged() {
        assert!(is_query_too_vague("what is the", 3));
        assert!(is_query_too_vague("need some information", 3));
        assert!(!is_query_too_vague("vpn certificate renewal failing", 3));
    }

    async fn seed_thread_with_labels(
        pool: &SqlitePool,
        root: &str,
        children: &[(&str, Option<&str>)],
    ) {
        sqlx::query("INSERT OR IGNORE INTO spaces (room_id, space_name) VALUES ('room-1', 'Test')")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO messages (id, space_id, message_id, person_id, person_email, text, created)
             VALUES (?, 'room-1', ?, 'p', 'p@example.com', ?, 1)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(root)
        .bind(format!("question in {}", root))
        .execute(pool)
        .await
        .unwrap();

        for (i, (child, label)) in children.iter().enumerate() {
            sqlx::query(
                "INSERT INTO messages (id, space_id, message_id, parent_id, person_id, person_email, text, created)
                 VALUES (?, 'room-1', ?, ?, 'p', 'p@example.com', ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(child)
            .bind(root)
            .bind(format!("text of {}", child))
            .bind(i as i64 + 2)
            .execute(pool)
            .await
            .unwrap();

            if let Some(label) = label {
                sqlx::query(
                    "INSERT INTO thread_labels (message_id, label, confidence_score) VALUES (?, ?, 0.9)",
                )
                .bind(child)
                .bind(label)
                .execute(pool)
                .await
                .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn first_answered_candidate_wins() {
        let pool = crate::db::connect_memory().await.unwrap();
        // r1 is the closest match but has no answer; r2 does
        seed_thread_with_labels(&pool, "r1", &[("r1c1", Some("clarification"))]).await;
        seed_thread_with_labels(
            &pool,
            "r2",
            &[("r2c1", Some("clarification")), ("r2c2", Some("answer"))],
        )
        .await;

        let index = SimilarityIndex::from_parts(
            vec!["r1".to_string(), "r2".to_string()],
            vec![vec![1.0, 0.0], vec![0.9, 0.1]],
        )
        .unwrap();

        let matched = find_thread_match(&pool, &index, &[1.0, 0.0], 5)
            .await
            .unwrap()
            .expect("should fall through to r2");

        assert_eq!(matched.thread_id, "r2");
        assert_eq!(matched.answer, "text of r2c2");
        assert_eq!(matched.thread_question, "question in r2");
        assert_eq!(matched.follow_ups, vec!["text of r2c1".to_string()]);
    }

    #[tokio::test]
    async fn no_answered_candidate_means_no_match() {
        let pool = crate::db::connect_memory().await.unwrap();
        seed_thread_with_labels(&pool, "r1", &[("c1", Some("clarification"))]).await;

        let index =
            SimilarityIndex::from_parts(vec!["r1".to_string()], vec![vec![1.0, 0.0]]).unwrap();

        let matched = find_thread_match(&pool, &index, &[1.0, 0.0], 5).await.unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn empty_index_means_no_match() {
        let pool = crate::db::connect_memory().await.unwrap();
        let index = SimilarityIndex::from_parts(vec![], vec![]).unwrap();
        let matched = find_thread_match(&pool, &index, &[], 5).await.unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn rephrase_parses_fenced_json_and_degrades_on_garbage() {
        let matched = ThreadMatch {
            thread_id: "r1".to_string(),
            thread_question: "q".to_string(),
            answer: "restart the agent".to_string(),
            follow_ups: vec![],
            similarity: 0.8,
        };

        let generator = ScriptedGenerator::new(vec![
            Ok("```json\n{\"response\": \"Try restarting the agent.\", \
                \"confidence_score\": 0.85, \"reasoning\": \"direct match\"}\n```"
                .to_string()),
            Ok("sure, here you go!".to_string()),
        ]);

        let reply = rephrase(&generator, "agent stuck", &matched).await.unwrap();
        assert_eq!(reply.response, "Try restarting the agent.");
        assert!((reply.confidence_score - 0.85).abs() < 1e-9);

        assert!(rephrase(&generator, "agent stuck", &matched).await.is_none());
    }
}
