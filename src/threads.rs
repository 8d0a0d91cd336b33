//! Thread assembly.
//!
//! A thread is a root message (no parent) plus every message whose parent id
//! equals the root's external message id, children ordered by creation time.
//! A parentless message with no replies is still a thread of one.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::models::{Message, Thread};

/// Group a flat message list into threads. Children whose parent id is not
/// present in the input are skipped with a warning; the store-level invariant
/// makes those ingestion bugs, not reasons to crash.
pub fn assemble(messages: &[Message]) -> Vec<Thread> {
    let mut roots: Vec<&Message> = Vec::new();
    let mut children: HashMap<&str, Vec<&Message>> = HashMap::new();

    for msg in messages {
        match msg.parent_id.as_deref() {
            None => roots.push(msg),
            Some(parent) => children.entry(parent).or_default().push(msg),
        }
    }

    let root_ids: std::collections::HashSet<&str> =
        roots.iter().map(|m| m.message_id.as_str()).collect();
    for parent in children.keys() {
        if !root_ids.contains(parent) {
            eprintln!("Warning: skipping replies to unknown root message {}", parent);
        }
    }

    roots.sort_by(|a, b| a.created.cmp(&b.created).then(a.message_id.cmp(&b.message_id)));

    roots
        .into_iter()
        .map(|root| {
            let mut kids: Vec<Message> = children
                .get(root.message_id.as_str())
                .map(|v| v.iter().map(|m| (*m).clone()).collect())
                .unwrap_or_default();
            kids.sort_by(|a, b| a.created.cmp(&b.created).then(a.message_id.cmp(&b.message_id)));
            Thread {
                root: root.clone(),
                children: kids,
            }
        })
        .collect()
}

/// Load one thread from the store: the root plus its children in creation
/// order. Returns `None` when no message with the given id exists.
pub async fn fetch_thread(pool: &SqlitePool, root_id: &str) -> Result<Option<Thread>> {
    let root_row = sqlx::query(
        "SELECT message_id, space_id, parent_id, person_id, person_email, text, created
         FROM messages WHERE message_id = ?",
    )
    .bind(root_id)
    .fetch_optional(pool)
    .await?;

    let Some(root_row) = root_row else {
        return Ok(None);
    };

    let child_rows = sqlx::query(
        "SELECT message_id, space_id, parent_id, person_id, person_email, text, created
         FROM messages WHERE parent_id = ? ORDER BY created ASC, message_id ASC",
    )
    .bind(root_id)
    .fetch_all(pool)
    .await?;

    Ok(Some(Thread {
        root: row_to_message(&root_row),
        children: child_rows.iter().map(row_to_message).collect(),
    }))
}

/// All messages of a space (or of every space), for the grouped thread view.
pub async fn fetch_messages(pool: &SqlitePool, space_id: Option<&str>) -> Result<Vec<Message>> {
    let rows = match space_id {
        Some(space) => {
            sqlx::query(
                "SELECT message_id, space_id, parent_id, person_id, person_email, text, created
                 FROM messages WHERE space_id = ? ORDER BY created ASC, message_id ASC",
            )
            .bind(space)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT message_id, space_id, parent_id, person_id, person_email, text, created
                 FROM messages ORDER BY created ASC, message_id ASC",
            )
            .fetch_all(pool)
            .await?
        }
    };

    Ok(rows.iter().map(row_to_message).collect())
}

/// External ids of every member of the thread rooted at `root_id` (root
/// included), or an empty set when the root does not exist.
pub async fn fetch_thread_member_ids(
    pool: &SqlitePool,
    root_id: &str,
) -> Result<std::collections::HashSet<String>> {
    let rows = sqlx::query(
        "SELECT message_id FROM messages WHERE message_id = ? OR parent_id = ?",
    )
    .bind(root_id)
    .bind(root_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| r.get::<String, _>("message_id")).collect())
}

pub(crate) fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    Message {
        message_id: row.get("message_id"),
        space_id: row.get("space_id"),
        parent_id: row.get("parent_id"),
        person_id: row.get("person_id"),
        person_email: row.get("person_email"),
        text: row.get("text"),
        created: row.get("created"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, parent: Option<&str>, created: i64) -> Message {
        Message {
            message_id: id.to_string(),
            space_id: "room-1".to_string(),
            parent_id: parent.map(|p| p.to_string()),
            person_id: "p1".to_string(),
            person_email: "p1@example.com".to_string(),
            text: format!("text of {}", id),
            created,
        }
    }

    #[test]
    fn parentless_message_is_a_root_without_children() {
        let threads = assemble(&[msg("solo", None, 10)]);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].root.message_id, "solo");
        assert!(threads[0].children.is_empty());
    }

    #[test]
    fn children_ordered_by_creation_time() {
        let threads = assemble(&[
            msg("root", None, 1),
            msg("late", Some("root"), 30),
            msg("early", Some("root"), 10),
            msg("mid", Some("root"), 20),
        ]);
        assert_eq!(threads.len(), 1);
        let order: Vec<&str> = threads[0]
            .children
            .iter()
            .map(|m| m.message_id.as_str())
            .collect();
        assert_eq!(order, vec!["early", "mid", "late"]);
    }

    #[test]
    fn multiple_roots_sorted_by_creation() {
        let threads = assemble(&[
            msg("r2", None, 20),
            msg("r1", None, 10),
            msg("c1", Some("r1"), 15),
        ]);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].root.message_id, "r1");
        assert_eq!(threads[0].children.len(), 1);
        assert_eq!(threads[1].root.message_id, "r2");
    }

    #[test]
    fn orphan_children_are_skipped() {
        let threads = assemble(&[msg("root", None, 1), msg("orphan", Some("gone"), 5)]);
        assert_eq!(threads.len(), 1);
        assert!(threads[0].children.is_empty());
    }

    #[test]
    fn message_ids_lists_root_first() {
        let threads = assemble(&[
            msg("root", None, 1),
            msg("a", Some("root"), 2),
            msg("b", Some("root"), 3),
        ]);
        assert_eq!(threads[0].message_ids(), vec!["root", "a", "b"]);
    }

    #[tokio::test]
    async fn fetch_thread_roundtrip() {
        let pool = crate::db::connect_memory().await.unwrap();
        sqlx::query("INSERT INTO spaces (room_id, space_name) VALUES ('room-1', 'Test Space')")
            .execute(&pool)
            .await
            .unwrap();
        for (id, parent, created) in [
            ("root", None::<&str>, 1i64),
            ("c2", Some("root"), 3),
            ("c1", Some("root"), 2),
        ] {
            sqlx::query(
                "INSERT INTO messages (id, space_id, message_id, parent_id, person_id, person_email, text, created)
                 VALUES (?, 'room-1', ?, ?, 'p', 'p@example.com', 'hi', ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(id)
            .bind(parent)
            .bind(created)
            .execute(&pool)
            .await
            .unwrap();
        }

        let thread = fetch_thread(&pool, "root").await.unwrap().unwrap();
        assert_eq!(thread.root.message_id, "root");
        assert_eq!(
            thread.children.iter().map(|m| m.message_id.as_str()).collect::<Vec<_>>(),
            vec!["c1", "c2"]
        );

        assert!(fetch_thread(&pool, "missing").await.unwrap().is_none());

        let members = fetch_thread_member_ids(&pool, "root").await.unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.contains("c1"));
    }
}
