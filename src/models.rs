//! Core data models used throughout thread-triage.
//!
//! These types represent the spaces, messages, labels, and classifier output
//! that flow through the ingestion, labeling, and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw message produced by a connector before storage.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageItem {
    /// Externally issued message id.
    #[serde(rename = "id")]
    pub message_id: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(rename = "personId")]
    pub person_id: String,
    #[serde(rename = "personEmail")]
    pub person_email: String,
    #[serde(default)]
    pub text: Option<String>,
    pub created: DateTime<Utc>,
}

/// Stored message row. `parent_id == None` means this message is a thread root.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub space_id: String,
    pub parent_id: Option<String>,
    pub person_id: String,
    pub person_email: String,
    pub text: String,
    /// Unix seconds.
    pub created: i64,
}

/// The label set the classifier chooses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Question,
    Answer,
    Clarification,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Question => "question",
            Label::Answer => "answer",
            Label::Clarification => "clarification",
        }
    }

    pub fn parse(s: &str) -> Option<Label> {
        match s {
            "question" => Some(Label::Question),
            "answer" => Some(Label::Answer),
            "clarification" => Some(Label::Clarification),
            _ => None,
        }
    }
}

/// Stored per-message label row.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadLabel {
    pub message_id: String,
    pub label: String,
    pub confidence_score: Option<f64>,
    pub solution_message_id: Option<String>,
    pub reviewed: bool,
}

/// One entry of a classifier reply: a label assignment for a single message.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelEntry {
    pub message_id: String,
    pub label: Label,
    #[serde(default = "default_confidence")]
    pub confidence_score: f64,
}

fn default_confidence() -> f64 {
    0.95
}

/// A thread: the root message plus its children, ordered by creation time.
#[derive(Debug, Clone)]
pub struct Thread {
    pub root: Message,
    pub children: Vec<Message>,
}

impl Thread {
    /// Root id followed by every child id, in thread order.
    pub fn message_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(1 + self.children.len());
        ids.push(self.root.message_id.clone());
        ids.extend(self.children.iter().map(|m| m.message_id.clone()));
        ids
    }
}

/// A similarity-index hit: an external message id with its raw score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub message_id: String,
    pub score: f32,
}
