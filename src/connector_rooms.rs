//! Rooms-API connector.
//!
//! Pulls messages for a room from the messaging service's REST API:
//! bearer-token auth, `max`/`since` query parameters, and RFC 5988
//! `Link: <...>; rel="next"` pagination. The token comes from the
//! `ROOMS_API_TOKEN` environment variable.
//!
//! A second source, [`load_archive`], reads the same `{"items": [...]}`
//! payload shape from a local JSON export so the pipeline can be run
//! without network access.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;

use crate::config::{require_env, RoomsConfig};
use crate::models::MessageItem;

pub struct RoomsClient {
    base_url: String,
    token: String,
    page_size: usize,
    client: reqwest::Client,
}

impl RoomsClient {
    pub fn new(config: &RoomsConfig) -> Result<Self> {
        let token = require_env("ROOMS_API_TOKEN")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            page_size: config.page_size,
            client,
        })
    }

    /// Fetch all messages of a room created after `since`, walking the
    /// pagination chain until exhausted or until a page falls entirely
    /// behind the cutoff.
    pub async fn fetch_messages(
        &self,
        room_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageItem>> {
        let mut url = format!(
            "{}/messages?roomId={}&max={}",
            self.base_url, room_id, self.page_size
        );
        if let Some(since) = since {
            url.push_str(&format!("&since={}", since.format("%Y-%m-%dT%H:%M:%SZ")));
        }

        let mut items = Vec::new();
        let mut next = Some(url);

        while let Some(page_url) = next.take() {
            let response = self
                .client
                .get(&page_url)
                .header("Authorization", format!("Bearer {}", self.token))
                .send()
                .await
                .with_context(|| format!("rooms API request failed: {}", page_url))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("rooms API returned {}: {}", status, body);
            }

            let link_header = response
                .headers()
                .get("Link")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let page: serde_json::Value = response.json().await?;
            let mut page_items = parse_items(&page)?;

            if page_items.is_empty() {
                break;
            }

            // Pages run newest-first; once everything on a page predates the
            // cutoff there is nothing further back worth fetching.
            if let Some(since) = since {
                page_items.retain(|item| item.created > since);
                if page_items.is_empty() {
                    break;
                }
            }

            items.extend(page_items);
            next = link_header.as_deref().and_then(parse_next_link);
        }

        Ok(items)
    }
}

/// Extract message items from an API page or archive document: either a bare
/// JSON array or an object with an `items` array.
pub fn parse_items(doc: &serde_json::Value) -> Result<Vec<MessageItem>> {
    let array = if doc.is_array() {
        doc.clone()
    } else if let Some(items) = doc.get("items") {
        items.clone()
    } else {
        bail!("expected a JSON array or an object with an 'items' array");
    };

    let items: Vec<MessageItem> = serde_json::from_value(array)?;
    Ok(items)
}

/// Pull the `rel="next"` target out of an RFC 5988 `Link` header.
pub fn parse_next_link(header: &str) -> Option<String> {
    for part in header.split(',') {
        let mut sections = part.split(';');
        let url = sections.next()?.trim();
        let is_next = sections.any(|s| {
            let s = s.trim();
            s == "rel=\"next\"" || s == "rel=next"
        });
        if is_next {
            return Some(url.trim_start_matches('<').trim_end_matches('>').to_string());
        }
    }
    None
}

/// Read a local JSON export holding the same payload shape as the API.
pub fn load_archive(path: &Path) -> Result<Vec<MessageItem>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read archive file: {}", path.display()))?;
    let doc: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Archive is not valid JSON: {}", path.display()))?;
    parse_items(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_link_extracted() {
        let header = r#"<https://api.example.com/v1/messages?cursor=abc>; rel="next""#;
        assert_eq!(
            parse_next_link(header).as_deref(),
            Some("https://api.example.com/v1/messages?cursor=abc")
        );
    }

    #[test]
    fn next_link_among_multiple_rels() {
        let header = r#"<https://x/prev>; rel="prev", <https://x/next>; rel="next""#;
        assert_eq!(parse_next_link(header).as_deref(), Some("https://x/next"));
    }

    #[test]
    fn no_next_link_is_none() {
        assert_eq!(parse_next_link(r#"<https://x/prev>; rel="prev""#), None);
        assert_eq!(parse_next_link(""), None);
    }

    #[test]
    fn parse_items_accepts_wrapped_and_bare() {
        let wrapped = serde_json::json!({
            "items": [{
                "id": "m1",
                "roomId": "room-1",
                "personId": "p1",
                "personEmail": "p1@example.com",
                "text": "hello",
                "created": "2025-03-01T12:00:00Z"
            }]
        });
        let items = parse_items(&wrapped).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].message_id, "m1");
        assert_eq!(items[0].parent_id, None);

        let bare = serde_json::json!([{
            "id": "m2",
            "roomId": "room-1",
            "parentId": "m1",
            "personId": "p2",
            "personEmail": "p2@example.com",
            "text": "hi back",
            "created": "2025-03-01T12:05:00Z"
        }]);
        let items = parse_items(&bare).unwrap();
        assert_eq!(items[0].parent_id.as_deref(), Some("m1"));
    }

    #[test]
    fn parse_items_rejects_other_shapes() {
        assert!(parse_items(&serde_json::json!({"messages": []})).is_err());
    }

    #[test]
    fn archive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        std::fs::write(
            &path,
            r#"{"items": [{"id": "m1", "roomId": "r", "personId": "p",
                "personEmail": "p@example.com", "text": "t",
                "created": "2025-01-15T08:30:00Z"}]}"#,
        )
        .unwrap();

        let items = load_archive(&path).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].created.timestamp(), 1736929800);
    }
}
