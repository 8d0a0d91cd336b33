use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub labeler: LabelerConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    pub index: IndexConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomsConfig {
    #[serde(default = "default_rooms_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rooms: Vec<RoomEntry>,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            base_url: default_rooms_base_url(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            rooms: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomEntry {
    pub room_id: String,
    pub name: String,
}

fn default_rooms_base_url() -> String {
    "https://webexapis.com/v1".to_string()
}
fn default_page_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LabelerConfig {
    #[serde(default = "default_labeler_model")]
    pub model: String,
    /// Threads per classifier call.
    #[serde(default = "default_labeler_batch")]
    pub batch_size: usize,
    /// Fixed delay between batches and after a soft failure.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            model: default_labeler_model(),
            batch_size: default_labeler_batch(),
            retry_delay_secs: default_retry_delay(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_labeler_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_labeler_batch() -> usize {
    5
}
fn default_retry_delay() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Queries with fewer non-stopword tokens than this are asked to clarify.
    #[serde(default = "default_min_keywords")]
    pub min_keywords: usize,
    /// Rephrase the stored answer through the LLM before returning it.
    #[serde(default = "default_rephrase")]
    pub rephrase: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_keywords: default_min_keywords(),
            rephrase: default_rephrase(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_keywords() -> usize {
    3
}
fn default_rephrase() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Index artifact path. The position→message-id map lives at `<path>.ids`.
    pub path: PathBuf,
}

impl IndexConfig {
    pub fn ids_path(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(".ids");
        PathBuf::from(s)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Directory holding the review UI; `GET /` serves `<ui_dir>/index.html`.
    #[serde(default)]
    pub ui_dir: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.rooms.page_size == 0 {
        anyhow::bail!("rooms.page_size must be > 0");
    }

    if config.labeler.batch_size == 0 {
        anyhow::bail!("labeler.batch_size must be > 0");
    }

    if config.assistant.top_k < 1 {
        anyhow::bail!("assistant.top_k must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

/// Read a required API key from the environment. Absence is a startup error
/// for every command that reaches an external service.
pub fn require_env(var: &str) -> Result<String> {
    std::env::var(var)
        .map_err(|_| anyhow::anyhow!("{} environment variable is not set", var))
        .and_then(|v| {
            if v.trim().is_empty() {
                anyhow::bail!("{} environment variable is empty", var)
            } else {
                Ok(v)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/triage.sqlite"

[index]
path = "data/threads.idx"

[server]
bind = "127.0.0.1:7800"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.labeler.batch_size, 5);
        assert_eq!(cfg.assistant.top_k, 5);
        assert!(!cfg.embedding.is_enabled());
        assert_eq!(
            cfg.index.ids_path(),
            PathBuf::from("data/threads.idx.ids")
        );
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/triage.sqlite"

[embedding]
provider = "openai"

[index]
path = "data/threads.idx"

[server]
bind = "127.0.0.1:7800"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn unknown_provider_rejected() {
        let (_dir, path) = write_config(
            r#"
[db]
path = "data/triage.sqlite"

[embedding]
provider = "local"
model = "all-mpnet-base-v2"
dims = 768

[index]
path = "data/threads.idx"

[server]
bind = "127.0.0.1:7800"
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
