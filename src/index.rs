//! Similarity index over thread-root embeddings.
//!
//! A flat inner-product index: vectors are L2-normalized at build time, so
//! inner product equals cosine similarity and a linear scan returns exact
//! nearest neighbors. The index is an explicitly constructed component —
//! built once, persisted, loaded at process start, and read-only afterwards —
//! so callers inject it and tests can substitute a small hand-built one.
//!
//! # Artifact layout
//!
//! - `<path>` — `u32` LE vector count, `u32` LE dims, then `count × dims`
//!   `f32` LE values in index-position order.
//! - `<path>.ids` — one external message id per line; line number = index
//!   position. Must be rebuilt together with the index whenever embeddings
//!   change.

use anyhow::{bail, Context, Result};
use sqlx::Row;
use std::path::Path;

use crate::config::{Config, IndexConfig};
use crate::db;
use crate::embedding::{blob_to_vec, inner_product, l2_normalize, vec_to_blob};
use crate::models::ScoredId;

pub struct SimilarityIndex {
    dims: usize,
    /// Row-major, `ids.len() × dims`, unit length per row.
    vectors: Vec<f32>,
    ids: Vec<String>,
}

impl SimilarityIndex {
    /// Assemble an index from parallel id/vector lists. Vectors are
    /// normalized here; inconsistent dimensions are an error.
    pub fn from_parts(ids: Vec<String>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if ids.len() != vectors.len() {
            bail!(
                "index id/vector count mismatch: {} ids, {} vectors",
                ids.len(),
                vectors.len()
            );
        }

        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        let mut flat = Vec::with_capacity(ids.len() * dims);

        for (id, mut vec) in ids.iter().zip(vectors.into_iter()) {
            if vec.len() != dims {
                bail!(
                    "embedding for {} has {} dims, expected {}",
                    id,
                    vec.len(),
                    dims
                );
            }
            l2_normalize(&mut vec);
            flat.extend_from_slice(&vec);
        }

        Ok(Self {
            dims,
            vectors: flat,
            ids,
        })
    }

    /// Load thread-root embeddings from the store and assemble the index.
    pub async fn from_store(pool: &sqlx::SqlitePool) -> Result<Self> {
        let rows = sqlx::query(
            r#"
            SELECT m.message_id, e.vector
            FROM messages m
            JOIN embeddings e ON e.message_id = m.message_id
            WHERE m.parent_id IS NULL
            ORDER BY m.created, m.message_id
            "#,
        )
        .fetch_all(pool)
        .await?;

        if rows.is_empty() {
            bail!("no thread-root embeddings found; run `embed pending` first");
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len());
        for row in &rows {
            ids.push(row.get::<String, _>("message_id"));
            let blob: Vec<u8> = row.get("vector");
            vectors.push(blob_to_vec(&blob));
        }

        Self::from_parts(ids, vectors)
    }

    /// Persist the index artifact and its position→id side file.
    pub fn save(&self, index_cfg: &IndexConfig) -> Result<()> {
        if let Some(parent) = index_cfg.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(8 + self.vectors.len() * 4);
        bytes.extend_from_slice(&(self.ids.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&self.vectors));
        std::fs::write(&index_cfg.path, bytes)
            .with_context(|| format!("Failed to write index: {}", index_cfg.path.display()))?;

        let ids_body = self.ids.join("\n") + "\n";
        std::fs::write(index_cfg.ids_path(), ids_body).with_context(|| {
            format!("Failed to write id map: {}", index_cfg.ids_path().display())
        })?;

        Ok(())
    }

    /// Load a previously persisted index. Fails when either file is missing
    /// or the two disagree on entry count.
    pub fn load(index_cfg: &IndexConfig) -> Result<Self> {
        let bytes = read_artifact(&index_cfg.path)?;
        if bytes.len() < 8 {
            bail!("index file too short: {}", index_cfg.path.display());
        }

        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let dims = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

        let expected = 8 + count * dims * 4;
        if bytes.len() != expected {
            bail!(
                "index file corrupt: expected {} bytes for {} × {} vectors, found {}",
                expected,
                count,
                dims,
                bytes.len()
            );
        }

        let vectors = blob_to_vec(&bytes[8..]);

        let ids_raw = std::fs::read_to_string(index_cfg.ids_path()).with_context(|| {
            format!("Failed to read id map: {}", index_cfg.ids_path().display())
        })?;
        let ids: Vec<String> = ids_raw
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        if ids.len() != count {
            bail!(
                "id map out of step with index: {} ids for {} vectors — rebuild with `index build`",
                ids.len(),
                count
            );
        }

        Ok(Self {
            dims,
            vectors,
            ids,
        })
    }

    /// Top-k nearest stored vectors by inner product, descending. The query
    /// is normalized here so callers may pass raw model output.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<ScoredId> {
        if self.ids.is_empty() || query.len() != self.dims || k == 0 {
            return Vec::new();
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<ScoredId> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, id)| {
                let row = &self.vectors[pos * self.dims..(pos + 1) * self.dims];
                ScoredId {
                    message_id: id.clone(),
                    score: inner_product(&q, row),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        scored.truncate(k);
        scored
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    fn vector_at(&self, pos: usize) -> &[f32] {
        &self.vectors[pos * self.dims..(pos + 1) * self.dims]
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read index: {}", path.display()))
}

/// `index build` — assemble from the store and persist both files.
pub async fn run_index_build(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let index = SimilarityIndex::from_store(&pool).await?;
    pool.close().await;

    index.save(&config.index)?;

    println!("index build");
    println!("  thread roots indexed: {}", index.len());
    println!("  dims: {}", index.dims());
    println!("  index: {}", config.index.path.display());
    println!("  id map: {}", config.index.ids_path().display());
    println!("ok");

    Ok(())
}

/// `index verify` — self-query every stored vector and report how many
/// return themselves at rank 0. Anything below 100% means the artifact and
/// the store have drifted apart.
pub async fn run_index_verify(config: &Config) -> Result<()> {
    let index = SimilarityIndex::load(&config.index)?;

    let mut hits = 0usize;
    for pos in 0..index.len() {
        let expected = &index.ids[pos];
        let results = index.search(index.vector_at(pos), 1);
        if results.first().map(|r| &r.message_id) == Some(expected) {
            hits += 1;
        }
    }

    println!("index verify");
    println!("  entries: {}", index.len());
    println!("  rank-0 self hits: {}/{}", hits, index.len());
    if hits == index.len() {
        println!("ok");
    } else {
        println!("stale — rebuild with `index build`");
    }

    Ok(())
}
