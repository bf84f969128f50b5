
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Chunk, CorpusId, IndexBuilder, IndexGeneration};

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    corpus: CorpusId,
    dimension: usize,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

#[inline]
pub fn snapshot_path(dir: &Path, corpus: CorpusId) -> PathBuf {
    dir.join(format!("{corpus}.json"))
}

/// Write `generation` to `<dir>/<corpus>.json`, replacing any previous file
/// only once the new one is complete.
pub fn save(dir: &Path, corpus: CorpusId, generation: &IndexGeneration) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory: {}", dir.display()))?;

    let snapshot = Snapshot {
        corpus,
        dimension: generation.dimension(),
        chunks: generation.chunks().to_vec(),
        vectors: generation.vectors().iter().map(<[f32]>::to_vec).collect(),
    };
    let content = serde_json::to_vec(&snapshot).context("Failed to serialize snapshot")?;

    let path = snapshot_path(dir, corpus);
    let mut file = tempfile::NamedTempFile::new_in(dir)
        .context("Failed to create temporary snapshot file")?;
    file.write_all(&content)
        .context("Failed to write snapshot")?;
    file.persist(&path)
        .with_context(|| format!("Failed to replace snapshot: {}", path.display()))?;

    debug!(
        "Saved {} corpus snapshot ({} chunks) to {}",
        corpus,
        snapshot.chunks.len(),
        path.display()
    );
    Ok(path)
}

/// Load a saved generation. Missing snapshots yield `None`; so do snapshots
/// written for another embedding dimension, which are discarded.
pub fn load(dir: &Path, corpus: CorpusId, dimension: usize) -> Result<Option<IndexGeneration>> {
    let path = snapshot_path(dir, corpus);
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read(&path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

    if snapshot.dimension != dimension {
        warn!(
            "Discarding {} snapshot: built for {} dimensions, service uses {}",
            corpus, snapshot.dimension, dimension
        );
        return Ok(None);
    }

    if snapshot.chunks.len() != snapshot.vectors.len() {
        anyhow::bail!(
            "Snapshot {} has {} chunks but {} vectors",
            path.display(),
            snapshot.chunks.len(),
            snapshot.vectors.len()
        );
    }

    let mut builder = IndexBuilder::new(dimension);
    for (chunk, vector) in snapshot.chunks.into_iter().zip(&snapshot.vectors) {
        builder
            .push(chunk, vector)
            .with_context(|| format!("Invalid vector in snapshot {}", path.display()))?;
    }

    debug!("Loaded {} corpus snapshot ({} chunks)", corpus, builder.len());
    Ok(Some(builder.build()))
}
