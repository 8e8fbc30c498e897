//! Semantic tier: nearest-neighbour lookup over original text.
//!
//! Entries hold only the key, the original text and the file name. Vectors
//! come from an [`Embedder`] and are compared by cosine distance.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::db::{now_rfc3339, open_connection, open_in_memory, StoreError, StoreResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimilarEntry {
    pub translation_key: String,
    pub original_text: String,
    pub file_name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimilarHit {
    pub translation_key: String,
    pub original_text: String,
    /// Cosine distance in `[0, 2]`; `0` is identical.
    pub distance: f32,
}

pub trait SimilarityIndex: Send + Sync {
    fn upsert(&self, entry: &SimilarEntry) -> StoreResult<()>;
    /// Returns `(success, failed)`.
    fn upsert_batch(&self, entries: &[SimilarEntry]) -> StoreResult<(usize, usize)>;
    /// Closest entries first.
    fn query(&self, text: &str, max_results: usize) -> StoreResult<Vec<SimilarHit>>;
    fn get(&self, key: &str) -> StoreResult<Option<SimilarEntry>>;
    /// Cosine distance from `text` to the stored entry `key`, if present.
    fn distance_to(&self, text: &str, key: &str) -> StoreResult<Option<f32>>;
    fn delete(&self, key: &str) -> StoreResult<bool>;
    /// Returns the number of entries removed.
    fn delete_batch(&self, keys: &[String]) -> StoreResult<usize>;
    fn count(&self) -> StoreResult<usize>;
}

/// Maps text to a unit-length vector.
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Hashed character-trigram embedding. Deterministic and dependency-free,
/// good enough for "similar past translation" hints.
#[derive(Clone, Debug)]
pub struct NgramEmbedder {
    dims: usize,
}

impl NgramEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for NgramEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

fn fnv1a(chars: &[char]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for ch in chars {
        let mut buf = [0u8; 4];
        for b in ch.encode_utf8(&mut buf).bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

impl Embedder for NgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        let normalized: Vec<char> = std::iter::once(' ')
            .chain(text.split_whitespace().flat_map(|w| w.chars().chain(std::iter::once(' '))))
            .flat_map(char::to_lowercase)
            .collect();
        if normalized.len() < 3 {
            if let Some(slot) = v.get_mut((fnv1a(&normalized) % self.dims as u64) as usize) {
                *slot += 1.0;
            }
        } else {
            for gram in normalized.windows(3) {
                let idx = (fnv1a(gram) % self.dims as u64) as usize;
                v[idx] += 1.0;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn from_blob(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 2.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).clamp(0.0, 2.0)
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vectors (
    translation_key TEXT PRIMARY KEY,
    original_text TEXT NOT NULL,
    file_name TEXT NOT NULL DEFAULT '',
    embedding BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO vectors (translation_key, original_text, file_name, embedding, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(translation_key) DO UPDATE SET
    original_text = excluded.original_text,
    file_name = excluded.file_name,
    embedding = excluded.embedding,
    updated_at = excluded.updated_at
"#;

/// Brute-force cosine index persisted in SQLite.
pub struct SqliteVectorIndex {
    embedder: Box<dyn Embedder>,
    conn: Mutex<Connection>,
}

impl SqliteVectorIndex {
    pub fn open(path: &Path, embedder: Box<dyn Embedder>) -> StoreResult<Self> {
        Self::with_connection(open_connection(path)?, embedder)
    }

    pub fn open_in_memory(embedder: Box<dyn Embedder>) -> StoreResult<Self> {
        Self::with_connection(open_in_memory()?, embedder)
    }

    fn with_connection(conn: Connection, embedder: Box<dyn Embedder>) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            embedder,
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn write_one(&self, conn: &Connection, entry: &SimilarEntry, now: &str) -> StoreResult<()> {
        if entry.translation_key.is_empty() {
            return Err(StoreError::MissingKey);
        }
        let blob = to_blob(&self.embedder.embed(&entry.original_text));
        let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
        stmt.execute(params![
            entry.translation_key,
            entry.original_text,
            entry.file_name,
            blob,
            now
        ])?;
        Ok(())
    }
}

impl SimilarityIndex for SqliteVectorIndex {
    fn upsert(&self, entry: &SimilarEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        self.write_one(&conn, entry, &now_rfc3339())
    }

    fn upsert_batch(&self, entries: &[SimilarEntry]) -> StoreResult<(usize, usize)> {
        if entries.is_empty() {
            return Ok((0, 0));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let (mut ok, mut failed) = (0usize, 0usize);
        for entry in entries {
            match self.write_one(&tx, entry, &now) {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(key = %entry.translation_key, "vector upsert failed: {e}");
                    failed += 1;
                }
            }
        }
        tx.commit()?;
        Ok((ok, failed))
    }

    fn query(&self, text: &str, max_results: usize) -> StoreResult<Vec<SimilarHit>> {
        if max_results == 0 {
            return Ok(Vec::new());
        }
        let probe = self.embedder.embed(text);
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT translation_key, original_text, embedding FROM vectors")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (translation_key, original_text, blob) = row?;
            let distance = cosine_distance(&probe, &from_blob(&blob));
            hits.push(SimilarHit {
                translation_key,
                original_text,
                distance,
            });
        }
        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.translation_key.cmp(&b.translation_key))
        });
        hits.truncate(max_results);
        debug!(candidates = hits.len(), "vector query");
        Ok(hits)
    }

    fn get(&self, key: &str) -> StoreResult<Option<SimilarEntry>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT translation_key, original_text, file_name FROM vectors \
                 WHERE translation_key = ?1",
                params![key],
                |row| {
                    Ok(SimilarEntry {
                        translation_key: row.get(0)?,
                        original_text: row.get(1)?,
                        file_name: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    fn distance_to(&self, text: &str, key: &str) -> StoreResult<Option<f32>> {
        let probe = self.embedder.embed(text);
        let conn = self.conn()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM vectors WHERE translation_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| cosine_distance(&probe, &from_blob(&b))))
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM vectors WHERE translation_key = ?1", params![key])? > 0)
    }

    fn delete_batch(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0usize;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM vectors WHERE translation_key = ?1")?;
            for key in keys {
                removed += stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}
