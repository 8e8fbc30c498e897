use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::{
    like_pattern, now_rfc3339, open_connection, open_in_memory, StoreError, StoreResult,
};

pub const DEFAULT_DOMAIN: &str = "general";

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    pub term: String,
    pub translation: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TermEntry {
    pub fn new(term: impl Into<String>, translation: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            translation: translation.into(),
            domain: default_domain(),
            notes: String::new(),
            created_at: None,
            updated_at: None,
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS terminology (
    term TEXT PRIMARY KEY,
    translation TEXT NOT NULL,
    domain TEXT NOT NULL DEFAULT 'general',
    notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_terminology_domain ON terminology(domain);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO terminology (term, translation, domain, notes, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?5)
ON CONFLICT(term) DO UPDATE SET
    translation = excluded.translation,
    domain = excluded.domain,
    notes = excluded.notes,
    updated_at = excluded.updated_at
"#;

const COLUMNS: &str = "term, translation, domain, notes, created_at, updated_at";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<TermEntry> {
    Ok(TermEntry {
        term: row.get(0)?,
        translation: row.get(1)?,
        domain: row.get(2)?,
        notes: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Term dictionary. Identity is the exact `term` string.
pub struct TermStore {
    conn: Mutex<Connection>,
}

impl TermStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::with_connection(open_connection(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn write_one(conn: &Connection, entry: &TermEntry, now: &str) -> StoreResult<()> {
        let term = entry.term.trim();
        let translation = entry.translation.trim();
        if term.is_empty() || translation.is_empty() {
            return Err(StoreError::EmptyTerm);
        }
        let domain = match entry.domain.trim() {
            "" => DEFAULT_DOMAIN,
            d => d,
        };
        conn.prepare_cached(UPSERT_SQL)?
            .execute(params![term, translation, domain, entry.notes.trim(), now])?;
        Ok(())
    }

    pub fn add(&self, entry: &TermEntry) -> StoreResult<()> {
        let conn = self.conn()?;
        Self::write_one(&conn, entry, &now_rfc3339())
    }

    /// Returns `(success, failed)`.
    pub fn add_batch(&self, entries: &[TermEntry]) -> StoreResult<(usize, usize)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let (mut ok, mut failed) = (0usize, 0usize);
        for entry in entries {
            match Self::write_one(&tx, entry, &now) {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(term = %entry.term, "term write failed: {e}");
                    failed += 1;
                }
            }
        }
        tx.commit()?;
        Ok((ok, failed))
    }

    pub fn delete(&self, term: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM terminology WHERE term = ?1", params![term])? > 0)
    }

    pub fn get(&self, term: &str) -> StoreResult<Option<TermEntry>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {COLUMNS} FROM terminology WHERE term = ?1");
        Ok(conn.query_row(&sql, params![term], row_to_entry).optional()?)
    }

    /// Substring search over term and translation, optionally within a domain.
    pub fn list(&self, search: Option<&str>, domain: Option<&str>) -> StoreResult<Vec<TermEntry>> {
        let search = search.filter(|s| !s.is_empty()).map(like_pattern);
        let domain = domain.filter(|d| !d.is_empty());
        let sql = format!(
            "SELECT {COLUMNS} FROM terminology \
             WHERE (?1 IS NULL OR term LIKE ?1 ESCAPE '\\' OR translation LIKE ?1 ESCAPE '\\') \
             AND (?2 IS NULL OR domain = ?2) \
             ORDER BY term"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![search, domain], row_to_entry)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn all(&self) -> StoreResult<Vec<TermEntry>> {
        self.list(None, None)
    }

    pub fn count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM terminology", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}
