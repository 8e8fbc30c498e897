//! Exact tier: authoritative translation records keyed by `translation_key`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::db::{
    like_pattern, now_rfc3339, open_connection, open_in_memory, StoreError, StoreResult,
};
use crate::unit::TranslationUnit;

/// Substring filters over text columns plus an exact approval filter.
#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    pub file_name: Option<String>,
    pub original_text: Option<String>,
    pub translation: Option<String>,
    pub context: Option<String>,
    pub approved_text: Option<String>,
    pub approved: Option<bool>,
}

pub trait RecordStore: Send + Sync {
    fn upsert(&self, unit: &TranslationUnit) -> StoreResult<()>;
    /// Returns `(success, failed)`.
    fn upsert_batch(&self, units: &[TranslationUnit]) -> StoreResult<(usize, usize)>;
    fn get_by_key(&self, key: &str) -> StoreResult<Option<TranslationUnit>>;
    /// First record with this exact original text, approved records first.
    fn get_by_original_text(&self, text: &str) -> StoreResult<Option<TranslationUnit>>;
    fn search(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<TranslationUnit>>;
    /// Returns whether a record was removed.
    fn delete(&self, key: &str) -> StoreResult<bool>;
    /// Returns `(deleted, not_deleted)`.
    fn delete_batch(&self, keys: &[String]) -> StoreResult<(usize, usize)>;
    fn count(&self) -> StoreResult<usize>;
    fn count_approved(&self) -> StoreResult<usize>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS translations (
    translation_key TEXT PRIMARY KEY,
    file_name TEXT NOT NULL,
    original_text TEXT NOT NULL,
    process_text TEXT NOT NULL DEFAULT '',
    translation TEXT NOT NULL DEFAULT '',
    context TEXT NOT NULL DEFAULT '',
    dangerous INTEGER NOT NULL DEFAULT 0,
    is_translated INTEGER NOT NULL DEFAULT 0,
    is_suggested_to_translate INTEGER NOT NULL DEFAULT 1,
    llm_reason TEXT NOT NULL DEFAULT '',
    approved INTEGER NOT NULL DEFAULT 0,
    approved_text TEXT NOT NULL DEFAULT '',
    config_name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_translations_file_name ON translations(file_name);
CREATE INDEX IF NOT EXISTS idx_translations_original_text ON translations(original_text);
CREATE INDEX IF NOT EXISTS idx_translations_approved ON translations(approved);
CREATE INDEX IF NOT EXISTS idx_translations_updated_at ON translations(updated_at);
"#;

const UPSERT_SQL: &str = r#"
INSERT INTO translations
    (translation_key, file_name, original_text, process_text, translation, context,
     dangerous, is_translated, is_suggested_to_translate, llm_reason, approved,
     approved_text, config_name, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
ON CONFLICT(translation_key) DO UPDATE SET
    file_name = excluded.file_name,
    original_text = excluded.original_text,
    process_text = excluded.process_text,
    translation = excluded.translation,
    context = excluded.context,
    dangerous = excluded.dangerous,
    is_translated = excluded.is_translated,
    is_suggested_to_translate = excluded.is_suggested_to_translate,
    llm_reason = excluded.llm_reason,
    approved = excluded.approved,
    approved_text = excluded.approved_text,
    updated_at = excluded.updated_at
"#;

const SELECT_COLUMNS: &str = "translation_key, file_name, original_text, process_text, \
    translation, context, dangerous, is_translated, is_suggested_to_translate, llm_reason, \
    approved, approved_text, created_at, updated_at";

pub struct SqliteRecordStore {
    config_name: String,
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path, config_name: &str) -> StoreResult<Self> {
        Self::with_connection(open_connection(path)?, config_name)
    }

    pub fn open_in_memory(config_name: &str) -> StoreResult<Self> {
        Self::with_connection(open_in_memory()?, config_name)
    }

    fn with_connection(conn: Connection, config_name: &str) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            config_name: config_name.to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn write_one(&self, conn: &Connection, unit: &TranslationUnit, now: &str) -> StoreResult<()> {
        if unit.translation_key.is_empty() {
            return Err(StoreError::MissingKey);
        }
        let mut stmt = conn.prepare_cached(UPSERT_SQL)?;
        stmt.execute(params![
            unit.translation_key,
            unit.file_name,
            unit.original_text,
            unit.process_text,
            unit.translation,
            unit.context,
            unit.dangerous,
            unit.is_translated,
            unit.is_suggested_to_translate,
            unit.llm_reason,
            unit.approved,
            unit.approved_text,
            self.config_name,
            now,
        ])?;
        Ok(())
    }
}

fn row_to_unit(row: &Row<'_>) -> rusqlite::Result<TranslationUnit> {
    Ok(TranslationUnit {
        translation_key: row.get(0)?,
        file_name: row.get(1)?,
        original_text: row.get(2)?,
        process_text: row.get(3)?,
        translation: row.get(4)?,
        context: row.get(5)?,
        dangerous: row.get(6)?,
        is_translated: row.get(7)?,
        is_suggested_to_translate: row.get(8)?,
        llm_reason: row.get(9)?,
        approved: row.get(10)?,
        approved_text: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl RecordStore for SqliteRecordStore {
    fn upsert(&self, unit: &TranslationUnit) -> StoreResult<()> {
        let conn = self.conn()?;
        self.write_one(&conn, unit, &now_rfc3339())
    }

    fn upsert_batch(&self, units: &[TranslationUnit]) -> StoreResult<(usize, usize)> {
        if units.is_empty() {
            return Ok((0, 0));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = now_rfc3339();
        let mut ok = 0usize;
        let mut failed = 0usize;
        for unit in units {
            match self.write_one(&tx, unit, &now) {
                Ok(()) => ok += 1,
                Err(e) => {
                    warn!(key = %unit.translation_key, "record upsert failed: {e}");
                    failed += 1;
                }
            }
        }
        tx.commit()?;
        debug!(ok, failed, "record batch upsert");
        Ok((ok, failed))
    }

    fn get_by_key(&self, key: &str) -> StoreResult<Option<TranslationUnit>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SELECT_COLUMNS} FROM translations WHERE translation_key = ?1");
        Ok(conn.query_row(&sql, params![key], row_to_unit).optional()?)
    }

    fn get_by_original_text(&self, text: &str) -> StoreResult<Option<TranslationUnit>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM translations WHERE original_text = ?1 \
             ORDER BY approved DESC, updated_at DESC LIMIT 1"
        );
        Ok(conn.query_row(&sql, params![text], row_to_unit).optional()?)
    }

    fn search(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<TranslationUnit>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let like_filters = [
            ("file_name", &filter.file_name),
            ("original_text", &filter.original_text),
            ("translation", &filter.translation),
            ("context", &filter.context),
            ("approved_text", &filter.approved_text),
        ];
        for (column, needle) in like_filters {
            if let Some(needle) = needle.as_deref().filter(|s| !s.is_empty()) {
                values.push(Value::Text(like_pattern(needle)));
                clauses.push(format!("{column} LIKE ?{} ESCAPE '\\'", values.len()));
            }
        }
        if let Some(approved) = filter.approved {
            values.push(Value::Integer(i64::from(approved)));
            clauses.push(format!("approved = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM translations");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY updated_at DESC, translation_key");
        // SQLite requires a LIMIT before OFFSET; -1 means unbounded.
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        values.push(Value::Integer(limit));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
        values.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" OFFSET ?{}", values.len()));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_unit)?;
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(unit) => out.push(unit),
                Err(e) => warn!("record row parse error (skipped): {e}"),
            }
        }
        Ok(out)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM translations WHERE translation_key = ?1", params![key])?;
        Ok(n > 0)
    }

    fn delete_batch(&self, keys: &[String]) -> StoreResult<(usize, usize)> {
        if keys.is_empty() {
            return Ok((0, 0));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        {
            let mut stmt =
                tx.prepare_cached("DELETE FROM translations WHERE translation_key = ?1")?;
            for key in keys {
                deleted += stmt.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok((deleted, keys.len().saturating_sub(deleted)))
    }

    fn count(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM translations", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn count_approved(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM translations WHERE approved = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}
