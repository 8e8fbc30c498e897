//! Two-tier translation memory.
//!
//! The exact tier ([`RecordStore`]) is the source of truth. The semantic tier
//! ([`SimilarityIndex`]) only answers "what did we translate that looks like
//! this" and is repaired from the exact tier whenever a read shows drift.

pub mod records;
pub mod similarity;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::StoreResult;
use crate::unit::TranslationUnit;
use crate::unit_log;

pub use records::{RecordFilter, RecordStore, SqliteRecordStore};
pub use similarity::{
    Embedder, NgramEmbedder, SimilarEntry, SimilarHit, SimilarityIndex, SqliteVectorIndex,
};

const SYNC_PAGE: usize = 500;

/// A past translation surfaced by similarity search.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoredMatch {
    pub unit: TranslationUnit,
    /// `1 - distance`.
    pub similarity: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl BatchOutcome {
    fn merge(&mut self, other: BatchOutcome) {
        self.success += other.success;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub records: usize,
    pub approved: usize,
    pub semantic_entries: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub files: usize,
    pub outcome: BatchOutcome,
}

fn projection(unit: &TranslationUnit) -> SimilarEntry {
    SimilarEntry {
        translation_key: unit.translation_key.clone(),
        original_text: unit.original_text.clone(),
        file_name: unit.file_name.clone(),
    }
}

/// Database locations for one namespace under a memory directory.
pub fn record_db_path(memory_dir: &Path, name: &str) -> PathBuf {
    memory_dir.join("sqlite").join(format!("translations_{name}.db"))
}

pub fn vector_db_path(memory_dir: &Path, name: &str) -> PathBuf {
    memory_dir.join("vector").join(format!("vectors_{name}.db"))
}

/// Facade over both tiers for one configuration namespace.
pub struct TranslationMemory {
    records: Box<dyn RecordStore>,
    similar: Box<dyn SimilarityIndex>,
}

impl TranslationMemory {
    pub fn new(records: Box<dyn RecordStore>, similar: Box<dyn SimilarityIndex>) -> Self {
        Self { records, similar }
    }

    pub fn open(memory_dir: &Path, name: &str) -> StoreResult<Self> {
        let records = SqliteRecordStore::open(&record_db_path(memory_dir, name), name)?;
        let similar = SqliteVectorIndex::open(
            &vector_db_path(memory_dir, name),
            Box::new(NgramEmbedder::default()),
        )?;
        Ok(Self::new(Box::new(records), Box::new(similar)))
    }

    pub fn open_in_memory(name: &str) -> StoreResult<Self> {
        Ok(Self::new(
            Box::new(SqliteRecordStore::open_in_memory(name)?),
            Box::new(SqliteVectorIndex::open_in_memory(Box::new(
                NgramEmbedder::default(),
            ))?),
        ))
    }

    pub fn records(&self) -> &dyn RecordStore {
        self.records.as_ref()
    }

    pub fn similar(&self) -> &dyn SimilarityIndex {
        self.similar.as_ref()
    }

    pub fn get_exact(&self, text: &str) -> StoreResult<Option<TranslationUnit>> {
        self.records.get_by_original_text(text)
    }

    pub fn get_by_key(&self, key: &str) -> StoreResult<Option<TranslationUnit>> {
        self.records.get_by_key(key)
    }

    /// Semantic candidates at or above `threshold`, checked against the exact
    /// tier. Diverging semantic entries are rewritten from their record and
    /// entries without a record are removed.
    pub fn search_similar(
        &self,
        text: &str,
        threshold: f32,
        max_results: usize,
    ) -> StoreResult<Vec<ScoredMatch>> {
        let hits = self.similar.query(text, max_results)?;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            if 1.0 - hit.distance < threshold {
                continue;
            }
            match self.records.get_by_key(&hit.translation_key)? {
                Some(unit) => {
                    let similarity = if unit.original_text == hit.original_text {
                        1.0 - hit.distance
                    } else {
                        warn!(
                            key = %hit.translation_key,
                            cached = %crate::textutil::preview(&hit.original_text, 40),
                            actual = %crate::textutil::preview(&unit.original_text, 40),
                            "semantic entry diverged from record; repairing"
                        );
                        // The hit was scored against the stale text.
                        match self.rescore_repaired(text, &unit) {
                            Some(s) if s >= threshold => s,
                            _ => continue,
                        }
                    };
                    out.push(ScoredMatch { unit, similarity });
                }
                None => {
                    warn!(key = %hit.translation_key, "orphaned semantic entry removed");
                    if let Err(e) = self.similar.delete(&hit.translation_key) {
                        warn!(key = %hit.translation_key, "orphan removal failed: {e}");
                    }
                }
            }
        }
        out.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(out)
    }

    /// Rewrites the semantic entry of `unit` and scores `text` against it.
    /// `None` when the repair or the rescoring failed.
    fn rescore_repaired(&self, text: &str, unit: &TranslationUnit) -> Option<f32> {
        if let Err(e) = self.similar.upsert(&projection(unit)) {
            warn!(key = %unit.translation_key, "semantic repair failed: {e}");
            return None;
        }
        match self.similar.distance_to(text, &unit.translation_key) {
            Ok(d) => d.map(|d| 1.0 - d),
            Err(e) => {
                warn!(key = %unit.translation_key, "rescoring repaired entry failed: {e}");
                None
            }
        }
    }

    /// Exact tier first; the semantic projection is best effort.
    pub fn record_translation(&self, unit: &TranslationUnit) -> StoreResult<()> {
        self.records.upsert(unit)?;
        if let Err(e) = self.similar.upsert(&projection(unit)) {
            warn!(key = %unit.translation_key, "semantic write failed: {e}");
        }
        Ok(())
    }

    pub fn record_batch(&self, units: &[TranslationUnit], update_semantic: bool) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut written: Vec<&TranslationUnit> = Vec::with_capacity(units.len());
        for unit in units {
            match self.records.upsert(unit) {
                Ok(()) => {
                    outcome.success += 1;
                    written.push(unit);
                }
                Err(e) => {
                    outcome.failed += 1;
                    outcome.errors.push(format!(
                        "{}: {e}",
                        if unit.translation_key.is_empty() {
                            unit.original_text.as_str()
                        } else {
                            unit.translation_key.as_str()
                        }
                    ));
                }
            }
        }
        if update_semantic && !written.is_empty() {
            let entries: Vec<SimilarEntry> = written.into_iter().map(projection).collect();
            match self.similar.upsert_batch(&entries) {
                Ok((_, 0)) => {}
                Ok((_, failed)) => warn!(failed, "semantic batch write partially failed"),
                Err(e) => warn!("semantic batch write failed: {e}"),
            }
        }
        debug!(success = outcome.success, failed = outcome.failed, "record batch");
        outcome
    }

    pub fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed = self.records.delete(key)?;
        if let Err(e) = self.similar.delete(key) {
            warn!(key = %key, "semantic delete failed: {e}");
        }
        Ok(removed)
    }

    /// Counts come from the exact tier; the semantic delete covers every key.
    pub fn delete_batch(&self, keys: &[String]) -> StoreResult<(usize, usize)> {
        let counts = self.records.delete_batch(keys)?;
        if let Err(e) = self.similar.delete_batch(keys) {
            warn!(keys = keys.len(), "semantic batch delete failed: {e}");
        }
        Ok(counts)
    }

    pub fn search(
        &self,
        filter: &RecordFilter,
        limit: Option<usize>,
        offset: usize,
    ) -> StoreResult<Vec<TranslationUnit>> {
        self.records.search(filter, limit, offset)
    }

    pub fn count(&self) -> StoreResult<usize> {
        self.records.count()
    }

    /// Rewrites the semantic entry of every record.
    pub fn sync_all(&self) -> StoreResult<SyncReport> {
        let mut report = SyncReport::default();
        let mut offset = 0usize;
        loop {
            let page = self
                .records
                .search(&RecordFilter::default(), Some(SYNC_PAGE), offset)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            let entries: Vec<SimilarEntry> = page.iter().map(projection).collect();
            let (ok, failed) = self.similar.upsert_batch(&entries)?;
            report.synced += ok;
            report.failed += failed;
        }
        info!(synced = report.synced, failed = report.failed, "semantic tier synchronized");
        Ok(report)
    }

    pub fn stats(&self) -> StoreResult<MemoryStats> {
        Ok(MemoryStats {
            records: self.records.count()?,
            approved: self.records.count_approved()?,
            semantic_entries: self.similar.count()?,
        })
    }

    /// Imports every `*.jsonl` unit log below `dir`.
    pub fn import_unit_logs(&self, dir: &Path, update_semantic: bool) -> StoreResult<ImportReport> {
        let mut files = Vec::new();
        collect_jsonl(dir, &mut files)?;
        files.sort();

        let mut report = ImportReport::default();
        for path in files {
            let mut units = match unit_log::read_units(&path) {
                Ok(units) => units,
                Err(e) => {
                    warn!(file = %path.display(), "skipping unreadable unit log: {e}");
                    report.outcome.failed += 1;
                    report.outcome.errors.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            for unit in &mut units {
                unit.ensure_key();
            }
            let outcome = self.record_batch(&units, update_semantic);
            info!(
                file = %path.display(),
                success = outcome.success,
                failed = outcome.failed,
                "imported unit log"
            );
            report.files += 1;
            report.outcome.merge(outcome);
        }
        Ok(report)
    }
}

fn collect_jsonl(dir: &Path, out: &mut Vec<PathBuf>) -> StoreResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_jsonl(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::db::StoreError;

    fn unit(key: &str, text: &str, translation: &str) -> TranslationUnit {
        let mut u = TranslationUnit::new("strings.csv", text, key);
        u.translation_key = key.to_string();
        u.translation = translation.to_string();
        u.is_translated = true;
        u
    }

    /// Semantic tier that always fails writes and counts delete attempts.
    struct BrokenIndex {
        deletes: Arc<AtomicUsize>,
    }

    impl SimilarityIndex for BrokenIndex {
        fn upsert(&self, _: &SimilarEntry) -> StoreResult<()> {
            Err(StoreError::Poisoned)
        }
        fn upsert_batch(&self, _: &[SimilarEntry]) -> StoreResult<(usize, usize)> {
            Err(StoreError::Poisoned)
        }
        fn query(&self, _: &str, _: usize) -> StoreResult<Vec<SimilarHit>> {
            Ok(Vec::new())
        }
        fn get(&self, _: &str) -> StoreResult<Option<SimilarEntry>> {
            Ok(None)
        }
        fn distance_to(&self, _: &str, _: &str) -> StoreResult<Option<f32>> {
            Ok(None)
        }
        fn delete(&self, _: &str) -> StoreResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Poisoned)
        }
        fn delete_batch(&self, keys: &[String]) -> StoreResult<usize> {
            self.deletes.fetch_add(keys.len(), Ordering::SeqCst);
            Err(StoreError::Poisoned)
        }
        fn count(&self) -> StoreResult<usize> {
            Ok(0)
        }
    }

    fn broken_memory() -> (TranslationMemory, Arc<AtomicUsize>) {
        let deletes = Arc::new(AtomicUsize::new(0));
        let memory = TranslationMemory::new(
            Box::new(SqliteRecordStore::open_in_memory("t").unwrap()),
            Box::new(BrokenIndex {
                deletes: Arc::clone(&deletes),
            }),
        );
        (memory, deletes)
    }

    #[test]
    fn record_then_exact_and_similar_lookup() {
        let memory = TranslationMemory::open_in_memory("t").unwrap();
        memory.record_translation(&unit("k1", "Hegemony fleet spotted", "发现霸主舰队")).unwrap();
        memory.record_translation(&unit("k2", "Station online", "空间站上线")).unwrap();

        assert_eq!(memory.get_exact("Station online").unwrap().unwrap().translation_key, "k2");

        let matches = memory.search_similar("Hegemony fleet spotted!", 0.7, 3).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].unit.translation, "发现霸主舰队");
        assert!(matches[0].similarity >= 0.7);
    }

    #[test]
    fn search_similar_repairs_diverged_semantic_entry() {
        let memory = TranslationMemory::open_in_memory("t").unwrap();
        memory.record_translation(&unit("k1", "Alpha fleet", "阿尔法舰队")).unwrap();
        memory
            .similar()
            .upsert(&SimilarEntry {
                translation_key: "k1".to_string(),
                original_text: "Beta fleet".to_string(),
                file_name: "strings.csv".to_string(),
            })
            .unwrap();

        let matches = memory.search_similar("Beta fleet", 0.0, 3).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].unit.original_text, "Alpha fleet");
        assert_eq!(memory.similar().get("k1").unwrap().unwrap().original_text, "Alpha fleet");
        // Scored against the repaired text, not the stale one.
        let expected = 1.0 - memory.similar().distance_to("Beta fleet", "k1").unwrap().unwrap();
        assert!(matches[0].similarity < 0.99, "{}", matches[0].similarity);
        assert!((matches[0].similarity - expected).abs() < 1e-6);
    }

    #[test]
    fn repaired_entry_below_threshold_is_dropped() {
        let memory = TranslationMemory::open_in_memory("t").unwrap();
        memory.record_translation(&unit("k1", "Alpha fleet", "阿尔法舰队")).unwrap();
        memory
            .similar()
            .upsert(&SimilarEntry {
                translation_key: "k1".to_string(),
                original_text: "Orbital station docking bay".to_string(),
                file_name: "strings.csv".to_string(),
            })
            .unwrap();

        let matches = memory.search_similar("Orbital station docking bay", 0.9, 3).unwrap();
        assert!(matches.is_empty());
        assert_eq!(memory.similar().get("k1").unwrap().unwrap().original_text, "Alpha fleet");
    }

    #[test]
    fn search_similar_drops_and_removes_orphans() {
        let memory = TranslationMemory::open_in_memory("t").unwrap();
        memory
            .similar()
            .upsert(&SimilarEntry {
                translation_key: "ghost".to_string(),
                original_text: "Ghost ship".to_string(),
                file_name: String::new(),
            })
            .unwrap();
        assert!(memory.search_similar("Ghost ship", 0.0, 3).unwrap().is_empty());
        assert!(memory.similar().get("ghost").unwrap().is_none());
    }

    #[test]
    fn threshold_filters_weak_candidates() {
        let memory = TranslationMemory::open_in_memory("t").unwrap();
        memory.record_translation(&unit("k1", "Completely unrelated words", "无关")).unwrap();
        assert!(memory.search_similar("Hegemony fleet", 0.7, 3).unwrap().is_empty());
    }

    #[test]
    fn semantic_write_failure_does_not_block_record() {
        let (memory, _) = broken_memory();
        memory.record_translation(&unit("k1", "Fleet", "舰队")).unwrap();
        assert_eq!(memory.get_by_key("k1").unwrap().unwrap().translation, "舰队");

        let outcome = memory.record_batch(&[unit("k2", "A", "甲"), unit("", "B", "乙")], true);
        assert_eq!((outcome.success, outcome.failed), (1, 1));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(memory.count().unwrap(), 2);
    }

    #[test]
    fn batch_delete_counts_from_exact_tier_and_hits_semantic_for_all_keys() {
        let (memory, deletes) = broken_memory();
        memory.record_batch(
            &[unit("a", "A", "甲"), unit("b", "B", "乙"), unit("c", "C", "丙")],
            false,
        );
        let keys: Vec<String> = ["a", "b", "c", "x", "y"].iter().map(|k| k.to_string()).collect();
        assert_eq!(memory.delete_batch(&keys).unwrap(), (3, 2));
        assert_eq!(deletes.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn sync_all_rebuilds_semantic_tier() {
        let memory = TranslationMemory::open_in_memory("t").unwrap();
        let units: Vec<_> = (0..7)
            .map(|i| unit(&format!("k{i}"), &format!("Text {i}"), "文本"))
            .collect();
        memory.record_batch(&units, false);
        assert_eq!(memory.stats().unwrap().semantic_entries, 0);

        let report = memory.sync_all().unwrap();
        assert_eq!(report, SyncReport { synced: 7, failed: 0 });
        let stats = memory.stats().unwrap();
        assert_eq!((stats.records, stats.semantic_entries), (7, 7));
    }

    #[test]
    fn import_unit_logs_derives_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("mod").join("data");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(
            nested.join("a.csv.temp_translation.jsonl"),
            concat!(
                r#"{"file_name":"a.csv","original_text":"Fleet","#,
                r#""translation":"舰队","context":"r1"}"#,
                "\n",
                r#"{"file_name":"a.csv","original":"Station","#,
                r#""translation":"空间站","translation_key":"fixed"}"#,
                "\n"
            ),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let memory = TranslationMemory::open_in_memory("t").unwrap();
        let report = memory.import_unit_logs(dir.path(), true).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.outcome.success, 2);
        assert!(memory.get_by_key("fixed").unwrap().is_some());
        let fleet = memory.get_exact("Fleet").unwrap().unwrap();
        assert_eq!(fleet.translation_key.len(), 64);
        assert_eq!(memory.stats().unwrap().semantic_entries, 2);
    }
}
