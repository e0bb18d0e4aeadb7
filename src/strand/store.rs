//! Durable, append-only strand log backed by SQLite.
//!
//! Storage approach follows the teacher's `signals/db_storage.rs`: WAL mode,
//! covering indexes, a single connection behind a `parking_lot::Mutex`. A
//! single mutexed connection trivially gives us the per-`(kind, source_id)`
//! append ordering §4.1 requires, since there is exactly one writer.

use super::{ClusterKeyEntry, Direction, NewStrand, Strand, StrandKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS strands (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    source_id TEXT NOT NULL,
    symbol TEXT,
    timeframe TEXT,
    regime TEXT,
    session_bucket TEXT,
    tags TEXT NOT NULL,
    sig_sigma REAL NOT NULL,
    sig_confidence REAL NOT NULL,
    sig_direction TEXT NOT NULL,
    outcome_score REAL NOT NULL,
    module_intelligence TEXT NOT NULL,
    cluster_key TEXT NOT NULL,
    braid_level INTEGER NOT NULL,
    lesson TEXT,
    source_strand_ids TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_strands_kind_created ON strands(kind, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_strands_source ON strands(source_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_strands_symbol ON strands(symbol, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_strands_braid_level ON strands(braid_level, created_at DESC);
"#;

/// Sort order for `scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    CreatedAtAsc,
    CreatedAtDesc,
}

/// Filter over the strand log. Every field is an AND-ed predicate.
#[derive(Debug, Clone, Default)]
pub struct StrandFilter {
    pub kind: Option<StrandKind>,
    pub tag_prefix: Option<String>,
    pub source_id: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub braid_level: Option<u32>,
    /// (cluster_type, consumed) — keep only strands with a cluster-key entry
    /// of this type whose `consumed` flag equals the given value.
    pub cluster_dimension: Option<(String, bool)>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl StrandFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: StrandKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn created_after(mut self, ts: DateTime<Utc>) -> Self {
        self.created_after = Some(ts);
        self
    }

    pub fn braid_level(mut self, level: u32) -> Self {
        self.braid_level = Some(level);
        self
    }

    pub fn cluster_dimension(mut self, cluster_type: impl Into<String>, consumed: bool) -> Self {
        self.cluster_dimension = Some((cluster_type.into(), consumed));
        self
    }

    pub fn order(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Restricted patch applied to an already-appended strand (§3.1 invariants:
/// everything except `outcome_score`, `updated_at`, per-dimension `consumed`
/// flags, and doctrine-rollup fields is immutable post-append).
///
/// `assignment_status` covers the one other legitimately mutable field named
/// outside §3.1's strand invariants: an `experiment_assignment` strand's
/// `status` (§3.6), e.g. the `active -> timed_out` transition.
#[derive(Debug, Clone, Default)]
pub struct RollupPatch {
    pub outcome_score: Option<f64>,
    pub doctrine_rollup: Option<Value>,
    pub assignment_status: Option<String>,
}

pub struct StrandStore {
    conn: Arc<Mutex<Connection>>,
}

impl StrandStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening strand store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initializing strand schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory strand store")?;
        conn.execute_batch(SCHEMA_SQL)
            .context("initializing strand schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Total-order append. Assigns `id`, `created_at = updated_at = now`, and
    /// clamps `sig_sigma`/`sig_confidence` into [0,1], recording a
    /// data-quality note strand when clamping occurred.
    pub fn append(&self, mut new: NewStrand) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut clamped = false;
        if !(0.0..=1.0).contains(&new.sig_sigma) {
            new.sig_sigma = new.sig_sigma.clamp(0.0, 1.0);
            clamped = true;
        }
        if !(0.0..=1.0).contains(&new.sig_confidence) {
            new.sig_confidence = new.sig_confidence.clamp(0.0, 1.0);
            clamped = true;
        }

        if new.braid_level == 1 {
            for entry in &mut new.cluster_key {
                entry.consumed = false;
            }
        }

        let tags_json = serde_json::to_string(&new.tags)?;
        let intel_json = serde_json::to_string(&new.module_intelligence)?;
        let cluster_json = serde_json::to_string(&new.cluster_key)?;
        let sources_json = serde_json::to_string(&new.source_strand_ids)?;

        {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO strands (id, kind, source_id, symbol, timeframe, regime, session_bucket,
                    tags, sig_sigma, sig_confidence, sig_direction, outcome_score, module_intelligence,
                    cluster_key, braid_level, lesson, source_strand_ids, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    id,
                    new.kind.as_str(),
                    new.source_id,
                    new.symbol,
                    new.timeframe,
                    new.regime,
                    new.session_bucket,
                    tags_json,
                    new.sig_sigma,
                    new.sig_confidence,
                    new.sig_direction.as_str(),
                    new.outcome_score,
                    intel_json,
                    cluster_json,
                    new.braid_level,
                    new.lesson,
                    sources_json,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .context("appending strand")?;
        }

        debug!(strand_id = %id, kind = new.kind.as_str(), "strand appended");

        if clamped {
            self.append_data_quality_note(&id, "sig_sigma/sig_confidence clamped to [0,1] on append")?;
        }

        Ok(id)
    }

    fn append_data_quality_note(&self, about_id: &str, note: &str) -> Result<()> {
        warn!(strand_id = about_id, note, "data-quality clamp on append");
        let new = NewStrand::base(StrandKind::DataQualityNote, "strand_store")
            .with_intelligence(serde_json::json!({ "about_strand_id": about_id, "note": note }));
        // Recursive append of a level-1 strand; clamping cannot recurse
        // because sigma/confidence default to 0.0 here, which is in-range.
        self.append(new).map(|_| ())
    }

    /// Filtered scan. Cluster-dimension and tag-prefix predicates are applied
    /// in Rust after the indexed SQL fetch, since SQLite's JSON1 querying
    /// buys little clarity at this scale and the teacher's own code (e.g.
    /// `wallet_analytics.rs`) favors simple SQL plus app-level filtering.
    pub fn scan(&self, filter: &StrandFilter) -> Result<Vec<Strand>> {
        let mut sql = String::from("SELECT id, kind, source_id, symbol, timeframe, regime, session_bucket, \
             tags, sig_sigma, sig_confidence, sig_direction, outcome_score, module_intelligence, \
             cluster_key, braid_level, lesson, source_strand_ids, created_at, updated_at FROM strands WHERE 1=1");
        let mut clauses: Vec<String> = Vec::new();
        let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(kind) = filter.kind {
            clauses.push(" AND kind = ?".to_string());
            bind.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(source_id) = &filter.source_id {
            clauses.push(" AND source_id = ?".to_string());
            bind.push(Box::new(source_id.clone()));
        }
        if let Some(symbol) = &filter.symbol {
            clauses.push(" AND symbol = ?".to_string());
            bind.push(Box::new(symbol.clone()));
        }
        if let Some(timeframe) = &filter.timeframe {
            clauses.push(" AND timeframe = ?".to_string());
            bind.push(Box::new(timeframe.clone()));
        }
        if let Some(after) = filter.created_after {
            clauses.push(" AND created_at >= ?".to_string());
            bind.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = filter.created_before {
            clauses.push(" AND created_at < ?".to_string());
            bind.push(Box::new(before.to_rfc3339()));
        }
        if let Some(level) = filter.braid_level {
            clauses.push(" AND braid_level = ?".to_string());
            bind.push(Box::new(level));
        }
        for clause in &clauses {
            sql.push_str(clause);
        }
        match filter.order_by.unwrap_or(OrderBy::CreatedAtDesc) {
            OrderBy::CreatedAtAsc => sql.push_str(" ORDER BY created_at ASC"),
            OrderBy::CreatedAtDesc => sql.push_str(" ORDER BY created_at DESC"),
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).context("preparing scan query")?;
        let bind_refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(bind_refs.as_slice(), row_to_strand)
            .context("executing scan query")?;

        let mut out = Vec::new();
        for row in rows {
            let strand = row.context("decoding strand row")?;
            if let Some(prefix) = &filter.tag_prefix {
                if !strand.tags.iter().any(|t| t.starts_with(prefix.as_str())) {
                    continue;
                }
            }
            if let Some((cluster_type, consumed)) = &filter.cluster_dimension {
                let matches = strand
                    .cluster_key
                    .iter()
                    .any(|e| &e.cluster_type == cluster_type && e.consumed == *consumed);
                if !matches {
                    continue;
                }
            }
            out.push(strand);
            if let Some(limit) = filter.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<Strand>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, kind, source_id, symbol, timeframe, regime, session_bucket, \
             tags, sig_sigma, sig_confidence, sig_direction, outcome_score, module_intelligence, \
             cluster_key, braid_level, lesson, source_strand_ids, created_at, updated_at \
             FROM strands WHERE id = ?1",
            params![id],
            row_to_strand,
        )
        .optional()
        .context("fetching strand by id")
    }

    /// Mutate only the fields §3.1 permits after append.
    pub fn update_rollup(&self, id: &str, patch: RollupPatch) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        if let Some(score) = patch.outcome_score {
            conn.execute(
                "UPDATE strands SET outcome_score = ?1, updated_at = ?2 WHERE id = ?3",
                params![score, now, id],
            )
            .context("updating outcome_score")?;
        }
        if let Some(rollup) = patch.doctrine_rollup {
            let rollup_json = serde_json::to_string(&rollup)?;
            conn.execute(
                "UPDATE strands SET module_intelligence = json_patch(module_intelligence, ?1), updated_at = ?2 WHERE id = ?3",
                params![rollup_json, now, id],
            )
            .context("updating doctrine rollup")?;
        }
        if let Some(status) = patch.assignment_status {
            let status_json = serde_json::to_string(&serde_json::json!({ "status": status }))?;
            conn.execute(
                "UPDATE strands SET module_intelligence = json_patch(module_intelligence, ?1), updated_at = ?2 WHERE id = ?3",
                params![status_json, now, id],
            )
            .context("updating assignment status")?;
        }
        Ok(())
    }

    /// Compare-and-swap flip of one cluster-key dimension's `consumed` flag
    /// from false to true (§4.1 "Updates to consumed flags are
    /// compare-and-swap"). Returns `Ok(true)` if this call performed the
    /// flip, `Ok(false)` if another braider already had.
    pub fn consume_cluster_dimension(
        &self,
        id: &str,
        cluster_type: &str,
        braid_level: u32,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let current_json: String = conn
            .query_row(
                "SELECT cluster_key FROM strands WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("reading cluster_key for CAS")?;
        let mut entries: Vec<ClusterKeyEntry> = serde_json::from_str(&current_json)?;

        let mut flipped = false;
        for entry in &mut entries {
            if entry.cluster_type == cluster_type && entry.braid_level == braid_level {
                if entry.consumed {
                    return Ok(false);
                }
                entry.consumed = true;
                flipped = true;
            }
        }
        if !flipped {
            return Ok(false);
        }

        let new_json = serde_json::to_string(&entries)?;
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE strands SET cluster_key = ?1, updated_at = ?2 WHERE id = ?3 AND cluster_key = ?4",
                params![new_json, now, id, current_json],
            )
            .context("CAS-updating cluster_key")?;
        Ok(affected == 1)
    }

    /// Idempotent recovery pass: for each braid (braid_level > 1) whose
    /// `module_intelligence.braid_dimension`/`source_braid_level` are set,
    /// ensure every referenced source member's consumed flag is flipped.
    /// Safe to run repeatedly after a crash between append and flip (§4.1).
    pub fn recover_incomplete_braids(&self) -> Result<usize> {
        let all = self.scan(&StrandFilter::new().order(OrderBy::CreatedAtAsc))?;
        let mut repaired = 0;
        for braid in all.into_iter().filter(|s| s.braid_level > 1) {
            let dimension = braid
                .module_intelligence
                .get("braid_dimension")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let source_level = braid
                .module_intelligence
                .get("source_braid_level")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            let (Some(dimension), Some(source_level)) = (dimension, source_level) else {
                continue;
            };
            for member_id in &braid.source_strand_ids {
                if self.consume_cluster_dimension(member_id, &dimension, source_level)? {
                    repaired += 1;
                }
            }
        }
        if repaired > 0 {
            info!(repaired, "recovered incomplete braid consumed-flags");
        }
        Ok(repaired)
    }
}

fn row_to_strand(row: &rusqlite::Row) -> rusqlite::Result<Strand> {
    let kind_str: String = row.get(1)?;
    let direction_str: String = row.get(10)?;
    let tags_json: String = row.get(7)?;
    let intel_json: String = row.get(12)?;
    let cluster_json: String = row.get(13)?;
    let sources_json: String = row.get(16)?;
    let created_at: String = row.get(17)?;
    let updated_at: String = row.get(18)?;

    Ok(Strand {
        id: row.get(0)?,
        kind: StrandKind::parse(&kind_str).unwrap_or(StrandKind::Signal),
        source_id: row.get(2)?,
        symbol: row.get(3)?,
        timeframe: row.get(4)?,
        regime: row.get(5)?,
        session_bucket: row.get(6)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        sig_sigma: row.get(8)?,
        sig_confidence: row.get(9)?,
        sig_direction: Direction::parse(&direction_str),
        outcome_score: row.get(11)?,
        module_intelligence: serde_json::from_str(&intel_json).unwrap_or(Value::Null),
        cluster_key: serde_json::from_str(&cluster_json).unwrap_or_default(),
        braid_level: row.get(14)?,
        lesson: row.get(15)?,
        source_strand_ids: serde_json::from_str(&sources_json).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::ClusterKeyEntry;

    fn store() -> StrandStore {
        StrandStore::open_in_memory().unwrap()
    }

    #[test]
    fn append_assigns_id_and_clamps_signal() {
        let s = store();
        let id = s
            .append(
                NewStrand::base(StrandKind::Signal, "vol_analyzer")
                    .with_signal(1.5, -0.2, Direction::Long),
            )
            .unwrap();
        let strand = s.get(&id).unwrap().unwrap();
        assert_eq!(strand.sig_sigma, 1.0);
        assert_eq!(strand.sig_confidence, 0.0);
    }

    #[test]
    fn scan_filters_by_kind_and_source() {
        let s = store();
        s.append(NewStrand::base(StrandKind::Signal, "a")).unwrap();
        s.append(NewStrand::base(StrandKind::Lesson, "a")).unwrap();
        s.append(NewStrand::base(StrandKind::Signal, "b")).unwrap();

        let found = s
            .scan(&StrandFilter::new().kind(StrandKind::Signal).source_id("a"))
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn cas_consume_only_succeeds_once() {
        let s = store();
        let id = s
            .append(
                NewStrand::base(StrandKind::PredictionReview, "x").with_cluster_key(vec![
                    ClusterKeyEntry {
                        cluster_type: "asset".into(),
                        cluster_key: "BTC".into(),
                        braid_level: 1,
                        consumed: false,
                    },
                ]),
            )
            .unwrap();

        assert!(s.consume_cluster_dimension(&id, "asset", 1).unwrap());
        assert!(!s.consume_cluster_dimension(&id, "asset", 1).unwrap());
    }

    #[test]
    fn recovery_completes_missing_flip() {
        let s = store();
        let member = s
            .append(
                NewStrand::base(StrandKind::PredictionReview, "x").with_cluster_key(vec![
                    ClusterKeyEntry {
                        cluster_type: "asset".into(),
                        cluster_key: "BTC".into(),
                        braid_level: 1,
                        consumed: false,
                    },
                ]),
            )
            .unwrap();

        // Simulate a braid appended but the flip never happened (crash).
        s.append(
            NewStrand::base(StrandKind::PredictionReview, "braider")
                .as_braid(2, "lesson text", vec![member.clone()])
                .with_intelligence(serde_json::json!({
                    "braid_dimension": "asset",
                    "source_braid_level": 1
                })),
        )
        .unwrap();

        let repaired = s.recover_incomplete_braids().unwrap();
        assert_eq!(repaired, 1);
        let member_strand = s.get(&member).unwrap().unwrap();
        assert!(member_strand.cluster_key[0].consumed);

        // Idempotent: running again repairs nothing further.
        assert_eq!(s.recover_incomplete_braids().unwrap(), 0);
    }
}
