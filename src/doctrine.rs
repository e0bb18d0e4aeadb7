//! Doctrine Keeper (§3.5, §4.9): curates promotion/retirement of patterns
//! from accumulated lesson strands.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS doctrine_entries (
    doctrine_id TEXT PRIMARY KEY,
    pattern_type TEXT NOT NULL,
    pattern_id TEXT NOT NULL,
    status TEXT NOT NULL,
    evidence_count INTEGER NOT NULL,
    success_rate REAL NOT NULL,
    failure_rate REAL NOT NULL,
    why_map TEXT NOT NULL,
    contraindications TEXT NOT NULL,
    lineage TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    UNIQUE(pattern_type, pattern_id)
);
"#;

/// Structured mechanism record (§2 supplemented from `why_map_system.py`),
/// merged from each lesson's extracted deltas (§4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhyMap {
    pub mechanism_hypothesis: Option<String>,
    pub supporting_evidence: Vec<String>,
    pub failure_conditions: Vec<String>,
    pub context_dependencies: Vec<String>,
}

impl WhyMap {
    fn merge(&mut self, delta: &WhyMap) {
        if delta.mechanism_hypothesis.is_some() {
            self.mechanism_hypothesis = delta.mechanism_hypothesis.clone();
        }
        for e in &delta.supporting_evidence {
            if !self.supporting_evidence.contains(e) {
                self.supporting_evidence.push(e.clone());
            }
        }
        for f in &delta.failure_conditions {
            if !self.failure_conditions.contains(f) {
                self.failure_conditions.push(f.clone());
            }
        }
        for c in &delta.context_dependencies {
            if !self.context_dependencies.contains(c) {
                self.context_dependencies.push(c.clone());
            }
        }
    }
}

/// A context-scoped negative, distinct from the coarse `status =
/// contraindicated` (§2 supplemented from `doctrine_of_negatives_system.py`):
/// a doctrine entry can be contraindicated in one context while provisional
/// in another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contraindication {
    pub context: String,
    pub reason: String,
    pub asserted_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoctrineStatus {
    Provisional,
    Affirmed,
    Retired,
    Contraindicated,
}

impl DoctrineStatus {
    fn as_str(self) -> &'static str {
        match self {
            DoctrineStatus::Provisional => "provisional",
            DoctrineStatus::Affirmed => "affirmed",
            DoctrineStatus::Retired => "retired",
            DoctrineStatus::Contraindicated => "contraindicated",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "affirmed" => DoctrineStatus::Affirmed,
            "retired" => DoctrineStatus::Retired,
            "contraindicated" => DoctrineStatus::Contraindicated,
            _ => DoctrineStatus::Provisional,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctrineEntry {
    pub doctrine_id: String,
    pub pattern_type: String,
    pub pattern_id: String,
    pub status: DoctrineStatus,
    pub evidence_count: u32,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub why_map: WhyMap,
    pub contraindications: Vec<Contraindication>,
    pub lineage: Vec<String>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// A single lesson's observation, applied to update a doctrine entry.
#[derive(Debug, Clone)]
pub struct Lesson {
    pub pattern_type: String,
    pub pattern_id: String,
    pub success: bool,
    pub why_map_delta: WhyMap,
    pub source_strand_id: String,
}

pub struct DoctrineKeeper {
    conn: Arc<Mutex<Connection>>,
    promotion_evidence: u32,
    promotion_success_rate: f64,
    promotion_failure_rate: f64,
    retirement_failure_rate: f64,
    contraindication_failure_rate: f64,
}

impl DoctrineKeeper {
    pub fn open(
        path: &str,
        promotion_evidence: u32,
        promotion_success_rate: f64,
        promotion_failure_rate: f64,
        retirement_failure_rate: f64,
        contraindication_failure_rate: f64,
    ) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening doctrine store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("initializing doctrine schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            promotion_evidence,
            promotion_success_rate,
            promotion_failure_rate,
            retirement_failure_rate,
            contraindication_failure_rate,
        })
    }

    pub fn open_in_memory(
        promotion_evidence: u32,
        promotion_success_rate: f64,
        promotion_failure_rate: f64,
        retirement_failure_rate: f64,
        contraindication_failure_rate: f64,
    ) -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory doctrine store")?;
        conn.execute_batch(SCHEMA_SQL).context("initializing doctrine schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            promotion_evidence,
            promotion_success_rate,
            promotion_failure_rate,
            retirement_failure_rate,
            contraindication_failure_rate,
        })
    }

    pub fn get(&self, pattern_type: &str, pattern_id: &str) -> Result<Option<DoctrineEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT doctrine_id, pattern_type, pattern_id, status, evidence_count, success_rate,
                failure_rate, why_map, contraindications, lineage, last_updated
             FROM doctrine_entries WHERE pattern_type = ?1 AND pattern_id = ?2",
            params![pattern_type, pattern_id],
            row_to_entry,
        )
        .optional()
        .context("fetching doctrine entry")
    }

    /// Applies one lesson to its entry (creating it if absent), updating
    /// `evidence_count`, an incremental `success_rate`/`failure_rate`,
    /// merging the why-map delta, and re-evaluating status (§4.9).
    /// Concurrent application to the same entry serializes via CAS on
    /// `(doctrine_id, evidence_count)` (§4.9 Failure semantics) — the single
    /// mutexed connection gives us that directly.
    pub fn apply_lesson(&self, lesson: &Lesson) -> Result<DoctrineEntry> {
        let mut entry = self
            .get(&lesson.pattern_type, &lesson.pattern_id)?
            .unwrap_or_else(|| new_entry(&lesson.pattern_type, &lesson.pattern_id));

        let expected_evidence_count = entry.evidence_count;
        let n = (entry.evidence_count + 1) as f64;
        entry.evidence_count += 1;
        let success_hits = entry.success_rate * (n - 1.0) + if lesson.success { 1.0 } else { 0.0 };
        let failure_hits = entry.failure_rate * (n - 1.0) + if lesson.success { 0.0 } else { 1.0 };
        entry.success_rate = success_hits / n;
        entry.failure_rate = failure_hits / n;
        entry.why_map.merge(&lesson.why_map_delta);
        entry.lineage.push(lesson.source_strand_id.clone());
        entry.status = self.evaluate_status(entry.evidence_count, entry.success_rate, entry.failure_rate);
        entry.last_updated = chrono::Utc::now();

        self.write_cas(&entry, expected_evidence_count)?;
        info!(
            pattern_type = %entry.pattern_type,
            pattern_id = %entry.pattern_id,
            evidence_count = entry.evidence_count,
            status = entry.status.as_str(),
            "doctrine entry updated"
        );
        Ok(entry)
    }

    fn evaluate_status(&self, evidence_count: u32, success_rate: f64, failure_rate: f64) -> DoctrineStatus {
        if failure_rate > self.contraindication_failure_rate {
            DoctrineStatus::Contraindicated
        } else if failure_rate > self.retirement_failure_rate {
            DoctrineStatus::Retired
        } else if evidence_count >= self.promotion_evidence
            && success_rate > self.promotion_success_rate
            && failure_rate < self.promotion_failure_rate
        {
            DoctrineStatus::Affirmed
        } else {
            DoctrineStatus::Provisional
        }
    }

    pub fn add_contraindication(&self, pattern_type: &str, pattern_id: &str, context: &str, reason: &str) -> Result<()> {
        let mut entry = self
            .get(pattern_type, pattern_id)?
            .unwrap_or_else(|| new_entry(pattern_type, pattern_id));
        entry.contraindications.push(Contraindication {
            context: context.to_string(),
            reason: reason.to_string(),
            asserted_at: chrono::Utc::now(),
        });
        let expected = entry.evidence_count;
        self.write_cas(&entry, expected)?;
        Ok(())
    }

    /// Gating contract exposed to the Orchestrator (§4.9). A pattern with
    /// coarse `status = contraindicated`, or one with a context-scoped
    /// contraindication matching `context`, gates.
    pub fn is_contraindicated(&self, pattern_type: &str, pattern_id: &str, context: Option<&str>) -> Result<bool> {
        let Some(entry) = self.get(pattern_type, pattern_id)? else { return Ok(false) };
        if entry.status == DoctrineStatus::Contraindicated {
            return Ok(true);
        }
        if let Some(context) = context {
            return Ok(entry.contraindications.iter().any(|c| c.context == context));
        }
        Ok(false)
    }

    pub fn contraindication_reasons(&self, pattern_type: &str, pattern_id: &str) -> Result<Vec<String>> {
        Ok(self
            .get(pattern_type, pattern_id)?
            .map(|e| e.contraindications.into_iter().map(|c| c.reason).collect())
            .unwrap_or_default())
    }

    fn write_cas(&self, entry: &DoctrineEntry, expected_evidence_count: u32) -> Result<()> {
        let why_map_json = serde_json::to_string(&entry.why_map)?;
        let contraindications_json = serde_json::to_string(&entry.contraindications)?;
        let lineage_json = serde_json::to_string(&entry.lineage)?;
        let conn = self.conn.lock();

        let existing_count: Option<u32> = conn
            .query_row(
                "SELECT evidence_count FROM doctrine_entries WHERE doctrine_id = ?1",
                params![entry.doctrine_id],
                |r| r.get(0),
            )
            .optional()?;

        match existing_count {
            None => {
                conn.execute(
                    "INSERT INTO doctrine_entries (doctrine_id, pattern_type, pattern_id, status,
                        evidence_count, success_rate, failure_rate, why_map, contraindications,
                        lineage, last_updated) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    params![
                        entry.doctrine_id,
                        entry.pattern_type,
                        entry.pattern_id,
                        entry.status.as_str(),
                        entry.evidence_count,
                        entry.success_rate,
                        entry.failure_rate,
                        why_map_json,
                        contraindications_json,
                        lineage_json,
                        entry.last_updated.to_rfc3339(),
                    ],
                )
                .context("inserting doctrine entry")?;
            }
            Some(current) => {
                let affected = conn
                    .execute(
                        "UPDATE doctrine_entries SET status = ?1, evidence_count = ?2, success_rate = ?3,
                            failure_rate = ?4, why_map = ?5, contraindications = ?6, lineage = ?7,
                            last_updated = ?8 WHERE doctrine_id = ?9 AND evidence_count = ?10",
                        params![
                            entry.status.as_str(),
                            entry.evidence_count,
                            entry.success_rate,
                            entry.failure_rate,
                            why_map_json,
                            contraindications_json,
                            lineage_json,
                            entry.last_updated.to_rfc3339(),
                            entry.doctrine_id,
                            expected_evidence_count,
                        ],
                    )
                    .context("CAS-updating doctrine entry")?;
                if affected == 0 {
                    anyhow::bail!(
                        "doctrine CAS conflict on {} (expected evidence_count {}, found {})",
                        entry.doctrine_id,
                        expected_evidence_count,
                        current
                    );
                }
            }
        }
        Ok(())
    }
}

fn new_entry(pattern_type: &str, pattern_id: &str) -> DoctrineEntry {
    DoctrineEntry {
        doctrine_id: format!("{pattern_type}:{pattern_id}"),
        pattern_type: pattern_type.to_string(),
        pattern_id: pattern_id.to_string(),
        status: DoctrineStatus::Provisional,
        evidence_count: 0,
        success_rate: 0.0,
        failure_rate: 0.0,
        why_map: WhyMap::default(),
        contraindications: Vec::new(),
        lineage: Vec::new(),
        last_updated: chrono::Utc::now(),
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<DoctrineEntry> {
    let status_str: String = row.get(3)?;
    let why_map_json: String = row.get(7)?;
    let contraindications_json: String = row.get(8)?;
    let lineage_json: String = row.get(9)?;
    let last_updated: String = row.get(10)?;
    Ok(DoctrineEntry {
        doctrine_id: row.get(0)?,
        pattern_type: row.get(1)?,
        pattern_id: row.get(2)?,
        status: DoctrineStatus::parse(&status_str),
        evidence_count: row.get(4)?,
        success_rate: row.get(5)?,
        failure_rate: row.get(6)?,
        why_map: serde_json::from_str(&why_map_json).unwrap_or_default(),
        contraindications: serde_json::from_str(&contraindications_json).unwrap_or_default(),
        lineage: serde_json::from_str(&lineage_json).unwrap_or_default(),
        last_updated: chrono::DateTime::parse_from_rfc3339(&last_updated)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}
