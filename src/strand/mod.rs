//! The strand: the unit of memory in the Central Intelligence Core (§3.1).

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use store::{RollupPatch, StrandFilter, StrandStore};

/// Tag identifying what a strand represents. New kinds (e.g. a new engine's
/// output marker) are just new string-backed variants; dispatch elsewhere is
/// by tag, never by inheritance (§9 "Hierarchical producer families").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrandKind {
    Signal,
    PredictionReview,
    Motif,
    ConfluenceEvent,
    MetaSignal,
    CrossSourceCorrelation,
    CoverageAnalysis,
    SignalFamily,
    DoctrineInsight,
    ExperimentAssignment,
    ExperimentResult,
    Lesson,
    Doctrine,
    ReconciliationNote,
    DataQualityNote,
}

impl StrandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrandKind::Signal => "signal",
            StrandKind::PredictionReview => "prediction_review",
            StrandKind::Motif => "motif",
            StrandKind::ConfluenceEvent => "confluence_event",
            StrandKind::MetaSignal => "meta_signal",
            StrandKind::CrossSourceCorrelation => "cross_source_correlation",
            StrandKind::CoverageAnalysis => "coverage_analysis",
            StrandKind::SignalFamily => "signal_family",
            StrandKind::DoctrineInsight => "doctrine_insight",
            StrandKind::ExperimentAssignment => "experiment_assignment",
            StrandKind::ExperimentResult => "experiment_result",
            StrandKind::Lesson => "lesson",
            StrandKind::Doctrine => "doctrine",
            StrandKind::ReconciliationNote => "reconciliation_note",
            StrandKind::DataQualityNote => "data_quality_note",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "signal" => StrandKind::Signal,
            "prediction_review" => StrandKind::PredictionReview,
            "motif" => StrandKind::Motif,
            "confluence_event" => StrandKind::ConfluenceEvent,
            "meta_signal" => StrandKind::MetaSignal,
            "cross_source_correlation" => StrandKind::CrossSourceCorrelation,
            "coverage_analysis" => StrandKind::CoverageAnalysis,
            "signal_family" => StrandKind::SignalFamily,
            "doctrine_insight" => StrandKind::DoctrineInsight,
            "experiment_assignment" => StrandKind::ExperimentAssignment,
            "experiment_result" => StrandKind::ExperimentResult,
            "lesson" => StrandKind::Lesson,
            "doctrine" => StrandKind::Doctrine,
            "reconciliation_note" => StrandKind::ReconciliationNote,
            "data_quality_note" => StrandKind::DataQualityNote,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
            Direction::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "long" => Direction::Long,
            "short" => Direction::Short,
            _ => Direction::Neutral,
        }
    }
}

/// One orthogonal clustering-dimension membership carried by a strand
/// (§3.1, GLOSSARY "Cluster key"). `consumed` flips true->false only via
/// compare-and-swap in the store, never via a plain field write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterKeyEntry {
    pub cluster_type: String,
    pub cluster_key: String,
    pub braid_level: u32,
    pub consumed: bool,
}

/// A fully materialized strand as read from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strand {
    pub id: String,
    pub kind: StrandKind,
    pub source_id: String,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub regime: Option<String>,
    pub session_bucket: Option<String>,
    pub tags: Vec<String>,
    pub sig_sigma: f64,
    pub sig_confidence: f64,
    pub sig_direction: Direction,
    pub outcome_score: f64,
    pub module_intelligence: Value,
    pub cluster_key: Vec<ClusterKeyEntry>,
    pub braid_level: u32,
    pub lesson: Option<String>,
    pub source_strand_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A strand not yet appended. `append` assigns id/timestamps and clamps
/// sigma/confidence into [0,1] per the §3.1 invariant.
#[derive(Debug, Clone)]
pub struct NewStrand {
    pub kind: StrandKind,
    pub source_id: String,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub regime: Option<String>,
    pub session_bucket: Option<String>,
    pub tags: Vec<String>,
    pub sig_sigma: f64,
    pub sig_confidence: f64,
    pub sig_direction: Direction,
    pub outcome_score: f64,
    pub module_intelligence: Value,
    pub cluster_key: Vec<ClusterKeyEntry>,
    pub braid_level: u32,
    pub lesson: Option<String>,
    pub source_strand_ids: Vec<String>,
}

impl NewStrand {
    pub fn base(kind: StrandKind, source_id: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            symbol: None,
            timeframe: None,
            regime: None,
            session_bucket: None,
            tags: Vec::new(),
            sig_sigma: 0.0,
            sig_confidence: 0.0,
            sig_direction: Direction::Neutral,
            outcome_score: 0.0,
            module_intelligence: Value::Null,
            cluster_key: Vec::new(),
            braid_level: 1,
            lesson: None,
            source_strand_ids: Vec::new(),
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.timeframe = Some(timeframe.into());
        self
    }

    pub fn with_regime(mut self, regime: impl Into<String>) -> Self {
        self.regime = Some(regime.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session_bucket = Some(session.into());
        self
    }

    pub fn with_signal(mut self, sigma: f64, confidence: f64, direction: Direction) -> Self {
        self.sig_sigma = sigma;
        self.sig_confidence = confidence;
        self.sig_direction = direction;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_intelligence(mut self, value: Value) -> Self {
        self.module_intelligence = value;
        self
    }

    pub fn with_cluster_key(mut self, entries: Vec<ClusterKeyEntry>) -> Self {
        self.cluster_key = entries;
        self
    }

    pub fn as_braid(mut self, braid_level: u32, lesson: impl Into<String>, sources: Vec<String>) -> Self {
        self.braid_level = braid_level;
        self.lesson = Some(lesson.into());
        self.source_strand_ids = sources;
        self
    }
}
