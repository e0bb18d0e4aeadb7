//! Input Normalizer (§4.6): projects the recent strand tail into five
//! structured views consumable by the Global Synthesizer.

use crate::strand::{OrderBy, Strand, StrandFilter, StrandKind, StrandStore};
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Context tuple a detection was made under (§4.6 view 1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DetectionContext {
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub regime: Option<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerOutput {
    pub strand_id: String,
    pub source_id: String,
    pub detection_type: String,
    pub context: DetectionContext,
    pub performance_tags: Vec<String>,
    pub hypothesis_notes: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
    pub signal_strength: f64,
}

fn detection_type_of(s: &Strand) -> String {
    s.module_intelligence
        .get("detection_type")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| s.kind.as_str().to_string())
}

fn context_of(s: &Strand) -> DetectionContext {
    DetectionContext {
        symbol: s.symbol.clone(),
        timeframe: s.timeframe.clone(),
        regime: s.regime.clone(),
        session: s.session_bucket.clone(),
    }
}

fn to_producer_output(s: &Strand) -> ProducerOutput {
    ProducerOutput {
        strand_id: s.id.clone(),
        source_id: s.source_id.clone(),
        detection_type: detection_type_of(s),
        context: context_of(s),
        performance_tags: s.tags.clone(),
        hypothesis_notes: s
            .module_intelligence
            .get("hypothesis_notes")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        timestamp: s.created_at,
        confidence: s.sig_confidence,
        signal_strength: s.sig_sigma,
    }
}

/// Confluence event: two strands within the same 5-minute bucket whose
/// similarity ≥ the confluence threshold (§4.6 view 2).
#[derive(Debug, Clone)]
pub struct ConfluenceEvent {
    pub strand_a: String,
    pub strand_b: String,
    pub source_a: String,
    pub source_b: String,
    pub similarity: f64,
    pub bucket_start: DateTime<Utc>,
}

/// A lead-lag relationship: the lag source follows the lead source within
/// the configured window in ≥ 60% of pairable observations (§4.6 view 2).
#[derive(Debug, Clone)]
pub struct LeadLagRelationship {
    pub lead_source: String,
    pub lag_source: String,
    pub fraction: f64,
    pub pair_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CoverageCell {
    pub producers: HashSet<String>,
    pub count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CrossSourceMetadata {
    pub per_source_timing: HashMap<String, Vec<DateTime<Utc>>>,
    pub detection_type_producers: HashMap<String, HashSet<String>>,
    pub coverage: HashMap<(String, String, String, String), CoverageCell>,
    pub confluence_events: Vec<ConfluenceEvent>,
    pub lead_lag: Vec<LeadLagRelationship>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatilityBand {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    Tight,
    Moderate,
    Loose,
}

#[derive(Debug, Clone, Default)]
pub struct MarketContext {
    pub dominant_regime: Option<String>,
    pub session_activity: HashMap<String, usize>,
    pub symbol_activity: HashMap<String, usize>,
    pub volatility_band: Option<VolatilityBand>,
    pub correlation_state: Option<CorrelationState>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoricalPerformance {
    pub persistent_signals: Vec<ProducerOutput>,
    pub ephemeral_signals: Vec<ProducerOutput>,
    pub success_patterns: Vec<ProducerOutput>,
    pub failed_patterns: Vec<ProducerOutput>,
    pub lessons: Vec<Strand>,
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentRegistryView {
    pub active: Vec<Strand>,
    pub completed: Vec<Strand>,
    pub unclaimed_hypotheses: Vec<Strand>,
    pub outcomes: Vec<Strand>,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedViews {
    pub producer_outputs: Vec<ProducerOutput>,
    pub cross_source: CrossSourceMetadata,
    pub market_context: MarketContext,
    pub historical: HistoricalPerformance,
    pub experiments: ExperimentRegistryView,
}

/// Average of unit-matches across {symbol, timeframe, regime,
/// session_bucket, detection_type}; 0.1 baseline if nothing matches (§4.6).
pub fn strand_similarity(a: &Strand, b: &Strand) -> f64 {
    let features: [bool; 5] = [
        opt_eq(&a.symbol, &b.symbol),
        opt_eq(&a.timeframe, &b.timeframe),
        opt_eq(&a.regime, &b.regime),
        opt_eq(&a.session_bucket, &b.session_bucket),
        detection_type_of(a) == detection_type_of(b),
    ];
    let matches = features.iter().filter(|&&m| m).count();
    if matches == 0 {
        return 0.1;
    }
    matches as f64 / features.len() as f64
}

fn opt_eq(a: &Option<String>, b: &Option<String>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

pub struct InputNormalizer {
    store: std::sync::Arc<StrandStore>,
    confluence_threshold: f64,
    lead_lag_window: (i64, i64),
}

impl InputNormalizer {
    pub fn new(store: std::sync::Arc<StrandStore>, confluence_threshold: f64, lead_lag_window: (i64, i64)) -> Self {
        Self { store, confluence_threshold, lead_lag_window }
    }

    pub fn normalize(&self, now: DateTime<Utc>) -> anyhow::Result<NormalizedViews> {
        let producer_outputs = self.producer_outputs_view(now - Duration::hours(24))?;
        let recent_48h = self.recent_strands(now - Duration::hours(48))?;
        let cross_source = self.cross_source_view(&recent_48h);
        let market_context = self.market_context_view(&producer_outputs);
        let historical = self.historical_view(&recent_48h)?;
        let experiments = self.experiments_view()?;
        Ok(NormalizedViews { producer_outputs, cross_source, market_context, historical, experiments })
    }

    fn recent_strands(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Strand>> {
        self.store.scan(
            &StrandFilter::new()
                .created_after(since)
                .order(OrderBy::CreatedAtAsc),
        )
    }

    fn producer_outputs_view(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ProducerOutput>> {
        let strands = self.recent_strands(since)?;
        Ok(strands
            .iter()
            .filter(|s| matches!(s.kind, StrandKind::Signal | StrandKind::Motif | StrandKind::MetaSignal))
            .map(to_producer_output)
            .collect())
    }

    /// Self-correlation exclusion: coincidence detection excludes pairs
    /// where both strands come from the synthesis engine itself (§4.6).
    fn cross_source_view(&self, strands: &[Strand]) -> CrossSourceMetadata {
        let mut meta = CrossSourceMetadata::default();
        for s in strands {
            meta.per_source_timing.entry(s.source_id.clone()).or_default().push(s.created_at);
            meta.detection_type_producers
                .entry(detection_type_of(s))
                .or_default()
                .insert(s.source_id.clone());
            let cell = meta
                .coverage
                .entry((
                    s.symbol.clone().unwrap_or_default(),
                    s.timeframe.clone().unwrap_or_default(),
                    s.regime.clone().unwrap_or_default(),
                    s.session_bucket.clone().unwrap_or_default(),
                ))
                .or_default();
            cell.producers.insert(s.source_id.clone());
            cell.count += 1;
        }

        let signal_like: Vec<&Strand> = strands
            .iter()
            .filter(|s| matches!(s.kind, StrandKind::Signal | StrandKind::Motif))
            .collect();

        // Pairwise similarity is CPU-bound batch work with no I/O suspension
        // (§5); fan it out over rayon's pool the way the teacher does for its
        // own signal-batch scoring, rather than a long serial double loop.
        let threshold = self.confluence_threshold;
        let mut confluence_events: Vec<ConfluenceEvent> = (0..signal_like.len())
            .into_par_iter()
            .flat_map_iter(|i| {
                let signal_like = &signal_like;
                ((i + 1)..signal_like.len()).filter_map(move |j| {
                    let a = signal_like[i];
                    let b = signal_like[j];
                    if a.source_id == "global_synthesizer" && b.source_id == "global_synthesizer" {
                        return None;
                    }
                    let delta = (a.created_at - b.created_at).num_seconds().abs();
                    if delta > 300 {
                        return None;
                    }
                    let similarity = strand_similarity(a, b);
                    if similarity < threshold {
                        return None;
                    }
                    let bucket_start = a.created_at.min(b.created_at);
                    Some(ConfluenceEvent {
                        strand_a: a.id.clone(),
                        strand_b: b.id.clone(),
                        source_a: a.source_id.clone(),
                        source_b: b.source_id.clone(),
                        similarity,
                        bucket_start,
                    })
                })
            })
            .collect();
        confluence_events.sort_by(|a, b| a.bucket_start.cmp(&b.bucket_start).then_with(|| a.strand_a.cmp(&b.strand_a)));
        meta.confluence_events = confluence_events;

        meta.lead_lag = self.lead_lag_relationships(&signal_like);
        meta
    }

    fn lead_lag_relationships(&self, strands: &[&Strand]) -> Vec<LeadLagRelationship> {
        let (min_lag, max_lag) = self.lead_lag_window;
        let mut by_pair: HashMap<(String, String), (usize, usize)> = HashMap::new();

        for a in strands {
            for b in strands {
                if a.source_id == b.source_id {
                    continue;
                }
                let lag_secs = (b.created_at - a.created_at).num_seconds();
                let pairable = a.symbol == b.symbol && a.symbol.is_some();
                if !pairable {
                    continue;
                }
                let entry = by_pair.entry((a.source_id.clone(), b.source_id.clone())).or_insert((0, 0));
                entry.1 += 1;
                if lag_secs >= min_lag && lag_secs <= max_lag {
                    entry.0 += 1;
                }
            }
        }

        by_pair
            .into_iter()
            .filter_map(|((lead, lag), (hits, total))| {
                if total == 0 {
                    return None;
                }
                let fraction = hits as f64 / total as f64;
                if fraction >= 0.60 {
                    Some(LeadLagRelationship { lead_source: lead, lag_source: lag, fraction, pair_count: total })
                } else {
                    None
                }
            })
            .collect()
    }

    fn market_context_view(&self, outputs: &[ProducerOutput]) -> MarketContext {
        let mut regime_counts: HashMap<String, usize> = HashMap::new();
        let mut session_activity: HashMap<String, usize> = HashMap::new();
        let mut symbol_activity: HashMap<String, usize> = HashMap::new();
        let mut strengths = Vec::new();
        let mut active_symbols: HashSet<String> = HashSet::new();

        for o in outputs {
            if let Some(regime) = &o.context.regime {
                *regime_counts.entry(regime.clone()).or_insert(0) += 1;
            }
            if let Some(session) = &o.context.session {
                *session_activity.entry(session.clone()).or_insert(0) += 1;
            }
            if let Some(symbol) = &o.context.symbol {
                *symbol_activity.entry(symbol.clone()).or_insert(0) += 1;
                active_symbols.insert(symbol.clone());
            }
            strengths.push(o.signal_strength);
        }

        let dominant_regime = regime_counts.into_iter().max_by_key(|(_, c)| *c).map(|(r, _)| r);
        let mean_strength = if strengths.is_empty() {
            0.0
        } else {
            strengths.iter().sum::<f64>() / strengths.len() as f64
        };
        let volatility_band = Some(if mean_strength < 0.33 {
            VolatilityBand::Low
        } else if mean_strength < 0.66 {
            VolatilityBand::Medium
        } else {
            VolatilityBand::High
        });
        let correlation_state = Some(match active_symbols.len() {
            0..=2 => CorrelationState::Tight,
            3..=6 => CorrelationState::Moderate,
            _ => CorrelationState::Loose,
        });

        MarketContext { dominant_regime, session_activity, symbol_activity, volatility_band, correlation_state }
    }

    fn historical_view(&self, strands: &[Strand]) -> anyhow::Result<HistoricalPerformance> {
        let mut perf = HistoricalPerformance::default();
        for s in strands {
            if s.kind == StrandKind::Lesson {
                perf.lessons.push(s.clone());
                continue;
            }
            if !matches!(s.kind, StrandKind::Signal | StrandKind::Motif | StrandKind::PredictionReview) {
                continue;
            }
            let output = to_producer_output(s);
            if output.signal_strength > 0.66 {
                perf.persistent_signals.push(output.clone());
            } else if output.signal_strength < 0.33 && s.outcome_score < 0.5 {
                perf.ephemeral_signals.push(output.clone());
            }
            if s.outcome_score > 0.6 && output.confidence > 0.5 {
                perf.success_patterns.push(output.clone());
            } else if s.outcome_score < 0.4 || output.confidence < 0.3 {
                perf.failed_patterns.push(output);
            }
        }
        Ok(perf)
    }

    fn experiments_view(&self) -> anyhow::Result<ExperimentRegistryView> {
        let assignments = self.store.scan(&StrandFilter::new().kind(StrandKind::ExperimentAssignment))?;
        let outcomes = self.store.scan(&StrandFilter::new().kind(StrandKind::ExperimentResult))?;

        let status_of = |s: &Strand| -> String {
            s.module_intelligence.get("status").and_then(|v| v.as_str()).unwrap_or("pending").to_string()
        };

        let active = assignments.iter().filter(|s| status_of(s) == "active").cloned().collect();
        let completed = assignments
            .iter()
            .filter(|s| matches!(status_of(s).as_str(), "completed" | "failed" | "timed_out" | "cancelled"))
            .cloned()
            .collect();
        let unclaimed_hypotheses = assignments.iter().filter(|s| status_of(s) == "pending").cloned().collect();

        Ok(ExperimentRegistryView { active, completed, unclaimed_hypotheses, outcomes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::{ClusterKeyEntry, Direction, NewStrand};

    fn base(kind: StrandKind, source: &str, symbol: &str) -> NewStrand {
        NewStrand::base(kind, source)
            .with_symbol(symbol)
            .with_timeframe("1h")
            .with_regime("bull")
            .with_session("us")
            .with_signal(0.8, 0.7, Direction::Long)
    }

    #[test]
    fn similarity_baseline_on_disjoint_strands() {
        let store = StrandStore::open_in_memory().unwrap();
        let a_id = store.append(base(StrandKind::Signal, "a", "BTC")).unwrap();
        let b_id = store
            .append(NewStrand::base(StrandKind::Lesson, "b").with_symbol("ETH").with_timeframe("4h"))
            .unwrap();
        let a = store.get(&a_id).unwrap().unwrap();
        let b = store.get(&b_id).unwrap().unwrap();
        assert!((strand_similarity(&a, &b) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn confluence_detected_for_similar_nearby_strands() {
        let store = std::sync::Arc::new(StrandStore::open_in_memory().unwrap());
        store.append(base(StrandKind::Signal, "producer_a", "BTC")).unwrap();
        store.append(base(StrandKind::Signal, "producer_b", "BTC")).unwrap();

        let normalizer = InputNormalizer::new(store, 0.7, (60, 3600));
        let views = normalizer.normalize(Utc::now()).unwrap();
        assert_eq!(views.cross_source.confluence_events.len(), 1);
    }

    #[test]
    fn self_correlation_excluded() {
        let store = std::sync::Arc::new(StrandStore::open_in_memory().unwrap());
        store.append(base(StrandKind::Signal, "global_synthesizer", "BTC")).unwrap();
        store.append(base(StrandKind::Signal, "global_synthesizer", "BTC")).unwrap();

        let normalizer = InputNormalizer::new(store, 0.7, (60, 3600));
        let views = normalizer.normalize(Utc::now()).unwrap();
        assert!(views.cross_source.confluence_events.is_empty());
    }

    #[test]
    fn historical_view_buckets_success_and_failure() {
        let store = std::sync::Arc::new(StrandStore::open_in_memory().unwrap());
        let good_id = store.append(base(StrandKind::Signal, "p", "BTC")).unwrap();
        store
            .update_rollup(&good_id, crate::strand::RollupPatch { outcome_score: Some(0.9), doctrine_rollup: None, assignment_status: None })
            .unwrap();
        let bad = base(StrandKind::Signal, "p", "ETH").with_cluster_key(vec![ClusterKeyEntry {
            cluster_type: "asset".into(),
            cluster_key: "ETH".into(),
            braid_level: 1,
            consumed: false,
        }]);
        let bad_id = store.append(bad).unwrap();
        store
            .update_rollup(&bad_id, crate::strand::RollupPatch { outcome_score: Some(0.1), doctrine_rollup: None, assignment_status: None })
            .unwrap();

        let normalizer = InputNormalizer::new(store, 0.7, (60, 3600));
        let views = normalizer.normalize(Utc::now()).unwrap();
        assert!(!views.historical.success_patterns.is_empty());
        assert!(!views.historical.failed_patterns.is_empty());
    }
}
