//! Global Synthesizer (§4.7): produces a "global view" from the normalized
//! inputs and emits doctrine-candidate insights.

use crate::normalizer::NormalizedViews;
use crate::strand::{NewStrand, StrandKind, StrandStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CrossSourceCorrelation {
    pub coincidence_count: usize,
    pub lead_lag_count: usize,
    pub confluence_count: usize,
    pub overall_strength: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct CoverageAnalysis {
    pub redundant_areas: Vec<(String, String, String, String)>,
    pub blind_spots: Vec<(String, String, String, String)>,
    pub coverage_gaps: Vec<(String, String, String, String)>,
    pub coverage_score: f64,
    pub efficiency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolutionTrend {
    Improving,
    Stable,
    Declining,
    InsufficientData,
}

#[derive(Debug, Clone)]
pub struct SignalFamily {
    pub pattern_type: String,
    pub success_rate: f64,
    pub regime_performance: HashMap<String, f64>,
    pub session_performance: HashMap<String, f64>,
    pub evolution_trend: EvolutionTrend,
    pub family_strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaPatternKind {
    ConfluenceBased,
    LeadLagBased,
    RegimeSpecific,
}

#[derive(Debug, Clone)]
pub struct MetaPattern {
    pub kind: MetaPatternKind,
    pub label: String,
    pub strength: f64,
    pub persistence: f64,
    pub novelty: f64,
}

#[derive(Debug, Clone)]
pub struct DoctrineInsight {
    pub insight_type: String,
    pub pattern_family: String,
    pub conditions: Vec<String>,
    pub reliability_score: f64,
    pub evidence_count: usize,
    pub recommendation: String,
    pub confidence_level: f64,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalView {
    pub correlation: CrossSourceCorrelation,
    pub coverage: Option<CoverageAnalysis>,
    pub families: Vec<SignalFamily>,
    pub meta_patterns: Vec<MetaPattern>,
    pub doctrine_insights: Vec<DoctrineInsight>,
}

/// Optional internal aid (§4.7): nodes are signal strand ids, edges are
/// confluence events weighted by similarity. An accelerator only —
/// correctness of synthesis never depends on its presence.
#[derive(Debug, Clone, Default)]
pub struct ConfluenceGraph {
    edges: Vec<(String, String, f64, DateTime<Utc>)>,
}

impl ConfluenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, a: impl Into<String>, b: impl Into<String>, weight: f64, created_at: DateTime<Utc>) {
        self.edges.push((a.into(), b.into(), weight, created_at));
    }

    /// Drops edges older than 24h with weight < 0.3 (§4.7).
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.edges.retain(|(_, _, weight, created_at)| {
            let age = now - *created_at;
            !(age > chrono::Duration::hours(24) && *weight < 0.3)
        });
    }

    /// Connected components via union-find over current edges.
    pub fn connected_components(&self) -> Vec<Vec<String>> {
        let mut parent: HashMap<String, String> = HashMap::new();
        for (a, b, _, _) in &self.edges {
            parent.entry(a.clone()).or_insert_with(|| a.clone());
            parent.entry(b.clone()).or_insert_with(|| b.clone());
        }

        fn find(parent: &mut HashMap<String, String>, x: &str) -> String {
            let p = parent.get(x).cloned().unwrap_or_else(|| x.to_string());
            if p == x {
                p
            } else {
                let root = find(parent, &p);
                parent.insert(x.to_string(), root.clone());
                root
            }
        }

        for (a, b, _, _) in &self.edges {
            let ra = find(&mut parent, a);
            let rb = find(&mut parent, b);
            if ra != rb {
                parent.insert(ra, rb);
            }
        }

        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        let keys: Vec<String> = parent.keys().cloned().collect();
        for k in keys {
            let root = find(&mut parent, &k);
            groups.entry(root).or_default().push(k);
        }
        groups.into_values().collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

pub struct GlobalSynthesizer {
    store: Arc<StrandStore>,
}

impl GlobalSynthesizer {
    pub fn new(store: Arc<StrandStore>) -> Self {
        Self { store }
    }

    pub fn synthesize(&self, views: &NormalizedViews) -> anyhow::Result<GlobalView> {
        let correlation = self.cross_source_correlation(views);
        let coverage = self.coverage_analysis(views);
        let families = self.signal_families(views);
        let meta_patterns = self.meta_patterns(views, &correlation);
        let doctrine_insights = self.doctrine_insights(&families, &meta_patterns, &correlation);

        self.emit(&correlation, &coverage, &families, &meta_patterns, &doctrine_insights)?;

        Ok(GlobalView { correlation, coverage: Some(coverage), families, meta_patterns, doctrine_insights })
    }

    /// `overall_strength` is a weighted mean (coincidence 0.3, lead-lag 0.4,
    /// confluence 0.3) over the per-class means (§4.7).
    fn cross_source_correlation(&self, views: &NormalizedViews) -> CrossSourceCorrelation {
        let coincidence_scores: Vec<f64> = views
            .cross_source
            .detection_type_producers
            .values()
            .filter(|producers| producers.len() >= 2)
            .map(|producers| (producers.len() as f64 / 3.0).min(1.0))
            .collect();
        let coincidence_mean = mean(&coincidence_scores);

        let lead_lag_scores: Vec<f64> = views.cross_source.lead_lag.iter().map(|r| r.fraction).collect();
        let lead_lag_mean = mean(&lead_lag_scores);

        let confluence_scores: Vec<f64> = views.cross_source.confluence_events.iter().map(|e| e.similarity).collect();
        let confluence_mean = mean(&confluence_scores);

        let overall_strength = 0.3 * coincidence_mean + 0.4 * lead_lag_mean + 0.3 * confluence_mean;
        let confidences: Vec<f64> = views.producer_outputs.iter().map(|o| o.confidence).collect();
        let confidence = mean(&confidences);

        CrossSourceCorrelation {
            coincidence_count: coincidence_scores.len(),
            lead_lag_count: views.cross_source.lead_lag.len(),
            confluence_count: views.cross_source.confluence_events.len(),
            overall_strength,
            confidence,
        }
    }

    fn coverage_analysis(&self, views: &NormalizedViews) -> CoverageAnalysis {
        let cells = &views.cross_source.coverage;
        let redundant_areas: Vec<_> = cells
            .iter()
            .filter(|(_, c)| c.producers.len() >= 3 && c.count >= 10)
            .map(|(k, _)| k.clone())
            .collect();
        let coverage_gaps: Vec<_> = cells
            .iter()
            .filter(|(_, c)| c.count > 0 && c.count < 3)
            .map(|(k, _)| k.clone())
            .collect();

        // Expected grid: every observed symbol crossed with every observed
        // timeframe; cells absent from `cells` are blind spots.
        let symbols: std::collections::HashSet<&String> = cells.keys().map(|(s, _, _, _)| s).collect();
        let timeframes: std::collections::HashSet<&String> = cells.keys().map(|(_, tf, _, _)| tf).collect();
        let mut expected_total = 0usize;
        let mut blind_spots = Vec::new();
        for symbol in &symbols {
            for tf in &timeframes {
                expected_total += 1;
                let present = cells.keys().any(|(s, t, _, _)| &s == symbol && &t == tf);
                if !present {
                    blind_spots.push(((*symbol).clone(), (*tf).clone(), String::new(), String::new()));
                }
            }
        }

        let active_cells = cells.values().filter(|c| c.count > 0).count();
        let coverage_score = if expected_total == 0 { 0.0 } else { active_cells as f64 / expected_total as f64 };

        let total_producers: std::collections::HashSet<&String> =
            cells.values().flat_map(|c| c.producers.iter()).collect();
        let redundancy_loss: usize = cells
            .iter()
            .filter(|(_, c)| c.producers.len() >= 3 && c.count >= 10)
            .map(|(_, c)| c.producers.len().saturating_sub(1))
            .sum();
        let efficiency = if total_producers.is_empty() {
            1.0
        } else {
            (1.0 - redundancy_loss as f64 / total_producers.len() as f64).max(0.0)
        };

        CoverageAnalysis { redundant_areas, blind_spots, coverage_gaps, coverage_score, efficiency }
    }

    fn signal_families(&self, views: &NormalizedViews) -> Vec<SignalFamily> {
        let mut by_type: HashMap<String, Vec<&crate::normalizer::ProducerOutput>> = HashMap::new();
        let success: Vec<&crate::normalizer::ProducerOutput> = views.historical.success_patterns.iter().collect();
        let failed: Vec<&crate::normalizer::ProducerOutput> = views.historical.failed_patterns.iter().collect();
        for o in success.iter().chain(failed.iter()) {
            by_type.entry(o.detection_type.clone()).or_default().push(o);
        }

        by_type
            .into_iter()
            .map(|(pattern_type, members)| {
                let success_count = members.iter().filter(|o| success.contains(o)).count();
                let total = members.len().max(1);
                let success_rate = success_count as f64 / total as f64;

                let regime_performance = bucket_success_rate(&members, &success, |o| o.context.regime.clone());
                let session_performance = bucket_success_rate(&members, &success, |o| o.context.session.clone());

                let regime_consistency = consistency(&regime_performance);
                let session_consistency = consistency(&session_performance);
                let family_strength = 0.6 * success_rate + 0.2 * regime_consistency + 0.2 * session_consistency;

                let evolution_trend = if members.len() < 4 {
                    EvolutionTrend::InsufficientData
                } else {
                    let mid = members.len() / 2;
                    let mut sorted = members.clone();
                    sorted.sort_by_key(|o| o.timestamp);
                    let early: f64 = sorted[..mid].iter().map(|o| o.signal_strength).sum::<f64>() / mid as f64;
                    let late_count = sorted.len() - mid;
                    let late: f64 = sorted[mid..].iter().map(|o| o.signal_strength).sum::<f64>() / late_count as f64;
                    if late - early > 0.1 {
                        EvolutionTrend::Improving
                    } else if early - late > 0.1 {
                        EvolutionTrend::Declining
                    } else {
                        EvolutionTrend::Stable
                    }
                };

                SignalFamily {
                    pattern_type,
                    success_rate,
                    regime_performance,
                    session_performance,
                    evolution_trend,
                    family_strength,
                }
            })
            .collect()
    }

    fn meta_patterns(&self, views: &NormalizedViews, _correlation: &CrossSourceCorrelation) -> Vec<MetaPattern> {
        let mut patterns = Vec::new();

        for event in &views.cross_source.confluence_events {
            patterns.push(MetaPattern {
                kind: MetaPatternKind::ConfluenceBased,
                label: format!("{}+{}", event.source_a, event.source_b),
                strength: event.similarity,
                persistence: 0.5,
                novelty: 0.5,
            });
        }

        for rel in &views.cross_source.lead_lag {
            patterns.push(MetaPattern {
                kind: MetaPatternKind::LeadLagBased,
                label: format!("{}->{}", rel.lead_source, rel.lag_source),
                strength: rel.fraction,
                persistence: (rel.pair_count as f64 / 10.0).min(1.0),
                novelty: 0.4,
            });
        }

        if let Some(regime) = &views.market_context.dominant_regime {
            let total: usize = views.market_context.symbol_activity.values().sum();
            let regime_count = views
                .producer_outputs
                .iter()
                .filter(|o| o.context.regime.as_deref() == Some(regime.as_str()))
                .count();
            let strength = if total == 0 { 0.0 } else { regime_count as f64 / total as f64 };
            patterns.push(MetaPattern {
                kind: MetaPatternKind::RegimeSpecific,
                label: regime.clone(),
                strength,
                persistence: 0.6,
                novelty: 0.3,
            });
        }

        patterns
    }

    /// For each family with `family_strength > 0.6`, each meta-pattern with
    /// `strength > 0.75`, each correlation with `overall_strength > 0.7` —
    /// emit a doctrine-candidate insight (§4.7).
    fn doctrine_insights(
        &self,
        families: &[SignalFamily],
        meta_patterns: &[MetaPattern],
        correlation: &CrossSourceCorrelation,
    ) -> Vec<DoctrineInsight> {
        let mut insights = Vec::new();

        for family in families.iter().filter(|f| f.family_strength > 0.6) {
            insights.push(DoctrineInsight {
                insight_type: "signal_family".to_string(),
                pattern_family: family.pattern_type.clone(),
                conditions: vec![format!("evolution_trend={:?}", family.evolution_trend)],
                reliability_score: family.family_strength,
                evidence_count: 1,
                recommendation: format!("family {} shows durable edge", family.pattern_type),
                confidence_level: family.success_rate,
            });
        }

        for pattern in meta_patterns.iter().filter(|p| p.strength > 0.75) {
            insights.push(DoctrineInsight {
                insight_type: "meta_pattern".to_string(),
                pattern_family: pattern.label.clone(),
                conditions: vec![format!("{:?}", pattern.kind)],
                reliability_score: pattern.strength,
                evidence_count: 1,
                recommendation: format!("meta-pattern {} warrants an experiment", pattern.label),
                confidence_level: pattern.persistence,
            });
        }

        if correlation.overall_strength > 0.7 {
            insights.push(DoctrineInsight {
                insight_type: "cross_source_correlation".to_string(),
                pattern_family: "cross_source".to_string(),
                conditions: vec!["overall_strength>0.7".to_string()],
                reliability_score: correlation.overall_strength,
                evidence_count: correlation.confluence_count + correlation.lead_lag_count,
                recommendation: "cross-source correlation is strong enough to promote".to_string(),
                confidence_level: correlation.confidence,
            });
        }

        insights
    }

    fn emit(
        &self,
        correlation: &CrossSourceCorrelation,
        coverage: &CoverageAnalysis,
        families: &[SignalFamily],
        meta_patterns: &[MetaPattern],
        insights: &[DoctrineInsight],
    ) -> anyhow::Result<()> {
        self.store.append(
            NewStrand::base(StrandKind::CrossSourceCorrelation, "global_synthesizer")
                .with_signal(correlation.overall_strength, correlation.confidence, crate::strand::Direction::Neutral)
                .with_intelligence(serde_json::json!({
                    "coincidence_count": correlation.coincidence_count,
                    "lead_lag_count": correlation.lead_lag_count,
                    "confluence_count": correlation.confluence_count,
                })),
        )?;

        self.store.append(
            NewStrand::base(StrandKind::CoverageAnalysis, "global_synthesizer").with_intelligence(serde_json::json!({
                "coverage_score": coverage.coverage_score,
                "efficiency": coverage.efficiency,
                "redundant_areas": coverage.redundant_areas.len(),
                "blind_spots": coverage.blind_spots.len(),
                "coverage_gaps": coverage.coverage_gaps.len(),
            })),
        )?;

        for family in families {
            self.store.append(
                NewStrand::base(StrandKind::SignalFamily, "global_synthesizer")
                    .with_intelligence(serde_json::json!({
                        "pattern_type": family.pattern_type,
                        "success_rate": family.success_rate,
                        "family_strength": family.family_strength,
                        "evolution_trend": format!("{:?}", family.evolution_trend),
                    })),
            )?;
        }

        for pattern in meta_patterns {
            self.store.append(
                NewStrand::base(StrandKind::MetaSignal, "global_synthesizer").with_intelligence(serde_json::json!({
                    "kind": format!("{:?}", pattern.kind),
                    "label": pattern.label,
                    "strength": pattern.strength,
                    "persistence": pattern.persistence,
                    "novelty": pattern.novelty,
                })),
            )?;
        }

        for insight in insights {
            self.store.append(
                NewStrand::base(StrandKind::DoctrineInsight, "global_synthesizer")
                    .with_signal(insight.reliability_score, insight.confidence_level, crate::strand::Direction::Neutral)
                    .with_intelligence(serde_json::to_value(InsightPayload::from(insight))?),
            )?;
        }

        Ok(())
    }
}

#[derive(serde::Serialize)]
struct InsightPayload {
    insight_type: String,
    pattern_family: String,
    conditions: Vec<String>,
    reliability_score: f64,
    evidence_count: usize,
    recommendation: String,
    confidence_level: f64,
}

impl From<&DoctrineInsight> for InsightPayload {
    fn from(i: &DoctrineInsight) -> Self {
        Self {
            insight_type: i.insight_type.clone(),
            pattern_family: i.pattern_family.clone(),
            conditions: i.conditions.clone(),
            reliability_score: i.reliability_score,
            evidence_count: i.evidence_count,
            recommendation: i.recommendation.clone(),
            confidence_level: i.confidence_level,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn bucket_success_rate(
    members: &[&crate::normalizer::ProducerOutput],
    success: &[&crate::normalizer::ProducerOutput],
    key_fn: impl Fn(&crate::normalizer::ProducerOutput) -> Option<String>,
) -> HashMap<String, f64> {
    let mut buckets: HashMap<String, (usize, usize)> = HashMap::new();
    for m in members {
        let Some(key) = key_fn(m) else { continue };
        let entry = buckets.entry(key).or_insert((0, 0));
        entry.1 += 1;
        if success.contains(m) {
            entry.0 += 1;
        }
    }
    buckets
        .into_iter()
        .map(|(k, (hits, total))| (k, if total == 0 { 0.0 } else { hits as f64 / total as f64 }))
        .collect()
}

fn consistency(buckets: &HashMap<String, f64>) -> f64 {
    if buckets.is_empty() {
        return 1.0;
    }
    let max = buckets.values().cloned().fold(f64::MIN, f64::max);
    let min = buckets.values().cloned().fold(f64::MAX, f64::min);
    1.0 - (max - min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::InputNormalizer;
    use crate::strand::{Direction, NewStrand};

    #[test]
    fn confluence_graph_prunes_old_low_weight_edges() {
        let mut graph = ConfluenceGraph::new();
        let now = Utc::now();
        graph.add_edge("a", "b", 0.9, now);
        graph.add_edge("c", "d", 0.1, now - chrono::Duration::hours(25));
        graph.prune(now);
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn confluence_graph_connected_components() {
        let mut graph = ConfluenceGraph::new();
        let now = Utc::now();
        graph.add_edge("a", "b", 0.9, now);
        graph.add_edge("b", "c", 0.8, now);
        graph.add_edge("x", "y", 0.7, now);
        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
    }

    #[test]
    fn synthesize_emits_strands_for_each_output() {
        let store = Arc::new(StrandStore::open_in_memory().unwrap());
        for i in 0..4 {
            store
                .append(
                    NewStrand::base(StrandKind::Signal, format!("producer_{i}"))
                        .with_symbol("BTC")
                        .with_timeframe("1h")
                        .with_regime("bull")
                        .with_session("us")
                        .with_signal(0.8, 0.8, Direction::Long),
                )
                .unwrap();
        }
        let normalizer = InputNormalizer::new(store.clone(), 0.7, (60, 3600));
        let views = normalizer.normalize(Utc::now()).unwrap();

        let synthesizer = GlobalSynthesizer::new(store.clone());
        let global_view = synthesizer.synthesize(&views).unwrap();
        assert!(global_view.correlation.overall_strength >= 0.0);

        let correlations = store
            .scan(&crate::strand::StrandFilter::new().kind(StrandKind::CrossSourceCorrelation))
            .unwrap();
        assert_eq!(correlations.len(), 1);
    }
}
