//! Experiment Orchestrator (§4.8): turns candidate ideas into assigned
//! experiments, tracks them to completion or timeout, and absorbs results.

use crate::capability::{Capability, CapabilityMap};
use crate::doctrine::DoctrineKeeper;
use crate::strand::{NewStrand, OrderBy, StrandFilter, StrandKind, StrandStore};
use crate::synthesizer::{EvolutionTrend, GlobalView, MetaPatternKind};
use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Experiment shape, i.e. what kind of test a target source runs (§2
/// supplemented from `output_directive_system.py`'s shape catalogue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentShape {
    Durability,
    Stack,
    LeadLag,
    Ablation,
    Boundary,
}

impl ExperimentShape {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentShape::Durability => "durability",
            ExperimentShape::Stack => "stack",
            ExperimentShape::LeadLag => "lead_lag",
            ExperimentShape::Ablation => "ablation",
            ExperimentShape::Boundary => "boundary",
        }
    }
}

/// A raw idea before it is shaped and admitted into the queue.
#[derive(Debug, Clone)]
pub struct IdeaCandidate {
    pub pattern_type: String,
    pub pattern_id: String,
    pub hypothesis: String,
    pub shape: ExperimentShape,
    pub target_capability: Capability,
    pub parameters: serde_json::Value,
    pub context: Option<String>,
    /// Set when the idea carries a mechanism hypothesis not already recorded
    /// in the pattern's why-map (§8 Scenario 5: a contraindicated pattern is
    /// still admitted if the idea attaches a genuinely new hypothesis).
    pub new_mechanism_hypothesis: Option<String>,
}

/// Decision returned for each candidate (§2 supplemented from
/// `output_directive_system.py`).
#[derive(Debug, Clone)]
pub enum OutputDirective {
    Assign { target_source: String },
    Defer,
    Reject { reason: String },
}

pub struct AdmissionResult {
    pub candidate: IdeaCandidate,
    pub directive: OutputDirective,
}

/// Idea generation (§4.8 step 1): turns synthesis output into raw candidates
/// from high-confidence doctrine insights, declining signal families,
/// strong meta-patterns, coverage blind spots/gaps, and overall cross-source
/// correlation strength. Each candidate still has to clear `evaluate`'s
/// guardrails before admission.
pub fn generate_ideas(view: &GlobalView) -> Vec<IdeaCandidate> {
    let mut ideas = Vec::new();

    for insight in &view.doctrine_insights {
        if insight.confidence_level < 0.6 {
            continue;
        }
        ideas.push(IdeaCandidate {
            pattern_type: insight.insight_type.clone(),
            pattern_id: insight.pattern_family.clone(),
            hypothesis: insight.recommendation.clone(),
            shape: ExperimentShape::Durability,
            target_capability: infer_capability(&insight.insight_type),
            parameters: json!({ "conditions": insight.conditions, "evidence_count": insight.evidence_count }),
            context: insight.conditions.first().cloned(),
            new_mechanism_hypothesis: None,
        });
    }

    for family in &view.families {
        if matches!(family.evolution_trend, EvolutionTrend::Declining) && family.family_strength > 0.4 {
            ideas.push(IdeaCandidate {
                pattern_type: family.pattern_type.clone(),
                pattern_id: format!("{}_decline", family.pattern_type),
                hypothesis: format!(
                    "{} is declining; isolate which precondition stopped holding",
                    family.pattern_type
                ),
                shape: ExperimentShape::Ablation,
                target_capability: infer_capability(&family.pattern_type),
                parameters: json!({ "family_strength": family.family_strength }),
                context: None,
                new_mechanism_hypothesis: None,
            });
        }
    }

    for pattern in &view.meta_patterns {
        if pattern.strength > 0.75 {
            let shape = match pattern.kind {
                MetaPatternKind::ConfluenceBased => ExperimentShape::Stack,
                MetaPatternKind::LeadLagBased => ExperimentShape::LeadLag,
                MetaPatternKind::RegimeSpecific => ExperimentShape::Boundary,
            };
            ideas.push(IdeaCandidate {
                pattern_type: "meta_pattern".to_string(),
                pattern_id: pattern.label.clone(),
                hypothesis: format!("{} persists across contexts", pattern.label),
                shape,
                target_capability: Capability::Pattern,
                parameters: json!({
                    "strength": pattern.strength,
                    "persistence": pattern.persistence,
                    "novelty": pattern.novelty,
                }),
                context: None,
                new_mechanism_hypothesis: None,
            });
        }
    }

    if let Some(coverage) = &view.coverage {
        for (symbol, timeframe, regime, session) in
            coverage.blind_spots.iter().chain(coverage.coverage_gaps.iter())
        {
            ideas.push(IdeaCandidate {
                pattern_type: "coverage_gap".to_string(),
                pattern_id: format!("{symbol}_{timeframe}"),
                hypothesis: format!("extend detection coverage into {symbol}/{timeframe}"),
                shape: ExperimentShape::Boundary,
                target_capability: Capability::RawData,
                parameters: json!({
                    "symbol": symbol, "timeframe": timeframe, "regime": regime, "session": session,
                }),
                context: None,
                new_mechanism_hypothesis: None,
            });
        }
    }

    if view.correlation.overall_strength > 0.7 {
        ideas.push(IdeaCandidate {
            pattern_type: "cross_source_correlation".to_string(),
            pattern_id: "global_correlation".to_string(),
            hypothesis: "cross-source correlation strength supports a combined signal".to_string(),
            shape: ExperimentShape::Stack,
            target_capability: Capability::Pattern,
            parameters: json!({
                "overall_strength": view.correlation.overall_strength,
                "confidence": view.correlation.confidence,
            }),
            context: None,
            new_mechanism_hypothesis: None,
        });
    }

    ideas
}

/// Target-source capability inference (§4.8 step 4): "divergence/volume ->
/// raw data intelligence producer; indicator composites -> indicator
/// producer; etc."
fn infer_capability(insight_type: &str) -> Capability {
    let lower = insight_type.to_ascii_lowercase();
    if lower.contains("divergence") {
        Capability::Divergence
    } else if lower.contains("volume") {
        Capability::Volume
    } else if lower.contains("indicator") {
        Capability::IndicatorComposite
    } else if lower.contains("microstructure") {
        Capability::Microstructure
    } else if lower.contains("regime") {
        Capability::Regime
    } else {
        Capability::Pattern
    }
}

pub struct ExperimentOrchestrator {
    strands: Arc<StrandStore>,
    doctrine: Arc<DoctrineKeeper>,
    capabilities: Arc<CapabilityMap>,
    max_concurrent: usize,
    max_per_source: usize,
    timeout: chrono::Duration,
}

impl ExperimentOrchestrator {
    pub fn new(
        strands: Arc<StrandStore>,
        doctrine: Arc<DoctrineKeeper>,
        capabilities: Arc<CapabilityMap>,
        max_concurrent: usize,
        max_per_source: usize,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            strands,
            doctrine,
            capabilities,
            max_concurrent,
            max_per_source,
            timeout: chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::hours(24)),
        }
    }

    fn outstanding_assignments(&self) -> Result<Vec<crate::strand::Strand>> {
        self.strands.scan(
            &StrandFilter::new()
                .kind(StrandKind::ExperimentAssignment)
                .order(OrderBy::CreatedAtDesc),
        )
    }

    /// An assignment still holds a queue slot only while it has neither a
    /// matching result nor a `timed_out` status.
    fn is_outstanding(&self, assignment: &crate::strand::Strand) -> Result<bool> {
        if assignment
            .module_intelligence
            .get("status")
            .and_then(|v| v.as_str())
            == Some("timed_out")
        {
            return Ok(false);
        }
        let assignment_id = assignment.id.clone();
        let has_result = self
            .strands
            .scan(&StrandFilter::new().kind(StrandKind::ExperimentResult))?
            .into_iter()
            .any(|r| {
                r.module_intelligence
                    .get("assignment_id")
                    .and_then(|v| v.as_str())
                    == Some(assignment_id.as_str())
            });
        Ok(!has_result)
    }

    /// Evaluates one idea candidate against the guardrails §4.8 lists:
    /// doctrine contraindication, queue capacity (max concurrent + per
    /// source), and target-source selection via the capability map.
    pub fn evaluate(&self, candidate: IdeaCandidate) -> Result<OutputDirective> {
        if self
            .doctrine
            .is_contraindicated(&candidate.pattern_type, &candidate.pattern_id, candidate.context.as_deref())?
        {
            let carries_new_hypothesis = match &candidate.new_mechanism_hypothesis {
                Some(hypothesis) => {
                    let existing = self
                        .doctrine
                        .get(&candidate.pattern_type, &candidate.pattern_id)?
                        .and_then(|entry| entry.why_map.mechanism_hypothesis);
                    existing.as_deref() != Some(hypothesis.as_str())
                }
                None => false,
            };
            if !carries_new_hypothesis {
                return Ok(OutputDirective::Reject {
                    reason: format!(
                        "pattern {}:{} is contraindicated",
                        candidate.pattern_type, candidate.pattern_id
                    ),
                });
            }
            info!(
                pattern_type = %candidate.pattern_type,
                pattern_id = %candidate.pattern_id,
                "admitting contraindicated pattern on a new mechanism hypothesis"
            );
        }

        let outstanding = self.outstanding_assignments()?;
        let mut active = Vec::new();
        for a in &outstanding {
            if self.is_outstanding(a)? {
                active.push(a.clone());
            }
        }

        if active.len() >= self.max_concurrent {
            return Ok(OutputDirective::Defer);
        }

        let mut targets = self.capabilities.sources_with(candidate.target_capability);
        if targets.is_empty() {
            return Ok(OutputDirective::Reject {
                reason: format!(
                    "no registered source carries capability {}",
                    candidate.target_capability.as_str()
                ),
            });
        }
        targets.sort();

        let mut per_source_counts: HashMap<String, usize> = HashMap::new();
        for a in &active {
            *per_source_counts.entry(a.source_id.clone()).or_insert(0) += 1;
        }

        let target = targets
            .into_iter()
            .find(|t| per_source_counts.get(t).copied().unwrap_or(0) < self.max_per_source);

        match target {
            Some(target_source) => Ok(OutputDirective::Assign { target_source }),
            None => Ok(OutputDirective::Defer),
        }
    }

    /// Runs `evaluate` and, for `Assign`, appends an `experiment_assignment`
    /// strand carrying the deadline used by `sweep_timeouts`.
    pub fn admit(&self, candidate: IdeaCandidate) -> Result<AdmissionResult> {
        let directive = self.evaluate(candidate.clone())?;
        if let OutputDirective::Assign { target_source } = &directive {
            let deadline = chrono::Utc::now() + self.timeout;
            self.strands.append(
                NewStrand::base(StrandKind::ExperimentAssignment, "experiment_orchestrator")
                    .with_intelligence(json!({
                        "pattern_type": candidate.pattern_type,
                        "pattern_id": candidate.pattern_id,
                        "hypothesis": candidate.hypothesis,
                        "shape": candidate.shape.as_str(),
                        "target_source": target_source,
                        "parameters": candidate.parameters,
                        "deadline": deadline.to_rfc3339(),
                        "status": "active",
                    })),
            )?;
            info!(
                pattern_type = %candidate.pattern_type,
                pattern_id = %candidate.pattern_id,
                target_source = %target_source,
                "experiment assigned"
            );
        }
        Ok(AdmissionResult { candidate, directive })
    }

    /// Scans outstanding assignments past their deadline and marks them
    /// timed out (§4.8 "deadline -> timed_out transition"). A timed-out
    /// assignment's absence of a matching result is what lets the next
    /// `evaluate` call free its queue slot.
    pub fn sweep_timeouts(&self) -> Result<usize> {
        let now = chrono::Utc::now();
        let mut timed_out = 0;
        for assignment in self.outstanding_assignments()? {
            if assignment
                .module_intelligence
                .get("status")
                .and_then(|v| v.as_str())
                != Some("active")
            {
                continue;
            }
            let deadline = assignment
                .module_intelligence
                .get("deadline")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc));
            if let Some(deadline) = deadline {
                if now > deadline && self.is_outstanding(&assignment)? {
                    self.strands.update_rollup(
                        &assignment.id,
                        crate::strand::RollupPatch {
                            outcome_score: None,
                            doctrine_rollup: None,
                            assignment_status: Some("timed_out".to_string()),
                        },
                    )?;
                    self.strands.append(
                        NewStrand::base(StrandKind::ExperimentResult, "experiment_orchestrator").with_intelligence(
                            json!({
                                "assignment_id": assignment.id,
                                "outcome": "timed_out",
                            }),
                        ),
                    )?;
                    warn!(assignment_id = %assignment.id, "experiment timed out without a result");
                    timed_out += 1;
                }
            }
        }
        Ok(timed_out)
    }

    /// Absorbs an experiment result strand and applies its lesson to the
    /// Doctrine Keeper (§4.9 handoff).
    pub fn absorb_result(
        &self,
        assignment_id: &str,
        pattern_type: &str,
        pattern_id: &str,
        success: bool,
        why_map_delta: crate::doctrine::WhyMap,
    ) -> Result<()> {
        self.strands.append(
            NewStrand::base(StrandKind::ExperimentResult, "experiment_orchestrator")
                .with_intelligence(json!({
                    "assignment_id": assignment_id,
                    "success": success,
                })),
        )?;
        self.doctrine.apply_lesson(&crate::doctrine::Lesson {
            pattern_type: pattern_type.to_string(),
            pattern_id: pattern_id.to_string(),
            success,
            why_map_delta,
            source_strand_id: assignment_id.to_string(),
        })?;
        Ok(())
    }
}

impl Clone for IdeaCandidate {
    fn clone(&self) -> Self {
        Self {
            pattern_type: self.pattern_type.clone(),
            pattern_id: self.pattern_id.clone(),
            hypothesis: self.hypothesis.clone(),
            shape: self.shape,
            target_capability: self.target_capability,
            parameters: self.parameters.clone(),
            context: self.context.clone(),
            new_mechanism_hypothesis: self.new_mechanism_hypothesis.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctrine::WhyMap;

    fn setup() -> (Arc<StrandStore>, Arc<DoctrineKeeper>, Arc<CapabilityMap>) {
        let strands = Arc::new(StrandStore::open_in_memory().unwrap());
        let doctrine = Arc::new(DoctrineKeeper::open_in_memory(10, 0.7, 0.3, 0.7, 0.8).unwrap());
        let capabilities = Arc::new(CapabilityMap::new());
        capabilities.register("raw_data_intel", [Capability::RawData, Capability::Divergence]);
        (strands, doctrine, capabilities)
    }

    fn candidate() -> IdeaCandidate {
        IdeaCandidate {
            pattern_type: "divergence".to_string(),
            pattern_id: "vol_price_div".to_string(),
            hypothesis: "divergence predicts reversal within 4h".to_string(),
            shape: ExperimentShape::LeadLag,
            target_capability: Capability::Divergence,
            parameters: json!({ "window_secs": 3600 }),
            context: None,
            new_mechanism_hypothesis: None,
        }
    }

    #[test]
    fn assigns_to_registered_source() {
        let (strands, doctrine, capabilities) = setup();
        let orchestrator = ExperimentOrchestrator::new(
            strands, doctrine, capabilities, 10, 3, std::time::Duration::from_secs(86400),
        );
        let result = orchestrator.admit(candidate()).unwrap();
        assert!(matches!(result.directive, OutputDirective::Assign { .. }));
    }

    #[test]
    fn rejects_contraindicated_pattern() {
        let (strands, doctrine, capabilities) = setup();
        for i in 0..10 {
            doctrine
                .apply_lesson(&crate::doctrine::Lesson {
                    pattern_type: "divergence".to_string(),
                    pattern_id: "vol_price_div".to_string(),
                    success: i < 1,
                    why_map_delta: WhyMap::default(),
                    source_strand_id: format!("l{i}"),
                })
                .unwrap();
        }
        let orchestrator = ExperimentOrchestrator::new(
            strands, doctrine, capabilities, 10, 3, std::time::Duration::from_secs(86400),
        );
        let result = orchestrator.admit(candidate()).unwrap();
        assert!(matches!(result.directive, OutputDirective::Reject { .. }));
    }

    #[test]
    fn scenario_5_new_mechanism_hypothesis_admits_contraindicated_pattern() {
        let (strands, doctrine, capabilities) = setup();
        for i in 0..10 {
            doctrine
                .apply_lesson(&crate::doctrine::Lesson {
                    pattern_type: "divergence".to_string(),
                    pattern_id: "vol_price_div".to_string(),
                    success: i < 1,
                    why_map_delta: WhyMap::default(),
                    source_strand_id: format!("l{i}"),
                })
                .unwrap();
        }
        let orchestrator = ExperimentOrchestrator::new(
            strands, doctrine, capabilities, 10, 3, std::time::Duration::from_secs(86400),
        );
        let mut idea = candidate();
        idea.new_mechanism_hypothesis = Some("divergence only reverses when funding rate is negative".to_string());
        let result = orchestrator.admit(idea).unwrap();
        assert!(matches!(result.directive, OutputDirective::Assign { .. }));
    }

    #[test]
    fn scenario_6_timeout_frees_queue_slot() {
        let (strands, doctrine, capabilities) = setup();
        let orchestrator = ExperimentOrchestrator::new(
            strands.clone(), doctrine, capabilities, 1, 3, std::time::Duration::from_secs(0),
        );
        let first = orchestrator.admit(candidate()).unwrap();
        assert!(matches!(first.directive, OutputDirective::Assign { .. }));

        // second candidate immediately defers since queue capacity is 1.
        let second = orchestrator.admit(candidate()).unwrap();
        assert!(matches!(second.directive, OutputDirective::Defer));

        // timeout is in the past immediately (duration 0), so the sweep fires.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let timed_out = orchestrator.sweep_timeouts().unwrap();
        assert_eq!(timed_out, 1);

        // §8 Scenario 6: exactly one transition to `timed_out` and one
        // `experiment_result` strand carrying that outcome.
        let results = strands
            .scan(&StrandFilter::new().kind(StrandKind::ExperimentResult))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].module_intelligence.get("outcome").and_then(|v| v.as_str()),
            Some("timed_out")
        );

        let third = orchestrator.admit(candidate()).unwrap();
        assert!(matches!(third.directive, OutputDirective::Assign { .. }));
    }

    #[test]
    fn rejects_when_no_source_carries_capability() {
        let (strands, doctrine, _capabilities) = setup();
        let empty_capabilities = Arc::new(CapabilityMap::new());
        let orchestrator = ExperimentOrchestrator::new(
            strands, doctrine, empty_capabilities, 10, 3, std::time::Duration::from_secs(86400),
        );
        let result = orchestrator.admit(candidate()).unwrap();
        assert!(matches!(result.directive, OutputDirective::Reject { .. }));
    }

    #[test]
    fn generate_ideas_covers_high_confidence_insight_and_declining_family() {
        use crate::synthesizer::{CrossSourceCorrelation, DoctrineInsight, SignalFamily};

        let mut view = GlobalView::default();
        view.doctrine_insights.push(DoctrineInsight {
            insight_type: "divergence_confluence".to_string(),
            pattern_family: "vol_price_div".to_string(),
            conditions: vec!["regime:trending".to_string()],
            reliability_score: 0.8,
            evidence_count: 12,
            recommendation: "combine divergence with volume confluence".to_string(),
            confidence_level: 0.75,
        });
        view.doctrine_insights.push(DoctrineInsight {
            insight_type: "low_confidence".to_string(),
            pattern_family: "noise".to_string(),
            conditions: vec![],
            reliability_score: 0.1,
            evidence_count: 1,
            recommendation: "ignore".to_string(),
            confidence_level: 0.2,
        });
        view.families.push(SignalFamily {
            pattern_type: "breakout".to_string(),
            success_rate: 0.4,
            regime_performance: HashMap::new(),
            session_performance: HashMap::new(),
            evolution_trend: EvolutionTrend::Declining,
            family_strength: 0.5,
        });
        view.correlation = CrossSourceCorrelation {
            coincidence_count: 2,
            lead_lag_count: 2,
            confluence_count: 2,
            overall_strength: 0.9,
            confidence: 0.8,
        };

        let ideas = generate_ideas(&view);
        assert!(ideas.iter().any(|i| i.pattern_id == "vol_price_div"));
        assert!(!ideas.iter().any(|i| i.pattern_id == "noise"));
        assert!(ideas.iter().any(|i| i.pattern_id == "breakout_decline" && i.shape == ExperimentShape::Ablation));
        assert!(ideas.iter().any(|i| i.pattern_id == "global_correlation"));
    }
}
