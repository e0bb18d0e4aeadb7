//! Resonance Prioritizer (§4.10): orders candidate strands for downstream
//! attention (braiding, experiment design, doctrine review) by a weighted,
//! multi-dimensional score, then packs them into a family-capped queue.

use crate::strand::Strand;
use rayon::prelude::*;
use std::collections::HashMap;

/// Per-candidate score breakdown (§4.10 five dimensions).
#[derive(Debug, Clone, Copy, Default)]
pub struct ResonanceScore {
    pub pattern_strength: f64,
    pub family_coherence: f64,
    pub cross_source_confirmation: f64,
    pub temporal_relevance: f64,
    pub contextual_fit: f64,
    pub total: f64,
}

const WEIGHT_PATTERN: f64 = 0.30;
const WEIGHT_FAMILY: f64 = 0.25;
const WEIGHT_CROSS_SOURCE: f64 = 0.20;
const WEIGHT_TEMPORAL: f64 = 0.15;
const WEIGHT_CONTEXTUAL: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub strand_id: String,
    pub family: String,
    pub source_id: String,
    pub score: ResonanceScore,
}

#[derive(Debug, Clone, Default)]
pub struct FamilyDistribution {
    pub counts: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PrioritizedQueue {
    pub ordered: Vec<RankedCandidate>,
    pub family_distribution: FamilyDistribution,
    pub constraint_violations: Vec<String>,
}

/// Inputs the scorer needs per strand beyond what's on the strand itself:
/// how many peers share its family, how many independent sources corroborate
/// it, and how recently it fired relative to `now`.
#[derive(Debug, Clone)]
pub struct ResonanceContext {
    pub family_peer_count: usize,
    pub corroborating_source_count: usize,
    pub age_seconds: i64,
    pub context_match_score: f64,
}

pub struct ResonancePrioritizer {
    family_cap_fraction: f64,
}

impl ResonancePrioritizer {
    pub fn new(family_cap_fraction: f64) -> Self {
        Self { family_cap_fraction }
    }

    pub fn score(&self, strand: &Strand, ctx: &ResonanceContext) -> ResonanceScore {
        let pattern_strength = (strand.sig_sigma * strand.sig_confidence).clamp(0.0, 1.0);
        let family_coherence = (ctx.family_peer_count as f64 / 5.0).min(1.0);
        let cross_source_confirmation = (ctx.corroborating_source_count as f64 / 3.0).min(1.0);
        // Half-life of 6 hours: relevance decays to 0.5 at 21600s, floors at 0.
        let temporal_relevance = (1.0 - ctx.age_seconds as f64 / 43200.0).clamp(0.0, 1.0);
        let contextual_fit = ctx.context_match_score.clamp(0.0, 1.0);

        let total = pattern_strength * WEIGHT_PATTERN
            + family_coherence * WEIGHT_FAMILY
            + cross_source_confirmation * WEIGHT_CROSS_SOURCE
            + temporal_relevance * WEIGHT_TEMPORAL
            + contextual_fit * WEIGHT_CONTEXTUAL;

        ResonanceScore {
            pattern_strength,
            family_coherence,
            cross_source_confirmation,
            temporal_relevance,
            contextual_fit,
            total,
        }
    }

    /// Builds the ordered queue: rank all candidates by total score
    /// descending, then enforce a per-family cap of
    /// `ceil(current_count_in_family * family_cap_fraction)` (floor 1) —
    /// each family's cap is derived from *that family's own* candidate
    /// count, not the total pool — dropping lower-scored overflow from an
    /// over-represented family rather than starving other families
    /// entirely (§4.10 "family-cap queue construction").
    pub fn build_queue(
        &self,
        candidates: Vec<(Strand, ResonanceContext)>,
        source_workload_cap: Option<&HashMap<String, usize>>,
    ) -> PrioritizedQueue {
        // Scoring is CPU-bound and independent per candidate; batch it over
        // rayon's pool rather than a serial map, matching the teacher's use
        // of rayon for its own batch scoring passes.
        let mut ranked: Vec<RankedCandidate> = candidates
            .par_iter()
            .map(|(strand, ctx)| {
                let family = strand
                    .tags
                    .iter()
                    .find(|t| t.starts_with("family:"))
                    .cloned()
                    .unwrap_or_else(|| format!("family:{}", strand.kind.as_str()));
                RankedCandidate {
                    strand_id: strand.id.clone(),
                    family,
                    source_id: strand.source_id.clone(),
                    score: self.score(strand, ctx),
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.score.total.partial_cmp(&a.score.total).unwrap_or(std::cmp::Ordering::Equal));

        let mut family_sizes: HashMap<String, usize> = HashMap::new();
        for candidate in &ranked {
            *family_sizes.entry(candidate.family.clone()).or_insert(0) += 1;
        }
        let family_caps: HashMap<String, usize> = family_sizes
            .iter()
            .map(|(family, count)| {
                let cap = ((*count as f64 * self.family_cap_fraction).ceil() as usize).max(1);
                (family.clone(), cap)
            })
            .collect();

        let mut family_counts: HashMap<String, usize> = HashMap::new();
        let mut source_counts: HashMap<String, usize> = HashMap::new();
        let mut ordered = Vec::new();
        let mut violations = Vec::new();

        for candidate in ranked {
            let family_cap = family_caps.get(&candidate.family).copied().unwrap_or(1);
            let family_count = family_counts.entry(candidate.family.clone()).or_insert(0);
            if *family_count >= family_cap {
                violations.push(format!(
                    "dropped {} from over-represented family {} (cap {})",
                    candidate.strand_id, candidate.family, family_cap
                ));
                continue;
            }
            if let Some(caps) = source_workload_cap {
                if let Some(&cap) = caps.get(&candidate.source_id) {
                    let source_count = source_counts.entry(candidate.source_id.clone()).or_insert(0);
                    if *source_count >= cap {
                        violations.push(format!(
                            "dropped {} exceeding workload cap for source {} (cap {})",
                            candidate.strand_id, candidate.source_id, cap
                        ));
                        continue;
                    }
                    *source_count += 1;
                }
            }
            *family_count += 1;
            ordered.push(candidate);
        }

        PrioritizedQueue {
            ordered,
            family_distribution: FamilyDistribution { counts: family_counts },
            constraint_violations: violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strand::{Direction, NewStrand, StrandKind, StrandStore};

    fn strand_with(store: &StrandStore, source: &str, family_tag: &str, sigma: f64, conf: f64) -> Strand {
        let id = store
            .append(
                NewStrand::base(StrandKind::Signal, source)
                    .with_tags(vec![family_tag.to_string()])
                    .with_signal(sigma, conf, Direction::Long),
            )
            .unwrap();
        store.get(&id).unwrap().unwrap()
    }

    #[test]
    fn higher_pattern_strength_ranks_first() {
        let store = StrandStore::open_in_memory().unwrap();
        let strong = strand_with(&store, "a", "family:divergence", 0.9, 0.9);
        let weak = strand_with(&store, "b", "family:divergence", 0.2, 0.2);

        let prioritizer = ResonancePrioritizer::new(0.30);
        let ctx = ResonanceContext {
            family_peer_count: 1,
            corroborating_source_count: 0,
            age_seconds: 60,
            context_match_score: 0.5,
        };
        let queue = prioritizer.build_queue(vec![(strong.clone(), ctx.clone()), (weak.clone(), ctx)], None);
        assert_eq!(queue.ordered[0].strand_id, strong.id);
    }

    #[test]
    fn family_cap_drops_overflow_from_dominant_family() {
        let store = StrandStore::open_in_memory().unwrap();
        let prioritizer = ResonancePrioritizer::new(0.30);
        let ctx = ResonanceContext {
            family_peer_count: 5,
            corroborating_source_count: 1,
            age_seconds: 0,
            context_match_score: 1.0,
        };
        // 10 candidates, 8 of "divergence" (cap = ceil(8*0.3) = 3), 2 of
        // "volume" (cap = ceil(2*0.3) = 1) — each family's cap comes from
        // its own count, not the pool of 10.
        let mut candidates = Vec::new();
        for i in 0..8 {
            candidates.push((strand_with(&store, "src_a", "family:divergence", 0.9 - i as f64 * 0.01, 0.8), ctx.clone()));
        }
        for i in 0..2 {
            candidates.push((strand_with(&store, "src_b", "family:volume", 0.5 - i as f64 * 0.01, 0.5), ctx.clone()));
        }
        let queue = prioritizer.build_queue(candidates, None);
        assert_eq!(*queue.family_distribution.counts.get("family:divergence").unwrap(), 3);
        assert_eq!(*queue.family_distribution.counts.get("family:volume").unwrap(), 1);
        assert!(!queue.constraint_violations.is_empty());
    }

    #[test]
    fn source_workload_cap_is_respected() {
        let store = StrandStore::open_in_memory().unwrap();
        let prioritizer = ResonancePrioritizer::new(1.0);
        let ctx = ResonanceContext {
            family_peer_count: 0,
            corroborating_source_count: 0,
            age_seconds: 0,
            context_match_score: 0.0,
        };
        let candidates: Vec<_> = (0..5)
            .map(|i| (strand_with(&store, "busy_source", &format!("family:f{i}"), 0.5, 0.5), ctx.clone()))
            .collect();
        let mut caps = HashMap::new();
        caps.insert("busy_source".to_string(), 2);
        let queue = prioritizer.build_queue(candidates, Some(&caps));
        assert_eq!(queue.ordered.len(), 2);
    }
}
