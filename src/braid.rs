//! Learning Braid Manager (§4.11, §3.2 GLOSSARY "Braid"): groups consumable
//! strands sharing a cluster dimension into higher-level lesson strands.

use crate::analysis::AnalysisFunction;
use crate::strand::{
    ClusterKeyEntry, Direction, NewStrand, OrderBy, Strand, StrandFilter, StrandKind, StrandStore,
};
use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One eligible group of members sharing `(cluster_type, cluster_key,
/// braid_level)`, all still `consumed = false` on that dimension.
#[derive(Debug, Clone)]
pub struct BraidCandidateGroup {
    pub cluster_type: String,
    pub cluster_key: String,
    pub braid_level: u32,
    pub members: Vec<Strand>,
}

pub struct BraidReport {
    pub groups_considered: usize,
    pub braids_formed: usize,
    pub members_consumed: usize,
    pub skipped_analysis_unavailable: usize,
}

pub struct LearningBraidManager {
    strands: Arc<StrandStore>,
    analysis: Arc<dyn AnalysisFunction>,
    threshold: usize,
    source_kind: StrandKind,
}

impl LearningBraidManager {
    pub fn new(
        strands: Arc<StrandStore>,
        analysis: Arc<dyn AnalysisFunction>,
        threshold: usize,
        source_kind: StrandKind,
    ) -> Self {
        Self { strands, analysis, threshold, source_kind }
    }

    /// Groups unconsumed source-kind strands by every `(cluster_type,
    /// cluster_key, braid_level)` triple present on them, keeping only
    /// groups meeting the configured threshold (§4.11 "at least N=3
    /// strands sharing a cluster-key dimension").
    pub fn find_candidate_groups(&self) -> Result<Vec<BraidCandidateGroup>> {
        let pool = self.strands.scan(
            &StrandFilter::new()
                .kind(self.source_kind)
                .order(OrderBy::CreatedAtAsc),
        )?;

        let mut buckets: HashMap<(String, String, u32), Vec<Strand>> = HashMap::new();
        for strand in pool {
            for entry in &strand.cluster_key {
                if entry.consumed {
                    continue;
                }
                buckets
                    .entry((entry.cluster_type.clone(), entry.cluster_key.clone(), entry.braid_level))
                    .or_default()
                    .push(strand.clone());
            }
        }

        Ok(buckets
            .into_iter()
            .filter(|(_, members)| members.len() >= self.threshold)
            .map(|((cluster_type, cluster_key, braid_level), members)| BraidCandidateGroup {
                cluster_type,
                cluster_key,
                braid_level,
                members,
            })
            .collect())
    }

    /// Runs one full cycle: finds eligible groups, synthesizes a lesson via
    /// the analysis function for each, appends the braid strand, and flips
    /// each member's consumed flag via CAS. A group whose analysis call
    /// yields no result is left untouched and retried next cycle (§4.11,
    /// §7 "Analysis function failure").
    pub async fn run_cycle(&self) -> Result<BraidReport> {
        let groups = self.find_candidate_groups()?;
        let mut report = BraidReport {
            groups_considered: groups.len(),
            braids_formed: 0,
            members_consumed: 0,
            skipped_analysis_unavailable: 0,
        };

        for group in groups {
            match self.braid_one(&group).await {
                Ok(consumed) => {
                    report.braids_formed += 1;
                    report.members_consumed += consumed;
                }
                Err(BraidError::AnalysisUnavailable) => {
                    report.skipped_analysis_unavailable += 1;
                    warn!(
                        cluster_type = %group.cluster_type,
                        cluster_key = %group.cluster_key,
                        "braid synthesis skipped: analysis function unavailable"
                    );
                }
                Err(BraidError::Other(e)) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn braid_one(&self, group: &BraidCandidateGroup) -> Result<usize, BraidError> {
        let context = json!({
            "cluster_type": group.cluster_type,
            "cluster_key": group.cluster_key,
            "braid_level": group.braid_level,
            "members": group.members.iter().map(|m| json!({
                "id": m.id,
                "source_id": m.source_id,
                "sig_sigma": m.sig_sigma,
                "sig_confidence": m.sig_confidence,
                "sig_direction": m.sig_direction.as_str(),
                "outcome_score": m.outcome_score,
            })).collect::<Vec<_>>(),
        });

        let result = self
            .analysis
            .analyze("lesson_synthesis", &context)
            .await
            .map_err(BraidError::Other)?;
        let Some(result) = result else { return Err(BraidError::AnalysisUnavailable) };

        let n = group.members.len() as f64;
        let avg_sigma = group.members.iter().map(|m| m.sig_sigma).sum::<f64>() / n;
        let avg_confidence = group.members.iter().map(|m| m.sig_confidence).sum::<f64>() / n;
        let direction = majority_direction(&group.members);

        let source_ids: Vec<String> = group.members.iter().map(|m| m.id.clone()).collect();
        let next_level = group.braid_level + 1;

        let braid = NewStrand::base(self.source_kind, "learning_braid_manager")
            .with_signal(avg_sigma, avg_confidence, direction)
            .with_intelligence(json!({
                "braid_dimension": group.cluster_type,
                "source_braid_level": group.braid_level,
                "analysis_confidence": result.confidence,
                "fields": result.fields,
            }))
            .with_cluster_key(vec![ClusterKeyEntry {
                cluster_type: group.cluster_type.clone(),
                cluster_key: group.cluster_key.clone(),
                braid_level: next_level,
                consumed: false,
            }])
            .as_braid(next_level, result.narrative.clone(), source_ids.clone());

        self.strands.append(braid).map_err(BraidError::Other)?;

        let mut consumed = 0;
        for member_id in &source_ids {
            match self
                .strands
                .consume_cluster_dimension(member_id, &group.cluster_type, group.braid_level)
            {
                Ok(true) => consumed += 1,
                Ok(false) => {}
                Err(e) => return Err(BraidError::Other(e)),
            }
        }

        info!(
            cluster_type = %group.cluster_type,
            cluster_key = %group.cluster_key,
            members = group.members.len(),
            "braid formed"
        );

        Ok(consumed)
    }

    /// Retrieves up to `k` recent braids on a cluster dimension, for context
    /// injection into a new base-level prediction's analysis call (§4.11
    /// "context-injection retrieval").
    pub fn recent_braids(&self, cluster_type: &str, k: usize) -> Result<Vec<Strand>> {
        let candidates = self.strands.scan(
            &StrandFilter::new()
                .kind(self.source_kind)
                .order(OrderBy::CreatedAtDesc)
                .limit(k * 4),
        )?;
        Ok(candidates
            .into_iter()
            .filter(|s| s.lesson.is_some())
            .filter(|s| s.cluster_key.iter().any(|e| e.cluster_type == cluster_type))
            .take(k)
            .collect())
    }
}

enum BraidError {
    AnalysisUnavailable,
    Other(anyhow::Error),
}

fn majority_direction(members: &[Strand]) -> Direction {
    let (mut long, mut short, mut neutral) = (0, 0, 0);
    for m in members {
        match m.sig_direction {
            Direction::Long => long += 1,
            Direction::Short => short += 1,
            Direction::Neutral => neutral += 1,
        }
    }
    if long >= short && long >= neutral {
        Direction::Long
    } else if short >= neutral {
        Direction::Short
    } else {
        Direction::Neutral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisResult, NullAnalysisFunction};

    fn member(store: &StrandStore, sigma: f64, confidence: f64, direction: Direction) -> String {
        store
            .append(
                NewStrand::base(StrandKind::PredictionReview, "raw_data_intel")
                    .with_signal(sigma, confidence, direction)
                    .with_cluster_key(vec![ClusterKeyEntry {
                        cluster_type: "asset".into(),
                        cluster_key: "BTC".into(),
                        braid_level: 1,
                        consumed: false,
                    }]),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn scenario_3_braid_formation_from_three_members() {
        let store = Arc::new(StrandStore::open_in_memory().unwrap());
        member(&store, 0.8, 0.7, Direction::Long);
        member(&store, 0.75, 0.65, Direction::Long);
        member(&store, 0.9, 0.8, Direction::Short);

        let analysis = Arc::new(NullAnalysisFunction::new().with_canned(
            "lesson_synthesis",
            AnalysisResult {
                template_id: "lesson_synthesis".into(),
                narrative: "BTC divergence cluster agrees on direction".into(),
                fields: serde_json::json!({}),
                confidence: 0.85,
            },
        ));

        let manager = LearningBraidManager::new(store.clone(), analysis, 3, StrandKind::PredictionReview);
        let report = manager.run_cycle().await.unwrap();
        assert_eq!(report.braids_formed, 1);
        assert_eq!(report.members_consumed, 3);

        let braids: Vec<_> = store
            .scan(&StrandFilter::new().kind(StrandKind::PredictionReview))
            .unwrap()
            .into_iter()
            .filter(|s| s.lesson.is_some())
            .collect();
        assert_eq!(braids.len(), 1);
        assert_eq!(braids[0].braid_level, 2);
        assert_eq!(braids[0].source_strand_ids.len(), 3);
        assert_eq!(braids[0].sig_direction, Direction::Long);
    }

    #[tokio::test]
    async fn below_threshold_group_never_considered() {
        let store = Arc::new(StrandStore::open_in_memory().unwrap());
        member(&store, 0.8, 0.7, Direction::Long);
        member(&store, 0.75, 0.65, Direction::Long);

        let analysis = Arc::new(NullAnalysisFunction::new());
        let manager = LearningBraidManager::new(store.clone(), analysis, 3, StrandKind::PredictionReview);
        let report = manager.run_cycle().await.unwrap();
        assert_eq!(report.groups_considered, 0);
        assert_eq!(report.braids_formed, 0);
    }

    #[tokio::test]
    async fn analysis_unavailable_leaves_group_unconsumed_for_retry() {
        let store = Arc::new(StrandStore::open_in_memory().unwrap());
        member(&store, 0.8, 0.7, Direction::Long);
        member(&store, 0.75, 0.65, Direction::Long);
        member(&store, 0.9, 0.8, Direction::Short);

        let analysis = Arc::new(NullAnalysisFunction::new());
        let manager = LearningBraidManager::new(store.clone(), analysis, 3, StrandKind::PredictionReview);
        let report = manager.run_cycle().await.unwrap();
        assert_eq!(report.skipped_analysis_unavailable, 1);
        assert_eq!(report.braids_formed, 0);

        let second = manager.find_candidate_groups().unwrap();
        assert_eq!(second.len(), 1);
    }

    /// A level-2 braid carries `kind == source_kind`, so it is itself
    /// visible to the next `find_candidate_groups` scan and can recurse to
    /// level 3 once enough level-2 braids accumulate (§4.11 "Recursion").
    #[tokio::test]
    async fn braid_recurses_to_next_level() {
        let store = Arc::new(StrandStore::open_in_memory().unwrap());
        let analysis = Arc::new(NullAnalysisFunction::new().with_canned(
            "lesson_synthesis",
            AnalysisResult {
                template_id: "lesson_synthesis".into(),
                narrative: "lesson".into(),
                fields: serde_json::json!({}),
                confidence: 0.8,
            },
        ));
        let manager = LearningBraidManager::new(store.clone(), analysis, 3, StrandKind::PredictionReview);

        // Three level-1 clusters of 3 members each, all on the same dimension.
        for _ in 0..3 {
            member(&store, 0.8, 0.7, Direction::Long);
            member(&store, 0.75, 0.65, Direction::Long);
            member(&store, 0.9, 0.8, Direction::Long);
            let report = manager.run_cycle().await.unwrap();
            assert_eq!(report.braids_formed, 1);
        }

        // Three level-2 braids now sit unconsumed on the same dimension at
        // braid_level 2; one more cycle should fold them into a level-3 braid.
        let groups = manager.find_candidate_groups().unwrap();
        assert!(groups.iter().any(|g| g.braid_level == 2 && g.members.len() == 3));

        let report = manager.run_cycle().await.unwrap();
        assert_eq!(report.braids_formed, 1);

        let level_three: Vec<_> = store
            .scan(&StrandFilter::new().kind(StrandKind::PredictionReview))
            .unwrap()
            .into_iter()
            .filter(|s| s.braid_level == 3)
            .collect();
        assert_eq!(level_three.len(), 1);
        assert_eq!(level_three[0].source_strand_ids.len(), 3);
    }
}
