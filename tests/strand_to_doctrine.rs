//! End-to-end: three signal strands sharing a cluster-key dimension braid
//! into a lesson, and that lesson is applied to the Doctrine Keeper, moving
//! the pattern from provisional toward affirmed. All stores are on-disk
//! SQLite under a shared temp directory.

use std::sync::Arc;

use serde_json::json;
use strand_braid_core::analysis::{AnalysisResult, NullAnalysisFunction};
use strand_braid_core::braid::LearningBraidManager;
use strand_braid_core::doctrine::{DoctrineKeeper, DoctrineStatus, Lesson, WhyMap};
use strand_braid_core::strand::{ClusterKeyEntry, Direction, NewStrand, StrandKind, StrandStore};

fn db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[tokio::test]
async fn three_signals_braid_and_promote_doctrine() {
    let dir = tempfile::tempdir().unwrap();
    let strands = Arc::new(StrandStore::open(&db_path(&dir, "strands.db")).unwrap());

    for i in 0..3 {
        strands
            .append(
                NewStrand::base(StrandKind::Signal, format!("producer_{i}"))
                    .with_symbol("BTC")
                    .with_timeframe("1h")
                    .with_signal(0.8, 0.85, Direction::Long)
                    .with_cluster_key(vec![ClusterKeyEntry {
                        cluster_type: "breakout_pattern".into(),
                        cluster_key: "BTC:1h:bull".into(),
                        braid_level: 1,
                        consumed: false,
                    }]),
            )
            .unwrap();
    }

    let analysis = Arc::new(
        NullAnalysisFunction::new().with_canned(
            "lesson_synthesis",
            AnalysisResult {
                template_id: "lesson_synthesis".into(),
                narrative: "breakout pattern confirms across three independent producers".into(),
                fields: json!({"members": 3}),
                confidence: 0.9,
            },
        ),
    );

    let braid_manager = LearningBraidManager::new(strands.clone(), analysis, 3, StrandKind::Signal);
    let groups = braid_manager.find_candidate_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members.len(), 3);

    let report = braid_manager.run_cycle().await.unwrap();
    assert_eq!(report.braids_formed, 1);
    assert_eq!(report.members_consumed, 3);

    // Re-running finds nothing left to braid: members are consumed on that dimension.
    let groups_after = braid_manager.find_candidate_groups().unwrap();
    assert!(groups_after.is_empty());

    let lessons = strands
        .scan(&strand_braid_core::strand::StrandFilter::new().kind(StrandKind::Lesson))
        .unwrap();
    assert_eq!(lessons.len(), 1);
    let lesson_strand = &lessons[0];
    assert_eq!(lesson_strand.braid_level, 2);

    let doctrine = DoctrineKeeper::open(&db_path(&dir, "doctrine.db"), 3, 0.7, 0.4, 0.5, 0.7).unwrap();
    for _ in 0..3 {
        doctrine
            .apply_lesson(&Lesson {
                pattern_type: "breakout_pattern".into(),
                pattern_id: "BTC:1h:bull".into(),
                success: true,
                why_map_delta: WhyMap {
                    mechanism_hypothesis: Some(lesson_strand.lesson.clone().unwrap_or_default()),
                    supporting_evidence: vec![lesson_strand.id.clone()],
                    failure_conditions: vec![],
                    context_dependencies: vec!["bull_regime".into()],
                },
                source_strand_id: lesson_strand.id.clone(),
            })
            .unwrap();
    }

    let entry = doctrine.get("breakout_pattern", "BTC:1h:bull").unwrap().unwrap();
    assert_eq!(entry.evidence_count, 3);
    assert_eq!(entry.status, DoctrineStatus::Affirmed);
    assert!(entry.why_map.supporting_evidence.contains(&lesson_strand.id));
}
