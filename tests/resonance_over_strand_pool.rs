//! End-to-end: a mixed pool of signal strands across two families is scanned
//! from an on-disk Strand Store and run through the Resonance Prioritizer,
//! confirming the family cap actually drops overflow from the dominant
//! family rather than starving the minority one.

use std::sync::Arc;

use strand_braid_core::resonance::{ResonanceContext, ResonancePrioritizer};
use strand_braid_core::strand::{Direction, NewStrand, StrandFilter, StrandKind, StrandStore};

fn db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[test]
fn family_cap_drops_overflow_across_on_disk_pool() {
    let dir = tempfile::tempdir().unwrap();
    let strands = Arc::new(StrandStore::open(&db_path(&dir, "strands.db")).unwrap());

    // 8 strands tagged "breakout", 2 tagged "reversal".
    for i in 0..8 {
        strands
            .append(
                NewStrand::base(StrandKind::Signal, format!("producer_a_{i}"))
                    .with_tags(vec!["family:breakout".into()])
                    .with_signal(0.9, 0.9, Direction::Long),
            )
            .unwrap();
    }
    for i in 0..2 {
        strands
            .append(
                NewStrand::base(StrandKind::Signal, format!("producer_b_{i}"))
                    .with_tags(vec!["family:reversal".into()])
                    .with_signal(0.6, 0.6, Direction::Short),
            )
            .unwrap();
    }

    let pool = strands.scan(&StrandFilter::new().kind(StrandKind::Signal)).unwrap();
    assert_eq!(pool.len(), 10);

    let now = chrono::Utc::now();
    let candidates: Vec<_> = pool
        .into_iter()
        .map(|s| {
            let ctx = ResonanceContext {
                family_peer_count: 4,
                corroborating_source_count: 1,
                age_seconds: (now - s.created_at).num_seconds().max(0),
                context_match_score: 0.5,
            };
            (s, ctx)
        })
        .collect();

    // family_cap_fraction of 0.3 over 10 candidates -> cap of 3 per family.
    let prioritizer = ResonancePrioritizer::new(0.3);
    let queue = prioritizer.build_queue(candidates, None);

    assert_eq!(queue.ordered.len(), 5); // 3 breakout + 2 reversal survive
    let breakout_kept = queue.ordered.iter().filter(|c| c.family == "family:breakout").count();
    let reversal_kept = queue.ordered.iter().filter(|c| c.family == "family:reversal").count();
    assert_eq!(breakout_kept, 3);
    assert_eq!(reversal_kept, 2);
    assert_eq!(queue.constraint_violations.len(), 5);
}
