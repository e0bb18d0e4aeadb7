//! End-to-end: a collection cycle against a stub DEX client feeds the Price
//! Store, then the Reconciliation Engine picks up the new price and updates
//! an active position on disk. Exercises the real SQLite path (not
//! `open_in_memory`) so schema creation and cross-store sharing are covered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strand_braid_core::collector::{DexPair, DexPriceClient, FetchOutcome, TieredCollector};
use strand_braid_core::position::{Position, PositionStatus, PositionStore};
use strand_braid_core::price::PriceStore;
use strand_braid_core::rate_limiter::CallBudget;
use strand_braid_core::strand::StrandStore;

struct StubClient {
    price_usd: f64,
}

#[async_trait]
impl DexPriceClient for StubClient {
    async fn fetch(&self, _token_contract: &str, _chain: &str) -> FetchOutcome {
        FetchOutcome::Pairs(vec![DexPair {
            chain_id: "solana".into(),
            base_token_address: "TOK".into(),
            quote_token_address: "so11111111111111111111111111111111111111112".into(),
            quote_token_symbol: "SOL".into(),
            price_native: 0.01,
            price_usd: self.price_usd,
            liquidity_usd: 50_000.0,
            volume_h24: 100_000.0,
            volume_h6: 20_000.0,
            volume_h1: 3_000.0,
            volume_m5: 200.0,
            price_change_h24: 1.5,
            market_cap: 2_000_000.0,
            fdv: 2_500_000.0,
            dex_id: "raydium".into(),
            pair_address: "pairXYZ".into(),
        }])
    }
}

fn db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[tokio::test]
async fn collected_price_drives_reconciliation_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let positions = Arc::new(PositionStore::open(&db_path(&dir, "core.db")).unwrap());
    let prices = Arc::new(PriceStore::open(&db_path(&dir, "core.db")).unwrap());
    let strands = Arc::new(StrandStore::open(&db_path(&dir, "core.db")).unwrap());

    positions
        .insert(&Position {
            id: "pos1".into(),
            token_contract: "TOK".into(),
            token_chain: "solana".into(),
            status: PositionStatus::Active,
            timeframe: "1h".into(),
            total_tokens_bought: 500.0,
            total_tokens_sold: 0.0,
            total_quantity: 500.0,
            total_allocation_usd: 400.0,
            total_extracted_usd: 0.0,
            current_usd_value: 0.0,
            total_pnl_usd: 0.0,
            total_pnl_pct: 0.0,
            pnl_last_calculated_at: None,
        })
        .unwrap();

    let client: Arc<dyn DexPriceClient> = Arc::new(StubClient { price_usd: 1.10 });
    let budget = Arc::new(CallBudget::new(60));
    let collector = TieredCollector::new(positions.clone(), prices.clone(), client, budget, 4, "1m", Duration::from_secs(5));

    let report = collector.run_cycle().await.unwrap();
    assert_eq!(report.success_count, 1);
    assert_eq!(report.error_count, 0);

    let latest = prices.latest("TOK", "solana").unwrap().expect("price row written");
    assert!((latest.price_usd - 1.10).abs() < 1e-9);

    let engine = strand_braid_core::position::ReconciliationEngine::new(positions.clone(), prices.clone(), strands);
    let recon = engine.run_once().unwrap();
    assert_eq!(recon.reconciled, 1);

    let updated = positions.get("pos1").unwrap().unwrap();
    assert!((updated.current_usd_value - 550.0).abs() < 1e-6);
    assert!(updated.total_pnl_usd > 0.0);
}
