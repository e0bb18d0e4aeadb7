//! Position rows and the Reconciliation Engine (§3.3, §4.4).

use crate::price::PriceStore;
use crate::strand::{NewStrand, StrandKind, StrandStore};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS lowcap_positions (
    id TEXT PRIMARY KEY,
    token_contract TEXT NOT NULL,
    token_chain TEXT NOT NULL,
    status TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    total_tokens_bought REAL NOT NULL,
    total_tokens_sold REAL NOT NULL,
    total_quantity REAL NOT NULL,
    total_allocation_usd REAL NOT NULL,
    total_extracted_usd REAL NOT NULL,
    current_usd_value REAL NOT NULL,
    total_pnl_usd REAL NOT NULL,
    total_pnl_pct REAL NOT NULL,
    pnl_last_calculated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_positions_status ON lowcap_positions(status);
CREATE INDEX IF NOT EXISTS idx_positions_token ON lowcap_positions(token_contract, token_chain);
"#;

/// Lifecycle state of a tracked position (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    Watchlist,
    Dormant,
    Closed,
}

impl PositionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionStatus::Active => "active",
            PositionStatus::Watchlist => "watchlist",
            PositionStatus::Dormant => "dormant",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => PositionStatus::Active,
            "watchlist" => PositionStatus::Watchlist,
            "dormant" => PositionStatus::Dormant,
            "closed" => PositionStatus::Closed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub token_contract: String,
    pub token_chain: String,
    pub status: PositionStatus,
    pub timeframe: String,
    pub total_tokens_bought: f64,
    pub total_tokens_sold: f64,
    pub total_quantity: f64,
    pub total_allocation_usd: f64,
    pub total_extracted_usd: f64,
    pub current_usd_value: f64,
    pub total_pnl_usd: f64,
    pub total_pnl_pct: f64,
    pub pnl_last_calculated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Tracked token identity for the collector's working set (§4.3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedToken {
    pub token_contract: String,
    pub chain: String,
}

pub struct PositionStore {
    conn: Arc<Mutex<Connection>>,
}

impl PositionStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening position store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("initializing position schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory position store")?;
        conn.execute_batch(SCHEMA_SQL).context("initializing position schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn insert(&self, p: &Position) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO lowcap_positions (
                id, token_contract, token_chain, status, timeframe, total_tokens_bought,
                total_tokens_sold, total_quantity, total_allocation_usd, total_extracted_usd,
                current_usd_value, total_pnl_usd, total_pnl_pct, pnl_last_calculated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                p.id,
                p.token_contract,
                p.token_chain,
                p.status.as_str(),
                p.timeframe,
                p.total_tokens_bought,
                p.total_tokens_sold,
                p.total_quantity,
                p.total_allocation_usd,
                p.total_extracted_usd,
                p.current_usd_value,
                p.total_pnl_usd,
                p.total_pnl_pct,
                p.pnl_last_calculated_at.map(|t| t.to_rfc3339()),
            ],
        )
        .context("inserting position")?;
        Ok(())
    }

    /// The union of tracked tokens: distinct `(token_contract, chain)` over
    /// positions with status ∈ {active, watchlist, dormant} (§4.3 Inputs).
    pub fn tracked_tokens(&self) -> Result<Vec<TrackedToken>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT token_contract, token_chain FROM lowcap_positions
             WHERE status IN ('active', 'watchlist', 'dormant')",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TrackedToken {
                    token_contract: row.get(0)?,
                    chain: row.get(1)?,
                })
            })
            .context("querying tracked tokens")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Priority set: positions on the priority timeframe (default `1m`)
    /// with status ∈ {active, watchlist} — always scheduled (§4.3).
    pub fn priority_tokens(&self, priority_timeframe: &str) -> Result<Vec<TrackedToken>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT token_contract, token_chain FROM lowcap_positions
             WHERE timeframe = ?1 AND status IN ('active', 'watchlist')",
        )?;
        let rows = stmt
            .query_map(params![priority_timeframe], |row| {
                Ok(TrackedToken {
                    token_contract: row.get(0)?,
                    chain: row.get(1)?,
                })
            })
            .context("querying priority tokens")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn active_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, token_contract, token_chain, status, timeframe, total_tokens_bought,
                total_tokens_sold, total_quantity, total_allocation_usd, total_extracted_usd,
                current_usd_value, total_pnl_usd, total_pnl_pct, pnl_last_calculated_at
             FROM lowcap_positions WHERE status = 'active'",
        )?;
        let rows = stmt.query_map([], row_to_position).context("querying active positions")?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<Position>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, token_contract, token_chain, status, timeframe, total_tokens_bought,
                total_tokens_sold, total_quantity, total_allocation_usd, total_extracted_usd,
                current_usd_value, total_pnl_usd, total_pnl_pct, pnl_last_calculated_at
             FROM lowcap_positions WHERE id = ?1",
            params![id],
            row_to_position,
        )
        .optional()
        .context("fetching position")
    }

    /// Writes the four reconciled fields plus `pnl_last_calculated_at`
    /// atomically (§4.4 step 6).
    fn write_reconciled(
        &self,
        id: &str,
        total_quantity: f64,
        current_usd_value: f64,
        total_pnl_usd: f64,
        total_pnl_pct: f64,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE lowcap_positions SET total_quantity = ?1, current_usd_value = ?2,
                total_pnl_usd = ?3, total_pnl_pct = ?4, pnl_last_calculated_at = ?5 WHERE id = ?6",
            params![total_quantity, current_usd_value, total_pnl_usd, total_pnl_pct, now.to_rfc3339(), id],
        )
        .context("writing reconciled position")?;
        Ok(())
    }
}

fn row_to_position(row: &rusqlite::Row) -> rusqlite::Result<Position> {
    let status_str: String = row.get(3)?;
    let pnl_ts: Option<String> = row.get(13)?;
    Ok(Position {
        id: row.get(0)?,
        token_contract: row.get(1)?,
        token_chain: row.get(2)?,
        status: PositionStatus::parse(&status_str).unwrap_or(PositionStatus::Dormant),
        timeframe: row.get(4)?,
        total_tokens_bought: row.get(5)?,
        total_tokens_sold: row.get(6)?,
        total_quantity: row.get(7)?,
        total_allocation_usd: row.get(8)?,
        total_extracted_usd: row.get(9)?,
        current_usd_value: row.get(10)?,
        total_pnl_usd: row.get(11)?,
        total_pnl_pct: row.get(12)?,
        pnl_last_calculated_at: pnl_ts
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc)),
    })
}

/// Tolerance for the reconciliation identity invariant (§3.3, §8 property 1).
pub const QUANTITY_DRIFT_TOLERANCE: f64 = 1e-4;

/// Reconciles every `active` position's derived monetary fields against the
/// Price Store (§4.4). Per-position errors are isolated; the reconciler
/// continues with remaining positions.
pub struct ReconciliationEngine {
    positions: Arc<PositionStore>,
    prices: Arc<PriceStore>,
    strands: Arc<StrandStore>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    pub reconciled: usize,
    pub no_price_skipped: usize,
    pub drift_corrected: usize,
    pub errors: usize,
}

impl ReconciliationEngine {
    pub fn new(positions: Arc<PositionStore>, prices: Arc<PriceStore>, strands: Arc<StrandStore>) -> Self {
        Self { positions, prices, strands }
    }

    /// Runs reconciliation for every active position once. Idempotent: with
    /// no intervening price change, re-running yields the same derived
    /// fields up to `pnl_last_calculated_at` (§4.4, §8).
    pub fn run_once(&self) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        let positions = match self.positions.active_positions() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "reconciliation: failed to list active positions");
                return Ok(report);
            }
        };

        for position in positions {
            match self.reconcile_one(&position) {
                Ok(Some(drifted)) => {
                    report.reconciled += 1;
                    if drifted {
                        report.drift_corrected += 1;
                    }
                }
                Ok(None) => report.no_price_skipped += 1,
                Err(e) => {
                    warn!(position_id = %position.id, error = %e, "reconciliation failed for position");
                    report.errors += 1;
                }
            }
        }
        info!(
            reconciled = report.reconciled,
            no_price = report.no_price_skipped,
            drift = report.drift_corrected,
            errors = report.errors,
            "reconciliation cycle complete"
        );
        Ok(report)
    }

    /// Returns `Ok(None)` (a no-op, logged as a warning) when there is no
    /// latest price for the position's token (§4.4 Idempotence).
    fn reconcile_one(&self, position: &Position) -> Result<Option<bool>> {
        let current_price = self.current_price(&position.token_contract, &position.token_chain)?;
        let Some(current_price) = current_price else {
            warn!(position_id = %position.id, "no latest price available; reconciliation is a no-op");
            return Ok(None);
        };

        let recomputed_quantity = position.total_tokens_bought - position.total_tokens_sold;
        let drifted = (recomputed_quantity - position.total_quantity).abs() > QUANTITY_DRIFT_TOLERANCE;
        if drifted {
            self.emit_reconciliation_note(position, position.total_quantity, recomputed_quantity)?;
        }

        let current_usd_value = recomputed_quantity * current_price;
        let total_pnl_usd = (position.total_extracted_usd + current_usd_value) - position.total_allocation_usd;
        let total_pnl_pct = if position.total_allocation_usd > 0.0 {
            total_pnl_usd / position.total_allocation_usd * 100.0
        } else {
            0.0
        };

        self.positions.write_reconciled(
            &position.id,
            recomputed_quantity,
            current_usd_value,
            total_pnl_usd,
            total_pnl_pct,
            chrono::Utc::now(),
        )?;

        Ok(Some(drifted))
    }

    /// §4.4 step 1: the streaming venue reads its own "most recent 1m close"
    /// rule; all other chains read the DEX-listed latest row.
    fn current_price(&self, token_contract: &str, chain: &str) -> Result<Option<f64>> {
        if chain.eq_ignore_ascii_case("hyperliquid") {
            self.prices.latest_perp_close(token_contract)
        } else {
            Ok(self.prices.latest(token_contract, chain)?.map(|r| r.price_usd))
        }
    }

    fn emit_reconciliation_note(&self, position: &Position, stored: f64, recomputed: f64) -> Result<()> {
        let new = NewStrand::base(StrandKind::ReconciliationNote, "reconciliation_engine")
            .with_symbol(position.token_contract.clone())
            .with_intelligence(serde_json::json!({
                "position_id": position.id,
                "stored_quantity": stored,
                "recomputed_quantity": recomputed,
                "drift": recomputed - stored,
            }));
        self.strands.append(new).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::PriceRow;

    fn fixture() -> (Arc<PositionStore>, Arc<PriceStore>, Arc<StrandStore>) {
        (
            Arc::new(PositionStore::open_in_memory().unwrap()),
            Arc::new(PriceStore::open_in_memory().unwrap()),
            Arc::new(StrandStore::open_in_memory().unwrap()),
        )
    }

    fn sample_position() -> Position {
        Position {
            id: "pos1".into(),
            token_contract: "TOK".into(),
            token_chain: "solana".into(),
            status: PositionStatus::Active,
            timeframe: "1h".into(),
            total_tokens_bought: 1000.0,
            total_tokens_sold: 200.0,
            total_quantity: 900.0, // drifted vs. 800 true
            total_allocation_usd: 1000.0,
            total_extracted_usd: 300.0,
            current_usd_value: 0.0,
            total_pnl_usd: 0.0,
            total_pnl_pct: 0.0,
            pnl_last_calculated_at: None,
        }
    }

    #[test]
    fn scenario_2_reconciliation_drift() {
        let (positions, prices, strands) = fixture();
        positions.insert(&sample_position()).unwrap();
        prices
            .put_minute(&PriceRow {
                token_contract: "TOK".into(),
                chain: "solana".into(),
                timestamp: chrono::Utc::now(),
                price_usd: 1.50,
                price_native: 0.01,
                quote_token: Some("USDC".into()),
                liquidity_usd: 10_000.0,
                liquidity_change_1m: 0.0,
                volume_1m: 100.0,
                volume_5m: 500.0,
                volume_1h: 6000.0,
                volume_6h: 36000.0,
                volume_24h: 144000.0,
                price_change_24h: 2.0,
                market_cap: 1_000_000.0,
                fdv: 1_200_000.0,
                dex_id: Some("raydium".into()),
                pair_address: Some("pair1".into()),
                source: "dexscreener".into(),
            })
            .unwrap();

        let engine = ReconciliationEngine::new(positions.clone(), prices, strands.clone());
        let report = engine.run_once().unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.drift_corrected, 1);

        let updated = positions.get("pos1").unwrap().unwrap();
        assert_eq!(updated.total_quantity, 800.0);
        assert_eq!(updated.current_usd_value, 1200.0);
        assert_eq!(updated.total_pnl_usd, 500.0);
        assert!((updated.total_pnl_pct - 50.0).abs() < 1e-9);

        let notes = strands
            .scan(&crate::strand::StrandFilter::new().kind(StrandKind::ReconciliationNote))
            .unwrap();
        assert_eq!(notes.len(), 1);
    }

    #[test]
    fn no_price_is_noop() {
        let (positions, prices, strands) = fixture();
        positions.insert(&sample_position()).unwrap();
        let engine = ReconciliationEngine::new(positions.clone(), prices, strands);
        let report = engine.run_once().unwrap();
        assert_eq!(report.no_price_skipped, 1);
        assert_eq!(report.reconciled, 0);
        // Stored quantity untouched.
        assert_eq!(positions.get("pos1").unwrap().unwrap().total_quantity, 900.0);
    }

    #[test]
    fn idempotent_rerun_is_noop_on_derived_fields() {
        let (positions, prices, strands) = fixture();
        positions.insert(&sample_position()).unwrap();
        prices
            .put_minute(&PriceRow {
                token_contract: "TOK".into(),
                chain: "solana".into(),
                timestamp: chrono::Utc::now(),
                price_usd: 1.50,
                price_native: 0.01,
                quote_token: Some("USDC".into()),
                liquidity_usd: 10_000.0,
                liquidity_change_1m: 0.0,
                volume_1m: 100.0,
                volume_5m: 500.0,
                volume_1h: 6000.0,
                volume_6h: 36000.0,
                volume_24h: 144000.0,
                price_change_24h: 2.0,
                market_cap: 1_000_000.0,
                fdv: 1_200_000.0,
                dex_id: Some("raydium".into()),
                pair_address: Some("pair1".into()),
                source: "dexscreener".into(),
            })
            .unwrap();
        let engine = ReconciliationEngine::new(positions.clone(), prices, strands);
        engine.run_once().unwrap();
        let first = positions.get("pos1").unwrap().unwrap();
        engine.run_once().unwrap();
        let second = positions.get("pos1").unwrap().unwrap();
        assert_eq!(first.total_quantity, second.total_quantity);
        assert_eq!(first.total_pnl_usd, second.total_pnl_usd);
        assert_eq!(first.current_usd_value, second.current_usd_value);
    }
}
