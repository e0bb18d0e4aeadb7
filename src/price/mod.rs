//! Price Store & OHLC rollups (§3.2, §4.2).

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::PriceStore;

/// Which venue family a price row belongs to (§6.5: separate table
/// namespace per venue family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    /// External DEX-listed pairs, polled per §6.1.
    DexListed,
    /// Perpetual venue, pushed per §6.2.
    Perpetual,
}

/// A single per-minute price row (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRow {
    pub token_contract: String,
    pub chain: String,
    pub timestamp: DateTime<Utc>,
    pub price_usd: f64,
    pub price_native: f64,
    pub quote_token: Option<String>,
    pub liquidity_usd: f64,
    pub liquidity_change_1m: f64,
    pub volume_1m: f64,
    pub volume_5m: f64,
    pub volume_1h: f64,
    pub volume_6h: f64,
    pub volume_24h: f64,
    pub price_change_24h: f64,
    pub market_cap: f64,
    pub fdv: f64,
    pub dex_id: Option<String>,
    pub pair_address: Option<String>,
    pub source: String,
}

/// An OHLC bar over a rollup timeframe (§4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct OhlcBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Supported OHLC rollup timeframes (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupTimeframe {
    FiveMin,
    FifteenMin,
    OneHour,
    FourHour,
    OneDay,
}

impl RollupTimeframe {
    pub fn duration(self) -> chrono::Duration {
        match self {
            RollupTimeframe::FiveMin => chrono::Duration::minutes(5),
            RollupTimeframe::FifteenMin => chrono::Duration::minutes(15),
            RollupTimeframe::OneHour => chrono::Duration::hours(1),
            RollupTimeframe::FourHour => chrono::Duration::hours(4),
            RollupTimeframe::OneDay => chrono::Duration::days(1),
        }
    }
}
