//! Price Store persistence (§3.2, §4.2).
//!
//! Separate table per venue family, matching §6.5's instruction that "all
//! other tables are distinct" even though the strand log may coalesce.
//! Storage approach mirrors `strand::store`: one SQLite connection behind a
//! `parking_lot::Mutex`, WAL mode, prepared statements.

use super::{OhlcBar, PriceRow, RollupTimeframe, Venue};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS lowcap_price_data_1m (
    token_contract TEXT NOT NULL,
    chain TEXT NOT NULL,
    minute_ts INTEGER NOT NULL,
    price_usd REAL NOT NULL,
    price_native REAL NOT NULL,
    quote_token TEXT,
    liquidity_usd REAL NOT NULL,
    liquidity_change_1m REAL NOT NULL,
    volume_1m REAL NOT NULL,
    volume_5m REAL NOT NULL,
    volume_1h REAL NOT NULL,
    volume_6h REAL NOT NULL,
    volume_24h REAL NOT NULL,
    price_change_24h REAL NOT NULL,
    market_cap REAL NOT NULL,
    fdv REAL NOT NULL,
    dex_id TEXT,
    pair_address TEXT,
    source TEXT NOT NULL,
    inserted_at INTEGER NOT NULL,
    PRIMARY KEY (token_contract, chain, minute_ts)
);

CREATE INDEX IF NOT EXISTS idx_price_1m_latest ON lowcap_price_data_1m(token_contract, chain, minute_ts DESC);

-- Perpetual venue 1m candles, pushed per §6.2. Kept distinct from the
-- DEX-listed table per §6.5's venue-family separation.
CREATE TABLE IF NOT EXISTS hyperliquid_price_data_ohlc (
    token TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    PRIMARY KEY (token, timeframe, ts)
);

CREATE INDEX IF NOT EXISTS idx_hl_ohlc_latest ON hyperliquid_price_data_ohlc(token, timeframe, ts DESC);
"#;

pub struct PriceStore {
    conn: Arc<Mutex<Connection>>,
}

impl PriceStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening price store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("initializing price schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory price store")?;
        conn.execute_batch(SCHEMA_SQL).context("initializing price schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Idempotent on `(token_contract, chain, minute)`; the later-appended
    /// write for a shared minute wins (§4.2 tie-break) via `INSERT OR REPLACE`,
    /// which is safe here because we are the sole writer of this table and
    /// replacement happens in append order.
    pub fn put_minute(&self, row: &PriceRow) -> Result<()> {
        let minute_ts = floor_to_minute(row.timestamp).timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO lowcap_price_data_1m (
                token_contract, chain, minute_ts, price_usd, price_native, quote_token,
                liquidity_usd, liquidity_change_1m, volume_1m, volume_5m, volume_1h,
                volume_6h, volume_24h, price_change_24h, market_cap, fdv, dex_id,
                pair_address, source, inserted_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)
            ON CONFLICT(token_contract, chain, minute_ts) DO UPDATE SET
                price_usd = excluded.price_usd,
                price_native = excluded.price_native,
                quote_token = excluded.quote_token,
                liquidity_usd = excluded.liquidity_usd,
                liquidity_change_1m = excluded.liquidity_change_1m,
                volume_1m = excluded.volume_1m,
                volume_5m = excluded.volume_5m,
                volume_1h = excluded.volume_1h,
                volume_6h = excluded.volume_6h,
                volume_24h = excluded.volume_24h,
                price_change_24h = excluded.price_change_24h,
                market_cap = excluded.market_cap,
                fdv = excluded.fdv,
                dex_id = excluded.dex_id,
                pair_address = excluded.pair_address,
                source = excluded.source,
                inserted_at = excluded.inserted_at",
            params![
                row.token_contract,
                row.chain,
                minute_ts,
                row.price_usd,
                row.price_native,
                row.quote_token,
                row.liquidity_usd,
                row.liquidity_change_1m,
                row.volume_1m,
                row.volume_5m,
                row.volume_1h,
                row.volume_6h,
                row.volume_24h,
                row.price_change_24h,
                row.market_cap,
                row.fdv,
                row.dex_id,
                row.pair_address,
                row.source,
                Utc::now().timestamp(),
            ],
        )
        .context("upserting 1m price row")?;
        debug!(token = row.token_contract, chain = row.chain, "price minute upserted");
        Ok(())
    }

    pub fn latest(&self, token_contract: &str, chain: &str) -> Result<Option<PriceRow>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token_contract, chain, minute_ts, price_usd, price_native, quote_token,
                liquidity_usd, liquidity_change_1m, volume_1m, volume_5m, volume_1h, volume_6h,
                volume_24h, price_change_24h, market_cap, fdv, dex_id, pair_address, source
             FROM lowcap_price_data_1m WHERE token_contract = ?1 AND chain = ?2
             ORDER BY minute_ts DESC LIMIT 1",
            params![token_contract, chain],
            row_to_price,
        )
        .optional()
        .context("fetching latest price row")
    }

    /// Current price for the perpetual venue: close of the most recent 1m
    /// candle (§4.4 step 1, §6.2).
    pub fn latest_perp_close(&self, token: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT close FROM hyperliquid_price_data_ohlc WHERE token = ?1 AND timeframe = '1m'
             ORDER BY ts DESC LIMIT 1",
            params![token],
            |row| row.get::<_, f64>(0),
        )
        .optional()
        .context("fetching latest perp close")
    }

    pub fn put_perp_candle(&self, token: &str, ts: DateTime<Utc>, bar: OhlcBar) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO hyperliquid_price_data_ohlc (token, timeframe, ts, open, high, low, close, volume)
             VALUES (?1, '1m', ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(token, timeframe, ts) DO UPDATE SET
                open = excluded.open, high = excluded.high, low = excluded.low,
                close = excluded.close, volume = excluded.volume",
            params![token, ts.timestamp(), bar.open, bar.high, bar.low, bar.close, bar.volume],
        )
        .context("upserting perp candle")?;
        Ok(())
    }

    /// `liquidity_change_1m` vs. the latest prior row for the same
    /// `(token, chain)`; 0 if no prior row exists (§3.2 invariant).
    pub fn liquidity_change_since_latest(&self, token_contract: &str, chain: &str, liquidity_usd: f64) -> Result<f64> {
        match self.latest(token_contract, chain)? {
            Some(prev) => Ok(liquidity_usd - prev.liquidity_usd),
            None => Ok(0.0),
        }
    }

    /// OHLC rollup over `[bar_start, bar_start + timeframe)` from 1-minute
    /// rows (§4.2). Volume uses the venue-native attribution rule: for
    /// DEX-listed rows we sum `volume_1m` across the bar's minute rows
    /// (each minute's derived 1-minute volume, summed), matching how the
    /// upstream-sourced `volume_5m`/`volume_1h` fields are themselves
    /// rolling windows rather than per-minute deltas.
    pub fn rollup_bar(
        &self,
        token_contract: &str,
        chain: &str,
        timeframe: RollupTimeframe,
        bar_start: DateTime<Utc>,
    ) -> Result<Option<OhlcBar>> {
        let bar_end = bar_start + timeframe.duration();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT price_usd, volume_1m FROM lowcap_price_data_1m
             WHERE token_contract = ?1 AND chain = ?2 AND minute_ts >= ?3 AND minute_ts < ?4
             ORDER BY minute_ts ASC",
        )?;
        let rows = stmt
            .query_map(
                params![token_contract, chain, bar_start.timestamp(), bar_end.timestamp()],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .context("querying rollup bar rows")?;

        let mut prices = Vec::new();
        let mut volume = 0.0;
        for row in rows {
            let (price, vol1m) = row.context("decoding rollup row")?;
            prices.push(price);
            volume += vol1m;
        }
        if prices.is_empty() {
            return Ok(None);
        }
        let open = prices[0];
        let close = *prices.last().unwrap();
        let high = prices.iter().cloned().fold(f64::MIN, f64::max);
        let low = prices.iter().cloned().fold(f64::MAX, f64::min);
        Ok(Some(OhlcBar { open, high, low, close, volume }))
    }

    /// Most recent write timestamp across all tracked tokens, for the
    /// heartbeat's write-recency summary (§7).
    pub fn most_recent_write(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let ts: Option<i64> = conn
            .query_row("SELECT MAX(inserted_at) FROM lowcap_price_data_1m", [], |row| row.get(0))
            .context("fetching most recent price write")?;
        Ok(ts.and_then(|t| Utc.timestamp_opt(t, 0).single()))
    }

    pub fn venue_for_chain(&self, chain: &str) -> Venue {
        if chain.eq_ignore_ascii_case("hyperliquid") {
            Venue::Perpetual
        } else {
            Venue::DexListed
        }
    }
}

fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(ts.timestamp() - ts.timestamp() % 60, 0).single().unwrap_or(ts)
}

fn row_to_price(row: &rusqlite::Row) -> rusqlite::Result<PriceRow> {
    let minute_ts: i64 = row.get(2)?;
    Ok(PriceRow {
        token_contract: row.get(0)?,
        chain: row.get(1)?,
        timestamp: Utc.timestamp_opt(minute_ts, 0).single().unwrap_or_else(Utc::now),
        price_usd: row.get(3)?,
        price_native: row.get(4)?,
        quote_token: row.get(5)?,
        liquidity_usd: row.get(6)?,
        liquidity_change_1m: row.get(7)?,
        volume_1m: row.get(8)?,
        volume_5m: row.get(9)?,
        volume_1h: row.get(10)?,
        volume_6h: row.get(11)?,
        volume_24h: row.get(12)?,
        price_change_24h: row.get(13)?,
        market_cap: row.get(14)?,
        fdv: row.get(15)?,
        dex_id: row.get(16)?,
        pair_address: row.get(17)?,
        source: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(token: &str, chain: &str, ts: DateTime<Utc>, price: f64, liquidity: f64) -> PriceRow {
        PriceRow {
            token_contract: token.to_string(),
            chain: chain.to_string(),
            timestamp: ts,
            price_usd: price,
            price_native: 0.5,
            quote_token: Some("USDC".into()),
            liquidity_usd: liquidity,
            liquidity_change_1m: 0.0,
            volume_1m: 100.0,
            volume_5m: 500.0,
            volume_1h: 6000.0,
            volume_6h: 36000.0,
            volume_24h: 144000.0,
            price_change_24h: 1.5,
            market_cap: 1_000_000.0,
            fdv: 1_200_000.0,
            dex_id: Some("raydium".into()),
            pair_address: Some("pair1".into()),
            source: "dexscreener".into(),
        }
    }

    #[test]
    fn put_minute_is_idempotent_on_key() {
        let s = PriceStore::open_in_memory().unwrap();
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 30).unwrap();
        s.put_minute(&row("TOK", "solana", ts, 1.0, 1000.0)).unwrap();
        s.put_minute(&row("TOK", "solana", ts, 1.5, 1000.0)).unwrap();
        let latest = s.latest("TOK", "solana").unwrap().unwrap();
        assert_eq!(latest.price_usd, 1.5);
        let conn = s.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM lowcap_price_data_1m", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn liquidity_change_vs_prior_row() {
        let s = PriceStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + Duration::minutes(1);
        s.put_minute(&row("TOK", "solana", t0, 1.0, 1000.0)).unwrap();
        let change = s.liquidity_change_since_latest("TOK", "solana", 1200.0).unwrap();
        assert_eq!(change, 200.0);
        assert_eq!(s.liquidity_change_since_latest("NEW", "solana", 50.0).unwrap(), 0.0);
        let _ = t1;
    }

    #[test]
    fn rollup_bar_aggregates_ohlc() {
        let s = PriceStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        s.put_minute(&row("TOK", "solana", t0, 1.0, 1000.0)).unwrap();
        s.put_minute(&row("TOK", "solana", t0 + Duration::minutes(1), 1.2, 1000.0)).unwrap();
        s.put_minute(&row("TOK", "solana", t0 + Duration::minutes(2), 0.9, 1000.0)).unwrap();
        s.put_minute(&row("TOK", "solana", t0 + Duration::minutes(3), 1.1, 1000.0)).unwrap();
        let bar = s
            .rollup_bar("TOK", "solana", RollupTimeframe::FiveMin, t0)
            .unwrap()
            .unwrap();
        assert_eq!(bar.open, 1.0);
        assert_eq!(bar.close, 1.1);
        assert_eq!(bar.high, 1.2);
        assert_eq!(bar.low, 0.9);
        assert_eq!(bar.volume, 400.0);
    }

    #[test]
    fn rollup_bar_none_when_empty() {
        let s = PriceStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(s.rollup_bar("TOK", "solana", RollupTimeframe::FiveMin, t0).unwrap().is_none());
    }

    #[test]
    fn most_recent_write_tracks_latest_insert() {
        let s = PriceStore::open_in_memory().unwrap();
        assert!(s.most_recent_write().unwrap().is_none());
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        s.put_minute(&row("TOK", "solana", t0, 1.0, 1000.0)).unwrap();
        assert!(s.most_recent_write().unwrap().is_some());
    }
}
