//! Wallet / Margin Refresher (§3.4, §4.5, §6.3).
//!
//! Single-writer-per-chain upsert; the refresher serializes per chain (§5
//! "Shared-resource policy"). Only the home chain (native + USDC) and the
//! perpetual venue's margin balance are tracked — non-home chains are
//! explicitly not tracked per §4.5.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wallet_balances (
    chain TEXT PRIMARY KEY,
    wallet_address TEXT NOT NULL,
    balance REAL NOT NULL,
    usdc_balance REAL NOT NULL,
    balance_usd REAL NOT NULL,
    last_updated TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalance {
    pub chain: String,
    pub wallet_address: String,
    pub balance: f64,
    pub usdc_balance: f64,
    pub balance_usd: f64,
    pub last_updated: DateTime<Utc>,
}

pub struct WalletStore {
    conn: Arc<Mutex<Connection>>,
}

impl WalletStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening wallet store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL).context("initializing wallet schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory wallet store")?;
        conn.execute_batch(SCHEMA_SQL).context("initializing wallet schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// One upsert per chain (§4.5 Contract).
    pub fn upsert(&self, balance: &WalletBalance) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO wallet_balances (chain, wallet_address, balance, usdc_balance, balance_usd, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(chain) DO UPDATE SET
                wallet_address = excluded.wallet_address,
                balance = excluded.balance,
                usdc_balance = excluded.usdc_balance,
                balance_usd = excluded.balance_usd,
                last_updated = excluded.last_updated",
            params![
                balance.chain,
                balance.wallet_address,
                balance.balance,
                balance.usdc_balance,
                balance.balance_usd,
                balance.last_updated.to_rfc3339(),
            ],
        )
        .context("upserting wallet balance")?;
        Ok(())
    }

    pub fn get(&self, chain: &str) -> Result<Option<WalletBalance>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT chain, wallet_address, balance, usdc_balance, balance_usd, last_updated
             FROM wallet_balances WHERE chain = ?1",
            params![chain],
            row_to_balance,
        )
        .optional()
        .context("fetching wallet balance")
    }
}

fn row_to_balance(row: &rusqlite::Row) -> rusqlite::Result<WalletBalance> {
    let last_updated: String = row.get(5)?;
    Ok(WalletBalance {
        chain: row.get(0)?,
        wallet_address: row.get(1)?,
        balance: row.get(2)?,
        usdc_balance: row.get(3)?,
        balance_usd: row.get(4)?,
        last_updated: DateTime::parse_from_rfc3339(&last_updated)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// `get_balance(chain, token_address_or_none)` (§6.3). `None` address means
/// native-token balance (gas accounting only); `Some(mint)` means the
/// balance of that specific token (the home chain's USDC mint for trading
/// capital).
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn get_balance(&self, chain: &str, wallet_address: &str, token_address: Option<&str>) -> Result<f64>;
}

/// Margin balance is polled (pull) via the perp venue SDK; returned as a USD
/// scalar (§6.2).
#[async_trait]
pub trait PerpVenue: Send + Sync {
    async fn margin_balance_usd(&self) -> Result<f64>;
}

/// Safe default `ChainRpc`: the concrete wallet/chain RPC client is out of
/// scope (§1 Non-goals "secret/credential loading"); this stands in until an
/// operator wires a real client, mirroring the teacher's
/// `BinancePriceFeed::disabled()` pattern for an unconfigured feed.
#[derive(Default)]
pub struct NullChainRpc;

#[async_trait]
impl ChainRpc for NullChainRpc {
    async fn get_balance(&self, _chain: &str, _wallet_address: &str, _token_address: Option<&str>) -> Result<f64> {
        Ok(0.0)
    }
}

/// Safe default `PerpVenue` for when the perp venue SDK isn't wired in.
pub struct DisabledPerpVenue;

#[async_trait]
impl PerpVenue for DisabledPerpVenue {
    async fn margin_balance_usd(&self) -> Result<f64> {
        Ok(0.0)
    }
}

/// Refreshes the home-chain balance row and, if enabled, the perp venue's
/// margin row (§4.5). Each refresh call writes at most one upsert per chain.
pub struct WalletRefresher {
    store: Arc<WalletStore>,
    rpc: Arc<dyn ChainRpc>,
    perp: Option<Arc<dyn PerpVenue>>,
    home_chain: String,
    home_wallet_address: String,
    home_usdc_mint: String,
    perp_venue_enabled: bool,
}

impl WalletRefresher {
    pub fn new(
        store: Arc<WalletStore>,
        rpc: Arc<dyn ChainRpc>,
        perp: Option<Arc<dyn PerpVenue>>,
        home_chain: impl Into<String>,
        home_wallet_address: impl Into<String>,
        home_usdc_mint: impl Into<String>,
        perp_venue_enabled: bool,
    ) -> Self {
        Self {
            store,
            rpc,
            perp,
            home_chain: home_chain.into(),
            home_wallet_address: home_wallet_address.into(),
            home_usdc_mint: home_usdc_mint.into(),
            perp_venue_enabled,
        }
    }

    pub async fn refresh_once(&self) -> Result<()> {
        self.refresh_home_chain().await;
        if self.perp_venue_enabled {
            self.refresh_perp_margin().await;
        }
        Ok(())
    }

    async fn refresh_home_chain(&self) {
        let native = self.rpc.get_balance(&self.home_chain, &self.home_wallet_address, None).await;
        let usdc = self
            .rpc
            .get_balance(&self.home_chain, &self.home_wallet_address, Some(&self.home_usdc_mint))
            .await;
        match (native, usdc) {
            (Ok(native), Ok(usdc)) => {
                let balance = WalletBalance {
                    chain: self.home_chain.clone(),
                    wallet_address: self.home_wallet_address.clone(),
                    balance: native,
                    usdc_balance: usdc,
                    balance_usd: usdc,
                    last_updated: Utc::now(),
                };
                if let Err(e) = self.store.upsert(&balance) {
                    warn!(error = %e, "failed to upsert home chain wallet balance");
                } else {
                    info!(chain = %self.home_chain, usdc, "home chain wallet balance refreshed");
                }
            }
            _ => warn!(chain = %self.home_chain, "failed to fetch home chain balance this cycle"),
        }
    }

    async fn refresh_perp_margin(&self) {
        let Some(perp) = &self.perp else { return };
        match perp.margin_balance_usd().await {
            Ok(margin) => {
                let balance = WalletBalance {
                    chain: "hyperliquid".to_string(),
                    wallet_address: String::new(),
                    balance: 0.0,
                    usdc_balance: margin,
                    balance_usd: margin,
                    last_updated: Utc::now(),
                };
                if let Err(e) = self.store.upsert(&balance) {
                    warn!(error = %e, "failed to upsert perp margin balance");
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch perp margin balance this cycle"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubRpc {
        native: f64,
        usdc: f64,
    }

    #[async_trait]
    impl ChainRpc for StubRpc {
        async fn get_balance(&self, _chain: &str, _addr: &str, token: Option<&str>) -> Result<f64> {
            Ok(if token.is_some() { self.usdc } else { self.native })
        }
    }

    struct StubPerp(f64);

    #[async_trait]
    impl PerpVenue for StubPerp {
        async fn margin_balance_usd(&self) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn refresh_upserts_home_and_perp() {
        let store = Arc::new(WalletStore::open_in_memory().unwrap());
        let refresher = WalletRefresher::new(
            store.clone(),
            Arc::new(StubRpc { native: 1.2, usdc: 5000.0 }),
            Some(Arc::new(StubPerp(2500.0))),
            "solana",
            "wallet123",
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            true,
        );
        refresher.refresh_once().await.unwrap();

        let home = store.get("solana").unwrap().unwrap();
        assert_eq!(home.usdc_balance, 5000.0);
        assert_eq!(home.balance, 1.2);

        let perp = store.get("hyperliquid").unwrap().unwrap();
        assert_eq!(perp.balance_usd, 2500.0);
    }

    #[tokio::test]
    async fn perp_refresh_skipped_when_disabled() {
        let store = Arc::new(WalletStore::open_in_memory().unwrap());
        let refresher = WalletRefresher::new(
            store.clone(),
            Arc::new(StubRpc { native: 1.0, usdc: 100.0 }),
            None,
            "solana",
            "wallet123",
            "mint",
            false,
        );
        refresher.refresh_once().await.unwrap();
        assert!(store.get("hyperliquid").unwrap().is_none());
    }
}
