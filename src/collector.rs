//! The Tiered Collector (§4.3).
//!
//! Schedules per-minute collection cycles across the tracked-token working
//! set under a fixed external-call budget. The concrete upstream DEX API
//! client wire format is out of scope (§1 Non-goals: "the specific upstream
//! price API client semantics beyond its rate contract") — this module
//! depends only on the `DexPriceClient` trait, grounded on
//! `scheduled_price_collector.py`'s `_fetch_and_store_price`/
//! `_process_token_price_data`/`_get_best_pair_with_native_preference`.

use crate::position::{PositionStore, TrackedToken};
use crate::price::{PriceRow, PriceStore};
use crate::rate_limiter::CallBudget;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A single candidate pair as returned by the upstream API's `pairs` array
/// (§6.1). Field names follow the JSON shape verbatim, flattened.
#[derive(Debug, Clone)]
pub struct DexPair {
    pub chain_id: String,
    pub base_token_address: String,
    pub quote_token_address: String,
    pub quote_token_symbol: String,
    pub price_native: f64,
    pub price_usd: f64,
    pub liquidity_usd: f64,
    pub volume_h24: f64,
    pub volume_h6: f64,
    pub volume_h1: f64,
    pub volume_m5: f64,
    pub price_change_h24: f64,
    pub market_cap: f64,
    pub fdv: f64,
    pub dex_id: String,
    pub pair_address: String,
}

/// Outcome of one upstream fetch, distinguishing the error kinds §7 assigns
/// different propagation policies to.
pub enum FetchOutcome {
    Pairs(Vec<DexPair>),
    /// HTTP 429: count as failure, no retry this cycle (§4.3 step 4, §7).
    RateLimited,
    /// Timeout / 5xx / network error: local skip, next cycle retries (§7).
    Transient,
    /// Parse error / missing pairs: emit a data-quality note, skip token (§7).
    Malformed,
}

#[async_trait]
pub trait DexPriceClient: Send + Sync {
    async fn fetch(&self, token_contract: &str, chain: &str) -> FetchOutcome;
}

/// Per-chain native wrapper token address and allowed stable quote symbols,
/// grounded on `scheduled_price_collector.py`'s `native_addresses` map and
/// `_get_best_pair_with_native_preference`.
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    native_wrapper: HashMap<String, String>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        let mut native_wrapper = HashMap::new();
        native_wrapper.insert("ethereum".to_string(), "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".to_string());
        native_wrapper.insert("bsc".to_string(), "0xbb4cdb9cbd36b01bd1cbaebf2de08d9173bc095c".to_string());
        native_wrapper.insert("solana".to_string(), "so11111111111111111111111111111111111111112".to_string());
        native_wrapper.insert("base".to_string(), "0x4200000000000000000000000000000000000006".to_string());
        Self { native_wrapper }
    }

    pub fn is_native_wrapper(&self, chain: &str, token_contract: &str) -> bool {
        self.native_wrapper
            .get(&chain.to_lowercase())
            .is_some_and(|w| w.eq_ignore_ascii_case(token_contract))
    }

    pub fn native_wrapper_address(&self, chain: &str) -> Option<&str> {
        self.native_wrapper.get(&chain.to_lowercase()).map(|s| s.as_str())
    }
}

const STABLE_QUOTES: &[&str] = &["USDC", "USDT"];

/// Best-pair selection rule (§4.3): native tokens prefer the highest-
/// liquidity stable-quoted pair; others prefer the highest-liquidity pair
/// quoted in the chain's native wrapper. Both fall back to overall highest
/// liquidity. Tie-break: liquidity desc, then pair_address asc.
pub fn select_best_pair<'a>(
    pairs: &'a [DexPair],
    chain: &str,
    token_contract: &str,
    registry: &ChainRegistry,
) -> Option<&'a DexPair> {
    if pairs.is_empty() {
        return None;
    }
    let preferred: Vec<&DexPair> = if registry.is_native_wrapper(chain, token_contract) {
        pairs
            .iter()
            .filter(|p| STABLE_QUOTES.contains(&p.quote_token_symbol.to_uppercase().as_str()))
            .collect()
    } else {
        match registry.native_wrapper_address(chain) {
            Some(wrapper) => pairs
                .iter()
                .filter(|p| p.quote_token_address.eq_ignore_ascii_case(wrapper))
                .collect(),
            None => Vec::new(),
        }
    };
    let candidates = if preferred.is_empty() { pairs.iter().collect::<Vec<_>>() } else { preferred };
    candidates
        .into_iter()
        .max_by(|a, b| {
            a.liquidity_usd
                .partial_cmp(&b.liquidity_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.pair_address.cmp(&a.pair_address))
        })
}

fn stable_hash(token: &str, chain: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    token.to_lowercase().hash(&mut hasher);
    chain.to_lowercase().hash(&mut hasher);
    hasher.finish()
}

/// `interval = max(1, ceil(N / B))` minutes (§4.3).
pub fn collection_interval(tracked_count: usize, budget: u32) -> u64 {
    if tracked_count == 0 {
        return 1;
    }
    let n = tracked_count as u64;
    let b = budget.max(1) as u64;
    std::cmp::max(1, (n + b - 1) / b)
}

/// Monitoring-floor coverage threshold for a given interval (§4.3).
pub fn coverage_threshold(interval: u64) -> f64 {
    match interval {
        1 => 0.60,
        2 => 0.45,
        _ => ((60.0 / interval as f64 - 2.0) / 60.0).max(0.20),
    }
}

/// Whether `token` is scheduled on cycle `c` given the computed `interval`
/// and whether it's in the priority set (§4.3 Key algorithm).
pub fn scheduled_this_cycle(token: &str, chain: &str, cycle: u64, interval: u64, is_priority: bool) -> bool {
    if is_priority {
        return true;
    }
    if interval <= 1 {
        return true;
    }
    (cycle % interval) == (stable_hash(token, chain) % interval)
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub scheduled: usize,
    pub priority_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub rate_limited_count: usize,
    pub elapsed_secs: f64,
    pub interval: u64,
    pub threshold: f64,
}

/// The per-minute scheduling and execution engine (§4.3).
pub struct TieredCollector {
    positions: Arc<PositionStore>,
    prices: Arc<PriceStore>,
    client: Arc<dyn DexPriceClient>,
    budget: Arc<CallBudget>,
    registry: ChainRegistry,
    concurrency_cap: usize,
    priority_timeframe: String,
    http_timeout: Duration,
    cycle: AtomicU64,
}

impl TieredCollector {
    pub fn new(
        positions: Arc<PositionStore>,
        prices: Arc<PriceStore>,
        client: Arc<dyn DexPriceClient>,
        budget: Arc<CallBudget>,
        concurrency_cap: usize,
        priority_timeframe: impl Into<String>,
        http_timeout: Duration,
    ) -> Self {
        Self {
            positions,
            prices,
            client,
            budget,
            registry: ChainRegistry::new(),
            concurrency_cap,
            priority_timeframe: priority_timeframe.into(),
            http_timeout,
            cycle: AtomicU64::new(0),
        }
    }

    /// Runs one collection cycle: schedule, fetch under the concurrency cap,
    /// write price rows. Reconciliation and wallet refresh are invoked by
    /// the caller immediately afterward (§4.3 step 5), kept as separate
    /// engines so their own tests don't need a collector in the loop.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let start = std::time::Instant::now();
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);

        let tracked = self.positions.tracked_tokens().unwrap_or_default();
        let priority = self
            .positions
            .priority_tokens(&self.priority_timeframe)
            .unwrap_or_default();
        let priority_set: std::collections::HashSet<TrackedToken> = priority.into_iter().collect();

        let n = tracked.len();
        let interval = collection_interval(n, self.budget.capacity());
        let threshold = coverage_threshold(interval);

        let scheduled: Vec<&TrackedToken> = tracked
            .iter()
            .filter(|t| !t.chain.eq_ignore_ascii_case("hyperliquid"))
            .filter(|t| {
                scheduled_this_cycle(
                    &t.token_contract,
                    &t.chain,
                    cycle,
                    interval,
                    priority_set.contains(t),
                )
            })
            .collect();

        let priority_count = scheduled.iter().filter(|t| priority_set.contains(**t)).count();
        let semaphore = Arc::new(Semaphore::new(self.concurrency_cap));
        let mut handles = Vec::with_capacity(scheduled.len());

        for token in &scheduled {
            if !self.budget.try_acquire() {
                continue;
            }
            let token_contract = token.token_contract.clone();
            let chain = token.chain.clone();
            let client = self.client.clone();
            let prices = self.prices.clone();
            let registry = self.registry.clone();
            let sem = semaphore.clone();
            let timeout = self.http_timeout;
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                fetch_and_store_one(client, prices, registry, token_contract, chain, timeout).await
            }));
        }

        let mut success_count = 0;
        let mut error_count = 0;
        let mut rate_limited_count = 0;
        for handle in handles {
            match handle.await {
                Ok(Outcome::Success) => success_count += 1,
                Ok(Outcome::RateLimited) => rate_limited_count += 1,
                Ok(Outcome::Error) => error_count += 1,
                Err(e) => {
                    warn!(error = %e, "collector task panicked");
                    error_count += 1;
                }
            }
        }

        let elapsed_secs = start.elapsed().as_secs_f64();
        let report = CycleReport {
            cycle,
            scheduled: scheduled.len(),
            priority_count,
            success_count,
            error_count,
            rate_limited_count,
            elapsed_secs,
            interval,
            threshold,
        };
        info!(
            cycle,
            scheduled = report.scheduled,
            priority = report.priority_count,
            success = report.success_count,
            errors = report.error_count,
            elapsed_secs = report.elapsed_secs,
            interval,
            threshold,
            "collection cycle complete"
        );
        Ok(report)
    }
}

enum Outcome {
    Success,
    RateLimited,
    Error,
}

async fn fetch_and_store_one(
    client: Arc<dyn DexPriceClient>,
    prices: Arc<PriceStore>,
    registry: ChainRegistry,
    token_contract: String,
    chain: String,
    timeout: Duration,
) -> Outcome {
    let outcome = match tokio::time::timeout(timeout, client.fetch(&token_contract, &chain)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            debug!(token = %token_contract, chain = %chain, "collector fetch timed out");
            return Outcome::Error;
        }
    };

    match outcome {
        FetchOutcome::RateLimited => Outcome::RateLimited,
        FetchOutcome::Transient => Outcome::Error,
        FetchOutcome::Malformed => {
            debug!(token = %token_contract, chain = %chain, "malformed upstream response, skipping");
            Outcome::Error
        }
        FetchOutcome::Pairs(pairs) => {
            let candidate_pairs: Vec<DexPair> = pairs
                .into_iter()
                .filter(|p| p.chain_id.eq_ignore_ascii_case(&chain))
                .collect();
            let Some(best) = select_best_pair(&candidate_pairs, &chain, &token_contract, &registry) else {
                return Outcome::Error;
            };
            let is_native = registry.is_native_wrapper(&chain, &token_contract);
            let liquidity_change_1m = prices
                .liquidity_change_since_latest(&token_contract, &chain, best.liquidity_usd)
                .unwrap_or(0.0);
            let row = PriceRow {
                token_contract: token_contract.clone(),
                chain: chain.clone(),
                timestamp: Utc::now(),
                price_usd: best.price_usd,
                price_native: if is_native { 1.0 } else { best.price_native },
                quote_token: Some(best.quote_token_symbol.clone()),
                liquidity_usd: best.liquidity_usd,
                liquidity_change_1m,
                volume_1m: best.volume_m5 / 5.0,
                volume_5m: best.volume_m5,
                volume_1h: best.volume_h1,
                volume_6h: best.volume_h6,
                volume_24h: best.volume_h24,
                price_change_24h: best.price_change_h24,
                market_cap: best.market_cap,
                fdv: best.fdv,
                dex_id: Some(best.dex_id.clone()),
                pair_address: Some(best.pair_address.clone()),
                source: "dexscreener".to_string(),
            };
            match prices.put_minute(&row) {
                Ok(()) => Outcome::Success,
                Err(e) => {
                    warn!(token = %token_contract, error = %e, "failed to store price row");
                    Outcome::Error
                }
            }
        }
    }
}
