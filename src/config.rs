//! Process-wide configuration, loaded from the environment.
//!
//! Mirrors the enumerated options in spec §6.6. Every tunable has a
//! conservative default so the process runs unconfigured in a dev shell.

use std::time::Duration;

/// All tunables for the collector, reconciler and CIL engines.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    // --- Tiered Collector (§4.3, §6.6) ---
    pub upstream_call_budget: u32,
    pub collector_concurrency_cap: usize,
    pub priority_timeframe: String,
    pub http_timeout: Duration,
    pub heartbeat_interval: Duration,

    // --- Venues (§4.5, §6.6) ---
    pub home_chain: String,
    pub perp_venue_enabled: bool,

    // --- Learning Braid Manager (§4.11, §6.6) ---
    pub cluster_threshold: usize,

    // --- Experiment Orchestrator (§4.8, §6.6) ---
    pub max_concurrent_experiments: usize,
    pub max_experiments_per_source: usize,
    pub experiment_timeout: Duration,

    // --- Resonance Prioritizer (§4.10, §6.6) ---
    pub resonance_family_cap_fraction: f64,

    // --- Doctrine Keeper (§4.9, §6.6) ---
    pub doctrine_promotion_evidence: u32,
    pub doctrine_promotion_success_rate: f64,
    pub doctrine_promotion_failure_rate: f64,
    pub doctrine_retirement_failure_rate: f64,
    pub doctrine_contraindication_failure_rate: f64,

    // --- Input Normalizer (§4.6, §6.6) ---
    pub confluence_threshold: f64,
    pub lead_lag_window: (i64, i64),
}

impl Config {
    /// Load configuration from the environment, falling back to spec defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("STRAND_DB_PATH")
            .unwrap_or_else(|_| "./strand_braid.db".to_string());

        let upstream_call_budget = env_parse("UPSTREAM_CALL_BUDGET", 250);
        let collector_concurrency_cap = env_parse("COLLECTOR_CONCURRENCY_CAP", 50);
        let priority_timeframe =
            std::env::var("PRIORITY_TIMEFRAME").unwrap_or_else(|_| "1m".to_string());
        let http_timeout = Duration::from_secs(env_parse("COLLECTOR_HTTP_TIMEOUT_SECS", 10));
        let heartbeat_interval = Duration::from_secs(60 * env_parse("HEARTBEAT_INTERVAL_MINUTES", 5));

        let home_chain = std::env::var("HOME_CHAIN").unwrap_or_else(|_| "solana".to_string());
        let perp_venue_enabled = std::env::var("PERP_VENUE_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let cluster_threshold = env_parse("CLUSTER_THRESHOLD", 3);

        let max_concurrent_experiments = env_parse("MAX_CONCURRENT_EXPERIMENTS", 10);
        let max_experiments_per_source = env_parse("MAX_EXPERIMENTS_PER_SOURCE", 3);
        let experiment_timeout = Duration::from_secs(3600 * env_parse("EXPERIMENT_TIMEOUT_HOURS", 24));

        let resonance_family_cap_fraction = env_parse("RESONANCE_FAMILY_CAP_FRACTION", 0.30);

        let doctrine_promotion_evidence = env_parse("DOCTRINE_PROMOTION_EVIDENCE", 10);
        let doctrine_promotion_success_rate = env_parse("DOCTRINE_PROMOTION_SUCCESS_RATE", 0.7);
        let doctrine_promotion_failure_rate = env_parse("DOCTRINE_PROMOTION_FAILURE_RATE", 0.3);
        let doctrine_retirement_failure_rate = env_parse("DOCTRINE_RETIREMENT_FAILURE_RATE", 0.7);
        let doctrine_contraindication_failure_rate =
            env_parse("DOCTRINE_CONTRAINDICATION_FAILURE_RATE", 0.8);

        let confluence_threshold = env_parse("CONFLUENCE_THRESHOLD", 0.7);
        let lead_lag_window = (
            env_parse::<i64>("LEAD_LAG_WINDOW_MIN_SECS", 60),
            env_parse::<i64>("LEAD_LAG_WINDOW_MAX_SECS", 3600),
        );

        Ok(Self {
            database_path,
            upstream_call_budget,
            collector_concurrency_cap,
            priority_timeframe,
            http_timeout,
            heartbeat_interval,
            home_chain,
            perp_venue_enabled,
            cluster_threshold,
            max_concurrent_experiments,
            max_experiments_per_source,
            experiment_timeout,
            resonance_family_cap_fraction,
            doctrine_promotion_evidence,
            doctrine_promotion_success_rate,
            doctrine_promotion_failure_rate,
            doctrine_retirement_failure_rate,
            doctrine_contraindication_failure_rate,
            confluence_threshold,
            lead_lag_window,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        std::env::remove_var("UPSTREAM_CALL_BUDGET");
        std::env::remove_var("CLUSTER_THRESHOLD");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.upstream_call_budget, 250);
        assert_eq!(cfg.cluster_threshold, 3);
        assert_eq!(cfg.max_concurrent_experiments, 10);
        assert!((cfg.doctrine_promotion_success_rate - 0.7).abs() < 1e-9);
    }
}
