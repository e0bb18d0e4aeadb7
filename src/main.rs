//! strand-braid-core — process entry point.
//!
//! Wires the Tiered Collector, Reconciliation Engine, and Wallet Refresher
//! (§4.3–§4.5) alongside the five Central Intelligence Layer engines
//! (§4.6–§4.11) onto their own periodic cycles per §5. Every engine
//! communicates only through the Strand Store; there are no in-process
//! queues between them.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strand_braid_core::analysis::{AnalysisFunction, NullAnalysisFunction, TimeoutAnalysisFunction};
use strand_braid_core::braid::LearningBraidManager;
use strand_braid_core::capability::{Capability, CapabilityMap};
use strand_braid_core::collector::{DexPriceClient, TieredCollector};
use strand_braid_core::config::Config;
use strand_braid_core::dex_client::HttpDexPriceClient;
use strand_braid_core::doctrine::DoctrineKeeper;
use strand_braid_core::governance::GovernanceRegistry;
use strand_braid_core::normalizer::InputNormalizer;
use strand_braid_core::orchestrator::{self, ExperimentOrchestrator};
use strand_braid_core::position::{PositionStore, ReconciliationEngine};
use strand_braid_core::price::PriceStore;
use strand_braid_core::rate_limiter::CallBudget;
use strand_braid_core::resonance::{ResonanceContext, ResonancePrioritizer};
use strand_braid_core::strand::{OrderBy, Strand, StrandFilter, StrandKind, StrandStore};
use strand_braid_core::synthesizer::GlobalSynthesizer;
use strand_braid_core::wallet::{DisabledPerpVenue, NullChainRpc, PerpVenue, WalletRefresher, WalletStore};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Registers the producer families named in §9 against the capability tags
/// the Orchestrator's target-source selection dispatches on (§4.8 step 4).
/// Concrete analyzer processes are out of scope (§1 Non-goals); this is the
/// minimal registry an operator extends by appending entries.
fn register_default_capabilities(capabilities: &CapabilityMap) {
    capabilities.register(
        "raw_data_intelligence",
        [Capability::RawData, Capability::Divergence, Capability::Volume, Capability::Microstructure],
    );
    capabilities.register(
        "indicator_producer",
        [Capability::Indicator, Capability::IndicatorComposite],
    );
    capabilities.register("pattern_producer", [Capability::Pattern, Capability::Regime]);
    capabilities.register("system_control", [Capability::SystemControl]);
    capabilities.register("central_intelligence", [Capability::CentralIntelligence]);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("strand-braid-core starting");

    let config = Config::from_env().context("loading configuration")?;
    info!(
        database_path = %config.database_path,
        upstream_call_budget = config.upstream_call_budget,
        home_chain = %config.home_chain,
        "configuration loaded"
    );

    // --- Persisted state (§6.5): one physical database, many tables ---
    let strands = Arc::new(StrandStore::open(&config.database_path).context("opening strand store")?);
    let prices = Arc::new(PriceStore::open(&config.database_path).context("opening price store")?);
    let positions = Arc::new(PositionStore::open(&config.database_path).context("opening position store")?);
    let wallets = Arc::new(WalletStore::open(&config.database_path).context("opening wallet store")?);
    let doctrine = Arc::new(
        DoctrineKeeper::open(
            &config.database_path,
            config.doctrine_promotion_evidence,
            config.doctrine_promotion_success_rate,
            config.doctrine_promotion_failure_rate,
            config.doctrine_retirement_failure_rate,
            config.doctrine_contraindication_failure_rate,
        )
        .context("opening doctrine store")?,
    );

    // --- Producer capability map (§9) ---
    let capabilities = Arc::new(CapabilityMap::new());
    register_default_capabilities(&capabilities);

    // --- Abstract analysis function (§6.4): the concrete LLM provider is a
    // Non-goal (§1); the null function returns "no result" until an operator
    // wires a real provider behind the same trait.
    let analysis: Arc<dyn AnalysisFunction> = Arc::new(TimeoutAnalysisFunction::new(
        NullAnalysisFunction::new(),
        Duration::from_secs(30),
    ));

    // --- Tiered Collector (§4.3) ---
    let budget = Arc::new(CallBudget::new(config.upstream_call_budget));
    let dex_client: Arc<dyn DexPriceClient> =
        Arc::new(HttpDexPriceClient::new(config.http_timeout).context("building dex price client")?);
    let collector = Arc::new(TieredCollector::new(
        positions.clone(),
        prices.clone(),
        dex_client,
        budget,
        config.collector_concurrency_cap,
        config.priority_timeframe.clone(),
        config.http_timeout,
    ));

    // --- Reconciliation Engine (§4.4) ---
    let reconciler = Arc::new(ReconciliationEngine::new(positions.clone(), prices.clone(), strands.clone()));

    // --- Wallet / Margin Refresher (§4.5, §6.3). Wallet/chain RPC and the
    // perp venue SDK are Non-goals (§1); these are safe disabled defaults an
    // operator swaps out without touching the refresher.
    let home_wallet_address = std::env::var("HOME_WALLET_ADDRESS").unwrap_or_default();
    let home_usdc_mint = std::env::var("HOME_USDC_MINT")
        .unwrap_or_else(|_| "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string());
    let perp: Option<Arc<dyn PerpVenue>> = if config.perp_venue_enabled {
        Some(Arc::new(DisabledPerpVenue))
    } else {
        None
    };
    let wallet_refresher = Arc::new(WalletRefresher::new(
        wallets,
        Arc::new(NullChainRpc),
        perp,
        config.home_chain.clone(),
        home_wallet_address,
        home_usdc_mint,
        config.perp_venue_enabled,
    ));

    // --- Central Intelligence Layer engines (§4.6–§4.11) ---
    let normalizer = Arc::new(InputNormalizer::new(
        strands.clone(),
        config.confluence_threshold,
        config.lead_lag_window,
    ));
    let synthesizer = Arc::new(GlobalSynthesizer::new(strands.clone()));
    let experiment_orchestrator = Arc::new(ExperimentOrchestrator::new(
        strands.clone(),
        doctrine.clone(),
        capabilities.clone(),
        config.max_concurrent_experiments,
        config.max_experiments_per_source,
        config.experiment_timeout,
    ));
    let resonance = Arc::new(ResonancePrioritizer::new(config.resonance_family_cap_fraction));
    let braid_manager = Arc::new(LearningBraidManager::new(
        strands.clone(),
        analysis.clone(),
        config.cluster_threshold,
        StrandKind::PredictionReview,
    ));

    // --- Cross-engine governance snapshot (§2 supplemented; §7 heartbeat) ---
    let governance = Arc::new(GovernanceRegistry::new());

    let mut handles = Vec::new();
    handles.push(tokio::spawn(collector_loop(
        collector,
        reconciler,
        wallet_refresher,
        governance.clone(),
    )));
    handles.push(tokio::spawn(cil_loop(
        strands.clone(),
        normalizer,
        synthesizer,
        experiment_orchestrator.clone(),
        resonance,
        braid_manager,
        governance.clone(),
    )));
    handles.push(tokio::spawn(timeout_sweep_loop(experiment_orchestrator, governance.clone())));
    handles.push(tokio::spawn(heartbeat_loop(
        strands,
        prices,
        config.heartbeat_interval,
        governance,
    )));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, stopping background tasks");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// The Tiered Collector's fixed wall-clock cycle (§4.3, §5): collect, then
/// reconcile positions, then refresh wallet balances, once per minute — the
/// collection writes all precede the reconciliation reads within one cycle
/// (§5 "happens-before").
async fn collector_loop(
    collector: Arc<TieredCollector>,
    reconciler: Arc<ReconciliationEngine>,
    wallet_refresher: Arc<WalletRefresher>,
    governance: Arc<GovernanceRegistry>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        match collector.run_cycle().await {
            Ok(report) => {
                governance.record_success("tiered_collector");
                if let Err(e) = reconciler.run_once() {
                    warn!(error = %e, "reconciliation pass failed");
                    governance.record_failure("reconciliation_engine");
                } else {
                    governance.record_success("reconciliation_engine");
                }
                if let Err(e) = wallet_refresher.refresh_once().await {
                    warn!(error = %e, "wallet refresh failed");
                    governance.record_failure("wallet_refresher");
                } else {
                    governance.record_success("wallet_refresher");
                }
                info!(
                    cycle = report.cycle,
                    scheduled = report.scheduled,
                    success = report.success_count,
                    errors = report.error_count,
                    "collection cycle settled"
                );
            }
            Err(e) => {
                error!(error = %e, "collection cycle failed");
                governance.record_failure("tiered_collector");
            }
        }
    }
}

/// The Central Intelligence Layer's longer cycle (§2, §5): normalize recent
/// strands, synthesize a global view, generate and admit experiment ideas
/// through the Resonance Prioritizer's queue, then run one braiding pass.
async fn cil_loop(
    strands: Arc<StrandStore>,
    normalizer: Arc<InputNormalizer>,
    synthesizer: Arc<GlobalSynthesizer>,
    experiment_orchestrator: Arc<ExperimentOrchestrator>,
    resonance: Arc<ResonancePrioritizer>,
    braid_manager: Arc<LearningBraidManager>,
    governance: Arc<GovernanceRegistry>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(300));
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();

        let views = match normalizer.normalize(now) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "input normalizer failed");
                governance.record_failure("input_normalizer");
                continue;
            }
        };
        governance.record_success("input_normalizer");

        let global_view = match synthesizer.synthesize(&views) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "global synthesizer failed");
                governance.record_failure("global_synthesizer");
                continue;
            }
        };
        governance.record_success("global_synthesizer");

        let ideas = orchestrator::generate_ideas(&global_view);

        rank_recent_signals(&strands, &resonance, views.market_context.dominant_regime.as_deref(), now);

        let mut admitted = 0usize;
        let mut deferred = 0usize;
        let mut rejected = 0usize;
        for idea in ideas {
            match experiment_orchestrator.admit(idea) {
                Ok(result) => match result.directive {
                    orchestrator::OutputDirective::Assign { .. } => admitted += 1,
                    orchestrator::OutputDirective::Defer => deferred += 1,
                    orchestrator::OutputDirective::Reject { .. } => rejected += 1,
                },
                Err(e) => warn!(error = %e, "experiment admission failed"),
            }
        }
        info!(admitted, deferred, rejected, "experiment orchestration pass complete");
        governance.record_success("experiment_orchestrator");

        match braid_manager.run_cycle().await {
            Ok(report) => {
                governance.record_success("learning_braid_manager");
                info!(
                    groups = report.groups_considered,
                    braids = report.braids_formed,
                    consumed = report.members_consumed,
                    "braiding pass complete"
                );
            }
            Err(e) => {
                error!(error = %e, "learning braid manager failed");
                governance.record_failure("learning_braid_manager");
            }
        }
    }
}

/// Ranks the recent Signal strand pool through the Resonance Prioritizer
/// (§4.10) and logs the resulting family-capped queue. Strands, not the
/// orchestrator's synthesized ideas, are what the prioritizer scores — it
/// orders the underlying evidence for braiding and doctrine review, one
/// layer below idea admission.
fn rank_recent_signals(
    strands: &StrandStore,
    resonance: &ResonancePrioritizer,
    dominant_regime: Option<&str>,
    now: chrono::DateTime<chrono::Utc>,
) {
    let recent = match strands.scan(
        &StrandFilter::new()
            .kind(StrandKind::Signal)
            .order(OrderBy::CreatedAtDesc)
            .limit(200),
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to scan recent signal strands for resonance ranking");
            return;
        }
    };
    if recent.is_empty() {
        return;
    }

    let mut family_counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut cell_sources: std::collections::HashMap<(Option<String>, Option<String>), std::collections::HashSet<String>> =
        std::collections::HashMap::new();
    for s in &recent {
        let family = family_of(s);
        *family_counts.entry(family).or_insert(0) += 1;
        cell_sources
            .entry((s.symbol.clone(), s.timeframe.clone()))
            .or_default()
            .insert(s.source_id.clone());
    }

    let candidates: Vec<(Strand, ResonanceContext)> = recent
        .into_iter()
        .map(|s| {
            let family_peer_count = family_counts.get(&family_of(&s)).copied().unwrap_or(1).saturating_sub(1);
            let corroborating_source_count = cell_sources
                .get(&(s.symbol.clone(), s.timeframe.clone()))
                .map(|set| set.len().saturating_sub(1))
                .unwrap_or(0);
            let age_seconds = (now - s.created_at).num_seconds().max(0);
            let context_match_score = match (dominant_regime, &s.regime) {
                (Some(dominant), Some(regime)) if dominant == regime => 1.0,
                (Some(_), Some(_)) => 0.3,
                _ => 0.5,
            };
            let ctx = ResonanceContext { family_peer_count, corroborating_source_count, age_seconds, context_match_score };
            (s, ctx)
        })
        .collect();

    let queue = resonance.build_queue(candidates, None);
    info!(
        ranked = queue.ordered.len(),
        families = queue.family_distribution.counts.len(),
        dropped = queue.constraint_violations.len(),
        "resonance queue built over recent signal strands"
    );
}

fn family_of(s: &Strand) -> String {
    s.tags
        .iter()
        .find(|t| t.starts_with("family:"))
        .cloned()
        .unwrap_or_else(|| format!("family:{}", s.kind.as_str()))
}

/// Background timeout sweep (§4.8 "Progress tracking"): runs more often than
/// the full CIL cycle so a deadline never drifts far past `now`.
async fn timeout_sweep_loop(orchestrator: Arc<ExperimentOrchestrator>, governance: Arc<GovernanceRegistry>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        match orchestrator.sweep_timeouts() {
            Ok(timed_out) if timed_out > 0 => {
                info!(timed_out, "experiment deadlines swept");
                governance.record_success("experiment_orchestrator");
            }
            Ok(_) => governance.record_success("experiment_orchestrator"),
            Err(e) => {
                warn!(error = %e, "timeout sweep failed");
                governance.record_failure("experiment_orchestrator");
            }
        }
    }
}

/// Heartbeat (§4.3 Observability contract, §7 "User-visible failures"):
/// summarizes write recency and engine health roughly every 5 minutes.
async fn heartbeat_loop(
    strands: Arc<StrandStore>,
    prices: Arc<PriceStore>,
    interval: Duration,
    governance: Arc<GovernanceRegistry>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let strand_count = strands.scan(&StrandFilter::new()).map(|s| s.len()).unwrap_or(0);
        let engines = governance.snapshot_all();
        for snapshot in &engines {
            info!(
                engine = %snapshot.engine,
                health = snapshot.health.as_str(),
                consecutive_failures = snapshot.consecutive_failures,
                last_successful_cycle = ?snapshot.last_successful_cycle,
                "heartbeat"
            );
        }
        let price_recency_seconds = prices
            .most_recent_write()
            .ok()
            .flatten()
            .map(|ts| (chrono::Utc::now() - ts).num_seconds());
        info!(strand_count, ?price_recency_seconds, "heartbeat: store write recency");
        governance.publish_heartbeat(strand_braid_core::governance::HeartbeatEvent {
            strand_count,
            price_recency_seconds,
            engines,
        });
    }
}
