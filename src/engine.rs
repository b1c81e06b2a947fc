//! Cycle Orchestrator
//!
//! Top-level scheduler. Each cycle: observe market -> classify regime ->
//! scan candidate invoices -> analyze a bounded number concurrently ->
//! execute the ones that should act. Every stage broadcasts a thought.
//!
//! Cycle state: Idle -> FetchingMarket -> ScanningInvoices -> Analyzing ->
//! ExecutingSelected -> Idle. A tick that fires while the previous cycle is
//! still running is skipped (and the skip broadcast) rather than racing on
//! shared market state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::{
    adjust,
    config::AgentConfig,
    events::{ThoughtBroadcaster, ThoughtKind},
    executor::{self, BreakerSnapshot, CircuitBreaker, RateLimitTable, RetryPolicy},
    ledger::{LedgerReader, LedgerWriter},
    market::{check_alert, MarketMonitor},
    models::{AnalysisResult, MarketAlert, MarketConditions, MarketRegime, Strategy},
    narrative::NarrativeGenerator,
    optimizer,
    regime::{RegimeClassifier, RegimeStats},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoScenario {
    MarketCrash,
    MarketRally,
    Reset,
}

impl DemoScenario {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "market-crash" | "marketcrash" | "crash" => Some(Self::MarketCrash),
            "market-rally" | "marketrally" | "rally" => Some(Self::MarketRally),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum AgentCommand {
    /// Manual re-analysis of a single invoice.
    Analyze { token_id: String },
    /// Force a full cycle now.
    RunCycle,
    /// Inject a demo market scenario, then force a cycle.
    Demo(DemoScenario),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub cycles_completed: u64,
    pub cycle_in_progress: bool,
    pub breaker: BreakerSnapshot,
    pub regime: RegimeStats,
    pub market: MarketConditions,
    pub rate_limited_tokens: usize,
    pub auto_execute: bool,
    pub min_confidence: f64,
}

struct AnalyzedCandidate {
    analysis: AnalysisResult,
    deposited: bool,
}

pub struct AgentEngine {
    config: Arc<RwLock<AgentConfig>>,
    reader: Arc<dyn LedgerReader>,
    writer: Arc<dyn LedgerWriter>,
    monitor: AsyncMutex<MarketMonitor>,
    regime: Mutex<RegimeClassifier>,
    breaker: Mutex<CircuitBreaker>,
    rate_limits: Mutex<RateLimitTable>,
    narrative: NarrativeGenerator,
    thoughts: ThoughtBroadcaster,
    last_market: Mutex<MarketConditions>,
    cycle_running: AtomicBool,
    cycles_completed: AtomicU64,
}

impl AgentEngine {
    pub fn new(
        config: Arc<RwLock<AgentConfig>>,
        reader: Arc<dyn LedgerReader>,
        writer: Arc<dyn LedgerWriter>,
        monitor: MarketMonitor,
        narrative: NarrativeGenerator,
        thoughts: ThoughtBroadcaster,
    ) -> Arc<Self> {
        let (threshold, cooldown) = {
            let cfg = config.read();
            (cfg.breaker_threshold, Duration::from_secs(cfg.breaker_cooldown_sec))
        };
        Arc::new(Self {
            config,
            reader,
            writer,
            monitor: AsyncMutex::new(monitor),
            regime: Mutex::new(RegimeClassifier::default()),
            breaker: Mutex::new(CircuitBreaker::new(threshold, cooldown)),
            rate_limits: Mutex::new(RateLimitTable::new()),
            narrative,
            thoughts,
            last_market: Mutex::new(MarketConditions::default()),
            cycle_running: AtomicBool::new(false),
            cycles_completed: AtomicU64::new(0),
        })
    }

    /// Spawn the tick loop and the command handler. Returns immediately.
    pub fn spawn(self: Arc<Self>, mut commands: mpsc::Receiver<AgentCommand>) {
        info!("strategy agent starting");
        self.thoughts
            .emit(ThoughtKind::System, None, "agent online; first cycle scheduled");

        tokio::spawn(async move {
            loop {
                let interval_ms = self.config.read().analysis_interval_ms;
                tokio::select! {
                    _ = sleep(Duration::from_millis(interval_ms)) => {
                        let engine = self.clone();
                        tokio::spawn(async move { engine.run_cycle().await });
                    }
                    cmd = commands.recv() => {
                        let Some(cmd) = cmd else {
                            info!("command channel closed; agent loop exiting");
                            break;
                        };
                        self.handle_command(cmd).await;
                    }
                }
            }
        });
    }

    async fn handle_command(self: &Arc<Self>, cmd: AgentCommand) {
        match cmd {
            AgentCommand::Analyze { token_id } => {
                self.analyze_one(&token_id).await;
            }
            AgentCommand::RunCycle => {
                self.run_cycle().await;
            }
            AgentCommand::Demo(scenario) => {
                self.run_demo(scenario).await;
            }
        }
    }

    async fn run_demo(self: &Arc<Self>, scenario: DemoScenario) {
        let pct = match scenario {
            DemoScenario::MarketCrash => -10.0,
            DemoScenario::MarketRally => 8.0,
            DemoScenario::Reset => 0.0,
        };
        let conditions = self.monitor.lock().await.simulate_shock(pct, Utc::now());
        *self.last_market.lock() = conditions.clone();
        let message = match scenario {
            DemoScenario::Reset => "demo reset: live price sampling resumed".to_string(),
            _ => format!(
                "demo scenario injected: {:+.1}% price change, volatility {}",
                conditions.price_change_24h,
                conditions.volatility.as_str()
            ),
        };
        self.thoughts.emit(ThoughtKind::System, None, message);
        self.run_cycle().await;
    }

    /// Run one full cycle. Skips (with a broadcast) when a cycle is already
    /// in flight or the circuit breaker is open.
    pub async fn run_cycle(self: &Arc<Self>) {
        if self.cycle_running.swap(true, Ordering::SeqCst) {
            debug!("cycle already in progress; tick skipped");
            self.thoughts.emit(
                ThoughtKind::System,
                None,
                "cycle already in progress; tick skipped",
            );
            return;
        }

        if self.breaker.lock().is_open() {
            let snapshot = self.breaker.lock().snapshot();
            self.thoughts.emit(
                ThoughtKind::System,
                None,
                format!(
                    "circuit breaker open; cycle skipped (closes in {}ms)",
                    snapshot.reset_in_ms.unwrap_or(0)
                ),
            );
            self.cycle_running.store(false, Ordering::SeqCst);
            return;
        }

        let outcome = self.cycle_inner().await;
        match outcome {
            Ok((analyzed, executed)) => {
                self.breaker.lock().record_success();
                let n = self.cycles_completed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(cycle = n, analyzed, executed, "cycle completed");
            }
            Err(e) => {
                self.breaker.lock().record_failure();
                warn!(error = %e, "cycle failed");
                self.thoughts
                    .emit(ThoughtKind::Error, None, format!("cycle failed: {e}"));
            }
        }
        self.cycle_running.store(false, Ordering::SeqCst);
    }

    async fn cycle_inner(self: &Arc<Self>) -> Result<(usize, usize)> {
        // FetchingMarket
        let conditions = self.monitor.lock().await.observe(Utc::now()).await;
        *self.last_market.lock() = conditions.clone();

        let alert = check_alert(&conditions);
        if let Some(alert) = &alert {
            self.thoughts.emit(
                ThoughtKind::System,
                None,
                format!("market alert [{:?}]: {}", alert.level, alert.message),
            );
        }
        let regime = self.regime.lock().update(&conditions);

        // ScanningInvoices
        let invoice_scan = self.reader.get_active_invoice_ids().await;
        let deposit_scan = self.reader.get_active_deposit_ids().await;

        match (&invoice_scan.error, &deposit_scan.error) {
            (Some(ie), Some(de)) => {
                return Err(anyhow!("ledger scan failed: invoices: {ie}; deposits: {de}"));
            }
            (Some(e), None) | (None, Some(e)) => {
                warn!(error = %e, "partial ledger scan failure; continuing with one list");
                self.thoughts.emit(
                    ThoughtKind::System,
                    None,
                    format!("partial ledger scan failure: {e}"),
                );
            }
            (None, None) => {}
        }

        let mut candidates: Vec<String> = Vec::new();
        for id in invoice_scan.ids.into_iter().chain(deposit_scan.ids) {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        debug!(count = candidates.len(), "candidate invoices");

        {
            let cooldown = Duration::from_secs(self.config.read().rate_limit_cooldown_sec);
            self.rate_limits.lock().prune(cooldown);
        }

        // Analyzing: bounded fan-out, per-invoice failures isolated.
        let max_concurrent = self.config.read().max_concurrent_analyses.max(1);
        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut set: JoinSet<Option<AnalyzedCandidate>> = JoinSet::new();

        for token_id in candidates {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            let conditions = conditions.clone();
            let alert = alert.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match engine.analyze_token(&token_id, &conditions, alert.as_ref(), regime).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(token_id = %token_id, error = %e, "analysis failed");
                        engine.thoughts.emit(
                            ThoughtKind::Error,
                            Some(&token_id),
                            format!("analysis failed: {e}"),
                        );
                        None
                    }
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(candidate)) => results.push(candidate),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "analysis task panicked"),
            }
        }
        let analyzed = results.len();

        // ExecutingSelected
        let mut executed = 0usize;
        for candidate in results {
            if candidate.analysis.should_act && self.execute_candidate(candidate).await {
                executed += 1;
            }
        }

        Ok((analyzed, executed))
    }

    /// Analyze a single invoice. Returns `None` on a rate-limit skip (a
    /// deliberate no-op: no broadcasts, no error).
    async fn analyze_token(
        self: &Arc<Self>,
        token_id: &str,
        conditions: &MarketConditions,
        alert: Option<&MarketAlert>,
        regime: MarketRegime,
    ) -> Result<Option<AnalyzedCandidate>> {
        let (cooldown, min_confidence) = {
            let cfg = self.config.read();
            (
                Duration::from_secs(cfg.rate_limit_cooldown_sec),
                cfg.min_confidence,
            )
        };

        if !self.rate_limits.lock().try_acquire(token_id, cooldown) {
            debug!(token_id, "rate limited; analysis skipped");
            return Ok(None);
        }

        self.thoughts.emit(
            ThoughtKind::Thinking,
            Some(token_id),
            format!("analyzing invoice {token_id}"),
        );

        let now = Utc::now();
        let invoice = self
            .reader
            .get_invoice(token_id)
            .await?
            .ok_or_else(|| anyhow!("invoice {token_id} not found on ledger"))?;

        // A deposit read failure degrades to "not deposited" rather than
        // failing the invoice's analysis.
        let deposit = match self.reader.get_deposit(token_id).await {
            Ok(d) => d.filter(|d| d.active),
            Err(e) => {
                warn!(token_id, error = %e, "deposit read failed; assuming not deposited");
                None
            }
        };
        let deposited = deposit.is_some();
        let current_strategy = deposit.as_ref().map(|d| d.strategy).unwrap_or(Strategy::Hold);

        let base = optimizer::optimize(&invoice, deposit.as_ref(), now);
        self.thoughts.emit(
            ThoughtKind::Analysis,
            Some(token_id),
            format!(
                "base recommendation {} ({:.0}% confidence): {}",
                base.strategy.as_str(),
                base.confidence,
                base.factors.join("; ")
            ),
        );

        let mut analysis = AnalysisResult {
            token_id: token_id.to_string(),
            risk_score: invoice.risk_score,
            payment_probability: invoice.payment_probability,
            days_until_due: optimizer::days_until_due(&invoice, now),
            invoice,
            current_strategy,
            recommended_strategy: base.strategy,
            confidence: base.confidence,
            should_act: false,
            reasoning: base.reasoning,
            factors: base.factors,
            market_override: None,
        };

        analysis = adjust::apply(analysis, conditions, alert, regime);
        analysis.should_act = executor::should_act(
            analysis.current_strategy,
            analysis.recommended_strategy,
            analysis.confidence,
            min_confidence,
        );

        let narrative = self.narrative.explain(&analysis).await;
        self.thoughts.emit_with_analysis(
            ThoughtKind::Decision,
            Some(token_id),
            narrative,
            Some(analysis.clone()),
        );

        Ok(Some(AnalyzedCandidate {
            analysis,
            deposited,
        }))
    }

    /// Route one should-act analysis to the ledger. Returns true when a
    /// decision was written.
    async fn execute_candidate(self: &Arc<Self>, candidate: AnalyzedCandidate) -> bool {
        let analysis = candidate.analysis;
        let token_id = analysis.token_id.clone();

        if !candidate.deposited {
            self.thoughts.emit(
                ThoughtKind::Decision,
                Some(&token_id),
                format!(
                    "recommendation {} needs a deposit first; guidance only",
                    analysis.recommended_strategy.as_str()
                ),
            );
            return false;
        }

        let (auto_execute, policy) = {
            let cfg = self.config.read();
            (cfg.auto_execute, RetryPolicy::from_config(&cfg))
        };
        if !auto_execute {
            self.thoughts.emit(
                ThoughtKind::Decision,
                Some(&token_id),
                "auto-execute disabled; decision not written".to_string(),
            );
            return false;
        }

        let receipt = executor::record_with_retry(
            &self.writer,
            &token_id,
            analysis.recommended_strategy,
            analysis.confidence,
            &analysis.reasoning,
            policy,
        )
        .await;

        if receipt.success {
            self.thoughts.emit(
                ThoughtKind::Execution,
                Some(&token_id),
                format!(
                    "strategy changed {} -> {} (ref {})",
                    analysis.current_strategy.as_str(),
                    analysis.recommended_strategy.as_str(),
                    receipt.reference.as_deref().unwrap_or("-")
                ),
            );
            true
        } else {
            self.thoughts.emit(
                ThoughtKind::Error,
                Some(&token_id),
                format!(
                    "execution failed: {}",
                    receipt.error.as_deref().unwrap_or("unknown")
                ),
            );
            false
        }
    }

    /// Manual single-invoice analysis (the dashboard's "re-analyze now").
    pub async fn analyze_one(self: &Arc<Self>, token_id: &str) {
        let token_id = token_id.trim();
        if token_id.is_empty() {
            self.thoughts
                .emit(ThoughtKind::Error, None, "analyze requested without token id");
            return;
        }

        let conditions = self.last_market.lock().clone();
        let alert = check_alert(&conditions);
        let regime = self.regime.lock().current();

        match self
            .analyze_token(token_id, &conditions, alert.as_ref(), regime)
            .await
        {
            Ok(Some(candidate)) => {
                if candidate.analysis.should_act {
                    self.execute_candidate(candidate).await;
                }
            }
            Ok(None) => {
                debug!(token_id, "manual analysis rate limited; no-op");
            }
            Err(e) => {
                self.thoughts.emit(
                    ThoughtKind::Error,
                    Some(token_id),
                    format!("analysis failed: {e}"),
                );
            }
        }
    }

    pub fn status(&self) -> StatusReport {
        let cfg = self.config.read();
        StatusReport {
            cycles_completed: self.cycles_completed.load(Ordering::SeqCst),
            cycle_in_progress: self.cycle_running.load(Ordering::SeqCst),
            breaker: self.breaker.lock().snapshot(),
            regime: self.regime.lock().stats(),
            market: self.last_market.lock().clone(),
            rate_limited_tokens: self.rate_limits.lock().len(),
            auto_execute: cfg.auto_execute,
            min_confidence: cfg.min_confidence,
        }
    }

    pub fn config(&self) -> Arc<RwLock<AgentConfig>> {
        self.config.clone()
    }

    pub fn thoughts(&self) -> &ThoughtBroadcaster {
        &self.thoughts
    }
}
