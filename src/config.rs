use std::env;

/// Agent configuration.
///
/// Everything is environment-driven with validated fallbacks; the four
/// runtime-tunable knobs (`min_confidence`, `analysis_interval_ms`,
/// `max_concurrent_analyses`, `auto_execute`) can also be changed through
/// the config API while the agent is running.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Cycle timer period.
    pub analysis_interval_ms: u64,
    /// Bounded fan-out for per-invoice analysis within one cycle.
    pub max_concurrent_analyses: usize,
    /// Minimum confidence for any strategy change.
    pub min_confidence: f64,
    /// When false, decisions are broadcast but never written to the ledger.
    pub auto_execute: bool,

    /// Per-invoice re-analysis cooldown.
    pub rate_limit_cooldown_sec: u64,

    /// Consecutive cycle failures before the breaker opens.
    pub breaker_threshold: u32,
    /// How long the breaker stays open before auto-closing.
    pub breaker_cooldown_sec: u64,

    /// Ledger write retry policy.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Price sample retention window.
    pub price_window_sec: u64,

    /// Narrative generation (LLM) knobs.
    pub narrative_timeout_sec: u64,
    pub narrative_max_calls_per_hour: usize,

    /// Remote ledger endpoint; when unset the agent runs against the
    /// simulated paper ledger.
    pub ledger_url: Option<String>,

    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: 30_000,
            max_concurrent_analyses: 5,
            min_confidence: 70.0,
            auto_execute: true,
            rate_limit_cooldown_sec: 300,
            breaker_threshold: 3,
            breaker_cooldown_sec: 60,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 10_000,
            price_window_sec: 4 * 3600,
            narrative_timeout_sec: 30,
            narrative_max_calls_per_hour: 20,
            ledger_url: None,
            port: 8090,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        cfg.analysis_interval_ms = env::var("AGENT_ANALYSIS_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1_000)
            .unwrap_or(cfg.analysis_interval_ms);

        cfg.max_concurrent_analyses = env::var("AGENT_MAX_CONCURRENT_ANALYSES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.max_concurrent_analyses);

        cfg.min_confidence = env::var("AGENT_MIN_CONFIDENCE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && (0.0..=100.0).contains(v))
            .unwrap_or(cfg.min_confidence);

        cfg.auto_execute = env::var("AGENT_AUTO_EXECUTE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(cfg.auto_execute);

        cfg.rate_limit_cooldown_sec = env::var("AGENT_RATE_LIMIT_COOLDOWN_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(cfg.rate_limit_cooldown_sec);

        cfg.breaker_threshold = env::var("AGENT_BREAKER_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.breaker_threshold);

        cfg.breaker_cooldown_sec = env::var("AGENT_BREAKER_COOLDOWN_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.breaker_cooldown_sec);

        cfg.retry_max_attempts = env::var("AGENT_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.retry_max_attempts);

        cfg.retry_base_delay_ms = env::var("AGENT_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.retry_base_delay_ms);

        cfg.retry_max_delay_ms = env::var("AGENT_RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.retry_max_delay_ms);

        cfg.price_window_sec = env::var("AGENT_PRICE_WINDOW_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 60)
            .unwrap_or(cfg.price_window_sec);

        cfg.narrative_timeout_sec = env::var("AGENT_NARRATIVE_TIMEOUT_SEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(cfg.narrative_timeout_sec);

        cfg.narrative_max_calls_per_hour = env::var("AGENT_NARRATIVE_MAX_CALLS_PER_HOUR")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(cfg.narrative_max_calls_per_hour);

        cfg.ledger_url = env::var("LEDGER_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        cfg.port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(cfg.port);

        cfg
    }

    /// Apply a runtime config update from the control surface. Unknown keys
    /// are reported back to the caller rather than silently dropped.
    pub fn apply_update(&mut self, update: &ConfigUpdate) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if let Some(v) = update.min_confidence {
            if v.is_finite() && (0.0..=100.0).contains(&v) {
                self.min_confidence = v;
                applied.push("min_confidence");
            }
        }
        if let Some(v) = update.analysis_interval_ms {
            if v >= 1_000 {
                self.analysis_interval_ms = v;
                applied.push("analysis_interval_ms");
            }
        }
        if let Some(v) = update.max_concurrent_analyses {
            if v >= 1 {
                self.max_concurrent_analyses = v;
                applied.push("max_concurrent_analyses");
            }
        }
        if let Some(v) = update.auto_execute {
            self.auto_execute = v;
            applied.push("auto_execute");
        }
        applied
    }
}

/// Partial config update accepted by `POST /api/agent/config`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub analysis_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrent_analyses: Option<usize>,
    #[serde(default)]
    pub auto_execute: Option<bool>,
}
