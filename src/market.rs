//! Market Monitor
//!
//! Owns the bounded price-sample window, classifies volatility, and raises
//! market alerts. The price collaborator may return `None` (simulated mode);
//! samples are only appended when a real price came back.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::models::{AlertLevel, MarketAlert, MarketConditions, VolatilityTier};

pub const ETH_FEED: &str = "ETH/USD";
pub const BTC_FEED: &str = "BTC/USD";

/// External price collaborator. Ledger clients implement this; tests use
/// scripted stubs.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// `Ok(None)` means the feed is unreachable or unconfigured; the
    /// monitor then runs without a fresh sample rather than failing.
    async fn get_price(&self, feed: &str) -> Result<Option<f64>>;
}

#[derive(Debug, Clone)]
struct PriceSample {
    timestamp: DateTime<Utc>,
    eth: f64,
    btc: Option<f64>,
}

pub struct MarketMonitor {
    source: Arc<dyn PriceSource>,
    window: VecDeque<PriceSample>,
    retention: ChronoDuration,
    last: MarketConditions,
    /// Set by a non-zero shock injection; live sampling resumes on reset so
    /// the next observation cannot dilute the synthetic window.
    hold_live: bool,
}

impl MarketMonitor {
    pub fn new(source: Arc<dyn PriceSource>, retention_sec: u64) -> Self {
        Self {
            source,
            window: VecDeque::new(),
            retention: ChronoDuration::seconds(retention_sec as i64),
            last: MarketConditions::default(),
            hold_live: false,
        }
    }

    /// Fetch prices, update the window, and recompute conditions.
    pub async fn observe(&mut self, now: DateTime<Utc>) -> MarketConditions {
        if self.hold_live {
            self.last.updated_at = now;
            return self.last.clone();
        }

        let eth = match self.source.get_price(ETH_FEED).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, feed = ETH_FEED, "price fetch failed; continuing without sample");
                None
            }
        };
        let btc = match self.source.get_price(BTC_FEED).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, feed = BTC_FEED, "price fetch failed");
                None
            }
        };

        if let Some(eth) = eth.filter(|p| p.is_finite() && *p > 0.0) {
            self.window.push_back(PriceSample {
                timestamp: now,
                eth,
                btc,
            });
        } else {
            debug!("no live ETH price (simulated mode); window unchanged");
        }

        self.prune(now);
        self.recompute(now);
        self.last.clone()
    }

    /// Last computed conditions without touching the feed.
    pub fn current(&self) -> MarketConditions {
        self.last.clone()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some(front) = self.window.front() {
            if front.timestamp < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn recompute(&mut self, now: DateTime<Utc>) {
        let change = match (self.window.front(), self.window.back()) {
            (Some(oldest), Some(latest)) if oldest.eth > 0.0 => {
                (latest.eth - oldest.eth) / oldest.eth * 100.0
            }
            _ => 0.0,
        };

        self.last = MarketConditions {
            eth_price: self.window.back().map(|s| s.eth),
            btc_price: self.window.back().and_then(|s| s.btc),
            price_change_24h: change,
            volatility: volatility_tier(change),
            updated_at: now,
        };
    }

    /// Demo/test hook: replace the window with a synthetic ramp over the
    /// retention period whose end-to-end change is exactly `percentage`.
    /// A non-zero shock also pauses live sampling; a zero shock (reset)
    /// resumes it.
    pub fn simulate_shock(&mut self, percentage: f64, now: DateTime<Utc>) -> MarketConditions {
        const STEPS: usize = 16;

        self.hold_live = percentage != 0.0;
        if percentage == 0.0 {
            // Reset: drop the synthetic window and let live samples rebuild.
            self.window.clear();
            self.recompute(now);
            return self.last.clone();
        }

        let start_price = self
            .window
            .back()
            .map(|s| s.eth)
            .filter(|p| p.is_finite() && *p > 0.0)
            .unwrap_or(2_500.0);
        let end_price = start_price * (1.0 + percentage / 100.0);

        self.window.clear();
        for i in 0..STEPS {
            let frac = i as f64 / (STEPS - 1) as f64;
            let ts = now - self.retention + ChronoDuration::seconds((self.retention.num_seconds() as f64 * frac) as i64);
            self.window.push_back(PriceSample {
                timestamp: ts,
                eth: start_price + (end_price - start_price) * frac,
                btc: None,
            });
        }

        self.recompute(now);
        debug!(percentage, eth = ?self.last.eth_price, "market shock injected");
        self.last.clone()
    }
}

pub fn volatility_tier(price_change: f64) -> VolatilityTier {
    let abs = price_change.abs();
    if abs < 2.0 {
        VolatilityTier::Low
    } else if abs < 5.0 {
        VolatilityTier::Medium
    } else if abs < 10.0 {
        VolatilityTier::High
    } else {
        VolatilityTier::Extreme
    }
}

/// Alert derivation. Quiet below |3%|; sell-offs escalate from info to
/// critical; a strong rally is informational only.
pub fn check_alert(conditions: &MarketConditions) -> Option<MarketAlert> {
    let change = conditions.price_change_24h;
    if change.abs() < 3.0 {
        return None;
    }

    let alert = if change <= -8.0 {
        MarketAlert {
            level: AlertLevel::Critical,
            message: format!("market crashed: ETH down {:.1}% over the window", -change),
            price_change: change,
            recommendation: "force capital preservation; move deposits to hold".to_string(),
        }
    } else if change <= -5.0 {
        MarketAlert {
            level: AlertLevel::Warning,
            message: format!("market dropped {:.1}% over the window", -change),
            price_change: change,
            recommendation: "downgrade aggressive positions to conservative".to_string(),
        }
    } else if change <= -3.0 {
        MarketAlert {
            level: AlertLevel::Info,
            message: format!("elevated volatility: ETH down {:.1}%; monitoring", -change),
            price_change: change,
            recommendation: "no action; continue monitoring".to_string(),
        }
    } else if change >= 5.0 {
        MarketAlert {
            level: AlertLevel::Info,
            message: format!("market rally: ETH up {:.1}% over the window", change),
            price_change: change,
            recommendation: "favorable conditions for higher-yield strategies".to_string(),
        }
    } else {
        return None;
    };

    Some(alert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedSource {
        eth: Mutex<Vec<Option<f64>>>,
    }

    impl ScriptedSource {
        fn new(prices: Vec<Option<f64>>) -> Arc<Self> {
            Arc::new(Self {
                eth: Mutex::new(prices),
            })
        }
    }

    #[async_trait]
    impl PriceSource for ScriptedSource {
        async fn get_price(&self, feed: &str) -> Result<Option<f64>> {
            if feed == ETH_FEED {
                let mut prices = self.eth.lock();
                if prices.is_empty() {
                    Ok(None)
                } else {
                    Ok(prices.remove(0))
                }
            } else {
                Ok(None)
            }
        }
    }

    fn conditions(change: f64) -> MarketConditions {
        MarketConditions {
            price_change_24h: change,
            ..Default::default()
        }
    }

    #[test]
    fn volatility_tiers_at_boundaries() {
        assert_eq!(volatility_tier(0.0), VolatilityTier::Low);
        assert_eq!(volatility_tier(1.9), VolatilityTier::Low);
        assert_eq!(volatility_tier(-2.0), VolatilityTier::Medium);
        assert_eq!(volatility_tier(4.9), VolatilityTier::Medium);
        assert_eq!(volatility_tier(-5.0), VolatilityTier::High);
        assert_eq!(volatility_tier(9.9), VolatilityTier::High);
        assert_eq!(volatility_tier(10.0), VolatilityTier::Extreme);
    }

    #[test]
    fn alert_levels_match_contract() {
        assert!(check_alert(&conditions(1.0)).is_none());
        assert!(check_alert(&conditions(-2.9)).is_none());

        let warn = check_alert(&conditions(-7.0)).unwrap();
        assert_eq!(warn.level, AlertLevel::Warning);
        assert!(warn.message.contains("dropped"));

        let crit = check_alert(&conditions(-9.0)).unwrap();
        assert_eq!(crit.level, AlertLevel::Critical);
        assert!(crit.message.contains("crashed"));

        let info = check_alert(&conditions(-3.5)).unwrap();
        assert_eq!(info.level, AlertLevel::Info);
        assert!(info.message.contains("monitoring"));

        let rally = check_alert(&conditions(6.0)).unwrap();
        assert_eq!(rally.level, AlertLevel::Info);
        assert!(rally.message.contains("rally"));
    }

    #[tokio::test]
    async fn observe_computes_change_over_window() {
        let source = ScriptedSource::new(vec![Some(2_000.0), Some(2_100.0)]);
        let mut monitor = MarketMonitor::new(source, 4 * 3600);

        let t0 = Utc::now();
        monitor.observe(t0).await;
        let cond = monitor.observe(t0 + ChronoDuration::minutes(5)).await;

        assert_eq!(cond.eth_price, Some(2_100.0));
        assert!((cond.price_change_24h - 5.0).abs() < 1e-9);
        assert_eq!(cond.volatility, VolatilityTier::High);
    }

    #[tokio::test]
    async fn samples_outside_retention_are_discarded() {
        let source = ScriptedSource::new(vec![Some(1_000.0), Some(1_500.0), Some(1_650.0)]);
        let mut monitor = MarketMonitor::new(source, 3600);

        let t0 = Utc::now();
        monitor.observe(t0).await;
        monitor.observe(t0 + ChronoDuration::minutes(50)).await;
        // First sample is now outside the 1h retention.
        let cond = monitor.observe(t0 + ChronoDuration::minutes(70)).await;

        assert!((cond.price_change_24h - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_price_means_no_sample() {
        let source = ScriptedSource::new(vec![None, None]);
        let mut monitor = MarketMonitor::new(source, 4 * 3600);

        let cond = monitor.observe(Utc::now()).await;
        assert_eq!(cond.eth_price, None);
        assert_eq!(cond.price_change_24h, 0.0);
        assert_eq!(cond.volatility, VolatilityTier::Low);
    }

    #[test]
    fn shock_window_produces_requested_change() {
        let source = ScriptedSource::new(vec![]);
        let mut monitor = MarketMonitor::new(source, 4 * 3600);

        let cond = monitor.simulate_shock(-10.0, Utc::now());
        assert!((cond.price_change_24h + 10.0).abs() < 1e-6);
        assert_eq!(cond.volatility, VolatilityTier::Extreme);
        assert!(check_alert(&cond).unwrap().level == AlertLevel::Critical);

        let rally = monitor.simulate_shock(6.0, Utc::now());
        assert!((rally.price_change_24h - 6.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn shock_holds_live_sampling_until_reset() {
        let source = ScriptedSource::new(vec![Some(2_500.0), Some(2_500.0)]);
        let mut monitor = MarketMonitor::new(source, 4 * 3600);

        monitor.simulate_shock(-10.0, Utc::now());
        // A live 2500 sample would read as a rebound; it must be ignored.
        let cond = monitor.observe(Utc::now()).await;
        assert!((cond.price_change_24h + 10.0).abs() < 1e-6);

        // Reset resumes live sampling.
        monitor.simulate_shock(0.0, Utc::now());
        let cond = monitor.observe(Utc::now()).await;
        assert_eq!(cond.eth_price, Some(2_500.0));
    }
}
