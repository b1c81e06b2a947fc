//! Regime Classifier
//!
//! Coarse market regime derived from monitor output. Hysteresis keeps a
//! noisy single sample from flipping the regime back and forth: a switch
//! requires the same signal on `hysteresis` consecutive observations.
//!
//! Thresholds (documented in DESIGN.md): volatility >= High -> volatile
//! signal; price change >= +3% -> bull; <= -3% -> bear; otherwise neutral.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::models::{MarketConditions, MarketRegime, VolatilityTier};

const BULL_CHANGE_PCT: f64 = 3.0;
const BEAR_CHANGE_PCT: f64 = -3.0;
const DEFAULT_HYSTERESIS: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct RegimeStats {
    pub current: MarketRegime,
    pub observations: u64,
    pub transitions: u64,
    pub bull_observations: u64,
    pub bear_observations: u64,
    pub volatile_observations: u64,
    pub neutral_observations: u64,
    pub last_change: Option<DateTime<Utc>>,
}

pub struct RegimeClassifier {
    current: MarketRegime,
    hysteresis: u32,
    pending: Option<(MarketRegime, u32)>,
    observations: u64,
    transitions: u64,
    counts: [u64; 4],
    last_change: Option<DateTime<Utc>>,
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS)
    }
}

impl RegimeClassifier {
    pub fn new(hysteresis: u32) -> Self {
        Self {
            current: MarketRegime::Neutral,
            hysteresis: hysteresis.max(1),
            pending: None,
            observations: 0,
            transitions: 0,
            counts: [0; 4],
            last_change: None,
        }
    }

    fn signal(conditions: &MarketConditions) -> MarketRegime {
        if matches!(
            conditions.volatility,
            VolatilityTier::High | VolatilityTier::Extreme
        ) {
            MarketRegime::Volatile
        } else if conditions.price_change_24h >= BULL_CHANGE_PCT {
            MarketRegime::Bull
        } else if conditions.price_change_24h <= BEAR_CHANGE_PCT {
            MarketRegime::Bear
        } else {
            MarketRegime::Neutral
        }
    }

    fn count_index(regime: MarketRegime) -> usize {
        match regime {
            MarketRegime::Bull => 0,
            MarketRegime::Bear => 1,
            MarketRegime::Volatile => 2,
            MarketRegime::Neutral => 3,
        }
    }

    /// Feed one observation; returns the (possibly unchanged) regime.
    pub fn update(&mut self, conditions: &MarketConditions) -> MarketRegime {
        let signal = Self::signal(conditions);
        self.observations += 1;
        self.counts[Self::count_index(signal)] += 1;

        if signal == self.current {
            self.pending = None;
            return self.current;
        }

        let streak = match self.pending {
            Some((pending, streak)) if pending == signal => streak + 1,
            _ => 1,
        };

        if streak >= self.hysteresis {
            info!(
                from = self.current.as_str(),
                to = signal.as_str(),
                streak,
                "market regime transition"
            );
            self.current = signal;
            self.pending = None;
            self.transitions += 1;
            self.last_change = Some(conditions.updated_at);
        } else {
            self.pending = Some((signal, streak));
        }

        self.current
    }

    pub fn current(&self) -> MarketRegime {
        self.current
    }

    pub fn stats(&self) -> RegimeStats {
        RegimeStats {
            current: self.current,
            observations: self.observations,
            transitions: self.transitions,
            bull_observations: self.counts[0],
            bear_observations: self.counts[1],
            volatile_observations: self.counts[2],
            neutral_observations: self.counts[3],
            last_change: self.last_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(change: f64, volatility: VolatilityTier) -> MarketConditions {
        MarketConditions {
            price_change_24h: change,
            volatility,
            ..Default::default()
        }
    }

    #[test]
    fn stays_neutral_until_streak_reached() {
        let mut c = RegimeClassifier::new(3);
        assert_eq!(c.update(&cond(4.0, VolatilityTier::Medium)), MarketRegime::Neutral);
        assert_eq!(c.update(&cond(4.0, VolatilityTier::Medium)), MarketRegime::Neutral);
        assert_eq!(c.update(&cond(4.0, VolatilityTier::Medium)), MarketRegime::Bull);
        assert_eq!(c.current(), MarketRegime::Bull);
    }

    #[test]
    fn alternating_signals_do_not_oscillate() {
        let mut c = RegimeClassifier::new(3);
        for _ in 0..5 {
            c.update(&cond(4.0, VolatilityTier::Medium));
            c.update(&cond(-4.0, VolatilityTier::Medium));
        }
        // Neither signal ever held for 3 consecutive observations.
        assert_eq!(c.current(), MarketRegime::Neutral);
        assert_eq!(c.stats().transitions, 0);
    }

    #[test]
    fn high_volatility_dominates_direction() {
        let mut c = RegimeClassifier::new(1);
        assert_eq!(
            c.update(&cond(7.0, VolatilityTier::High)),
            MarketRegime::Volatile
        );
    }

    #[test]
    fn stats_track_observations_and_transitions() {
        let mut c = RegimeClassifier::new(2);
        c.update(&cond(-4.0, VolatilityTier::Medium));
        c.update(&cond(-4.0, VolatilityTier::Medium));
        let stats = c.stats();
        assert_eq!(stats.current, MarketRegime::Bear);
        assert_eq!(stats.observations, 2);
        assert_eq!(stats.transitions, 1);
        assert_eq!(stats.bear_observations, 2);
        assert!(stats.last_change.is_some());
    }
}
