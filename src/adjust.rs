//! Adjustment Layer
//!
//! Applies market alerts and the regime classifier's state on top of the
//! optimizer's base recommendation. Alert handling runs first, regime bias
//! second; both are idempotent for identical inputs, and the pre-override
//! recommendation is preserved in `market_override`.

use tracing::debug;

use crate::models::{AlertLevel, AnalysisResult, MarketAlert, MarketConditions, MarketRegime, Strategy};

/// Confidence floor for a bull-regime upgrade toward Aggressive.
const BULL_UPGRADE_MIN_CONFIDENCE: f64 = 75.0;

pub fn apply(
    mut analysis: AnalysisResult,
    conditions: &MarketConditions,
    alert: Option<&MarketAlert>,
    regime: MarketRegime,
) -> AnalysisResult {
    let original = analysis.recommended_strategy;

    if let Some(alert) = alert {
        match alert.level {
            AlertLevel::Critical => {
                if analysis.recommended_strategy != Strategy::Hold {
                    record_override(
                        &mut analysis,
                        Strategy::Hold,
                        format!(
                            "market override: {} ({:+.1}%) forces hold for capital protection",
                            alert.message, alert.price_change
                        ),
                    );
                }
            }
            AlertLevel::Warning => {
                if analysis.recommended_strategy == Strategy::Aggressive {
                    record_override(
                        &mut analysis,
                        Strategy::Conservative,
                        format!(
                            "market override: {}; aggressive downgraded to conservative",
                            alert.message
                        ),
                    );
                }
            }
            AlertLevel::Info => {}
        }
    }

    // Regime bias applies after alert handling. An active alert already
    // expresses stress; the bull upgrade only fires in calm conditions.
    match regime {
        MarketRegime::Bull => {
            if alert.is_none()
                && analysis.recommended_strategy == Strategy::Conservative
                && analysis.confidence >= BULL_UPGRADE_MIN_CONFIDENCE
            {
                record_override(
                    &mut analysis,
                    Strategy::Aggressive,
                    "bull regime: conservative upgraded toward aggressive".to_string(),
                );
            }
        }
        MarketRegime::Bear | MarketRegime::Volatile => {
            if analysis.recommended_strategy == Strategy::Aggressive {
                record_override(
                    &mut analysis,
                    Strategy::Conservative,
                    format!(
                        "{} regime: aggressive biased down to conservative",
                        regime.as_str()
                    ),
                );
            }
        }
        MarketRegime::Neutral => {}
    }

    if analysis.recommended_strategy != original {
        debug!(
            token_id = %analysis.token_id,
            from = original.as_str(),
            to = analysis.recommended_strategy.as_str(),
            change = conditions.price_change_24h,
            regime = regime.as_str(),
            "market adjustment applied"
        );
    }

    analysis
}

fn record_override(analysis: &mut AnalysisResult, new: Strategy, note: String) {
    if analysis.market_override.is_none() {
        analysis.market_override = Some(analysis.recommended_strategy);
    }
    analysis.recommended_strategy = new;
    analysis.reasoning = format!("{} | {}", analysis.reasoning, note);
    analysis.factors.push(note);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertLevel, Invoice, InvoiceStatus, VolatilityTier};
    use chrono::{Duration, Utc};

    fn analysis(strategy: Strategy, confidence: f64) -> AnalysisResult {
        let now = Utc::now();
        AnalysisResult {
            token_id: "7".to_string(),
            invoice: Invoice {
                token_id: "7".to_string(),
                due_date: now + Duration::days(30),
                created_at: now,
                issuer: "acme".to_string(),
                status: InvoiceStatus::InYield,
                risk_score: 80.0,
                payment_probability: 85.0,
            },
            risk_score: 80.0,
            payment_probability: 85.0,
            days_until_due: 30,
            current_strategy: Strategy::Hold,
            recommended_strategy: strategy,
            confidence,
            should_act: false,
            reasoning: "base".to_string(),
            factors: vec![],
            market_override: None,
        }
    }

    fn alert(level: AlertLevel, change: f64) -> MarketAlert {
        MarketAlert {
            level,
            message: "test alert".to_string(),
            price_change: change,
            recommendation: String::new(),
        }
    }

    fn calm() -> MarketConditions {
        MarketConditions {
            volatility: VolatilityTier::Low,
            ..Default::default()
        }
    }

    #[test]
    fn critical_alert_forces_hold_and_records_override() {
        let a = apply(
            analysis(Strategy::Aggressive, 90.0),
            &calm(),
            Some(&alert(AlertLevel::Critical, -9.0)),
            MarketRegime::Neutral,
        );
        assert_eq!(a.recommended_strategy, Strategy::Hold);
        assert_eq!(a.market_override, Some(Strategy::Aggressive));
    }

    #[test]
    fn warning_downgrades_aggressive_only() {
        let down = apply(
            analysis(Strategy::Aggressive, 85.0),
            &calm(),
            Some(&alert(AlertLevel::Warning, -6.0)),
            MarketRegime::Neutral,
        );
        assert_eq!(down.recommended_strategy, Strategy::Conservative);

        let untouched = apply(
            analysis(Strategy::Conservative, 85.0),
            &calm(),
            Some(&alert(AlertLevel::Warning, -6.0)),
            MarketRegime::Neutral,
        );
        assert_eq!(untouched.recommended_strategy, Strategy::Conservative);
        assert!(untouched.market_override.is_none());
    }

    #[test]
    fn bull_regime_upgrades_confident_conservative() {
        let up = apply(
            analysis(Strategy::Conservative, 80.0),
            &calm(),
            None,
            MarketRegime::Bull,
        );
        assert_eq!(up.recommended_strategy, Strategy::Aggressive);
        assert_eq!(up.market_override, Some(Strategy::Conservative));

        let hesitant = apply(
            analysis(Strategy::Conservative, 60.0),
            &calm(),
            None,
            MarketRegime::Bull,
        );
        assert_eq!(hesitant.recommended_strategy, Strategy::Conservative);
    }

    #[test]
    fn bear_and_volatile_bias_down() {
        for regime in [MarketRegime::Bear, MarketRegime::Volatile] {
            let a = apply(analysis(Strategy::Aggressive, 90.0), &calm(), None, regime);
            assert_eq!(a.recommended_strategy, Strategy::Conservative, "{regime:?}");
        }
    }

    #[test]
    fn reapplying_is_idempotent() {
        let crash = alert(AlertLevel::Critical, -10.0);
        let once = apply(
            analysis(Strategy::Aggressive, 90.0),
            &calm(),
            Some(&crash),
            MarketRegime::Bear,
        );
        let twice = apply(once.clone(), &calm(), Some(&crash), MarketRegime::Bear);
        assert_eq!(once.recommended_strategy, twice.recommended_strategy);
        assert_eq!(once.market_override, twice.market_override);

        let bull_once = apply(analysis(Strategy::Conservative, 80.0), &calm(), None, MarketRegime::Bull);
        let bull_twice = apply(bull_once.clone(), &calm(), None, MarketRegime::Bull);
        assert_eq!(bull_once.recommended_strategy, bull_twice.recommended_strategy);
        assert_eq!(bull_once.market_override, bull_twice.market_override);
    }
}
