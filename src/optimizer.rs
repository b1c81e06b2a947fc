//! Strategy Optimizer
//!
//! Pure recommendation logic: no I/O, no shared state, deterministic for
//! identical inputs. Market/regime overrides live in `adjust`, not here.

use chrono::{DateTime, Utc};

use crate::models::{Deposit, Invoice, Strategy};

/// Thresholds that must all clear for an Aggressive recommendation.
const AGGRESSIVE_MIN_RISK: f64 = 70.0;
const AGGRESSIVE_MIN_PROB: f64 = 75.0;
const AGGRESSIVE_MIN_DAYS: i64 = 14;

/// Thresholds for Conservative; below these the invoice stays in Hold.
const CONSERVATIVE_MIN_RISK: f64 = 45.0;
const CONSERVATIVE_MIN_PROB: f64 = 55.0;
const CONSERVATIVE_MIN_DAYS: i64 = 7;

/// Base recommendation before market adjustment.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub strategy: Strategy,
    /// Confidence in [0, 100], monotone in distance from the decision
    /// boundary.
    pub confidence: f64,
    pub reasoning: String,
    pub factors: Vec<String>,
}

pub fn days_until_due(invoice: &Invoice, now: DateTime<Utc>) -> i64 {
    (invoice.due_date - now).num_days()
}

/// Compute the base strategy recommendation for one invoice.
pub fn optimize(invoice: &Invoice, deposit: Option<&Deposit>, now: DateTime<Utc>) -> Recommendation {
    let risk = invoice.risk_score.clamp(0.0, 100.0);
    let prob = invoice.payment_probability.clamp(0.0, 100.0);
    let days = days_until_due(invoice, now);

    let mut factors = Vec::new();

    // Overdue dominates everything else, however good the scores look.
    if invoice.due_date < now {
        factors.push(format!(
            "invoice is OVERDUE by {} day(s); capital preservation only",
            (-days).max(1)
        ));
        push_deposit_factor(&mut factors, deposit, Strategy::Hold);
        return Recommendation {
            strategy: Strategy::Hold,
            confidence: 95.0,
            reasoning: format!(
                "HOLD: invoice {} is past due; yield strategies are off the table until settlement",
                invoice.token_id
            ),
            factors,
        };
    }

    factors.push(format!("risk score {:.0}/100", risk));
    factors.push(format!("payment probability {:.0}%", prob));
    factors.push(format!("{} day(s) until due", days));

    let (strategy, confidence, reasoning) = if risk >= AGGRESSIVE_MIN_RISK
        && prob >= AGGRESSIVE_MIN_PROB
        && days >= AGGRESSIVE_MIN_DAYS
    {
        // Margin = the weakest of the three clearances, normalized to [0,1].
        let margin = ((risk - AGGRESSIVE_MIN_RISK) / (100.0 - AGGRESSIVE_MIN_RISK))
            .min((prob - AGGRESSIVE_MIN_PROB) / (100.0 - AGGRESSIVE_MIN_PROB))
            .min((days - AGGRESSIVE_MIN_DAYS) as f64 / 76.0)
            .clamp(0.0, 1.0);
        let confidence = (70.0 + 25.0 * margin).clamp(0.0, 100.0);
        (
            Strategy::Aggressive,
            confidence,
            format!(
                "AGGRESSIVE: strong credit ({:.0}), high payment probability ({:.0}%) and {} days of runway support maximum yield",
                risk, prob, days
            ),
        )
    } else if risk >= CONSERVATIVE_MIN_RISK && prob >= CONSERVATIVE_MIN_PROB && days >= CONSERVATIVE_MIN_DAYS
    {
        let margin = ((risk - CONSERVATIVE_MIN_RISK) / (AGGRESSIVE_MIN_RISK - CONSERVATIVE_MIN_RISK))
            .min((prob - CONSERVATIVE_MIN_PROB) / (AGGRESSIVE_MIN_PROB - CONSERVATIVE_MIN_PROB))
            .min(
                (days - CONSERVATIVE_MIN_DAYS) as f64
                    / (AGGRESSIVE_MIN_DAYS - CONSERVATIVE_MIN_DAYS) as f64,
            )
            .clamp(0.0, 1.0);
        let confidence = (55.0 + 20.0 * margin).clamp(0.0, 100.0);
        (
            Strategy::Conservative,
            confidence,
            format!(
                "CONSERVATIVE: moderate credit profile ({:.0} risk, {:.0}% probability) with {} days left favors measured yield",
                risk, prob, days
            ),
        )
    } else {
        // The further below the Conservative bar, the surer we are that
        // Hold is right.
        let shortfall = ((CONSERVATIVE_MIN_RISK - risk) / CONSERVATIVE_MIN_RISK)
            .max((CONSERVATIVE_MIN_PROB - prob) / CONSERVATIVE_MIN_PROB)
            .max((CONSERVATIVE_MIN_DAYS - days) as f64 / CONSERVATIVE_MIN_DAYS as f64)
            .clamp(0.0, 1.0);
        let confidence = (50.0 + 45.0 * shortfall).clamp(0.0, 100.0);
        (
            Strategy::Hold,
            confidence,
            format!(
                "HOLD: weak scores or short runway ({:.0} risk, {:.0}% probability, {} days) do not justify yield exposure",
                risk, prob, days
            ),
        )
    };

    push_deposit_factor(&mut factors, deposit, strategy);

    Recommendation {
        strategy,
        confidence,
        reasoning,
        factors,
    }
}

/// Surfaces the current deposit position as context. Does not change the
/// recommendation target.
fn push_deposit_factor(factors: &mut Vec<String>, deposit: Option<&Deposit>, recommended: Strategy) {
    let Some(dep) = deposit.filter(|d| d.active) else {
        factors.push("no active deposit; recommendation is guidance only".to_string());
        return;
    };

    let relation = if recommended.is_riskier_than(dep.strategy) {
        "can be upgraded from"
    } else if dep.strategy.is_riskier_than(recommended) {
        "would be downgraded from"
    } else {
        "already matches"
    };
    factors.push(format!(
        "deposited ({:.2} principal); {} {}",
        dep.principal,
        relation,
        dep.strategy.as_str()
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceStatus;
    use chrono::Duration;

    fn invoice(risk: f64, prob: f64, days: i64, now: DateTime<Utc>) -> Invoice {
        Invoice {
            token_id: "42".to_string(),
            due_date: now + Duration::days(days),
            created_at: now - Duration::days(10),
            issuer: "acme".to_string(),
            status: InvoiceStatus::Active,
            risk_score: risk,
            payment_probability: prob,
        }
    }

    fn deposit(strategy: Strategy, now: DateTime<Utc>) -> Deposit {
        Deposit {
            token_id: "42".to_string(),
            owner: "0xabc".to_string(),
            strategy,
            deposited_at: now - Duration::days(3),
            principal: 1_000.0,
            accrued_yield: 4.2,
            last_yield_update: now,
            active: true,
        }
    }

    #[test]
    fn strong_invoices_go_aggressive_with_high_confidence() {
        let now = Utc::now();
        for (risk, prob, days) in [(70.0, 75.0, 14), (85.0, 90.0, 45), (100.0, 100.0, 90)] {
            let rec = optimize(&invoice(risk, prob, days, now), None, now);
            assert_eq!(rec.strategy, Strategy::Aggressive, "risk={risk} prob={prob}");
            assert!(rec.confidence >= 70.0);
            assert!(rec.reasoning.contains("AGGRESSIVE"));
        }
    }

    #[test]
    fn overdue_always_holds_regardless_of_scores() {
        let now = Utc::now();
        let rec = optimize(&invoice(99.0, 99.0, -5, now), None, now);
        assert_eq!(rec.strategy, Strategy::Hold);
        assert!(rec.factors.iter().any(|f| f.contains("OVERDUE")));
    }

    #[test]
    fn moderate_profile_goes_conservative() {
        let now = Utc::now();
        let rec = optimize(&invoice(55.0, 65.0, 10, now), None, now);
        assert_eq!(rec.strategy, Strategy::Conservative);
        assert!(rec.reasoning.contains("CONSERVATIVE"));
    }

    #[test]
    fn weak_or_short_runway_holds() {
        let now = Utc::now();
        assert_eq!(
            optimize(&invoice(30.0, 40.0, 60, now), None, now).strategy,
            Strategy::Hold
        );
        // Good scores, but due in 3 days.
        assert_eq!(
            optimize(&invoice(90.0, 95.0, 3, now), None, now).strategy,
            Strategy::Hold
        );
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let now = Utc::now();
        let inv = invoice(72.0, 81.0, 20, now);
        let a = optimize(&inv, None, now);
        let b = optimize(&inv, None, now);
        assert_eq!(a.strategy, b.strategy);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.reasoning, b.reasoning);
        assert_eq!(a.factors, b.factors);
    }

    #[test]
    fn confidence_monotone_in_distance_from_boundary() {
        let now = Utc::now();
        let edge = optimize(&invoice(70.0, 75.0, 14, now), None, now);
        let deep = optimize(&invoice(95.0, 98.0, 60, now), None, now);
        assert!(deep.confidence > edge.confidence);
        assert!(edge.confidence <= 100.0 && deep.confidence <= 100.0);
    }

    #[test]
    fn deposit_only_contextualizes_factors() {
        let now = Utc::now();
        let inv = invoice(85.0, 90.0, 30, now);
        let dep = deposit(Strategy::Hold, now);
        let with = optimize(&inv, Some(&dep), now);
        let without = optimize(&inv, None, now);
        assert_eq!(with.strategy, without.strategy);
        assert_eq!(with.confidence, without.confidence);
        assert!(with
            .factors
            .iter()
            .any(|f| f.contains("can be upgraded from hold")));
    }
}
