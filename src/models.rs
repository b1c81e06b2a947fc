use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Yield strategy for a deposited invoice, ordered by risk.
///
/// The derived `Ord` is the risk ordering: Hold < Conservative < Aggressive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Hold,
    Conservative,
    Aggressive,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Hold => "hold",
            Strategy::Conservative => "conservative",
            Strategy::Aggressive => "aggressive",
        }
    }

    /// Nominal APY in basis points for each strategy tier.
    pub fn apy_bps(&self) -> u32 {
        match self {
            Strategy::Hold => 0,
            Strategy::Conservative => 500,
            Strategy::Aggressive => 1200,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hold" => Some(Strategy::Hold),
            "conservative" => Some(Strategy::Conservative),
            "aggressive" => Some(Strategy::Aggressive),
            _ => None,
        }
    }

    /// True when `self` carries strictly more risk than `other`.
    pub fn is_riskier_than(&self, other: Strategy) -> bool {
        *self > other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Active,
    InYield,
    Paid,
    Defaulted,
    Cancelled,
}

/// Read-only invoice snapshot fetched from the ledger per analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub token_id: String,
    pub due_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub issuer: String,
    pub status: InvoiceStatus,
    /// Risk score in [0, 100]; higher is better credit quality.
    pub risk_score: f64,
    /// Payment probability in [0, 100].
    pub payment_probability: f64,
}

/// Read-only deposit snapshot. Absence means "not deposited", not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub token_id: String,
    pub owner: String,
    pub strategy: Strategy,
    pub deposited_at: DateTime<Utc>,
    pub principal: f64,
    pub accrued_yield: f64,
    pub last_yield_update: DateTime<Utc>,
    pub active: bool,
}

/// Output of one analysis pass over one invoice. Never mutated after the
/// adjustment layer has run; superseded by the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub token_id: String,
    pub invoice: Invoice,
    pub risk_score: f64,
    pub payment_probability: f64,
    /// Signed days until the due date; negative means overdue.
    pub days_until_due: i64,
    /// Hold when the invoice has no active deposit.
    pub current_strategy: Strategy,
    pub recommended_strategy: Strategy,
    /// Confidence in [0, 100].
    pub confidence: f64,
    pub should_act: bool,
    pub reasoning: String,
    pub factors: Vec<String>,
    /// When the market/regime layer overrode the optimizer, the original
    /// recommendation is preserved here for observability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_override: Option<Strategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityTier {
    Low,
    Medium,
    High,
    Extreme,
}

impl VolatilityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolatilityTier::Low => "low",
            VolatilityTier::Medium => "medium",
            VolatilityTier::High => "high",
            VolatilityTier::Extreme => "extreme",
        }
    }
}

/// Current market snapshot produced by the market monitor.
///
/// `price_change_24h` keeps its historical wire name even though it is
/// computed over the 4h retained sample window; dashboard consumers key on
/// this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditions {
    pub eth_price: Option<f64>,
    pub btc_price: Option<f64>,
    pub price_change_24h: f64,
    pub volatility: VolatilityTier,
    pub updated_at: DateTime<Utc>,
}

impl Default for MarketConditions {
    fn default() -> Self {
        Self {
            eth_price: None,
            btc_price: None,
            price_change_24h: 0.0,
            volatility: VolatilityTier::Low,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Derived from `MarketConditions` on demand; never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketAlert {
    pub level: AlertLevel,
    pub message: String,
    pub price_change: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Bull,
    Bear,
    Volatile,
    Neutral,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Bull => "bull",
            MarketRegime::Bear => "bear",
            MarketRegime::Volatile => "volatile",
            MarketRegime::Neutral => "neutral",
        }
    }
}

/// Result of a ledger list read. Never an `Err`: a broken connection is
/// reported through `error` so callers can tell "no invoices" apart from
/// "read failed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdScan {
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IdScan {
    pub fn ok(ids: Vec<String>) -> Self {
        Self { ids, error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ids: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Outcome of a ledger decision write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionReceipt {
    pub fn succeeded(reference: impl Into<String>) -> Self {
        Self {
            success: true,
            reference: Some(reference.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            reference: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_risk_ordering() {
        assert!(Strategy::Hold < Strategy::Conservative);
        assert!(Strategy::Conservative < Strategy::Aggressive);
        assert!(Strategy::Aggressive.is_riskier_than(Strategy::Hold));
        assert!(!Strategy::Hold.is_riskier_than(Strategy::Hold));
    }

    #[test]
    fn strategy_parse_roundtrip() {
        for s in [Strategy::Hold, Strategy::Conservative, Strategy::Aggressive] {
            assert_eq!(Strategy::parse(s.as_str()), Some(s));
        }
        assert_eq!(Strategy::parse("AGGRESSIVE"), Some(Strategy::Aggressive));
        assert_eq!(Strategy::parse("yolo"), None);
    }

    #[test]
    fn id_scan_failed_is_distinguishable_from_empty() {
        let healthy = IdScan::ok(vec![]);
        let broken = IdScan::failed("connection refused");
        assert!(healthy.error.is_none());
        assert!(broken.ids.is_empty());
        assert!(broken.error.is_some());
    }
}
