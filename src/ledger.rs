//! Ledger collaborators.
//!
//! The agent never owns invoice/deposit state; it reads snapshots from and
//! writes decisions to an external ledger. Two implementations: an HTTP
//! client against the ledger indexer, and an in-memory paper ledger used
//! when no endpoint is configured (and by the test suite).
//!
//! List reads return `IdScan` instead of erroring so callers can tell
//! "no invoices" apart from "read failed".

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market::{PriceSource, BTC_FEED, ETH_FEED};
use crate::models::{
    Deposit, ExecutionReceipt, IdScan, Invoice, InvoiceStatus, Strategy,
};

#[async_trait]
pub trait LedgerReader: Send + Sync {
    async fn get_invoice(&self, token_id: &str) -> Result<Option<Invoice>>;
    async fn get_deposit(&self, token_id: &str) -> Result<Option<Deposit>>;
    async fn get_active_invoice_ids(&self) -> IdScan;
    async fn get_active_deposit_ids(&self) -> IdScan;
}

#[async_trait]
pub trait LedgerWriter: Send + Sync {
    /// Record a strategy decision. No idempotency guarantee: the engine
    /// relies on retry plus the next natural cycle, not exactly-once.
    async fn record_decision(
        &self,
        token_id: &str,
        strategy: Strategy,
        confidence: f64,
        reasoning: &str,
    ) -> Result<ExecutionReceipt>;
}

// ============================================================================
// HTTP ledger client
// ============================================================================

#[derive(Clone)]
pub struct HttpLedgerClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct DecisionPayload<'a> {
    token_id: &'a str,
    strategy: &'a str,
    confidence: f64,
    reasoning: &'a str,
    client_ref: String,
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdListResponse {
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Option<f64>,
}

impl HttpLedgerClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(base_url = %base_url, "ledger client initialized");
        Self { client, base_url }
    }

    async fn fetch_ids(&self, path: &str) -> IdScan {
        let url = format!("{}{}", self.base_url, path);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => return IdScan::failed(format!("ledger read failed: {e}")),
        };
        let status = resp.status();
        if !status.is_success() {
            return IdScan::failed(format!("ledger read failed ({status})"));
        }
        match resp.json::<IdListResponse>().await {
            Ok(list) => IdScan::ok(list.ids),
            Err(e) => IdScan::failed(format!("ledger response parse failed: {e}")),
        }
    }

    async fn fetch_optional<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("ledger request {path}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        Ok(Some(resp.json::<T>().await.context("ledger response parse")?))
    }
}

#[async_trait]
impl LedgerReader for HttpLedgerClient {
    async fn get_invoice(&self, token_id: &str) -> Result<Option<Invoice>> {
        self.fetch_optional(&format!("/api/invoices/{token_id}")).await
    }

    async fn get_deposit(&self, token_id: &str) -> Result<Option<Deposit>> {
        self.fetch_optional(&format!("/api/deposits/{token_id}")).await
    }

    async fn get_active_invoice_ids(&self) -> IdScan {
        self.fetch_ids("/api/invoices/active").await
    }

    async fn get_active_deposit_ids(&self) -> IdScan {
        self.fetch_ids("/api/deposits/active").await
    }
}

#[async_trait]
impl PriceSource for HttpLedgerClient {
    async fn get_price(&self, feed: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/prices", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("feed", feed)])
            .send()
            .await;

        // Price unavailability is not an error; the monitor falls back to
        // simulated mode.
        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(feed, status = %r.status(), "price feed unavailable");
                return Ok(None);
            }
            Err(e) => {
                debug!(feed, error = %e, "price feed unreachable");
                return Ok(None);
            }
        };

        let parsed = resp.json::<PriceResponse>().await.unwrap_or(PriceResponse { price: None });
        Ok(parsed.price.filter(|p| p.is_finite() && *p > 0.0))
    }
}

#[async_trait]
impl LedgerWriter for HttpLedgerClient {
    async fn record_decision(
        &self,
        token_id: &str,
        strategy: Strategy,
        confidence: f64,
        reasoning: &str,
    ) -> Result<ExecutionReceipt> {
        if token_id.trim().is_empty() {
            return Err(anyhow!("missing token id"));
        }

        let payload = DecisionPayload {
            token_id,
            strategy: strategy.as_str(),
            confidence,
            reasoning,
            client_ref: Uuid::new_v4().to_string(),
        };

        let url = format!("{}/api/decisions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("ledger write request")?;

        let status = resp.status();
        if status.is_server_error() {
            // Keep the status code in the message; the retry layer
            // classifies 5xx as transient.
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ledger unavailable ({status}): {body}"));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ledger rejected ({status}): {body}"));
        }

        let parsed: DecisionResponse = resp.json().await.context("decision response parse")?;
        if !parsed.success {
            return Err(anyhow!(
                "ledger rejected: {}",
                parsed.error.unwrap_or_else(|| "unknown rejection".to_string())
            ));
        }

        Ok(ExecutionReceipt {
            success: true,
            reference: parsed.reference,
            error: None,
        })
    }
}

// ============================================================================
// Paper ledger (simulation)
// ============================================================================

#[derive(Debug, Clone)]
pub struct PaperLedgerConfig {
    pub base_latency_ms: u64,
    pub latency_jitter_ms: u64,
    /// Probability a write is rejected (simulates allowance/guard failures).
    pub reject_prob: f64,
    /// When false, `get_price` returns `None` (pure simulated mode).
    pub live_prices: bool,
}

impl Default for PaperLedgerConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 30,
            latency_jitter_ms: 50,
            reject_prob: 0.02,
            live_prices: true,
        }
    }
}

struct PaperState {
    invoices: HashMap<String, Invoice>,
    deposits: HashMap<String, Deposit>,
    eth_price: f64,
    rng: StdRng,
}

/// In-memory ledger with synthetic invoices and a random-walk price.
pub struct PaperLedger {
    config: PaperLedgerConfig,
    state: Mutex<PaperState>,
}

impl PaperLedger {
    pub fn new(config: PaperLedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PaperState {
                invoices: HashMap::new(),
                deposits: HashMap::new(),
                eth_price: 2_500.0,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Seeded demo book: a spread of credit profiles, some deposited.
    pub fn with_demo_data() -> Arc<Self> {
        let ledger = Self::new(PaperLedgerConfig::default());
        let now = Utc::now();

        let profiles: &[(&str, f64, f64, i64, Option<Strategy>)] = &[
            ("1", 88.0, 92.0, 45, Some(Strategy::Conservative)),
            ("2", 74.0, 80.0, 21, Some(Strategy::Hold)),
            ("3", 55.0, 62.0, 12, Some(Strategy::Aggressive)),
            ("4", 35.0, 48.0, 30, None),
            ("5", 91.0, 95.0, 60, Some(Strategy::Hold)),
            ("6", 68.0, 71.0, 5, None),
            ("7", 80.0, 85.0, -3, Some(Strategy::Conservative)),
            ("8", 47.0, 58.0, 9, None),
        ];

        {
            let mut state = ledger.state.lock();
            for (id, risk, prob, days, strategy) in profiles {
                let deposited = strategy.is_some();
                state.invoices.insert(
                    id.to_string(),
                    Invoice {
                        token_id: id.to_string(),
                        due_date: now + ChronoDuration::days(*days),
                        created_at: now - ChronoDuration::days(20),
                        issuer: format!("issuer-{id}"),
                        status: if deposited {
                            InvoiceStatus::InYield
                        } else {
                            InvoiceStatus::Active
                        },
                        risk_score: *risk,
                        payment_probability: *prob,
                    },
                );
                if let Some(strategy) = strategy {
                    state.deposits.insert(
                        id.to_string(),
                        Deposit {
                            token_id: id.to_string(),
                            owner: format!("0xowner{id}"),
                            strategy: *strategy,
                            deposited_at: now - ChronoDuration::days(5),
                            principal: 1_000.0 + 250.0 * id.parse::<f64>().unwrap_or(0.0),
                            accrued_yield: 0.0,
                            last_yield_update: now,
                            active: true,
                        },
                    );
                }
            }
        }

        Arc::new(ledger)
    }

    async fn simulate_latency(&self) {
        let jitter = {
            let mut state = self.state.lock();
            let max = self.config.latency_jitter_ms;
            if max == 0 {
                0
            } else {
                state.rng.gen_range(0..=max)
            }
        };
        sleep(Duration::from_millis(self.config.base_latency_ms + jitter)).await;
    }
}

#[async_trait]
impl LedgerReader for PaperLedger {
    async fn get_invoice(&self, token_id: &str) -> Result<Option<Invoice>> {
        self.simulate_latency().await;
        Ok(self.state.lock().invoices.get(token_id).cloned())
    }

    async fn get_deposit(&self, token_id: &str) -> Result<Option<Deposit>> {
        self.simulate_latency().await;
        Ok(self.state.lock().deposits.get(token_id).cloned())
    }

    async fn get_active_invoice_ids(&self) -> IdScan {
        self.simulate_latency().await;
        let mut ids: Vec<String> = self
            .state
            .lock()
            .invoices
            .values()
            .filter(|i| matches!(i.status, InvoiceStatus::Active | InvoiceStatus::InYield))
            .map(|i| i.token_id.clone())
            .collect();
        ids.sort();
        IdScan::ok(ids)
    }

    async fn get_active_deposit_ids(&self) -> IdScan {
        self.simulate_latency().await;
        let mut ids: Vec<String> = self
            .state
            .lock()
            .deposits
            .values()
            .filter(|d| d.active)
            .map(|d| d.token_id.clone())
            .collect();
        ids.sort();
        IdScan::ok(ids)
    }
}

#[async_trait]
impl PriceSource for PaperLedger {
    async fn get_price(&self, feed: &str) -> Result<Option<f64>> {
        if !self.config.live_prices {
            return Ok(None);
        }
        let mut state = self.state.lock();
        match feed {
            ETH_FEED => {
                // Gentle random walk so volatility stays realistic.
                let step: f64 = state.rng.gen_range(-0.004..0.004);
                state.eth_price = (state.eth_price * (1.0 + step)).max(100.0);
                Ok(Some(state.eth_price))
            }
            BTC_FEED => Ok(Some(state.eth_price * 18.0)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl LedgerWriter for PaperLedger {
    async fn record_decision(
        &self,
        token_id: &str,
        strategy: Strategy,
        confidence: f64,
        reasoning: &str,
    ) -> Result<ExecutionReceipt> {
        if token_id.trim().is_empty() {
            return Err(anyhow!("missing token id"));
        }
        self.simulate_latency().await;

        let mut state = self.state.lock();

        if state.rng.gen::<f64>() < self.config.reject_prob {
            return Err(anyhow!("ledger rejected (simulated): strategy guard"));
        }
        if !state.invoices.contains_key(token_id) {
            return Err(anyhow!("ledger rejected: unknown token {token_id}"));
        }

        let now = Utc::now();
        if let Some(dep) = state.deposits.get_mut(token_id) {
            dep.strategy = strategy;
            dep.last_yield_update = now;
        } else {
            warn!(token_id, "decision recorded for undeposited invoice");
        }

        let reference = format!("paper:{}", Uuid::new_v4());
        debug!(
            token_id,
            strategy = strategy.as_str(),
            confidence,
            reasoning_len = reasoning.len(),
            reference = %reference,
            "paper decision recorded"
        );

        Ok(ExecutionReceipt::succeeded(reference))
    }
}
