//! Narrative generation.
//!
//! Optional LLM-written explanation of a decision, with a hard timeout, an
//! independent rolling-window call budget, and a deterministic template
//! fallback. A narrative failure never fails the analysis that asked for it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::AnalysisResult;

const BUDGET_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }
        let model = std::env::var("AGENT_NARRATIVE_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "openai/gpt-4o-mini".to_string());

        Ok(Self {
            http,
            api_key,
            model,
        })
    }

    async fn chat_completion(&self, system: &str, user: &str, timeout: Duration) -> Result<String> {
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.3),
            max_tokens: Some(180),
        };

        let resp = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&req)
            .send()
            .await
            .context("openrouter request")?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("openrouter {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("openrouter json parse")?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(anyhow!("openrouter returned empty content"));
        }
        Ok(content)
    }
}

/// Narrative generator with budget and fallback.
pub struct NarrativeGenerator {
    client: Option<OpenRouterClient>,
    timeout: Duration,
    max_calls_per_window: usize,
    call_log: Mutex<VecDeque<Instant>>,
}

impl NarrativeGenerator {
    pub fn new(client: Option<OpenRouterClient>, timeout_sec: u64, max_calls_per_hour: usize) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(timeout_sec),
            max_calls_per_window: max_calls_per_hour,
            call_log: Mutex::new(VecDeque::new()),
        }
    }

    /// Deterministic template used whenever the LLM path is unavailable.
    pub fn template(analysis: &AnalysisResult) -> String {
        let action = if analysis.should_act {
            format!(
                "moving from {} to {}",
                analysis.current_strategy.as_str(),
                analysis.recommended_strategy.as_str()
            )
        } else {
            format!("staying on {}", analysis.current_strategy.as_str())
        };
        let override_note = match analysis.market_override {
            Some(original) => format!(
                " Market conditions overrode the base {} recommendation.",
                original.as_str()
            ),
            None => String::new(),
        };
        format!(
            "Invoice {}: {} at {:.0}% confidence. Risk {:.0}/100, payment probability {:.0}%, {} day(s) until due.{}",
            analysis.token_id,
            action,
            analysis.confidence,
            analysis.risk_score,
            analysis.payment_probability,
            analysis.days_until_due,
            override_note
        )
    }

    /// True when another LLM call fits the rolling budget; records the call.
    fn try_spend_call(&self) -> bool {
        let mut log = self.call_log.lock();
        let now = Instant::now();
        while let Some(front) = log.front() {
            if now.duration_since(*front) > BUDGET_WINDOW {
                log.pop_front();
            } else {
                break;
            }
        }
        if log.len() >= self.max_calls_per_window {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Explain an analysis. Falls back to the template on any failure,
    /// timeout, or budget exhaustion.
    pub async fn explain(&self, analysis: &AnalysisResult) -> String {
        let Some(client) = &self.client else {
            return Self::template(analysis);
        };
        if !self.try_spend_call() {
            debug!(token_id = %analysis.token_id, "narrative budget exhausted; using template");
            return Self::template(analysis);
        }

        let system = "You explain invoice yield strategy decisions to vault depositors. \
                      One short paragraph, plain language, no financial advice disclaimers.";
        let user = format!(
            "token_id={} current={} recommended={} confidence={:.0} should_act={} days_until_due={} risk={:.0} probability={:.0}\nfactors:\n{}",
            analysis.token_id,
            analysis.current_strategy.as_str(),
            analysis.recommended_strategy.as_str(),
            analysis.confidence,
            analysis.should_act,
            analysis.days_until_due,
            analysis.risk_score,
            analysis.payment_probability,
            analysis.factors.join("\n"),
        );

        match client.chat_completion(system, &user, self.timeout).await {
            Ok(text) => text,
            Err(e) => {
                warn!(token_id = %analysis.token_id, error = %e, "narrative generation failed; using template");
                Self::template(analysis)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}
