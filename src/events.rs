//! Agent thought stream.
//!
//! Every pipeline stage publishes a structured thought; the dashboard (or
//! any other observer) subscribes over WebSocket. Publication is
//! fire-and-forget: no subscribers is normal and send errors are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    Thinking,
    Analysis,
    Decision,
    Execution,
    Error,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentThought {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub kind: ThoughtKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
}

/// Thin wrapper over a broadcast channel.
#[derive(Clone)]
pub struct ThoughtBroadcaster {
    tx: broadcast::Sender<AgentThought>,
}

impl ThoughtBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentThought> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: ThoughtKind, token_id: Option<&str>, message: impl Into<String>) {
        self.emit_with_analysis(kind, token_id, message, None);
    }

    pub fn emit_with_analysis(
        &self,
        kind: ThoughtKind,
        token_id: Option<&str>,
        message: impl Into<String>,
        analysis: Option<AnalysisResult>,
    ) {
        let thought = AgentThought {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            token_id: token_id.map(|s| s.to_string()),
            kind,
            message: message.into(),
            analysis,
        };
        // No receivers is fine; drop the thought silently.
        if self.tx.send(thought).is_err() {
            trace!("thought dropped (no subscribers)");
        }
    }
}
