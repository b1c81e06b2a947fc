use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yieldpilot_backend::{
    api,
    config::AgentConfig,
    engine::{AgentCommand, AgentEngine},
    events::ThoughtBroadcaster,
    ledger::{HttpLedgerClient, LedgerReader, LedgerWriter, PaperLedger},
    market::{MarketMonitor, PriceSource},
    narrative::{NarrativeGenerator, OpenRouterClient},
};

#[derive(Parser, Debug)]
#[command(name = "yieldpilot", about = "Autonomous invoice yield strategy agent")]
struct Args {
    /// HTTP listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Ledger endpoint (overrides LEDGER_URL); omit for the paper ledger
    #[arg(long)]
    ledger_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    let args = Args::parse();
    let mut config = AgentConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(url) = args.ledger_url {
        config.ledger_url = Some(url);
    }

    info!("yieldpilot agent starting");

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    // Ledger + price source. One object serves both roles in either mode.
    let (reader, writer, prices): (
        Arc<dyn LedgerReader>,
        Arc<dyn LedgerWriter>,
        Arc<dyn PriceSource>,
    ) = match &config.ledger_url {
        Some(url) => {
            let client = Arc::new(HttpLedgerClient::new(http_client.clone(), url.clone()));
            info!(url = %url, "using remote ledger");
            (client.clone(), client.clone(), client)
        }
        None => {
            let paper = PaperLedger::with_demo_data();
            info!("LEDGER_URL not set; using simulated paper ledger");
            (paper.clone(), paper.clone(), paper)
        }
    };

    let monitor = MarketMonitor::new(prices, config.price_window_sec);

    let narrative_client = match OpenRouterClient::from_env(http_client) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "narrative LLM disabled; using template explanations");
            None
        }
    };
    let narrative = NarrativeGenerator::new(
        narrative_client,
        config.narrative_timeout_sec,
        config.narrative_max_calls_per_hour,
    );

    let port = config.port;
    let config = Arc::new(RwLock::new(config));
    let thoughts = ThoughtBroadcaster::new(1024);

    let engine = AgentEngine::new(config, reader, writer, monitor, narrative, thoughts);
    let (command_tx, command_rx) = mpsc::channel::<AgentCommand>(64);
    engine.clone().spawn(command_rx);

    let app = api::create_router(engine, command_tx);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yieldpilot_backend=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
