mod face;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use dotenvy::dotenv;
use face::AgentEvent;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use weblinx_live::brain::{ActionGenerator, GenerationClient};
use weblinx_live::hands::{Browser, ChromeBrowser};
use weblinx_live::retrieval::{RetrievalClient, SimilarityScorer};
use weblinx_live::{Agent, Config, HarnessError, Session, TurnInput, TurnOutcome};

/// Chat with a web navigation model while it drives Chrome, and record the
/// session as a replayable demonstration.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Where pages, bboxes, the replay log and screenshots are written
    #[arg(long, default_value = "./live_data")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 1600)]
    viewport_width: u32,

    #[arg(long, default_value_t = 900)]
    viewport_height: u32,

    /// Pause after every browser action, in milliseconds
    #[arg(long, default_value_t = 3000)]
    settle_ms: u64,

    /// Candidates shown to the model per turn
    #[arg(long, default_value_t = 10)]
    num_candidates: usize,

    #[arg(long, default_value_t = 256)]
    max_new_tokens: u32,

    #[arg(long, default_value_t = 2)]
    pad_token_id: u32,

    #[arg(long, default_value_t = 12_000)]
    max_prompt_chars: usize,

    /// Show the Chrome window
    #[arg(long)]
    headed: bool,

    /// Used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: Config) -> Config {
        Config {
            viewport_width: self.viewport_width,
            viewport_height: self.viewport_height,
            settle_delay: Duration::from_millis(self.settle_ms),
            num_candidates: self.num_candidates,
            max_new_tokens: self.max_new_tokens,
            pad_token_id: self.pad_token_id,
            max_prompt_chars: self.max_prompt_chars,
            headless: !self.headed,
            ..config
        }
        .with_data_dir(&self.data_dir)
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level: tracing::Level = level.parse().context("invalid log level")?;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = args.apply(Config::from_env()?);

    // UI first, so the user sees something while Chrome starts.
    let (mut cmd_rx, events) = face::start_server(config.screenshot_path()).await?;

    let launch_config = config.clone();
    let browser = tokio::task::spawn_blocking(move || ChromeBrowser::launch(&launch_config))
        .await
        .map_err(|e| anyhow!("browser launch panicked: {e}"))??;

    let scorer = RetrievalClient::new(&config.retrieval_url, config.api_token.clone());
    let generator = GenerationClient::new(&config.generation_url, config.api_token.clone())
        .with_limits(config.max_new_tokens, config.pad_token_id);
    let session = Session::init(config, browser)?;
    let mut agent = Agent::new(session, scorer, generator);

    info!("waiting for instructions");
    let _ = events.send(AgentEvent::Ready);

    while let Some(message) = cmd_rx.recv().await {
        if !run_turn(&mut agent, &message, &events).await? {
            break;
        }
    }

    info!("agent stopped");
    Ok(())
}

/// Handles one chat message. Returns `false` once the session is over.
async fn run_turn<B, S, G>(
    agent: &mut Agent<B, S, G>,
    message: &str,
    events: &broadcast::Sender<AgentEvent>,
) -> Result<bool>
where
    B: Browser,
    S: SimilarityScorer,
    G: ActionGenerator,
{
    let input = TurnInput::from_chat(message);
    let _ = events.send(AgentEvent::User {
        text: message.trim().to_string(),
    });
    if input != TurnInput::Quit {
        let _ = events.send(AgentEvent::Thinking);
    }

    match agent.handle(input).await {
        Ok(TurnOutcome::Acted { outcome, .. }) => {
            let _ = events.send(AgentEvent::Assistant {
                text: outcome.message,
            });
            if let Some(page) = outcome.snapshot {
                let _ = events.send(AgentEvent::Screenshot { page });
            }
            let _ = events.send(AgentEvent::Ready);
            Ok(true)
        }
        Ok(TurnOutcome::Closed) | Err(HarnessError::SessionClosed) => {
            let _ = events.send(AgentEvent::Closed);
            Ok(false)
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, "stopping on fatal error");
            let _ = events.send(AgentEvent::TurnError {
                message: e.to_string(),
            });
            Err(e.into())
        }
        Err(e) => {
            warn!(error = %e, "turn failed");
            let _ = events.send(AgentEvent::TurnError {
                message: e.to_string(),
            });
            let _ = events.send(AgentEvent::Ready);
            Ok(true)
        }
    }
}
