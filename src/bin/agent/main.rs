use std::path::PathBuf;
use std::sync::Arc;

use agentic_rpa::face::{self, AppState};
use agentic_rpa::types::{Profile, default_goals, default_profile};
use agentic_rpa::{AgentConfig, OpenAiOracle, PolicyOracle, run_session};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agent", about = "Drive a browser through a list of goals")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (POST /api/test).
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Run one session and print the report as JSON.
    Run {
        #[arg(long)]
        url: String,
        /// Repeat for each goal, in order. Defaults to the demo-booking goals.
        #[arg(long = "goal")]
        goals: Vec<String>,
        /// JSON object with the profile used to fill forms.
        #[arg(long)]
        profile: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args)]
struct Overrides {
    /// Decision cycles per goal.
    #[arg(long)]
    budget: Option<usize>,
    #[arg(long)]
    headless: bool,
}

impl Overrides {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(budget) = self.budget.filter(|b| *b > 0) {
            config.action_budget = budget;
        }
        if self.headless {
            config.browser.headless = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("agentic_rpa=info,agent=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::from_env()?;

    match cli.command {
        Command::Serve { port, overrides } => {
            overrides.apply(&mut config);
            if let Some(port) = port {
                config.port = port;
            }
            let oracle: Arc<dyn PolicyOracle> = Arc::new(OpenAiOracle::new(&config.oracle)?);
            let port = config.port;
            info!("Starting agent server (budget {} per goal)", config.action_budget);
            face::serve(
                AppState {
                    config: Arc::new(config),
                    oracle,
                },
                port,
            )
            .await
        }
        Command::Run {
            url,
            goals,
            profile,
            overrides,
        } => {
            overrides.apply(&mut config);
            let oracle: Arc<dyn PolicyOracle> = Arc::new(OpenAiOracle::new(&config.oracle)?);
            let profile = match profile {
                Some(path) => load_profile(&path)?,
                None => default_profile(),
            };
            let goals = if goals.is_empty() { default_goals() } else { goals };

            let report = run_session(&config, oracle, &url, &profile, &goals).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn load_profile(path: &PathBuf) -> Result<Profile> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening profile {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    serde_json::from_reader(reader).with_context(|| format!("parsing profile {}", path.display()))
}
