//! Fleet Agent CLI
//!
//! A command-line tool for checking agent health, triggering update and
//! download cycles, and listing managed containers.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::{ApiError, CycleQuery};
use commands::{containers, cycle, status};
use output::OutputFormat;

/// Fleet Agent CLI
#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the Fleet Agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via FLEET_API_URL env var)
    #[arg(long, env = "FLEET_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Show agent health and readiness
    Status,

    /// Pull newer images and recreate stale containers
    Update {
        /// Only containers running these images (comma separated)
        #[arg(long, value_delimiter = ',')]
        images: Vec<String>,

        /// Only these containers (comma separated)
        #[arg(long, value_delimiter = ',')]
        names: Vec<String>,
    },

    /// Pull newer images without touching containers
    Download {
        /// Only these images (comma separated)
        #[arg(long, value_delimiter = ',')]
        images: Vec<String>,
    },

    /// List managed containers
    Containers,
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let format = cli
        .format
        .or_else(|| config.default_format.as_deref().and_then(OutputFormat::from_name))
        .unwrap_or_default();
    let client = client::ApiClient::new(&config.resolve_api_url(cli.api_url.as_deref()))?;

    match cli.command {
        Commands::Status => status::show_status(&client, format).await,
        Commands::Update { images, names } => {
            cycle::run_update(&client, CycleQuery { images, names }, format).await
        }
        Commands::Download { images } => {
            let query = CycleQuery {
                images,
                names: Vec::new(),
            };
            cycle::run_download(&client, query, format).await
        }
        Commands::Containers => containers::list_containers(&client, format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&e.to_string());
        let code = match e.downcast_ref::<ApiError>() {
            Some(ApiError::Busy) => 75, // EX_TEMPFAIL
            _ => 1,
        };
        std::process::exit(code);
    }
}
