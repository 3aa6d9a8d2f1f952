use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use gator::commands::{self, Command, State};
use gator::config::{Config, DEFAULT_CONFIG_PATH};
use gator::db::Database;
use gator::logger::{self, LogConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow RSS and Atom feeds from the terminal", long_about = None)]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Console log level (off, error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    logger::init(LogConfig::from_settings(&config.log, args.log_level.as_deref()))?;

    let db = Database::connect(&config.db_url)
        .await
        .with_context(|| format!("failed to open database {}", config.db_url))?;

    let mut state = State::new(db, config, args.config);
    let mut stdout = io::stdout();

    commands::run(&mut state, args.command, &mut stdout).await
}
