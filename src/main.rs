use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tab_scrobbler::bridge::{self, InboundMessage, JsonLinesListener, JsonLinesWriter};
use tab_scrobbler::{BindingRegistry, Config, Tracker};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "tab-scrobbler", version, about = "Scrobble what your browser tabs are playing")]
struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read tab messages as JSON lines from stdin and write lifecycle events to stdout (default)
    Run,
    /// Validate the config file and list the configured services
    CheckConfig,
    /// Print the default configuration
    PrintDefaultConfig,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the event stream
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(load_config(cli.config.as_ref())?).await,
        Command::CheckConfig => {
            let config = load_config(cli.config.as_ref())?;
            let bindings = BindingRegistry::from_config(&config)?;
            for binding in bindings.bindings() {
                println!(
                    "{}: enabled={} authenticated={}",
                    binding.service_id, binding.enabled, binding.authenticated
                );
            }
            println!("Config OK");
            Ok(())
        }
        Command::PrintDefaultConfig => {
            let content = toml::to_string_pretty(&Config::default())
                .context("Failed to serialize config")?;
            print!("{}", content);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let bindings = Arc::new(BindingRegistry::from_config(&config)?);
    // Events and replies share one writer so lines never interleave
    let (writer, writer_task) = JsonLinesWriter::spawn(tokio::io::stdout());
    let listener = JsonLinesListener::new(writer.clone());
    let (tracker, handle) = Tracker::from_config(&config, bindings, vec![Box::new(listener)]);
    let tracker_task = tracker.spawn();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match InboundMessage::parse(line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("{:#}", e);
                continue;
            }
        };

        if let Some(reply) = bridge::apply(&handle, message).await? {
            writer.send(&reply);
        }
    }

    log::info!("Input closed, shutting down");
    drop(handle);
    tracker_task.await.context("Tracker task failed")?;
    drop(writer);
    writer_task.await.context("Output writer failed")?;
    Ok(())
}
