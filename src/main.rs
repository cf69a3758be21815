use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use cdrd::backend::FileBackend;
use cdrd::config::Config;
use cdrd::engine::Engine;
use cdrd::events::EngineEvent;
use cdrd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "cdrd")]
#[command(author, version, about = "Call Detail Record engine daemon")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,

    /// Read events from this JSON-lines file instead of stdin
    #[arg(long, value_name = "FILE")]
    events: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting cdrd"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let file_backend = config.backends.file.clone();
    let engine = Engine::new(config);

    if let Some(file_backend) = file_backend {
        engine.register_backend(
            "file",
            "Flat-file CDR backend",
            Arc::new(FileBackend::new(file_backend.path, file_backend.format)),
        )?;
    }

    match args.events {
        Some(path) => {
            let file = tokio::fs::File::open(&path).await?;
            info!(events = %path.display(), "consuming event stream");
            consume_events(&engine, BufReader::new(file)).await?;
        }
        None => {
            info!("consuming event stream from stdin");
            consume_events(&engine, BufReader::new(tokio::io::stdin())).await?;
        }
    }

    engine.shutdown().await;
    info!("cdrd stopped");
    Ok(())
}

/// Feed JSON-lines events into the engine until EOF or interrupt.
async fn consume_events<R: AsyncBufRead + Unpin>(engine: &Engine, reader: R) -> Result<()> {
    let mut lines = reader.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<EngineEvent>(line) {
                        Ok(event) => engine.handle_event(event).await,
                        Err(error) => warn!(%error, "dropping malformed event line"),
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }
    Ok(())
}
