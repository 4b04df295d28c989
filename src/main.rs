//! # Media Jobs CLI - Main Entry Point
//!
//! Questo è il punto di ingresso del binario `media-jobs`.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Caricamento della configurazione e applicazione degli override CLI
//! - Esecuzione di un job tramite un motore locale con `ProcessRunner`
//!
//! ## Sottocomandi:
//! - `submit`: esegue un job, mostra l'avanzamento e copia gli output (Ctrl-C lo cancella)
//! - `check`: verifica la presenza di ffmpeg/ffprobe
//! - `sweep`: rimuove i workspace orfani
//!
//! ## Esempio di utilizzo:
//! ```bash
//! media-jobs submit screenshot movie.mp4 -p interval=30 -o ./shots --verbose
//! media-jobs submit merge a.mp4 b.mp4 c.mp4 -o ./merged
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use media_job_engine::platform::{is_command_available, ToolBinaries};
use media_job_engine::progress::{summarize, JobProgress};
use media_job_engine::workspace::WorkspaceManager;
use media_job_engine::{
    ChannelSink, DirectorySink, EngineConfig, JobState, MediaJobEngine, OperationKind, ProcessRunner, UserId,
};

#[derive(Parser)]
#[command(name = "media-jobs")]
#[command(about = "Run media processing jobs (thumbnails, trims, merges, splits, ...) through ffmpeg")]
struct Args {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one job and copy its outputs
    Submit {
        /// thumbnail, trim, merge, split, optimize, subtitle or screenshot
        kind: String,

        /// Input files, in order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Operation parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Directory receiving the outputs
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// User the job is submitted for
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Per-invocation timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Total attempts for timed-out invocations
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Check that ffmpeg and ffprobe are available
    Check,

    /// Remove orphaned workspaces
    Sweep {
        /// Minimum age in seconds (defaults to the configured grace period)
        #[arg(long)]
        grace: Option<u64>,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("media-jobs").join("config.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match args.config.or_else(default_config_path) {
        Some(path) => EngineConfig::from_file(&path).await?,
        None => EngineConfig::default(),
    };

    match args.command {
        Command::Submit {
            kind,
            inputs,
            params,
            output_dir,
            user,
            timeout,
            attempts,
        } => {
            let mut config = config;
            if let Some(timeout) = timeout {
                config.default_tool_timeout_secs = timeout;
            }
            if let Some(attempts) = attempts {
                config.max_attempts = attempts;
            }
            submit(config, kind, inputs, params.into_iter().collect(), output_dir, user).await
        }
        Command::Check => check(&config).await,
        Command::Sweep { grace } => {
            let grace = grace.map(Duration::from_secs).unwrap_or_else(|| config.orphan_grace());
            let removed = WorkspaceManager::from_config(&config).sweep_orphans(grace).await;
            println!("Removed {} orphaned workspace(s) from {}", removed, config.workspace_root.display());
            Ok(())
        }
    }
}

async fn submit(
    config: EngineConfig,
    kind: String,
    inputs: Vec<PathBuf>,
    params: BTreeMap<String, String>,
    output_dir: PathBuf,
    user: String,
) -> Result<()> {
    let kind: OperationKind = kind.parse()?;

    if !output_dir.exists() {
        tokio::fs::create_dir_all(&output_dir).await?;
        info!("Created output directory: {}", output_dir.display());
    }
    if !output_dir.is_dir() {
        return Err(anyhow::anyhow!("Output path is not a directory: {}", output_dir.display()));
    }

    let tools = ToolBinaries::from_config(&config);
    tools.check_dependencies().await?;

    let (channel, mut results) = ChannelSink::new();
    let sink = DirectorySink::new(&output_dir).forward_to(Arc::new(channel));
    let engine = MediaJobEngine::start(config, Arc::new(ProcessRunner::new()), Arc::new(sink)).await?;

    let job_id = match engine.submit_job(kind, inputs, params, UserId::new(user)).await {
        Ok(job_id) => job_id,
        Err(e) => {
            engine.shutdown().await;
            return Err(e.into());
        }
    };

    let progress = JobProgress::new(job_id);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut cancel_requested = false;

    let notice = loop {
        tokio::select! {
            notice = results.recv() => break notice,
            _ = ticker.tick() => {
                if let Some(status) = engine.query_status(job_id).await {
                    progress.update(&status);
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                warn!("Interrupted, cancelling job {}", job_id);
                cancel_requested = true;
                engine.cancel_job(job_id).await;
            }
        }
    };
    engine.shutdown().await;

    let notice = notice.ok_or_else(|| anyhow::anyhow!("engine stopped before job {} finished", job_id))?;
    progress.finish(&summarize(&notice));
    for output in &notice.outputs {
        println!("{}", output.display());
    }

    match notice.state {
        JobState::Succeeded => Ok(()),
        JobState::Cancelled => Err(anyhow::anyhow!("job {} was cancelled", job_id)),
        _ => Err(anyhow::anyhow!(
            "job {} failed: {}",
            job_id,
            notice.error.unwrap_or_default()
        )),
    }
}

async fn check(config: &EngineConfig) -> Result<()> {
    let tools = ToolBinaries::from_config(config);
    let mut missing = Vec::new();

    for tool in [&tools.ffmpeg, &tools.ffprobe] {
        if is_command_available(tool).await {
            println!("✅ {}", tool);
        } else {
            println!("❌ {} not found", tool);
            missing.push(tool.clone());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("missing tools: {}", missing.join(", ")))
    }
}
