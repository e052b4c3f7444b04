//! Display session server
//!
//! This binary keeps a compiler display server running and exposes it over
//! JSON lines on stdin/stdout, or runs one-shot probes and queries.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use display_session::{
    server, Capabilities, DisplayRequest, Platform, SessionManager, SettingsFile, StdioSpawner,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Settings file looked up in the working directory when `--config` is absent.
const DEFAULT_SETTINGS_FILE: &str = "display-session.json";

#[derive(Parser)]
#[command(
    name = "display-session",
    version,
    about = "Display session manager for compiler code-intelligence servers"
)]
struct Cli {
    /// JSON settings file (re-read on every start)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Working directory for the compiler server
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-lines requests on stdin/stdout (default)
    Serve,
    /// Start the toolchain, print its version and capabilities, stop
    Probe,
    /// Start the toolchain, run one display request, print the result
    Query(QueryArgs),
}

#[derive(Args)]
struct QueryArgs {
    /// File whose contents are passed to the compiler over stdin
    #[arg(long)]
    stdin_file: Option<PathBuf>,
    /// Print the result as JSON instead of the raw body
    #[arg(long)]
    json: bool,
    /// Compiler arguments, e.g. `-- --display Main.hx@120@type`
    #[arg(last = true, required = true)]
    arguments: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    // Initialize logging to stderr (stdout is used for the protocol)
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("display_session=info")),
        )
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async move {
        let manager = build_manager(&cli);
        match cli.command.unwrap_or(Command::Serve) {
            Command::Serve => run_server(manager).await,
            Command::Probe => run_probe(manager).await,
            Command::Query(args) => run_query(manager, args).await,
        }
    })
}

fn build_manager(cli: &Cli) -> Arc<SessionManager> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
    let mut spawner = StdioSpawner::new();
    if let Some(cwd) = &cli.cwd {
        spawner = spawner.with_working_directory(cwd.clone());
    }
    let platform = Platform::current();
    info!(settings = %path.display(), platform = %platform, "Using settings file");
    SessionManager::new(Arc::new(SettingsFile::new(path)), Arc::new(spawner), platform)
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

async fn run_server(manager: Arc<SessionManager>) -> anyhow::Result<()> {
    info!("Display session server listening on stdio");
    let shutdown = async {
        if wait_for_shutdown_signal().await.is_ok() {
            info!("Shutdown signal received");
        } else {
            info!("Shutdown signal handler failed; serving until input closes");
            std::future::pending::<()>().await;
        }
    };
    server::serve(manager, tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await
        .context("JSON-lines transport failed")?;
    info!("Server stopped");
    Ok(())
}

async fn run_probe(manager: Arc<SessionManager>) -> anyhow::Result<()> {
    let started = manager.start().await;
    manager.shutdown().await;
    let session = started.context("Display server failed to start")?;
    let capabilities = Capabilities::for_version(session.version);
    let report = json!({
        "session": session,
        "capabilities": capabilities,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_query(manager: Arc<SessionManager>, args: QueryArgs) -> anyhow::Result<()> {
    let mut request = DisplayRequest::new(args.arguments).with_label("query");
    if let Some(path) = &args.stdin_file {
        let contents = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        request = request.with_stdin(contents);
    }

    if let Err(e) = manager.start().await {
        manager.shutdown().await;
        return Err(e).context("Display server failed to start");
    }
    let result = manager.submit(request, CancellationToken::new()).await;
    manager.shutdown().await;

    let output = result.context("Display request failed")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for line in &output.prints {
            eprintln!("{line}");
        }
        print!("{}", output.text);
    }
    Ok(())
}
