//! relay - drive a language server from the command line.
//!
//! ```text
//! main() -> load config -> LspClient::start -> open files
//!                                  |
//!                                  v
//!          print events until the server goes quiet -> shutdown
//! ```
//!
//! Logs go to `~/.relay/logs/relay.log` so stdout carries only results.

mod config;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use config::{RelayConfig, find_root};
use relay_lsp::{
    LspClient, LspHandle, MessageKind, ProgressEvent, SemanticToken, SessionEvent,
};

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Run a language server over a set of files")]
struct Cli {
    /// Config file (default: ~/.relay/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server name from the config; picked by file extension when omitted.
    #[arg(long)]
    server: Option<String>,

    /// Workspace root; found via the server's root markers when omitted.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Print semantic tokens as they arrive.
    #[arg(long)]
    tokens: bool,

    /// Seconds without server activity before shutting down.
    #[arg(long, default_value_t = 3)]
    settle: u64,

    /// Files to open.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_relay_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: keep stdout for results rather than interleaving logs.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_relay_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in relay_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn relay_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(config_path) = config::config_path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("relay.log"));
    }

    candidates.push(PathBuf::from(".relay").join("logs").join("relay.log"));

    candidates
}

fn print_tokens(path: &Path, tokens: &[SemanticToken]) {
    println!("{}: {} semantic tokens", path.display(), tokens.len());
    for token in tokens {
        let kind = token
            .type_name
            .clone()
            .unwrap_or_else(|| token.token_type.to_string());
        if token.modifier_names.is_empty() {
            println!("  {}:{} +{} {kind}", token.line + 1, token.start + 1, token.length);
        } else {
            println!(
                "  {}:{} +{} {kind} [{}]",
                token.line + 1,
                token.start + 1,
                token.length,
                token.modifier_names.join(",")
            );
        }
    }
}

/// Handle one event. Returns `Some` once the session is over.
async fn report(event: SessionEvent, handle: &LspHandle, show_tokens: bool) -> Option<Option<String>> {
    match event {
        SessionEvent::Diagnostics { path, items } => {
            for item in items {
                println!("{}", item.display_with_path(&path));
            }
        }
        SessionEvent::DocumentUpdated { path, tokens } if show_tokens => print_tokens(&path, &tokens),
        SessionEvent::Progress(ProgressEvent::Begin { title, .. }) => eprintln!("[{title}]"),
        SessionEvent::Progress(ProgressEvent::Report {
            message, percentage, ..
        }) => {
            if let Some(pct) = percentage {
                eprintln!("  {pct}% {}", message.unwrap_or_default());
            }
        }
        SessionEvent::ShowMessage { kind, message } => {
            let label = match kind {
                MessageKind::Error => "error",
                MessageKind::Warning => "warning",
                MessageKind::Info => "info",
                MessageKind::Log => "log",
            };
            eprintln!("server {label}: {message}");
        }
        SessionEvent::InitializeRetryOffered { message } => {
            tracing::warn!(%message, "Server asked for initialize retry");
            if let Err(e) = handle.retry_initialize(true).await {
                tracing::warn!("Retry failed: {e}");
            }
        }
        SessionEvent::Finished { error } => return Some(error),
        SessionEvent::StateChanged(state) => tracing::debug!(?state, "Session state"),
        _ => {}
    }
    None
}

async fn run(cli: Cli) -> Result<()> {
    let config = match RelayConfig::load(cli.config.as_deref()) {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(path = %e.path().display(), "Config error: {e}");
            return Err(e.into());
        }
    };

    let files: Vec<PathBuf> = cli
        .files
        .iter()
        .map(|f| fs::canonicalize(f).with_context(|| format!("cannot open {}", f.display())))
        .collect::<Result<_>>()?;
    let Some(first) = files.first() else {
        bail!("no files given");
    };
    let Some((name, server)) = config.server_for(first, cli.server.as_deref()) else {
        bail!("no language server configured for {}", first.display());
    };
    let root = match &cli.root {
        Some(root) => fs::canonicalize(root).with_context(|| format!("bad root {}", root.display()))?,
        None => find_root(first, &server.root_markers),
    };
    tracing::info!(server = %name, root = %root.display(), files = files.len(), "Starting relay");

    let language_id = server.language_id.clone();
    let mut client = LspClient::start(server, &root);
    let handle = client.handle();

    for file in &files {
        let text = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        handle
            .open(file, &language_id, &text)
            .await
            .with_context(|| format!("opening {}", file.display()))?;
    }

    let settle = Duration::from_secs(cli.settle);
    let mut shutting_down = false;
    loop {
        let event = match tokio::time::timeout(settle, client.next_event()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) if shutting_down => bail!("server did not finish after shutdown"),
            Err(_) => {
                tracing::info!("Server quiet; shutting down");
                shutting_down = true;
                if let Err(e) = handle.shutdown().await {
                    tracing::warn!("Shutdown rejected: {e}");
                    break;
                }
                continue;
            }
        };
        if let Some(error) = report(event, &handle, cli.tokens).await {
            if let Some(error) = error {
                bail!("language server failed: {error}");
            }
            break;
        }
    }

    drop(handle);
    client.join().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    }
}
