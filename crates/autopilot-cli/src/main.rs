//! # autopilot-cli
//!
//! Binary entry point for the autopilot supervisor.
//!
//! Subcommands:
//! - `autopilot run`: the supervisor loop (global lock, tick, shutdown)
//! - `autopilot classify <window>`: one-shot classification; exit code
//!   0=working, 1=idle/permission, 2=shell, 3=absent
//! - `autopilot consume-reviews`: one consumer pass over review triggers
//! - `autopilot status`: per-window snapshot table

use anyhow::{Context, Result};
use autopilot_core::{
    AutopilotConfig, Classifier, Injector, NoopNotifier, Notifier, PatternSet, ReviewConsumer,
    StatePaths, Supervisor, Tmux, WindowSnapshot,
};
use autopilot_telegram::TelegramNotifier;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "autopilot", about = "Multi-project autopilot supervisor", version)]
struct Cli {
    /// State base directory (default: $AUTOPILOT_DIR or ~/.autopilot).
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor loop.
    Run,
    /// Classify one window and print the observation as JSON.
    Classify { window: String },
    /// Run one review-consumer pass over pending triggers.
    ConsumeReviews,
    /// Print the per-window snapshot table.
    Status,
}

fn init_logging(paths: &StatePaths, to_stderr: bool) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    paths.ensure_layout()?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())
        .context("opening log file")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file = Arc::new(file);
    if to_stderr {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(fmt::layer().with_target(false).with_ansi(false).with_writer(file))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_ansi(false).with_writer(file))
            .init();
    }
    Ok(())
}

fn build_notifier(cfg: &AutopilotConfig) -> Arc<dyn Notifier> {
    match &cfg.telegram {
        Some(tg) => Arc::new(TelegramNotifier::from_config(tg)),
        None => Arc::new(NoopNotifier),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let base = cli.base.unwrap_or_else(StatePaths::default_base);
    let cfg = AutopilotConfig::load(&base).context("loading configuration")?;
    let paths = StatePaths::new(&cfg.base_dir);

    match cli.command {
        Command::Run => {
            init_logging(&paths, true)?;
            let notifier = build_notifier(&cfg);
            let mut supervisor = Supervisor::new(cfg, notifier);
            if let Err(e) = supervisor.run().await {
                tracing::error!(error = %e, "fatal");
                eprintln!("autopilot: {e}");
                std::process::exit(1);
            }
            Ok(())
        }

        Command::Classify { window } => {
            // Quiet logging: the JSON line on stdout is the contract.
            init_logging(&paths, false)?;
            let pats = PatternSet::with_overrides(&cfg.patterns);
            let tmux = Tmux::new(&cfg.tmux.bin, &cfg.tmux.session);
            let classifier = Classifier::new(tmux, pats, cfg.low_context_threshold);
            let obs = classifier.observe(&window).await;
            println!("{}", serde_json::to_string(&obs)?);
            std::process::exit(obs.status.exit_code());
        }

        Command::ConsumeReviews => {
            init_logging(&paths, true)?;
            let pats = PatternSet::with_overrides(&cfg.patterns);
            let tmux = Tmux::new(&cfg.tmux.bin, &cfg.tmux.session);
            let classifier = Classifier::new(tmux.clone(), pats.clone(), cfg.low_context_threshold);
            let injector = Injector::new(tmux, pats, paths.clone());
            let notifier = build_notifier(&cfg);
            let consumer = ReviewConsumer {
                paths: &paths,
                cfg: &cfg.review,
                classifier: &classifier,
                injector: &injector,
                notifier: &*notifier,
            };
            let consumed = consumer.run_once().await.context("consumer pass")?;
            tracing::info!(consumed, "consumer pass done");
            Ok(())
        }

        Command::Status => {
            println!(
                "{:<16} {:<22} {:>8} {:>9} {:>11}  {}",
                "WINDOW", "STATUS", "CONTEXT", "HEAD", "COMMITS/30M", "LAST COMMIT"
            );
            for project in &cfg.projects {
                let snap = WindowSnapshot::load(&paths.snapshot(&project.window));
                let context = if snap.context_num < 0 {
                    "?".to_string()
                } else {
                    format!("{}%", snap.context_num)
                };
                println!(
                    "{:<16} {:<22} {:>8} {:>9} {:>11}  {}",
                    project.window, snap.status, context, snap.head, snap.commits_30m, snap.commit_msg
                );
            }
            Ok(())
        }
    }
}
