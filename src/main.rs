use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use price_refresh::api::create_router;
use price_refresh::app::Services;
use price_refresh::config::AppConfig;
use price_refresh::pipeline::{RefreshTask, RunOptions, RunOutcome};
use price_refresh::storage::Repository;
use price_refresh::universe::load_universe;
use price_refresh::utils;

#[derive(Parser)]
#[command(name = "price-refresh", about = "Stock price refresh worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and HTTP API until Ctrl-C
    Serve,

    /// Refresh stale tickers once and exit
    RunOnce {
        /// Ignore market hours
        #[arg(long)]
        force: bool,
    },

    /// Apply schema migrations
    Migrate,

    /// Show database statistics
    Stats,

    /// List the ticker universe
    Universe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "price_refresh=info,warn",
        1 => "price_refresh=debug,tower_http=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Serve => {
            let addr = config.server.socket_addr()?;
            let services = Services::build(config)?;
            let scheduler = services.scheduler();
            let _startup = scheduler.start();

            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Could not bind {}", addr))?;
            info!("Listening on {}", addr);

            axum::serve(listener, create_router(services.api_state()))
                .with_graceful_shutdown(async {
                    tokio::signal::ctrl_c().await.ok();
                    info!("Shutdown requested");
                })
                .await
                .context("HTTP server failed")?;

            scheduler.shutdown();
        }

        Command::RunOnce { force } => {
            let services = Services::build(config)?;
            let outcome = services
                .processor
                .run_with(RunOptions { ignore_market_hours: force })
                .await;
            services.processor.close();
            match outcome {
                RunOutcome::Completed(stats) => info!(
                    "Done: {} stale of {}, {} refreshed ({} fallback, {} placeholders), {} batch errors",
                    stats.tickers_stale,
                    stats.tickers_total,
                    stats.refreshed,
                    stats.from_fallback,
                    stats.placeholders,
                    stats.store_errors
                ),
                RunOutcome::Aborted(reason) => anyhow::bail!("Refresh aborted: {}", reason),
                other => info!("Nothing done: {:?}", other),
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            let prices = repo.price_count()?;
            let placeholders = repo.placeholder_count()?;
            let last = repo.latest_run()?;
            println!("─────────────────────────────────");
            println!("  Price refresh: database stats");
            println!("─────────────────────────────────");
            println!("  Tickers      : {}", utils::fmt_count(prices));
            println!("  Placeholders : {}", utils::fmt_count(placeholders));
            match last {
                Some(run) => {
                    println!("  Last run     : #{} {} ({})", run.id, run.started_at, run.status);
                    println!("  Refreshed    : {}", utils::fmt_count(run.tickers_refreshed));
                    if let Some(err) = run.error_msg {
                        println!("  Error        : {}", err);
                    }
                }
                None => println!("  Last run     : never"),
            }
            println!("─────────────────────────────────");
        }

        Command::Universe => {
            let syms = load_universe(config.pipeline.universe_file.as_deref())?;
            println!("{} symbols:", syms.len());
            for s in &syms {
                println!("  {}", s);
            }
        }
    }

    Ok(())
}
