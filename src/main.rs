mod config;
mod error;
mod loader;
mod models;
mod normalize;
mod notify;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::loader::load_rows;
use crate::notify::{LogNotifier, Notifier, TelegramNotifier};
use crate::pipeline::Pipeline;
use crate::scraper::FarsideScraper;

#[derive(Parser)]
#[command(name = "etf-flows", about = "ETF flow table normalizer and store", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape the flow table, upsert the latest days and send alerts (cron mode)
    Update {
        /// Label shown in alerts
        #[arg(long, default_value = "invoked")]
        trigger: String,
    },

    /// Load a historical dump (JSON or CSV) and upsert every day
    Seed {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Print the most recent stored days
    Days {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without loading data
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "etf_flows=info,warn",
        1 => "etf_flows=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;
    let pipeline = Pipeline::new(config.clone())?;

    match cli.command {
        Command::Update { trigger } => {
            let _t = utils::Timer::start("Flow update");
            let source = FarsideScraper::new(&config.scraper, &pipeline.market().page_url)?;
            let notifier: Box<dyn Notifier> = match (&config.notify.bot_token, &config.notify.channel_id) {
                (Some(token), Some(chat)) if config.notify.enabled => Box::new(TelegramNotifier::new(token, chat)?),
                _ => Box::new(LogNotifier),
            };
            let stats = pipeline.run(&source, notifier.as_ref(), &trigger).await?;
            info!(
                "Done: {} rows, {} days ({} new, {} skipped), {} rejected, {} alerts",
                stats.rows, stats.days_processed, stats.days_created, stats.skipped, stats.rejected, stats.alerts_sent
            );
        }

        Command::Seed { file } => {
            let _t = utils::Timer::start("Seed");
            let rows = load_rows(&file)?;
            let stats = pipeline.seed(&rows)?;
            info!(
                "Done: {} days upserted ({} new), {} rows rejected, {} unreadable cells",
                stats.days_processed, stats.days_created, stats.rejected, stats.cell_failures
            );
        }

        Command::Days { limit } => {
            let repo = pipeline.open_repository()?;
            let days = repo.recent_days(limit)?;
            if days.is_empty() {
                println!("No days stored — run `etf-flows update` or `etf-flows seed` first.");
            } else {
                for d in &days {
                    let flows: Vec<String> = d
                        .flows
                        .iter()
                        .filter(|(_, v)| *v != 0.0)
                        .map(|(t, v)| format!("{}={}", t, utils::fmt_flow(Some(*v))))
                        .collect();
                    println!("  {:<18} total {:>8}  {}", d.id, utils::fmt_flow(Some(d.total)), flows.join(" "));
                }
            }
        }

        Command::Stats => {
            let repo = pipeline.open_repository()?;
            let days = repo.day_count()?;
            let (min, max) = repo.date_range().unwrap_or((None, None));
            let last = repo.last_run_status()?;
            println!("─────────────────────────────────");
            println!("  ETF flows — {}", pipeline.market().table);
            println!("─────────────────────────────────");
            println!("  Tickers  : {}", pipeline.market().tickers.len());
            println!("  Days     : {}", utils::fmt_number(days));
            println!("  From     : {}", min.map(|d| d.to_string()).unwrap_or("—".into()));
            println!("  To       : {}", max.map(|d| d.to_string()).unwrap_or("—".into()));
            println!(
                "  Last run : {}",
                last.map(|(at, status)| format!("{} ({})", at, status)).unwrap_or("—".into())
            );
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            storage::Repository::open(&config.storage.db_path, pipeline.market())?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
