use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lbw_core::Outcome;
use lbw_cycle::{CycleConfig, CycleReport};
use lbw_storage::WineDatabase;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lbw-cli")]
#[command(about = "Last Bottle Watch: score the daily wine deal for every profile and send alerts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a single cycle
    Run,
    /// Create the database and apply migrations
    Migrate,
    /// Run cycles on the configured cron schedule until Ctrl-C
    Schedule {
        /// Also run one cycle immediately
        #[arg(long)]
        now: bool,
    },
    /// Recently seen listings with their average score
    History {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Score history for one user
    Scores {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        json: bool,
    },
    /// Validate every profile file
    Profiles {
        /// Defaults to LBW_PROFILES_DIR
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = CycleConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let report = lbw_cycle::run_cycle_once_from_env().await?;
            print_report(&report);
        }
        Commands::Migrate => {
            let db = WineDatabase::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?;
            db.close().await;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Schedule { now } => {
            let pipeline = Arc::new(lbw_cycle::pipeline_from_config(&config).await?);
            if now {
                if let Some(Ok(report)) = pipeline.run_exclusive().await {
                    print_report(&report);
                }
            }
            let mut sched =
                lbw_cycle::build_scheduler(Arc::clone(&pipeline), &config.scheduler_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scheduler_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.store().close().await;
        }
        Commands::History { limit, json } => {
            let db = WineDatabase::connect(&config.database_url).await?;
            let rows = db.recent_listings(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no listings recorded yet");
            } else {
                for row in &rows {
                    let avg = row
                        .average_score
                        .map(|s| format!("{s:.1}"))
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  #{:<5} ${:>8.2}  avg {:>5} ({} scored)  {}",
                        row.listing.first_seen_at.format("%Y-%m-%d %H:%M"),
                        row.listing.id.0,
                        row.listing.listing.price,
                        avg,
                        row.evaluations,
                        row.listing.listing.wine_name
                    );
                }
            }
            db.close().await;
        }
        Commands::Scores { user, limit, json } => {
            let db = WineDatabase::connect(&config.database_url).await?;
            let rows = db.scores_for_user(&user, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no scores for {user}");
            } else {
                for row in &rows {
                    let score = row
                        .record
                        .score
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  {:<16}  score {:>3}  ${:>8.2}  {}",
                        row.record.created_at.format("%Y-%m-%d %H:%M"),
                        row.record.outcome.as_str(),
                        score,
                        row.price,
                        row.wine_name
                    );
                }
            }
            db.close().await;
        }
        Commands::Profiles { dir } => {
            let dir = dir.unwrap_or(config.profiles_dir);
            let loaded = lbw_cycle::load_profiles_from_dir(&dir).await?;
            for p in &loaded.profiles {
                println!(
                    "ok    {:<12} threshold {:>3}  {}  types [{}]  overrides {}  -> {}",
                    p.user_id,
                    p.notify_threshold,
                    p.price_range,
                    p.types.join(", "),
                    p.type_price_ranges.len(),
                    p.contact.email
                );
            }
            for r in &loaded.rejected {
                eprintln!("error {}: {}", r.path.display(), r.error);
            }
            if !loaded.rejected.is_empty() {
                bail!("{} invalid profile file(s) in {}", loaded.rejected.len(), dir.display());
            }
        }
    }

    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "cycle complete: run_id={} wine=\"{}\" price=${:.2} new={} notified={} suppressed={} failures={}",
        report.run_id,
        report.listing.wine_name,
        report.listing.price,
        report.new_listing,
        report.count(Outcome::Notified),
        report.count(Outcome::Suppressed),
        report.failures.len()
    );
    if let Some(dir) = &report.reports_dir {
        println!("reports: {dir}");
    }
}
