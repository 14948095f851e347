//! campaign-dispatch CLI entry point.
//!
//! `start` runs the scheduler and dispatcher loops until interrupted. The
//! other subcommands are one-shot operator actions against the same database.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::info;

use campaign_dispatch::config::Config;
use campaign_dispatch::engine::Engine;
use campaign_dispatch::events::EventBus;
use campaign_dispatch::provider::HttpProvider;
use campaign_dispatch::quota::QuotaTracker;
use campaign_dispatch::store::{Account, NewCampaign, NewRecipient, Store};

/// Scheduled bulk-messaging dispatch engine.
#[derive(Parser)]
#[command(name = "campaign-dispatch", version, about)]
struct Cli {
    /// Config file (default: `$CAMPAIGN_DISPATCH_CONFIG` or
    /// `~/.campaign-dispatch/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and dispatcher loops until Ctrl-C.
    Start,
    /// Create or upgrade the database schema and exit.
    Migrate,
    /// Import accounts, campaigns, recipients and quota plans from JSON.
    Import {
        /// Path to the import document.
        file: PathBuf,
    },
    /// Schedule a run of a campaign on an account.
    Schedule {
        /// Campaign id.
        #[arg(long)]
        campaign: String,
        /// Sending account id.
        #[arg(long)]
        account: String,
        /// Start time (RFC 3339). Defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Idempotency key. Repeating a key returns the existing run.
        #[arg(long)]
        key: Option<String>,
    },
    /// Show a run and its queue counts as JSON.
    Status {
        /// Run id.
        run_id: String,
    },
    /// Reschedule a paused run for now.
    Resume {
        /// Run id.
        run_id: String,
    },
    /// Return a campaign's failed recipients to pending for a resumed or new run.
    ResetFailed {
        /// Campaign id.
        campaign_id: String,
    },
}

/// Input document for `import`.
#[derive(Deserialize)]
struct ImportDocument {
    #[serde(default)]
    accounts: Vec<Account>,
    #[serde(default)]
    campaigns: Vec<ImportCampaign>,
    #[serde(default)]
    quota_plans: Vec<ImportPlan>,
}

#[derive(Deserialize)]
struct ImportCampaign {
    #[serde(flatten)]
    campaign: NewCampaign,
    #[serde(default)]
    recipients: Vec<NewRecipient>,
}

#[derive(Deserialize)]
struct ImportPlan {
    org_id: String,
    #[serde(default)]
    account_id: Option<String>,
    daily_limit: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Command::Start => handle_start(&config).await,
        command => {
            campaign_dispatch::logging::init_cli();
            let store = open_store(&config).await?;
            let result = run_command(command, &config, &store).await;
            store.close().await;
            result
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Store> {
    let path = config.database_path()?;
    Store::open(&path, config.database.max_connections).await
}

/// Run the dispatch engine until interrupted.
async fn handle_start(config: &Config) -> anyhow::Result<()> {
    let logs_dir = config.logs_dir()?;
    let _logging_guard =
        campaign_dispatch::logging::init_production(&logs_dir, config.logging.directive())?;

    let store = open_store(config).await?;
    let provider = Arc::new(HttpProvider::new(&config.provider));
    let events = Arc::new(EventBus::new(config.events.channel_capacity));

    let engine = Engine::new(config, store.clone(), provider, events);
    let running = engine.start();
    info!(
        scheduler_interval_secs = config.scheduler.interval_secs,
        dispatcher_interval_secs = config.dispatcher.interval_secs,
        "campaign-dispatch running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    running.stop().await;
    store.close().await;
    Ok(())
}

async fn run_command(command: Command, config: &Config, store: &Store) -> anyhow::Result<()> {
    let now = Utc::now();
    match command {
        Command::Start => anyhow::bail!("start is handled separately"),
        Command::Migrate => {
            println!("schema up to date");
        }
        Command::Import { file } => handle_import(&file, config, store, now).await?,
        Command::Schedule {
            campaign,
            account,
            at,
            key,
        } => {
            let key = key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let (run, created) = store
                .schedule_run(&campaign, &account, at.unwrap_or(now), &key, now)
                .await
                .context("failed to schedule run")?;
            let verb = if created { "scheduled" } else { "existing" };
            println!("{verb} run {} at {}", run.id, run.scheduled_at.to_rfc3339());
        }
        Command::Status { run_id } => {
            let run = store.run(&run_id).await?;
            let summary = store.run_summary(&run_id).await?;
            let report = serde_json::json!({ "run": run, "queue": summary });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Resume { run_id } => {
            if store.resume_run(&run_id, now).await? {
                println!("run {run_id} rescheduled");
            } else {
                let run = store.run(&run_id).await?;
                anyhow::bail!("run {run_id} is {}, not paused", run.status.as_str());
            }
        }
        Command::ResetFailed { campaign_id } => {
            store.campaign(&campaign_id).await?;
            let count = store.reset_failed_recipients(&campaign_id).await?;
            println!("{count} recipients reset to pending");
        }
    }
    Ok(())
}

async fn handle_import(
    file: &Path,
    config: &Config,
    store: &Store,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let document: ImportDocument = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    for account in &document.accounts {
        store.upsert_account(account).await?;
        println!("account {}", account.id);
    }

    let quota = QuotaTracker::new(store.clone(), config.quota.default_daily_limit);
    for plan in &document.quota_plans {
        quota
            .set_plan_limit(&plan.org_id, plan.account_id.as_deref(), plan.daily_limit, now)
            .await?;
    }

    for entry in &document.campaigns {
        let campaign = store.create_campaign(&entry.campaign, now).await?;
        let recipients = store
            .add_recipients(&campaign.id, &entry.recipients, now)
            .await?;
        println!(
            "campaign {} ({}) with {} recipients",
            campaign.id,
            campaign.name,
            recipients.len()
        );
    }
    Ok(())
}
