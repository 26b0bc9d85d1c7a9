//! Command line interface: run the worker, submit jobs, inspect and manage queues.

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::info;

use courier_infra::jobs::{HistoryFilter, HistoryStatus, Pagination};

use crate::app::App;
use crate::config::WorkerConfig;

#[derive(Parser, Debug)]
#[command(name = "courier-worker")]
#[command(about = "Durable background job worker: queues, retries and job history")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process jobs from every queue until Ctrl-C.
    Run,

    /// Validate and enqueue a job.
    Submit(SubmitArgs),

    /// Queue counts, for one queue or all of them.
    Stats(QueueFilterArgs),

    /// List job history records, newest first.
    History(HistoryArgs),

    /// History record counts per status.
    HistoryStats(QueueFilterArgs),

    /// Stop handing out jobs from a queue.
    Pause(QueueArgs),

    /// Resume a paused queue.
    Resume(QueueArgs),

    /// Remove waiting and delayed jobs from a queue.
    Clear(QueueArgs),

    /// Remove completed jobs from a queue.
    ClearCompleted(QueueArgs),

    /// Remove failed jobs from a queue.
    ClearFailed(QueueArgs),

    /// Remove waiting and delayed jobs from every queue.
    ClearAll,
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[arg(long, env = "COURIER_QUEUE")]
    pub queue: String,
}

#[derive(Args, Debug)]
pub struct QueueFilterArgs {
    #[arg(long)]
    pub queue: Option<String>,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    pub queue: String,

    #[arg(long)]
    pub job_type: String,

    /// Payload as a JSON object.
    #[arg(long, value_parser = parse_json)]
    pub payload: JsonValue,

    /// Visibility delay in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long)]
    pub queue: Option<String>,

    #[arg(long)]
    pub job_type: Option<String>,

    /// PENDING, ACTIVE, COMPLETED, FAILED, DELAYED or STALLED.
    #[arg(long)]
    pub status: Option<HistoryStatus>,

    #[arg(long, default_value_t = 50)]
    pub limit: u32,

    #[arg(long, default_value_t = 0)]
    pub offset: u32,
}

fn parse_json(raw: &str) -> Result<JsonValue, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("invalid configuration")?;
    let app = App::connect(config).await?;

    match cli.command {
        Command::Run => {
            let registry = app.registry()?;
            info!(queues = ?app.catalog.queues(), "worker starting");
            app.run(registry, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
            })
            .await?;
        }
        Command::Submit(args) => {
            let delay = (args.delay_ms > 0).then(|| Duration::from_millis(args.delay_ms));
            let job_id = app
                .producer()
                .submit(&args.queue, &args.job_type, args.payload, delay)
                .await?;
            print_json(&serde_json::json!({ "jobId": job_id }))?;
        }
        Command::Stats(args) => {
            let admin = app.admin();
            match args.queue {
                Some(queue) => print_json(&admin.stats(&queue).await?)?,
                None => print_json(&admin.stats_summary().await?)?,
            }
        }
        Command::History(args) => {
            let filter = HistoryFilter {
                queue_name: args.queue,
                job_type: args.job_type,
                status: args.status,
            };
            let page = app
                .history
                .query(filter, Pagination::new(Some(args.limit), Some(args.offset)))
                .await?;
            print_json(&page)?;
        }
        Command::HistoryStats(args) => {
            let stats = app.history.stats(args.queue.as_deref()).await?;
            print_json(&stats)?;
        }
        Command::Pause(args) => {
            app.admin().pause(&args.queue).await?;
            println!("queue {} paused", args.queue);
        }
        Command::Resume(args) => {
            app.admin().resume(&args.queue).await?;
            println!("queue {} resumed", args.queue);
        }
        Command::Clear(args) => {
            let removed = app.admin().clear(&args.queue).await?;
            println!("removed {removed} job(s) from {}", args.queue);
        }
        Command::ClearCompleted(args) => {
            let removed = app.admin().clear_completed(&args.queue).await?;
            println!("removed {removed} completed job(s) from {}", args.queue);
        }
        Command::ClearFailed(args) => {
            let removed = app.admin().clear_failed(&args.queue).await?;
            println!("removed {removed} failed job(s) from {}", args.queue);
        }
        Command::ClearAll => {
            print_json(&app.admin().clear_all().await?)?;
        }
    }

    Ok(())
}
