use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use jobq_core::{Clock, JobOptions, JobStatus, JobqConfig, SystemClock};
use jobq_events::{EventEnvelope, EventHandler};
use jobq_queue::{db, DeadLetterFilter, JobQueue, Page};
use jobq_scheduler::{NewSchedule, Scheduler};
use serde::Serialize;
use tracing::{debug, info, warn};

mod builtin;

#[derive(Parser)]
#[command(name = "jobq", version, about = "Priority job queue with retries, dead letters and cron schedules")]
struct Cli {
    /// Config file. Falls back to $JOBQ_CONFIG, then ~/.jobq/jobq.toml.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run dispatchers, the stall reaper, metrics and the scheduler until Ctrl-C.
    Run {
        /// Keep everything in memory instead of the configured database file.
        #[arg(long)]
        in_memory: bool,
    },
    /// Job counts per queue.
    Status,
    /// Submit one job.
    Enqueue {
        queue: String,
        name: String,
        #[arg(default_value = "{}")]
        payload: String,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        attempts: Option<u32>,
        #[arg(long)]
        job_id: Option<String>,
    },
    /// List jobs of a queue in one state.
    Jobs {
        queue: String,
        state: JobStatus,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run a delayed job now, or give a failed job one more attempt.
    Retry { queue: String, id: String },
    /// Cancel a waiting or delayed job.
    Cancel { queue: String, id: String },
    /// Delete completed or failed jobs older than the grace period.
    Clean {
        queue: String,
        state: JobStatus,
        #[arg(long, default_value_t = 3600)]
        grace_secs: u64,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },
    /// Inspect and act on exhausted jobs.
    #[command(subcommand)]
    DeadLetters(DeadLetterCommand),
    /// Manage recurring definitions.
    #[command(subcommand)]
    Schedules(ScheduleCommand),
}

#[derive(Subcommand)]
enum DeadLetterCommand {
    List {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        job_name: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Enqueue a fresh copy of the captured job.
    Replay { id: String },
    Purge { id: String },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    List,
    Add {
        name: String,
        /// Five-field cron expression, e.g. "*/5 * * * *".
        cron: String,
        queue: String,
        job: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long, default_value = "null")]
        payload: String,
    },
    Remove { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobq=info,jobq_queue=info,jobq_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > JOBQ_CONFIG env > ~/.jobq/jobq.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("JOBQ_CONFIG").ok());
    let config = JobqConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        JobqConfig::default()
    });

    match cli.command {
        Command::Run { in_memory } => run(config, in_memory).await,
        command => {
            let (jq, conn) = open(&config, false)?;
            admin(&jq, conn, command)
        }
    }
}

fn open(config: &JobqConfig, in_memory: bool) -> anyhow::Result<(JobQueue, db::SharedConn)> {
    let conn = if in_memory {
        db::open_in_memory()?
    } else {
        let path = &config.database.path;
        ensure_parent_dir(path)?;
        info!(path = %path, "opening SQLite database");
        db::open(path).with_context(|| format!("opening {path}"))?
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jq = JobQueue::with_connection(conn.clone(), config, clock)?;
    Ok((jq, conn))
}

async fn run(config: JobqConfig, in_memory: bool) -> anyhow::Result<()> {
    let (jq, conn) = open(&config, in_memory)?;
    builtin::register(&jq);
    jq.bus().subscribe("log", Arc::new(EventLog));

    debug!(processors = ?jq.processors().names(), "processors registered");
    let missing = jq.processors().missing(config.scheduler.schedules.iter().map(|s| s.job.as_str()));
    if !missing.is_empty() {
        warn!(?missing, "scheduled jobs have no processor and will be dead-lettered");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = jq.start(&shutdown_rx);

    if config.scheduler.enabled {
        let scheduler = Arc::new(Scheduler::new(conn, Arc::clone(jq.registry()))?);
        for entry in &config.scheduler.schedules {
            match scheduler.ensure(NewSchedule::from(entry)) {
                Ok(def) => info!(name = %def.name, cron = %def.cron, next_run = ?def.next_run_at, "schedule ready"),
                Err(e) => warn!(name = %entry.name, "schedule rejected: {e}"),
            }
        }
        handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));
    }

    info!("jobq running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining in-flight jobs");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("background task ended abnormally: {e}");
        }
    }
    info!("jobq stopped");
    Ok(())
}

fn admin(jq: &JobQueue, conn: db::SharedConn, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run { .. } => anyhow::bail!("`run` is not an admin command"),
        Command::Status => print(&jq.all_queue_status()?),
        Command::Enqueue { queue, name, payload, priority, delay_ms, attempts, job_id } => {
            let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let opts = JobOptions { priority, delay_ms, attempts, job_id, ..JobOptions::default() };
            print(&jq.enqueue(&queue, &name, payload, opts)?)
        }
        Command::Jobs { queue, state, offset, limit } => {
            print(&jq.list_jobs(&queue, state, Page::new(offset, limit))?)
        }
        Command::Retry { queue, id } => print(&jq.retry_job(&queue, &id)?),
        Command::Cancel { queue, id } => {
            jq.cancel(&queue, &id)?;
            println!("cancelled {id}");
            Ok(())
        }
        Command::Clean { queue, state, grace_secs, limit } => {
            let n = jq.clean(&queue, state, Duration::from_secs(grace_secs), limit)?;
            println!("removed {n} {state} jobs from {queue}");
            Ok(())
        }
        Command::DeadLetters(cmd) => match cmd {
            DeadLetterCommand::List { queue, job_name, offset, limit } => {
                let filter = DeadLetterFilter { queue, job_name };
                print(&jq.list_dead_letters(&filter, Page::new(offset, limit))?)
            }
            DeadLetterCommand::Replay { id } => print(&jq.replay_dead_letter(&id)?),
            DeadLetterCommand::Purge { id } => {
                jq.purge_dead_letter(&id)?;
                println!("purged {id}");
                Ok(())
            }
        },
        Command::Schedules(cmd) => {
            let scheduler = Scheduler::new(conn, Arc::clone(jq.registry()))?;
            match cmd {
                ScheduleCommand::List => print(&scheduler.list()?),
                ScheduleCommand::Add { name, cron, queue, job, timezone, payload } => {
                    let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
                    let new = NewSchedule::new(name, cron, queue, job)
                        .with_timezone(timezone)
                        .with_payload(payload);
                    print(&scheduler.register(new)?)
                }
                ScheduleCommand::Remove { id } => {
                    scheduler.remove(&id)?;
                    println!("removed {id}");
                    Ok(())
                }
            }
        }
    }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_parent_dir(path: &str) -> anyhow::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display())),
        _ => Ok(()),
    }
}

/// Mirrors every bus event into the trace log.
struct EventLog;

impl EventHandler for EventLog {
    fn handle(&self, env: &EventEnvelope) {
        debug!(seq = env.seq, event = env.event.name(), queue = env.event.queue(), "event");
    }
}
