//! Run a seeded workload against an embedded engine.
//!
//! The seed file (TOML, JSON or YAML, chosen by extension) declares
//! deployments, executions, event subscriptions, jobs and events. The engine
//! runs on the in-memory store with every configured acquisition until no job
//! is left to acquire or the time limit is reached.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tabled::Tabled;

use conductor_core::config::Config;
use conductor_core::delegate::DeploymentHandle;
use conductor_core::engine::ProcessEngine;
use conductor_core::events::{EventSubscription, EventType};
use conductor_core::execution::{ExecutionId, ExecutionNode, RecordingRuntime, ResumeTrigger};
use conductor_core::jobs::{AcquisitionStats, JobEntity, JobScheduler};
use conductor_core::persistence::InMemoryStore;

use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct RunArgs {
    /// Seed file with deployments, executions, subscriptions, jobs and events
    seed: PathBuf,

    /// Stop after this many seconds even if jobs are still pending
    #[arg(short, long, default_value_t = 30)]
    timeout: u64,

    /// Keep running until the timeout, even when idle
    #[arg(long)]
    no_idle_exit: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Seed File
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub deployments: Vec<SeedDeployment>,
    #[serde(default)]
    pub executions: Vec<SeedExecution>,
    #[serde(default)]
    pub subscriptions: Vec<SeedSubscription>,
    #[serde(default)]
    pub jobs: Vec<SeedJob>,
    #[serde(default)]
    pub events: Vec<SeedEvent>,
}

#[derive(Debug, Deserialize)]
pub struct SeedDeployment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedExecution {
    pub id: String,
    /// Parent execution; omitted for process instance roots
    pub parent: Option<String>,
    /// Execution that called this process instance
    pub called_by: Option<String>,
    pub activity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSubscription {
    pub event_type: EventType,
    pub event_name: String,
    pub execution: String,
    pub activity: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedJob {
    pub handler: String,
    pub execution: Option<String>,
    pub deployment: Option<String>,
    #[serde(default)]
    pub configuration: Value,
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: i64,
    /// Delay before the job becomes due
    #[serde(default)]
    pub delay_millis: u64,
    #[serde(default)]
    pub suspended: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedEvent {
    pub event_type: EventType,
    pub event_name: String,
    pub execution: String,
    pub payload: Option<Value>,
    /// Deliver through an event-delivery job instead of immediately
    #[serde(default, rename = "async")]
    pub asynchronous: bool,
}

/// Parse a seed file; the extension selects JSON, YAML or TOML.
pub fn load_seed(path: &Path) -> Result<Seed> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;

    let seed = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).context("Failed to parse JSON seed")?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content).context("Failed to parse YAML seed")?,
        _ => toml::from_str(&content).context("Failed to parse TOML seed")?,
    };
    Ok(seed)
}

/// Write the seed into `engine`; returns the number of jobs created.
pub async fn apply_seed(engine: &ProcessEngine, seed: &Seed) -> Result<usize> {
    let mut nodes: HashMap<&str, ExecutionNode> = HashMap::new();
    for execution in &seed.executions {
        let node = match (&execution.parent, &execution.called_by) {
            (Some(_), Some(_)) => bail!(
                "execution '{}' cannot have both a parent and a caller",
                execution.id
            ),
            (Some(parent), None) => {
                let parent = nodes.get(parent.as_str()).with_context(|| {
                    format!("execution '{}' references unknown parent '{}'", execution.id, parent)
                })?;
                ExecutionNode::child_of(execution.id.as_str(), parent)
            }
            (None, Some(caller)) => {
                let caller = nodes.get(caller.as_str()).with_context(|| {
                    format!("execution '{}' references unknown caller '{}'", execution.id, caller)
                })?;
                ExecutionNode::called_by(execution.id.as_str(), caller)
            }
            (None, None) => ExecutionNode::process_instance(execution.id.as_str()),
        };
        let node = match &execution.activity {
            Some(activity) => node.with_activity(activity.as_str()),
            None => node,
        };

        engine.create_execution(node.clone()).await?;
        nodes.insert(execution.id.as_str(), node);
    }

    for s in &seed.subscriptions {
        let mut subscription = EventSubscription::new(s.event_type, s.event_name.as_str(), s.execution.as_str());
        if let Some(node) = nodes.get(s.execution.as_str()) {
            subscription = subscription.with_process_instance(node.process_instance_id.clone());
        }
        if let Some(activity) = &s.activity {
            subscription = subscription.with_activity(activity.as_str());
        }
        engine.subscribe(subscription).await?;
    }

    let now = Utc::now();
    let mut created = 0;
    for j in &seed.jobs {
        let mut job = engine
            .new_job(j.handler.as_str())
            .with_configuration(j.configuration.clone())
            .with_priority(j.priority);
        if let Some(execution) = &j.execution {
            job = job.with_execution(execution.as_str());
            if let Some(node) = nodes.get(execution.as_str()) {
                job = job.with_process_instance(node.process_instance_id.clone());
            }
        }
        if let Some(deployment) = &j.deployment {
            job = job.with_deployment(deployment.as_str());
        }
        if let Some(retries) = j.retries {
            job = job.with_retries(retries);
        }
        if j.delay_millis > 0 {
            job = job.with_due_date(now + chrono::Duration::milliseconds(j.delay_millis as i64));
        }
        if j.suspended {
            job = job.suspended();
        }
        engine.create_job(job).await?;
        created += 1;
    }

    for e in &seed.events {
        let execution = ExecutionId::from(e.execution.as_str());
        if e.asynchronous {
            engine
                .deliver_event_async(e.event_type, &e.event_name, &execution, e.payload.clone())
                .await?;
            created += 1;
        } else {
            engine
                .deliver_event(e.event_type, &e.event_name, &execution, e.payload.clone())
                .await?;
        }
    }

    Ok(created)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Report
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Tabled, Serialize)]
struct JobRow {
    #[tabled(rename = "Job")]
    id: String,
    #[tabled(rename = "Handler")]
    handler: String,
    #[tabled(rename = "Execution")]
    execution: String,
    #[tabled(rename = "Retries")]
    retries: u32,
    #[tabled(rename = "Attempts")]
    failed_attempts: u32,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl JobRow {
    fn new(job: &JobEntity, now: DateTime<Utc>, full_error: bool) -> Self {
        let state = if job.suspended {
            "suspended"
        } else if job.is_failed() {
            "failed"
        } else if job.is_locked(now) {
            "locked"
        } else if job.due_date.map_or(false, |due| due > now) {
            "waiting"
        } else {
            "due"
        };
        let error = job.exception_message.clone().unwrap_or_default();

        Self {
            id: job.id.to_string(),
            handler: job.handler_type.clone(),
            execution: job
                .execution_id
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "-".to_string()),
            retries: job.retries,
            failed_attempts: job.failed_attempts,
            state: state.to_string(),
            error: if full_error { error } else { output::truncate(&error, 48) },
        }
    }
}

#[derive(Tabled, Serialize)]
struct ResumptionRow {
    #[tabled(rename = "Execution")]
    execution: String,
    #[tabled(rename = "Trigger")]
    trigger: String,
    #[tabled(rename = "Payload")]
    payload: String,
}

#[derive(Tabled, Serialize)]
struct AcquisitionRow {
    #[tabled(rename = "Acquisition")]
    name: String,
    #[tabled(rename = "Cycles")]
    cycles: u64,
    #[tabled(rename = "Acquired")]
    acquired: u64,
    #[tabled(rename = "Executed")]
    executed: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Conflicts")]
    lock_conflicts: u64,
    #[tabled(rename = "Rejected")]
    rejected: u64,
}

impl From<AcquisitionStats> for AcquisitionRow {
    fn from(s: AcquisitionStats) -> Self {
        Self {
            name: s.name,
            cycles: s.cycles,
            acquired: s.acquired,
            executed: s.executed,
            failed: s.failed,
            lock_conflicts: s.lock_conflicts,
            rejected: s.rejected,
        }
    }
}

#[derive(Serialize)]
struct RunReport {
    engine: String,
    elapsed_ms: u64,
    timed_out: bool,
    jobs_created: usize,
    jobs_remaining: usize,
    jobs_failed: usize,
    peak_workers: usize,
    rejected_permits: u64,
    jobs: Vec<JobRow>,
    resumptions: Vec<ResumptionRow>,
    acquisitions: Vec<AcquisitionRow>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether no remaining job can still run before `deadline`.
fn is_idle(jobs: &[JobEntity], now: DateTime<Utc>, deadline: DateTime<Utc>) -> bool {
    jobs.iter().all(|job| {
        job.suspended
            || job.is_failed()
            || (!job.is_locked(now) && job.due_date.map_or(false, |due| due > deadline))
    })
}

pub async fn execute(args: RunArgs, config: Config, format: OutputFormat) -> Result<()> {
    let seed = load_seed(&args.seed)?;

    let store = Arc::new(InMemoryStore::new());
    let runtime = Arc::new(RecordingRuntime::new());
    let mut builder = ProcessEngine::from_config(config.engine.clone())
        .with_store(store)
        .with_runtime(runtime.clone());
    for d in &seed.deployments {
        let mut handle = DeploymentHandle::new(d.id.as_str(), d.name.as_str());
        for (key, value) in &d.properties {
            handle = handle.with_property(key.as_str(), value.as_str());
        }
        builder = builder.with_deployment(handle);
    }
    let engine = builder.build()?;

    let jobs_created = apply_seed(&engine, &seed)
        .await
        .with_context(|| format!("Failed to apply seed {}", args.seed.display()))?;

    if format == OutputFormat::Table {
        output::print_info(&format!(
            "Seeded {} job{} into engine '{}', running for at most {}s",
            jobs_created,
            if jobs_created == 1 { "" } else { "s" },
            engine.name(),
            args.timeout
        ));
    }

    let scheduler = JobScheduler::new(config.scheduler.clone());
    let acquisitions = scheduler.acquisition_names();
    for name in &acquisitions {
        scheduler.register_engine(name, engine.clone()).await?;
    }

    let started = Instant::now();
    let limit = Duration::from_secs(args.timeout);
    let deadline = Utc::now() + chrono::Duration::seconds(args.timeout as i64);
    let timed_out = loop {
        if started.elapsed() >= limit {
            break true;
        }
        if !args.no_idle_exit && is_idle(&engine.list_jobs().await?, Utc::now(), deadline) {
            break false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    scheduler.shutdown().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let pool = scheduler.pool().stats();

    let mut stats = Vec::with_capacity(acquisitions.len());
    for name in &acquisitions {
        stats.push(AcquisitionRow::from(scheduler.acquisition_stats(name).await?));
    }

    let now = Utc::now();
    let full_error = format != OutputFormat::Table;
    let remaining = engine.list_jobs().await?;
    let jobs: Vec<JobRow> = remaining.iter().map(|j| JobRow::new(j, now, full_error)).collect();
    let resumptions: Vec<ResumptionRow> = runtime
        .resumptions()
        .into_iter()
        .map(|r| ResumptionRow {
            execution: r.execution_id.to_string(),
            trigger: match r.trigger {
                ResumeTrigger::Event {
                    event_type,
                    event_name,
                } => format!("{}:{}", event_type, event_name),
                ResumeTrigger::AsyncContinuation { activity_id } => {
                    format!("continuation:{}", activity_id.unwrap_or_else(|| "-".to_string()))
                }
            },
            payload: r.payload.map(|p| p.to_string()).unwrap_or_default(),
        })
        .collect();

    let report = RunReport {
        engine: engine.name().to_string(),
        elapsed_ms,
        timed_out,
        jobs_created,
        jobs_remaining: remaining.len(),
        jobs_failed: remaining.iter().filter(|j| j.is_failed()).count(),
        peak_workers: pool.peak_concurrent,
        rejected_permits: pool.acquire_timeouts,
        jobs,
        resumptions,
        acquisitions: stats,
    };

    match format {
        OutputFormat::Table => print_report(&report)?,
        _ => output::print_item(&report, format)?,
    }
    Ok(())
}

fn print_report(report: &RunReport) -> Result<()> {
    output::print_header("Remaining Jobs");
    output::print_list(&report.jobs, OutputFormat::Table)?;

    output::print_header("Resumed Executions");
    output::print_list(&report.resumptions, OutputFormat::Table)?;

    output::print_header("Acquisitions");
    output::print_list(&report.acquisitions, OutputFormat::Table)?;

    output::print_header("Summary");
    output::print_detail("Engine", &report.engine);
    output::print_detail("Elapsed (ms)", &report.elapsed_ms.to_string());
    output::print_detail("Jobs created", &report.jobs_created.to_string());
    output::print_detail("Jobs remaining", &report.jobs_remaining.to_string());
    output::print_detail("Peak workers", &report.peak_workers.to_string());
    output::print_detail("Rejected permits", &report.rejected_permits.to_string());
    println!();

    if report.timed_out {
        output::print_warning("Time limit reached with jobs still pending");
    }
    if report.jobs_failed > 0 {
        output::print_error(&format!(
            "{} job{} failed with no retries left",
            report.jobs_failed,
            if report.jobs_failed == 1 { "" } else { "s" }
        ));
    } else if report.jobs_remaining == 0 {
        output::print_success("All jobs executed");
    }
    Ok(())
}
