// Waypoint worker
//
// Design Decision: Use clap derive with env fallbacks so every flag can come from .env.
// Design Decision: Only `demo` uses the in-memory store; other commands need PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use waypoint_durable::{InMemoryWorkflowStore, PostgresWorkflowStore, RunInfo, WorkflowExecutor};
use waypoint_worker::{
    worker_pool, CrossLanguageInput, CrossLanguageWorkflow, GreeterWorkflow, Settings,
};

#[derive(Parser)]
#[command(name = "waypoint-worker")]
#[command(about = "Waypoint worker - run workflows and activities, start and inspect runs")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Task queue to poll and start runs on
    #[arg(long, env = "WAYPOINT_TASK_QUEUE")]
    task_queue: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the task queue until Ctrl-C
    Run,

    /// Start a run and print its id
    Start {
        /// Registered workflow type, e.g. Greeter
        workflow_type: String,

        /// Run input as JSON, e.g. '"Ada"'
        input: String,

        /// Wait for the run to finish and print its final state
        #[arg(long)]
        wait: bool,

        /// Max wait time in seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Print a run's state and history as JSON
    Describe { run_id: Uuid },

    /// Request cancellation of a run
    Cancel {
        run_id: Uuid,

        #[arg(long, default_value = "cancelled from cli")]
        reason: String,
    },

    /// Run Greeter and CrossLanguage end to end on an in-memory store
    Demo {
        #[arg(default_value = "Ada")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("invalid worker settings")?;
    if let Some(url) = cli.database_url {
        settings.database_url = Some(url);
    }
    if let Some(task_queue) = cli.task_queue {
        settings.task_queue = task_queue;
    }

    match cli.command {
        Commands::Run => run(&settings).await,
        Commands::Start {
            workflow_type,
            input,
            wait,
            timeout,
        } => start(&settings, &workflow_type, &input, wait.then(|| Duration::from_secs(timeout))).await,
        Commands::Describe { run_id } => describe(&settings, run_id).await,
        Commands::Cancel { run_id, reason } => cancel(&settings, run_id, &reason).await,
        Commands::Demo { name } => demo(&settings, name).await,
    }
}

/// `RUST_LOG` wins; otherwise `LOG_LEVEL` applies to both crates
fn init_tracing() {
    let default_filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => format!("waypoint_worker={level},waypoint_durable={level}"),
        Err(_) => "waypoint_worker=debug,waypoint_durable=info".to_string(),
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn connect(settings: &Settings, command: &str) -> Result<Arc<PostgresWorkflowStore>> {
    let Some(url) = settings.database_url.as_deref() else {
        bail!(
            "DATABASE_URL is required for `{command}`: in-memory state lives only as long as \
             one process, use `demo` to try the engine without a database"
        );
    };

    let max_connections = settings.concurrency as u32 + 2;
    let store = PostgresWorkflowStore::connect(url, max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    store.migrate().await.context("failed to run migrations")?;
    Ok(Arc::new(store))
}

async fn run(settings: &Settings) -> Result<()> {
    let store = connect(settings, "run").await?;
    let pool = worker_pool(store, settings);
    pool.start().await.context("failed to start worker pool")?;

    info!(
        worker_id = %pool.worker_id(),
        task_queue = %settings.task_queue,
        concurrency = settings.concurrency,
        "waypoint-worker running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal");

    pool.shutdown().await?;
    info!("worker shutdown complete");
    Ok(())
}

async fn start(
    settings: &Settings,
    workflow_type: &str,
    input: &str,
    wait: Option<Duration>,
) -> Result<()> {
    let input: Value =
        serde_json::from_str(input).with_context(|| format!("input is not valid JSON: {input}"))?;

    let store = connect(settings, "start").await?;
    let executor = WorkflowExecutor::with_config(store, settings.executor_config());
    let run_id = executor.start_workflow(workflow_type, input).await?;
    println!("{run_id}");

    if let Some(timeout) = wait {
        let info = executor
            .wait_for_completion(run_id, Duration::from_millis(500), timeout)
            .await?;
        print_json(&info)?;
    }
    Ok(())
}

async fn describe(settings: &Settings, run_id: Uuid) -> Result<()> {
    let store = connect(settings, "describe").await?;
    let executor = WorkflowExecutor::with_config(store, settings.executor_config());

    let info = executor.describe(run_id).await?;
    let history = executor.history(run_id).await?;
    print_json(&json!({ "run": info, "history": history }))
}

async fn cancel(settings: &Settings, run_id: Uuid, reason: &str) -> Result<()> {
    let store = connect(settings, "cancel").await?;
    let executor = WorkflowExecutor::with_config(store, settings.executor_config());

    if executor.cancel_workflow(run_id, reason).await? {
        println!("cancel requested for {run_id}");
    } else {
        println!("run {run_id} is already closed or cancelling");
    }
    Ok(())
}

async fn demo(settings: &Settings, name: String) -> Result<()> {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let pool = worker_pool(store, settings);
    pool.start().await?;

    let executor = pool.executor();
    let greeter = executor.start::<GreeterWorkflow>(name.clone()).await?;
    print_outcome(&wait_briefly(executor, greeter).await?);

    let cross = executor
        .start::<CrossLanguageWorkflow>(CrossLanguageInput {
            message: format!("Hello from {name}"),
            languages: ["python", "typescript", "csharp", "go"]
                .into_iter()
                .map(String::from)
                .collect(),
            task_queue_suffix: None,
        })
        .await?;
    print_outcome(&wait_briefly(executor, cross).await?);

    pool.shutdown().await?;
    Ok(())
}

async fn wait_briefly(executor: &WorkflowExecutor, run_id: Uuid) -> Result<RunInfo> {
    let info = executor
        .wait_for_completion(run_id, Duration::from_millis(50), Duration::from_secs(30))
        .await?;
    Ok(info)
}

fn print_outcome(info: &RunInfo) {
    match (&info.result, &info.error) {
        (Some(Value::String(text)), _) => println!("{text}"),
        (Some(other), _) => println!("{other}"),
        (None, Some(error)) => println!("{} run {}: {error}", info.status, info.run_id),
        (None, None) => println!("{} run {}", info.status, info.run_id),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
