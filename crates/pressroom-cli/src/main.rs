//! `pressroom` command line: run the scheduler, manage queued tasks and
//! drive workflows against the data directory from the config file.

mod serve;

use clap::{Parser, Subcommand};
use pressroom_core::{PressroomConfig, PressroomResult};
use pressroom_orchestrator::{register_builtin, TemplateGenerator};
use pressroom_queue::{Broker, EnqueueRequest, FileBroker, TaskDefaults, TaskStatus};
use pressroom_workflow::{
    EngineConfig, FileCheckpointStore, FileValidationStore, StateUpdate, WorkflowEngine,
    WorkflowState,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pressroom", about = "Pressroom: content agent queue and workflows")]
struct Cli {
    /// Path to config file. Defaults apply when it does not exist.
    #[arg(short, long, default_value = "pressroom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and queue maintenance until Ctrl-C
    Serve,
    /// Inspect and manage queued tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Start, resume and inspect workflows
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Put a task on the queue
    Enqueue {
        #[arg(long)]
        kind: String,
        /// JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Sending agent role
        #[arg(long)]
        source: Option<String>,
        /// Receiving agent role
        #[arg(long)]
        target: Option<String>,
        /// Scheduled source, for collection jobs
        #[arg(long)]
        source_key: Option<String>,
    },
    Status {
        id: Uuid,
    },
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Cancel a pending task
    Cancel {
        id: Uuid,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    Start {
        name: String,
        /// Initial state as a JSON object
        #[arg(long, default_value = "{}")]
        state: String,
    },
    /// Answer a pending validation and continue its workflow
    Resume {
        validation_id: Uuid,
        /// Decision as a JSON object, merged into the paused state
        #[arg(long, default_value = "{}")]
        decision: String,
    },
    Status {
        id: Uuid,
    },
    List,
    /// List validations awaiting a decision
    Pending,
    Cancel {
        id: Uuid,
    },
}

fn load_config(path: &std::path::Path) -> PressroomResult<PressroomConfig> {
    if path.exists() {
        PressroomConfig::from_file(path)
    } else {
        Ok(PressroomConfig::default())
    }
}

fn parse_object(raw: &str, what: &str) -> anyhow::Result<serde_json::Map<String, Value>> {
    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(anyhow::anyhow!("{what} must be a JSON object")),
        Err(e) => Err(anyhow::anyhow!("Invalid {what} JSON: {e}")),
    }
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_broker(config: &PressroomConfig) -> PressroomResult<FileBroker> {
    Ok(FileBroker::open(config.tasks_dir())
        .await?
        .with_retry_delay(config.queue.retry_delay()))
}

async fn open_engine(config: &PressroomConfig) -> PressroomResult<WorkflowEngine> {
    let checkpoints = FileCheckpointStore::open(config.checkpoints_dir()).await?;
    let validations = FileValidationStore::open(config.validations_dir()).await?;
    let mut engine = WorkflowEngine::new(
        Arc::new(checkpoints),
        Arc::new(validations),
        EngineConfig::from(&config.workflow),
    );
    register_builtin(&mut engine, Arc::new(TemplateGenerator))?;
    Ok(engine)
}

async fn run_task(config: &PressroomConfig, action: TaskAction) -> anyhow::Result<()> {
    let broker = open_broker(config).await?;
    match action {
        TaskAction::Enqueue {
            kind,
            payload,
            priority,
            max_retries,
            source,
            target,
            source_key,
        } => {
            let request = EnqueueRequest {
                kind,
                payload: Value::Object(parse_object(&payload, "payload")?),
                priority,
                max_retries,
                source,
                target,
                source_key,
            };
            let task = request.into_task(TaskDefaults::from(&config.queue))?;
            let task_id = broker.enqueue(task).await?;
            info!(task_id = %task_id, "Task enqueued");
            print_json(&json!({ "task_id": task_id }))?;
        }
        TaskAction::Status { id } => print_json(&broker.status(id).await?)?,
        TaskAction::List { status } => {
            let wanted = status.map(|s| s.parse::<TaskStatus>()).transpose()?;
            let tasks = broker
                .find(&|t: &pressroom_queue::Task| wanted.map_or(true, |w| t.status == w))
                .await?;
            let reports: Vec<_> = tasks.iter().map(|t| t.report()).collect();
            print_json(&reports)?;
        }
        TaskAction::Cancel { id } => {
            let task = broker.cancel(id).await?;
            print_json(&task.report())?;
        }
    }
    Ok(())
}

async fn run_workflow(config: &PressroomConfig, action: WorkflowAction) -> anyhow::Result<()> {
    let engine = open_engine(config).await?;
    match action {
        WorkflowAction::Start { name, state } => {
            let initial = WorkflowState::from(parse_object(&state, "state")?);
            print_json(&engine.start(&name, initial).await?)?;
        }
        WorkflowAction::Resume {
            validation_id,
            decision,
        } => {
            let decision: StateUpdate = parse_object(&decision, "decision")?;
            print_json(&engine.resume(validation_id, decision).await?)?;
        }
        WorkflowAction::Status { id } => print_json(&engine.status(id).await?)?,
        WorkflowAction::List => print_json(&engine.list_workflows().await?)?,
        WorkflowAction::Pending => print_json(&engine.pending_validations().await?)?,
        WorkflowAction::Cancel { id } => print_json(&engine.cancel(id).await?)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    pressroom_core::logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve => serve::run(config).await?,
        Commands::Task { action } => run_task(&config, action).await?,
        Commands::Workflow { action } => run_workflow(&config, action).await?,
    }
    Ok(())
}
