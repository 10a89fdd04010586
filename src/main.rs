use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use seeflow_lib::agent_engine::{
    progress_channel, AgentEngine, JsonFileReporter, LogReporter, ProgressKind,
    RunStatusReporter, DEFAULT_PROGRESS_CAPACITY,
};
use seeflow_lib::config::{self, AppConfig};
use seeflow_lib::errors::SeeFlowResult;
use seeflow_lib::executor::{DesktopOperator, DirectExecutor, EnigoDriver};
use seeflow_lib::llm::{ModelRole, ProviderRegistry};
use seeflow_lib::perception::XcapScreen;
use seeflow_lib::workflow::{JsonFileStore, Step, WorkflowFile, WorkflowStore, WorkflowType};

#[derive(Parser)]
#[command(name = "seeflow", version, about = "Vision-driven workflow runner")]
struct Cli {
    /// Path to config.toml; searched for next to the binary, in the cwd, then the user config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workflow against the local screen.
    Run {
        /// Workflow JSON file.
        #[arg(long, conflicts_with_all = ["store", "id"])]
        workflow: Option<PathBuf>,
        /// Directory of `<id>.json` workflow files.
        #[arg(long, requires = "id")]
        store: Option<PathBuf>,
        #[arg(long, requires = "store")]
        id: Option<String>,
        /// Overrides the workflow's own type (browser | desktop).
        #[arg(long = "type")]
        workflow_type: Option<WorkflowType>,
        /// Write the final run status as JSON here.
        #[arg(long)]
        status_out: Option<PathBuf>,
    },
    /// Validate the config and print the resolved model roles.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (ignore error if not found)
    let _ = dotenvy::dotenv();
    seeflow_lib::init_logging("info");

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::CheckConfig => check_config(&config),
        Command::Run {
            workflow,
            store,
            id,
            workflow_type,
            status_out,
        } => {
            let source = match (workflow, store, id) {
                (Some(path), _, _) => WorkflowSource::File(path),
                (None, Some(root), Some(id)) => WorkflowSource::Store(root, id),
                _ => {
                    tracing::error!("pass --workflow <file> or --store <dir> --id <workflow>");
                    return ExitCode::FAILURE;
                }
            };
            run(config, source, workflow_type, status_out).await
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "seeflow failed");
            ExitCode::FAILURE
        }
    }
}

fn check_config(config: &AppConfig) -> SeeFlowResult<bool> {
    let registry = ProviderRegistry::from_config(config);
    println!("providers: {}", registry.list_names().join(", "));
    for role in [ModelRole::Decision, ModelRole::Perception, ModelRole::Verification] {
        let binding = registry.binding_for_role(role)?;
        println!(
            "{:<12} provider={} model={} temperature={}",
            role.as_str(),
            binding.client.name(),
            binding.model,
            binding.temperature
        );
    }
    Ok(true)
}

enum WorkflowSource {
    File(PathBuf),
    Store(PathBuf, String),
}

async fn load_steps(source: WorkflowSource) -> SeeFlowResult<(Vec<Step>, Option<WorkflowType>)> {
    match source {
        WorkflowSource::File(path) => {
            let file = WorkflowFile::from_path(&path)?;
            tracing::info!(
                name = file.name.as_deref().unwrap_or("-"),
                steps = file.steps.len(),
                "workflow loaded"
            );
            Ok((file.steps, Some(file.workflow_type)))
        }
        WorkflowSource::Store(root, id) => {
            let steps = JsonFileStore::new(root).load_steps(&id).await?;
            Ok((steps, None))
        }
    }
}

async fn run(
    config: AppConfig,
    source: WorkflowSource,
    type_override: Option<WorkflowType>,
    status_out: Option<PathBuf>,
) -> SeeFlowResult<bool> {
    let (steps, file_type) = load_steps(source).await?;
    let workflow_type = type_override.or(file_type).unwrap_or_default();

    let roles = ProviderRegistry::from_config(&config).roles()?;
    let driver = Arc::new(EnigoDriver);
    let operator = DesktopOperator::connect(
        driver.clone(),
        Arc::new(XcapScreen),
        config.operator.clone(),
    )
    .await?;
    let direct = DirectExecutor::new(driver, operator.device());

    let reporter: Arc<dyn RunStatusReporter> = match status_out {
        Some(path) => Arc::new(JsonFileReporter::new(path)),
        None => Arc::new(LogReporter),
    };
    let (progress, mut events) = progress_channel(DEFAULT_PROGRESS_CAPACITY);

    let mut engine = AgentEngine::new(Arc::new(operator), roles, direct, config.agent.clone())
        .with_workflow_type(workflow_type)
        .with_progress(progress)
        .with_reporter(reporter);
    if config.trace.enabled {
        engine = engine.with_trace_dir(config.trace.resolve_dir());
    }

    let signals = engine.signals();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping at the next step boundary");
            signals.cancel();
        }
    });

    let drain = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let step = event.step_index.unwrap_or(0);
            // Warnings and errors are already logged by the engine.
            if !matches!(event.kind, ProgressKind::Warning | ProgressKind::Error) {
                tracing::info!(
                    step,
                    kind = ?event.kind,
                    action = event.action.as_deref().unwrap_or(""),
                    "{}",
                    event.message
                );
            }
        }
    });

    let outcome = engine.run(&steps).await;
    drop(engine);
    let _ = drain.await;

    match &outcome.error {
        None => tracing::info!(steps = outcome.steps_completed, "workflow succeeded"),
        Some(err) => tracing::error!(kind = ?err.kind, reason = %err.reason, "workflow stopped"),
    }
    Ok(outcome.success)
}
