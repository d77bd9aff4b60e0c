//! CLI command definitions for pipeforge.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::{load_remote_plugin, Invoker, SubprocessInvoker};
use crate::context::{settings, Settings};
use crate::pipeline::{Orchestrator, OrchestratorConfig, PipelinePlan, PipelineStatus};
use crate::plugin::PluginRegistry;
use crate::storage::Database;

/// Database used when neither `--db-url` nor `DB_URL` is set.
const DEFAULT_DB_URL: &str = "sqlite::memory:";

/// Multi-tenant data collection pipeline runner.
#[derive(Parser)]
#[command(name = "pipeforge")]
#[command(about = "Run staged data collection pipelines over pluggable sources")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a pipeline plan to completion.
    Run(RunArgs),

    /// List registered plugins and their ordered subtasks.
    Plugins(PluginArgs),

    /// Apply core and plugin migrations.
    Migrate(MigrateArgs),

    /// Show a pipeline and its tasks.
    Status(StatusArgs),
}

/// Remote plugin executables, in addition to `PIPEFORGE_PLUGINS` and `REMOTE_PLUGIN_DIR`.
#[derive(Parser, Debug, Default)]
pub struct PluginArgs {
    /// Remote plugin executable; may be repeated.
    #[arg(long = "plugin")]
    pub plugins: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Plan file (.json, .yaml or .yml).
    #[arg(long)]
    pub plan: PathBuf,

    /// Pipeline name; defaults to the plan file stem.
    #[arg(long)]
    pub name: Option<String>,

    /// Database URL (overrides DB_URL).
    #[arg(long)]
    pub db_url: Option<String>,

    #[command(flatten)]
    pub plugins: PluginArgs,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Database URL (overrides DB_URL).
    #[arg(long)]
    pub db_url: Option<String>,

    #[command(flatten)]
    pub plugins: PluginArgs,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Pipeline id.
    #[arg(long)]
    pub pipeline: String,

    /// Database URL (overrides DB_URL).
    #[arg(long)]
    pub db_url: Option<String>,

    /// Print the records as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses the arguments and runs the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env();
    match cli.command {
        Commands::Run(args) => run_pipeline_command(args, settings).await,
        Commands::Plugins(args) => run_plugins_command(args, settings).await,
        Commands::Migrate(args) => run_migrate_command(args, settings).await,
        Commands::Status(args) => run_status_command(args, settings).await,
    }
}

async fn run_pipeline_command(args: RunArgs, settings: Settings) -> anyhow::Result<()> {
    let plan = load_plan(&args.plan)?;
    let name = args.name.clone().unwrap_or_else(|| {
        args.plan
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline".to_string())
    });

    let db_url = resolve_db_url(args.db_url.as_deref(), &settings);
    let settings = Arc::new(settings.with(settings::DB_URL, db_url.clone()));
    let registry = load_registry(&args.plugins, &settings).await?;
    let db = open_database(&db_url, &registry).await?;

    let config = OrchestratorConfig::from_settings(&settings)?;
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        Arc::new(registry),
        settings,
        config,
    )?);

    let submitted = orchestrator.submit(&name, &plan).await?;
    info!(pipeline_id = %submitted.id, name = %name, "Pipeline submitted");

    let handle = submitted.handle;
    tokio::pin!(handle);
    let status = tokio::select! {
        joined = &mut handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!(pipeline_id = %submitted.id, "Interrupted, cancelling pipeline");
            orchestrator.cancel(&submitted.id);
            handle.await??
        }
    };

    print_pipeline(&db, &submitted.id, args.json).await?;
    if !matches!(status, PipelineStatus::Completed | PipelineStatus::PartialFail) {
        anyhow::bail!("pipeline {} finished as {}", submitted.id, status);
    }
    Ok(())
}

async fn run_plugins_command(args: PluginArgs, settings: Settings) -> anyhow::Result<()> {
    let registry = load_registry(&args, &settings).await?;
    if registry.is_empty() {
        println!("No plugins registered.");
        return Ok(());
    }

    for plugin in registry.iter() {
        println!("{}", plugin.name);
        if !plugin.description.is_empty() {
            println!("  {}", plugin.description);
        }
        println!("  sort strategy: {}", plugin.sort_strategy);
        let ordered = plugin.sort_strategy.sort(&plugin.task.sub_task_metas())?;
        for (number, meta) in ordered.iter().enumerate() {
            let mut flags = Vec::new();
            if meta.required {
                flags.push("required");
            }
            if !meta.enabled_by_default {
                flags.push("disabled by default");
            }
            if flags.is_empty() {
                println!("  {:>3}. {}", number + 1, meta.name);
            } else {
                println!("  {:>3}. {} ({})", number + 1, meta.name, flags.join(", "));
            }
        }
    }
    Ok(())
}

async fn run_migrate_command(args: MigrateArgs, settings: Settings) -> anyhow::Result<()> {
    let db_url = resolve_db_url(args.db_url.as_deref(), &settings);
    let registry = load_registry(&args.plugins, &settings).await?;
    open_database(&db_url, &registry).await?;
    println!("✓ Migrations applied to {}", db_url);
    Ok(())
}

async fn run_status_command(args: StatusArgs, settings: Settings) -> anyhow::Result<()> {
    let db_url = resolve_db_url(args.db_url.as_deref(), &settings);
    let db = Database::connect(&db_url).await?;
    db.run_migrations().await?;
    print_pipeline(&db, &args.pipeline, args.json).await
}

fn resolve_db_url(flag: Option<&str>, settings: &Settings) -> String {
    flag.or_else(|| settings.get_str(settings::DB_URL))
        .unwrap_or(DEFAULT_DB_URL)
        .to_string()
}

fn load_plan(path: &Path) -> anyhow::Result<PipelinePlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let plan = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => PipelinePlan::from_yaml(&text)?,
        _ => PipelinePlan::from_json(&text)?,
    };
    Ok(plan)
}

/// Executables from `--plugin`, `PIPEFORGE_PLUGINS` and `REMOTE_PLUGIN_DIR`, in that order.
fn plugin_executables(args: &PluginArgs, settings: &Settings) -> anyhow::Result<Vec<PathBuf>> {
    let mut executables = args.plugins.clone();
    executables.extend(
        settings
            .get_list(settings::PIPEFORGE_PLUGINS)
            .into_iter()
            .map(PathBuf::from),
    );

    if let Some(dir) = settings.get_str(settings::REMOTE_PLUGIN_DIR) {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read plugin directory {}", dir))?
        {
            let path = entry?.path();
            if path.is_file() {
                found.push(path);
            }
        }
        found.sort();
        executables.extend(found);
    }

    let mut seen = HashSet::new();
    executables.retain(|path| seen.insert(path.clone()));
    Ok(executables)
}

async fn load_registry(args: &PluginArgs, settings: &Settings) -> anyhow::Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    let cancel = CancellationToken::new();
    for executable in plugin_executables(args, settings)? {
        let invoker: Arc<dyn Invoker> = Arc::new(SubprocessInvoker::new(&executable));
        let descriptor = load_remote_plugin(invoker, &cancel)
            .await
            .with_context(|| format!("Failed to load plugin {}", executable.display()))?;
        registry.register(descriptor)?;
    }
    info!(plugins = registry.len(), "Plugin registry ready");
    Ok(registry)
}

async fn open_database(db_url: &str, registry: &PluginRegistry) -> anyhow::Result<Database> {
    let db = Database::connect(db_url).await?;
    db.run_migrations().await?;
    for plugin in registry.iter() {
        let applied = db
            .apply_plugin_migrations(&plugin.name, &plugin.migration_scripts)
            .await?;
        if applied > 0 {
            info!(plugin = %plugin.name, applied, "Plugin migrations applied");
        }
    }
    Ok(db)
}

async fn print_pipeline(db: &Database, id: &str, json: bool) -> anyhow::Result<()> {
    let pipeline = db.get_pipeline(id).await?;
    let tasks = db.list_tasks(id).await?;

    if json {
        let output = serde_json::json!({ "pipeline": pipeline, "tasks": tasks });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Pipeline {} ===", pipeline.id);
    println!("Name:     {}", pipeline.name);
    println!("Status:   {}", pipeline.status);
    println!(
        "Tasks:    {}/{} ({:.0}%)",
        pipeline.finished_tasks,
        pipeline.total_tasks,
        pipeline.progress_percent()
    );
    if let Some(spent) = pipeline.spent_seconds {
        println!("Spent:    {}s", spent);
    }
    if !pipeline.message.is_empty() {
        println!("Message:  {}", pipeline.message);
    }
    println!();

    for task in &tasks {
        println!(
            "  [stage {}] {:<16} {:<16} {:>5.1}%  {}",
            task.stage,
            task.plugin,
            task.status.to_string(),
            task.progress * 100.0,
            task.id
        );
        if let Some(failed) = &task.failed_sub_task {
            println!("      failed subtask: {}", failed);
        }
        if !task.message.is_empty() {
            println!("      {}", task.message);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "pipeforge",
            "--log-level",
            "debug",
            "run",
            "--plan",
            "plan.yaml",
            "--plugin",
            "./github.sh",
            "--plugin",
            "./jira.sh",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.plan, PathBuf::from("plan.yaml"));
                assert_eq!(args.plugins.plugins.len(), 2);
                assert!(args.db_url.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_status_requires_pipeline() {
        assert!(Cli::try_parse_from(["pipeforge", "status"]).is_err());
    }

    #[test]
    fn test_db_url_precedence() {
        let settings = Settings::default().with(settings::DB_URL, "sqlite://env.db");
        assert_eq!(resolve_db_url(Some("sqlite://flag.db"), &settings), "sqlite://flag.db");
        assert_eq!(resolve_db_url(None, &settings), "sqlite://env.db");
        assert_eq!(resolve_db_url(None, &Settings::default()), DEFAULT_DB_URL);
    }

    #[test]
    fn test_plugin_executables_order() {
        let args = PluginArgs {
            plugins: vec![PathBuf::from("./a.sh")],
        };
        let settings = Settings::default().with(settings::PIPEFORGE_PLUGINS, "./b.sh,./a.sh");
        let found = plugin_executables(&args, &settings).unwrap();
        assert_eq!(found, vec![PathBuf::from("./a.sh"), PathBuf::from("./b.sh")]);
    }
}
