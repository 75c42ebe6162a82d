//! cronkeeper - A crash-safe cron orchestrator.
//!
//! Usage:
//!   cronkeeper run <defs-dir>       Run the engine with jobs from the specified directory
//!   cronkeeper validate <defs-dir>  Validate job definitions without running
//!   cronkeeper list <defs-dir>      List all jobs and their next fire time

use chrono::Utc;
use clap::{Parser, Subcommand};
use cronkeeper::config::ProjectDefinitions;
use cronkeeper::{
    CommandExecutor, Engine, EngineConfig, InMemoryStorage, LocalDispatcher, LocalQueue,
    ProjectId, Schedule, load_definitions_from_directory,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// cronkeeper - A crash-safe cron orchestrator
#[derive(Parser)]
#[command(name = "cronkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine with job definitions from a directory
    Run {
        /// Path to the directory containing one YAML file per project
        #[arg(value_name = "DEFS_DIR")]
        defs_dir: PathBuf,

        /// Engine settings file
        #[arg(short = 'c', long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// How often to reload the definitions, in seconds (default: 60)
        #[arg(long, default_value = "60")]
        refresh: u64,
    },

    /// Validate job definitions without running
    Validate {
        /// Path to the directory containing one YAML file per project
        #[arg(value_name = "DEFS_DIR")]
        defs_dir: PathBuf,
    },

    /// List all jobs in the directory
    List {
        /// Path to the directory containing one YAML file per project
        #[arg(value_name = "DEFS_DIR")]
        defs_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            defs_dir,
            config,
            refresh,
        } => {
            run_engine(defs_dir, config, refresh).await?;
        }
        Commands::Validate { defs_dir } => {
            validate_definitions(defs_dir)?;
        }
        Commands::List { defs_dir } => {
            list_jobs(defs_dir)?;
        }
    }

    Ok(())
}

/// Run the engine, reloading definitions from a directory periodically.
async fn run_engine(
    defs_dir: PathBuf,
    config_path: Option<PathBuf>,
    refresh: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &config_path {
        Some(path) => {
            info!("Loading engine settings from: {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };

    // Fail fast on a broken directory before anything is started
    load_definitions_from_directory(&defs_dir)?;

    let storage = InMemoryStorage::new();
    let (queue, rx) = LocalQueue::new();
    let engine = Engine::builder(
        Arc::new(storage),
        Arc::new(queue),
        Arc::new(CommandExecutor::new()),
    )
    .config(config)
    .build();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let dispatcher = tokio::spawn(LocalDispatcher::new(engine.clone(), rx).run(async move {
        let _ = stop_rx.await;
    }));

    info!(
        "Starting engine (definitions: {}, refresh: {}s)...",
        defs_dir.display(),
        refresh
    );
    info!("Press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(refresh.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                sync_definitions(&engine, &defs_dir).await;
            }
        }
    }

    let _ = stop_tx.send(());
    if let Err(e) = dispatcher.await {
        error!("Dispatcher task failed: {}", e);
    }

    info!("Goodbye!");
    Ok(())
}

/// Push the definitions found in `defs_dir` into the engine.
///
/// Projects whose file disappeared get all of their jobs disabled.
async fn sync_definitions(engine: &Engine, defs_dir: &Path) {
    let projects = match load_definitions_from_directory(defs_dir) {
        Ok(projects) => projects,
        Err(e) => {
            error!("Failed to load definitions, keeping current jobs: {}", e);
            return;
        }
    };

    let loaded: BTreeSet<ProjectId> = projects.iter().map(|p| p.project.clone()).collect();
    for ProjectDefinitions {
        project,
        definitions,
        ..
    } in &projects
    {
        if let Err(e) = engine.update_project_jobs(project, definitions).await {
            warn!("Project '{}' only partially updated: {}", project, e);
        }
    }

    match engine.get_all_projects().await {
        Ok(active) => {
            for project in active.iter().filter(|p| !loaded.contains(*p)) {
                info!("Project '{}' was removed, disabling its jobs", project);
                if let Err(e) = engine.update_project_jobs(project, &[]).await {
                    warn!("Failed to disable jobs of project '{}': {}", project, e);
                }
            }
        }
        Err(e) => error!("Failed to list projects: {}", e),
    }
}

/// Validate job definitions without running.
fn validate_definitions(defs_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating definitions in: {}", defs_dir.display());

    match load_definitions_from_directory(&defs_dir) {
        Ok(projects) => {
            let total: usize = projects.iter().map(|p| p.definitions.len()).sum();
            info!(
                "All {} job(s) in {} project(s) are valid:",
                total,
                projects.len()
            );
            for project in &projects {
                for def in &project.definitions {
                    info!("  - {} ({}): OK", def.job_id, def.schedule);
                }
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// List all jobs in the directory.
fn list_jobs(defs_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let projects = load_definitions_from_directory(&defs_dir)?;

    if projects.iter().all(|p| p.definitions.is_empty()) {
        println!("No jobs found in {}", defs_dir.display());
        return Ok(());
    }

    println!("Jobs in {}:", defs_dir.display());
    println!();

    let now = Utc::now();
    for project in &projects {
        println!("Project: {}", project.project);
        println!("  Revision: {}", &project.revision[..12.min(project.revision.len())]);

        for def in &project.definitions {
            println!("  - {}", def.job_id);
            let schedule = match Schedule::parse(def.schedule.as_str()) {
                Ok(schedule) => schedule,
                Err(e) => {
                    println!("      Schedule: {} (invalid: {})", def.schedule, e);
                    continue;
                }
            };
            println!("      Schedule: {}", schedule.expression());
            match schedule.next_after(now) {
                Ok(next) => println!("      Next run: {}", next.to_rfc3339()),
                Err(e) => println!("      Next run: unknown ({})", e),
            }
        }

        println!();
    }

    Ok(())
}
