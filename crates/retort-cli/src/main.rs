use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use retort_runner::{
    plan_pipeline, run_pipeline, store_statuses, ExecutionPlan, RunOptions, RunOutcome,
    StoreStatus, VersionKey,
};

#[derive(Parser)]
#[command(name = "retort", version = "0.1.0", about = "Versioned stage pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline against a data root.
    Run {
        root: PathBuf,
        /// Version key as E-S-C-T.
        #[arg(long)]
        version: String,
        #[arg(long)]
        stage_cmd: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        force_from: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Predict what a run would do without touching anything.
    Plan {
        root: PathBuf,
        #[arg(long)]
        version: String,
        #[arg(long)]
        stage_cmd: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        force_from: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List every resolved store for a version key.
    Stores {
        root: PathBuf,
        #[arg(long)]
        version: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            root,
            version,
            stage_cmd,
            force,
            force_from,
            json,
        } => {
            let key = VersionKey::parse(&version)?;
            let options = RunOptions {
                force,
                force_from,
                stage_cmd,
            };
            let started = Instant::now();
            let outcome = run_pipeline(&root, key, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": outcome_to_json(&outcome),
                    "elapsed_seconds": started.elapsed().as_secs_f64(),
                })));
            }
            print_outcome(&outcome);
            println!(
                "elapsed: {}",
                format_elapsed_time(started.elapsed())
            );
        }
        Commands::Plan {
            root,
            version,
            stage_cmd,
            force,
            force_from,
            json,
        } => {
            let key = VersionKey::parse(&version)?;
            let options = RunOptions {
                force,
                force_from,
                stage_cmd,
            };
            let plan = plan_pipeline(&root, key, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": plan_to_json(&plan),
                })));
            }
            print_plan(&plan);
        }
        Commands::Stores {
            root,
            version,
            json,
        } => {
            let key = VersionKey::parse(&version)?;
            let statuses = store_statuses(&root, &key);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stores",
                    "data_root": root.display().to_string(),
                    "version": version,
                    "stores": statuses.iter().map(store_status_to_json).collect::<Vec<_>>(),
                })));
            }
            print_stores(&root, &statuses);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Stores { json, .. } => *json,
    }
}

fn outcome_to_json(outcome: &RunOutcome) -> Value {
    json!({
        "run_id": outcome.run_id,
        "run_dir": outcome.run_dir.display().to_string(),
        "data_root": outcome.data_root.display().to_string(),
        "version": outcome.version.to_string(),
        "command": outcome.command,
        "stages": outcome.stages.iter().map(|record| json!({
            "slug": record.slug,
            "stage": record.stage,
            "state": record.state.as_str(),
            "note": record.note,
            "elapsed_seconds": record.elapsed_seconds,
            "reads": record.reads,
            "writes": record.writes,
        })).collect::<Vec<_>>(),
    })
}

fn plan_to_json(plan: &ExecutionPlan) -> Value {
    json!({
        "data_root": plan.data_root.display().to_string(),
        "version": plan.version.to_string(),
        "stages": plan.stages.iter().map(|stage| json!({
            "slug": stage.slug,
            "stage": stage.stage,
            "action": stage.action.as_str(),
            "detail": stage.detail,
            "reads": stage.reads.iter().map(|s| s.path.display().to_string()).collect::<Vec<_>>(),
            "writes": stage.writes.iter().map(|s| s.path.display().to_string()).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    })
}

fn store_status_to_json(status: &StoreStatus) -> Value {
    json!({
        "role": status.role.as_str(),
        "dir": status.dir_name,
        "path": status.path.display().to_string(),
        "presence": status.presence.as_str(),
    })
}

fn print_outcome(outcome: &RunOutcome) {
    println!("root: {}", outcome.data_root.display());
    println!("version: {}", outcome.version);
    println!("command: {:?}", outcome.command);
    for record in &outcome.stages {
        match &record.note {
            Some(note) => println!(
                "stage {}: {} ({}) [{:.1}s]",
                record.slug,
                record.state.as_str(),
                note,
                record.elapsed_seconds
            ),
            None => println!(
                "stage {}: {} [{:.1}s]",
                record.slug,
                record.state.as_str(),
                record.elapsed_seconds
            ),
        }
    }
    println!("run_id: {}", outcome.run_id);
    println!("run_dir: {}", outcome.run_dir.display());
}

fn print_plan(plan: &ExecutionPlan) {
    println!("root: {}", plan.data_root.display());
    println!("version: {}", plan.version);
    for stage in &plan.stages {
        match &stage.detail {
            Some(detail) => println!("stage {}: {} ({})", stage.slug, stage.action.as_str(), detail),
            None => println!("stage {}: {}", stage.slug, stage.action.as_str()),
        }
    }
}

fn print_stores(root: &std::path::Path, statuses: &[StoreStatus]) {
    println!("root: {}", root.display());
    for status in statuses {
        println!(
            "{}: {} ({})",
            status.role.as_str(),
            status.dir_name,
            status.presence.as_str()
        );
    }
}

fn format_elapsed_time(duration: std::time::Duration) -> String {
    let duration = duration.as_secs();
    let seconds = duration % 60;
    let minutes = (duration / 60) % 60;
    let hours = duration / 3600;
    format!("{hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
    use super::format_elapsed_time;
    use std::time::Duration;

    #[test]
    fn elapsed_time_formats_as_h_m_s() {
        assert_eq!(format_elapsed_time(Duration::new(0, 0)), "0h 0m 0s");
        assert_eq!(format_elapsed_time(Duration::new(12, 0)), "0h 0m 12s");
        assert_eq!(format_elapsed_time(Duration::new(120, 0)), "0h 2m 0s");
        assert_eq!(format_elapsed_time(Duration::new(134, 0)), "0h 2m 14s");
        assert_eq!(format_elapsed_time(Duration::new(3600, 0)), "1h 0m 0s");
        assert_eq!(format_elapsed_time(Duration::new(3724, 0)), "1h 2m 4s");
    }
}
