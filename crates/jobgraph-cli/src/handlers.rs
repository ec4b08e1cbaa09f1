//! Command handlers.

use crate::commands::{EventKind, RunArgs};
use crate::config::{CliConfig, OutputFormat};
use crate::reporter::ConsoleReporter;
use anyhow::{Context, anyhow, bail};
use console::style;
use indexmap::IndexMap;
use jobgraph_artifacts::{ArtifactStore, FilesystemBackend};
use jobgraph_core::context::RunContext;
use jobgraph_core::pipeline::RunDefinition;
use jobgraph_core::run::{JobStatus, RunResult, RunStatus};
use jobgraph_runner::ShellExecutor;
use jobgraph_scheduler::{
    RunPlan, Scheduler, SchedulerConfig, TriggerEvent, TriggerResolver, parse_assignment,
};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const TEMPLATE: &str = r#"name: ci
env:
  RUST_BACKTRACE: "1"

jobs:
  build:
    steps:
      - name: compile
        run: cargo build --release
      - name: version
        run: echo "version=$(git describe --tags --always)" >> "$JOBGRAPH_OUTPUT"
      - name: publish
        upload:
          name: build-info
          content: ${{ steps.version.outputs.version }}
          retention_days: 7
    outputs:
      version: ${{ steps.version.outputs.version }}

  test:
    needs: [build]
    matrix:
      axes:
        os: [linux, macos]
        toolchain: [stable, nightly]
      exclude:
        - os: macos
          toolchain: nightly
    steps:
      - name: unit
        run: echo "testing on ${{ matrix.os }} with ${{ matrix.toolchain }}"

  deploy:
    needs: [build, test]
    if: ctx.branch == 'main'
    steps:
      - name: fetch
        download:
          name: build-info
      - name: release
        run: echo "releasing ${{ needs.build.outputs.version }}"
"#;

/// Read a run definition; `.json` files are parsed as JSON, anything else as YAML.
pub fn load_definition(path: &Path) -> anyhow::Result<RunDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => RunDefinition::from_json(&content),
        _ => RunDefinition::from_yaml(&content),
    };
    definition.with_context(|| format!("Invalid run definition {}", path.display()))
}

fn load_plan(path: &Path) -> anyhow::Result<(RunDefinition, RunPlan)> {
    let definition = load_definition(path)?;
    let plan = RunPlan::build(&definition)
        .with_context(|| format!("Invalid run definition {}", path.display()))?;
    Ok((definition, plan))
}

/// Write a starter run definition.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    std::fs::write(path, TEMPLATE).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Validate a run definition.
pub fn validate(path: &Path) -> anyhow::Result<()> {
    let (definition, plan) = load_plan(path)?;

    println!(
        "{} Run definition \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}, instances: {}", definition.jobs.len(), plan.len());

    for job in plan.dag().topological_order() {
        let instances = plan.indices_of(job).len();
        let needs = plan.dag().predecessors(job);
        if needs.is_empty() {
            println!("    - {} ({} instances)", job, instances);
        } else {
            println!(
                "    - {} ({} instances, needs: {})",
                job,
                instances,
                needs.join(", ")
            );
        }
    }

    Ok(())
}

/// Show the instances a definition expands to.
pub fn plan(path: &Path, json: bool) -> anyhow::Result<()> {
    let (_, plan) = load_plan(path)?;

    if json {
        let instances: Vec<serde_json::Value> = plan
            .instances()
            .iter()
            .map(|key| {
                let job = key.job.as_str();
                serde_json::json!({
                    "instance": key.to_string(),
                    "job": job,
                    "matrix": key.matrix,
                    "needs": plan.job(job).map(|spec| spec.needs.clone()).unwrap_or_default(),
                    "if": plan.condition(job).map(|c| c.source()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    println!("Plan for {}:", style(plan.name()).bold());
    for (position, key) in plan.instances().iter().enumerate() {
        let condition = plan
            .condition(key.job.as_str())
            .map(|c| c.source().to_string())
            .unwrap_or_default();
        println!(
            "  {:>3}. {}  {}",
            position + 1,
            key,
            style(format!("if: {}", condition)).dim()
        );
    }
    Ok(())
}

/// The trigger event described by the run flags.
pub fn trigger_event(args: &RunArgs) -> anyhow::Result<TriggerEvent> {
    if !args.inputs.is_empty() && args.event != EventKind::Manual {
        bail!("--input is only valid with --event manual");
    }

    let event = match args.event {
        EventKind::Push => TriggerEvent::Push {
            branch: args.branch.clone(),
            sha: args.sha.clone(),
            actor: args.actor.clone(),
        },
        EventKind::Tag => TriggerEvent::Tag {
            name: args
                .tag
                .clone()
                .ok_or_else(|| anyhow!("--tag is required with --event tag"))?,
            sha: args.sha.clone(),
            actor: args.actor.clone(),
        },
        EventKind::PullRequest => TriggerEvent::PullRequest {
            number: args.pr,
            source_branch: args.branch.clone(),
            target_branch: args.base.clone(),
            sha: args.sha.clone(),
            actor: args.actor.clone(),
        },
        EventKind::Schedule => TriggerEvent::Schedule {
            cron: args.cron.clone(),
            branch: args.branch.clone(),
        },
        EventKind::Manual => {
            let mut inputs = IndexMap::new();
            for assignment in &args.inputs {
                let (name, value) = parse_assignment(assignment).map_err(|e| anyhow!(e))?;
                inputs.insert(name, value);
            }
            TriggerEvent::Manual {
                branch: args.branch.clone(),
                actor: args.actor.clone(),
                inputs,
            }
        }
    };
    Ok(event)
}

/// Run context for the run flags: trigger facts plus `--set` overrides.
pub fn resolve_context(args: &RunArgs) -> anyhow::Result<RunContext> {
    let event = trigger_event(args)?;
    let overrides = args
        .sets
        .iter()
        .map(|assignment| parse_assignment(assignment).map_err(|e| anyhow!(e)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(TriggerResolver::new().with_overrides(overrides).resolve(&event))
}

/// Execute a run definition locally.
pub async fn run(config: &CliConfig, args: RunArgs) -> anyhow::Result<RunStatus> {
    let mut definition = load_definition(&args.path)?;
    if let Some(workers) = args.max_workers {
        if workers == 0 {
            bail!("--max-workers must be at least 1");
        }
        definition.max_workers = Some(workers);
    }
    let ctx = resolve_context(&args)?;

    let artifact_dir = match &args.artifact_dir {
        Some(dir) => dir.clone(),
        None => config.artifact_dir()?,
    };
    let mut store = ArtifactStore::new(Arc::new(FilesystemBackend::new(artifact_dir)));
    if let Some(days) = config.default_retention_days {
        store = store.with_default_retention(chrono::Duration::days(i64::from(days)));
    }

    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("Workspace {} not found", args.workspace.display()))?;
    let json = args.json || config.output_format == OutputFormat::Json;

    let mut scheduler = Scheduler::new(
        Arc::new(ShellExecutor::default()),
        Arc::new(store),
        SchedulerConfig {
            max_workers: config.max_workers,
            workspace,
        },
    );
    if !json {
        scheduler = scheduler.with_event_sink(Arc::new(ConsoleReporter));
    }

    let plan = scheduler
        .load(&definition)
        .with_context(|| format!("Invalid run definition {}", args.path.display()))?;
    let handle = scheduler.spawn(plan, ctx);

    let token = handle.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
    let result = handle.wait().await?;
    interrupt.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }
    Ok(result.status)
}

fn print_summary(result: &RunResult) {
    println!();
    for report in &result.instances {
        let duration = report
            .duration_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_default();
        let marker = match report.status {
            JobStatus::Succeeded => style("✓").green(),
            JobStatus::Failed => style("✗").red(),
            JobStatus::Cancelled => style("!").yellow(),
            _ => style("○").dim(),
        };
        println!(
            "{} {:<32} {:<10} {}",
            marker,
            report.key.to_string(),
            report.status,
            style(duration).dim()
        );
        if let Some(failure) = &report.failure {
            println!("    {}", style(&failure.message).red());
        }
    }

    let summary = format!(
        "Run {} {} in {}ms ({} succeeded, {} failed, {} skipped, {} cancelled)",
        result.name,
        result.status,
        result.duration_ms,
        result.count(JobStatus::Succeeded),
        result.count(JobStatus::Failed),
        result.count(JobStatus::Skipped),
        result.count(JobStatus::Cancelled),
    );
    match result.status {
        RunStatus::Succeeded => println!("\n{} {}", style("✓").green(), summary),
        RunStatus::Failed => println!("\n{} {}", style("✗").red(), style(summary).red()),
        RunStatus::Cancelled => println!("\n{} {}", style("!").yellow(), summary),
    }
}

/// Print the JSON Schema of the run definition format.
pub fn schema(output: Option<&Path>) -> anyhow::Result<()> {
    let schema = schemars::schema_for!(RunDefinition);
    let content = serde_json::to_string_pretty(&schema)?;
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} Wrote {}", style("✓").green(), path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}

/// Show configuration.
pub fn show_config(config: &CliConfig) -> anyhow::Result<()> {
    println!("Current configuration:");
    println!("  max_workers: {}", config.max_workers);
    println!("  artifact_dir: {}", config.artifact_dir()?.display());
    println!(
        "  default_retention_days: {}",
        config
            .default_retention_days
            .map_or("(never expire)".to_string(), |days| days.to_string())
    );
    println!("  log_format: {:?}", config.log_format);
    println!("  output_format: {:?}", config.output_format);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> anyhow::Result<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

pub fn config_path() -> anyhow::Result<()> {
    println!("{}", CliConfig::config_path()?.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use jobgraph_core::value::Value;
    use pretty_assertions::assert_eq;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn run_args(args: &[&str]) -> RunArgs {
        let argv = std::iter::once("jobgraph").chain(args.iter().copied());
        TestCli::parse_from(argv).run
    }

    #[test]
    fn test_template_is_a_valid_definition() {
        let definition = RunDefinition::from_yaml(TEMPLATE).unwrap();
        let plan = RunPlan::build(&definition).unwrap();
        assert_eq!(
            plan.instances().iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            vec![
                "build",
                "test (linux, stable)",
                "test (linux, nightly)",
                "test (macos, stable)",
                "deploy",
            ]
        );
    }

    #[test]
    fn test_init_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobgraph.yaml");
        std::fs::write(&path, "name: mine\njobs: {}\n").unwrap();

        init(&path, false).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: mine\njobs: {}\n");

        init(&path, true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), TEMPLATE);
    }

    #[test]
    fn test_load_definition_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("ci.json");
        std::fs::write(
            &json,
            r#"{"name": "ci", "jobs": {"build": {"steps": [{"name": "make", "run": "make"}]}}}"#,
        )
        .unwrap();

        let definition = load_definition(&json).unwrap();
        assert_eq!(definition.name, "ci");
        assert_eq!(definition.jobs["build"].id.as_str(), "build");

        let missing = load_definition(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read"));
    }

    #[test]
    fn test_validate_reports_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yaml");
        std::fs::write(
            &path,
            "name: ci\njobs:\n  a:\n    needs: [b]\n  b:\n    needs: [a]\n",
        )
        .unwrap();

        let err = validate(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Cycle detected"));
    }

    #[test]
    fn test_resolve_manual_context() {
        let args = run_args(&[
            "--event",
            "manual",
            "--branch",
            "release",
            "--input",
            "version=1.4.0",
            "--input",
            "dry_run=true",
            "--set",
            "team=infra",
        ]);

        let ctx = resolve_context(&args).unwrap();
        assert_eq!(ctx.get("event"), Some(&Value::from("workflow_dispatch")));
        assert_eq!(ctx.get("branch"), Some(&Value::from("release")));
        assert_eq!(ctx.get("inputs.version"), Some(&Value::from("1.4.0")));
        assert_eq!(ctx.get("inputs.dry_run"), Some(&Value::from(true)));
        assert_eq!(ctx.get("team"), Some(&Value::from("infra")));
    }

    #[test]
    fn test_trigger_flag_errors() {
        assert!(trigger_event(&run_args(&["--event", "tag"])).is_err());
        assert!(trigger_event(&run_args(&["--input", "a=b"])).is_err());
        assert!(resolve_context(&run_args(&["--set", "novalue"])).is_err());

        let event = trigger_event(&run_args(&["--event", "tag", "--tag", "v1.0.0"])).unwrap();
        assert_eq!(event, TriggerEvent::tag("v1.0.0"));
    }

    #[tokio::test]
    async fn test_run_definition_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yaml");
        std::fs::write(
            &path,
            r#"name: local
jobs:
  build:
    steps:
      - name: compile
        shell: sh
        run: echo "artifact=app-${{ ctx.branch }}" >> "$JOBGRAPH_OUTPUT"
    outputs:
      artifact: ${{ steps.compile.outputs.artifact }}
  ship:
    needs: [build]
    if: ctx.branch == 'main'
    steps:
      - name: deliver
        shell: sh
        run: echo "${{ needs.build.outputs.artifact }}" > shipped.txt
"#,
        )
        .unwrap();

        let artifacts = dir.path().join("artifacts");
        let args = run_args(&[
            path.to_str().unwrap(),
            "--workspace",
            dir.path().to_str().unwrap(),
            "--artifact-dir",
            artifacts.to_str().unwrap(),
            "--json",
        ]);
        let status = run(&CliConfig::default(), args).await.unwrap();

        assert_eq!(status, RunStatus::Succeeded);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("shipped.txt")).unwrap().trim(),
            "app-main"
        );
    }
}
