//! Local pipeline execution command.

use crate::RunArgs;
use anyhow::{Context, Result};
use pinbuild_config::load_pipeline;
use pinbuild_core::BuildEnvironment;
use pinbuild_core::pipeline::{RunRequest, RunSettings};
use pinbuild_executor::LocalProcessExecutor;
use pinbuild_scheduler::{PipelineEvent, PipelineOrchestrator};
use std::path::Path;
use std::sync::Arc;

/// Run the pipeline for one parent revision.
pub async fn run(config_path: &Path, cache_root: &Path, args: RunArgs) -> Result<()> {
    let definition = load_pipeline(config_path)
        .with_context(|| format!("Failed to load pipeline config: {}", config_path.display()))?;

    std::fs::create_dir_all(&args.workspace).with_context(|| {
        format!("Failed to create workspace: {}", args.workspace.display())
    })?;
    let workspace = args
        .workspace
        .canonicalize()
        .context("Failed to resolve workspace directory")?;

    let output_root = args.output_dir.clone().unwrap_or_else(|| workspace.clone());
    let mut settings = RunSettings::new(cache_root, &output_root);
    if let Some(dir) = args.artifacts_dir.clone() {
        settings.artifacts_dir = dir;
    }
    if let Some(dir) = args.results_dir.clone() {
        settings.results_dir = dir;
    }
    settings.ci = args.ci;

    println!("Running pipeline: {}", definition.name);
    println!(
        "  {} @ {} ({})",
        definition.parent.component.name, args.revision, args.branch
    );
    println!("  workspace: {}", workspace.display());
    println!("  cache:     {}", cache_root.display());

    let request = RunRequest {
        workspace,
        parent_remote: args.remote,
        parent_branch: args.branch,
        parent_revision: args.revision,
        dependency_remote: args.dependency_remote,
        dependency_revision: args.dependency_revision,
    };

    let executor = Arc::new(LocalProcessExecutor::new());
    let orchestrator = PipelineOrchestrator::new(executor, definition, settings)
        .with_base_environment(BuildEnvironment::from_process());

    println!("\n--- Starting pipeline execution ---\n");

    let (mut rx, result_handle) = orchestrator.execute(request);

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::StateEntered { state } => {
                println!("▶ {}", state);
            }
            PipelineEvent::StateCompleted { state } => {
                println!("✓ {}", state);
            }
            PipelineEvent::PipelineCompleted { success } => {
                if success {
                    println!("\n--- Pipeline completed successfully ---");
                } else {
                    println!("\n--- Pipeline failed ---");
                }
            }
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    match result {
        Ok(summary) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
                return Ok(());
            }
            println!("\n--- Summary ---");
            println!(
                "  dependency: {} ({})",
                summary.dependency.revision,
                if summary.dependency_cache_hit {
                    "cached"
                } else {
                    "built"
                }
            );
            println!("  built against: {}", summary.dependency_dir.display());
            if summary.release {
                println!("  release version stamped");
            }
            if let Some(record) = &summary.package_record {
                println!("  package: {}", record.file_name);
            }
            if let Some(report) = &summary.report {
                println!("  test report: {}", report.path.display());
            }
            println!("\n✓ Pipeline succeeded!");
            Ok(())
        }
        Err(failure) => {
            println!("\n✗ Failed in {} ({})", failure.stage, failure.source.kind());
            Err(failure.into())
        }
    }
}
