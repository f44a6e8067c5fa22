//! Migrate command handler

use anyhow::{bail, Context, Result};

use quire_core::migration::{MigrationProgress, StageStatus};
use quire_core::{MigrationEngine, MigrationRequest, ProjectKey, Workspace};

use crate::output::{Output, OutputFormat};
use crate::App;

use super::{active_workspace, default_owner};

/// Copy projects from the active context into `to`
pub fn migrate(
    app: &App,
    to: &str,
    owner: Option<String>,
    projects: Vec<String>,
    renames: Vec<String>,
    output: &Output,
) -> Result<()> {
    let Some(target) = app.registry.find(to).cloned() else {
        bail!("No context named '{}'. See `quire context list`.", to);
    };
    if &target.id == app.registry.active_id() {
        bail!("Cannot migrate a context into itself");
    }

    let owner = match owner {
        Some(owner) => owner,
        None => default_owner(app, &target)?,
    };

    let mut request = MigrationRequest::new(owner);
    if !projects.is_empty() {
        let keys = projects
            .iter()
            .map(|p| {
                ProjectKey::parse(p).with_context(|| format!("Invalid project key '{}'", p))
            })
            .collect::<Result<Vec<_>>>()?;
        request = request.with_projects(keys);
    }
    for rename in &renames {
        let Some((key, slug)) = rename.split_once('=') else {
            bail!("Invalid rename '{}' (expected owner/slug=new-slug)", rename);
        };
        let key = ProjectKey::parse(key).with_context(|| format!("Invalid project key '{}'", key))?;
        request = request.with_rename(key, slug);
    }

    let source = active_workspace(app);
    let target_workspace = Workspace::open(app.kv.clone(), target.handle());
    let engine = MigrationEngine::new(&source, &target_workspace);

    let human = output.format == OutputFormat::Human;
    let report = engine
        .run(&request, |progress: &MigrationProgress| {
            if human {
                print_progress(progress);
            }
        })
        .context("Migration failed")?;

    match output.format {
        OutputFormat::Json => {
            let outcomes: Vec<_> = report
                .outcomes
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "original": o.original_key,
                        "migrated": o.migrated_key,
                        "failed_stage": o.failure.as_ref().map(|f| f.stage),
                        "error": o.failure.as_ref().map(|f| f.message.as_str()),
                    })
                })
                .collect();
            output.json(&serde_json::json!({
                "target": target.id,
                "success": report.is_success(),
                "outcomes": outcomes,
            }));
        }
        OutputFormat::Quiet => {
            for outcome in report.succeeded() {
                println!("{}", outcome.migrated_key);
            }
        }
        OutputFormat::Human => {
            let ok = report.succeeded().count();
            if report.outcomes.is_empty() {
                println!("Nothing to migrate.");
            } else {
                println!();
                output.success(&format!(
                    "Migrated {} of {} project(s) to {}",
                    ok,
                    report.outcomes.len(),
                    target.display_name
                ));
            }
            for outcome in report.failed() {
                if let Some(ref failure) = outcome.failure {
                    output.failure(&format!(
                        "{} failed at {}: {}",
                        outcome.original_key, failure.stage, failure.message
                    ));
                }
            }
            if report.failed().next().is_some() {
                println!("Run the same command again to retry the failed projects.");
            }
        }
    }

    if !report.is_success() {
        bail!("Some projects could not be migrated");
    }
    Ok(())
}

fn print_progress(progress: &MigrationProgress) {
    match progress.status {
        StageStatus::Started => println!(
            "[{}/{}] {} {}...",
            progress.index + 1,
            progress.total,
            progress.project,
            progress.stage
        ),
        StageStatus::Completed => {}
        StageStatus::Failed(ref message) => {
            println!("  {} failed: {}", progress.stage, message)
        }
    }
}
