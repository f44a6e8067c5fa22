//! Project command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};

use quire_core::{DeleteOptions, MediaRecord, MetadataPatch, ProjectDraft, ProjectKey};

use crate::output::{Output, OutputFormat};
use crate::App;

use super::{active_workspace, confirm, default_owner};

fn parse_key(key: &str) -> Result<ProjectKey> {
    ProjectKey::parse(key)
        .with_context(|| format!("Invalid project key '{}' (expected owner/slug)", key))
}

/// List projects in the active context
pub fn list(app: &App, output: &Output) -> Result<()> {
    let workspace = active_workspace(app);
    let projects = workspace
        .list_projects()?
        .into_iter()
        .map(|p| {
            let state = workspace.sync_state().get_state(&p.key);
            (p, state)
        })
        .collect::<Vec<_>>();

    output.print_projects(&projects);
    Ok(())
}

/// Show one project
pub fn show(app: &App, key: &str, output: &Output) -> Result<()> {
    let key = parse_key(key)?;
    let workspace = active_workspace(app);
    let Some(project) = workspace.get_project(&key)? else {
        bail!("Project not found: {}", key);
    };

    let state = workspace.sync_state().get_state(&key);
    output.print_project(&project, &state);
    Ok(())
}

/// Create a project
pub fn create(
    app: &App,
    slug: &str,
    title: String,
    description: Option<String>,
    template: Option<String>,
    owner: Option<String>,
    output: &Output,
) -> Result<()> {
    let owner = match owner {
        Some(owner) => owner,
        None => default_owner(app, &app.registry.active())?,
    };
    let key = ProjectKey::new(owner, slug).context("Invalid project key")?;

    let workspace = active_workspace(app);
    let project = workspace.create_project(&key, ProjectDraft { title, description }, template)?;

    let state = workspace.sync_state().get_state(&key);
    if output.should_prompt() {
        output.success(&format!("Created project {}", project.key));
        if state.pending_creation.is_some() {
            println!("It will be created on the server on the next `quire sync`.");
        }
    } else {
        output.print_project(&project, &state);
    }
    Ok(())
}

/// Edit project metadata
pub fn edit(
    app: &App,
    key: &str,
    title: Option<String>,
    description: Option<String>,
    output: &Output,
) -> Result<()> {
    let key = parse_key(key)?;
    if title.is_none() && description.is_none() {
        bail!("Nothing to change. Pass --title and/or --description.");
    }

    let workspace = active_workspace(app);
    let patch = MetadataPatch {
        title,
        description,
        ..Default::default()
    };
    let project = workspace.update_metadata(&key, &patch)?;

    let state = workspace.sync_state().get_state(&key);
    if output.should_prompt() {
        output.success(&format!("Updated project {}", project.key));
    } else {
        output.print_project(&project, &state);
    }
    Ok(())
}

/// Attach a media file to a project
pub fn attach(app: &App, key: &str, file: &Path, mime: &str, output: &Output) -> Result<()> {
    let key = parse_key(key)?;
    let data = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());

    let record = MediaRecord::new(filename, mime, data);
    active_workspace(app).add_media(&key, &record)?;

    match output.format {
        OutputFormat::Quiet => println!("{}", record.id),
        _ => output.success(&format!(
            "Attached {} to {} ({} bytes)",
            record.filename,
            key,
            record.data.len()
        )),
    }
    Ok(())
}

/// Delete a project
///
/// The deletion leaves a tombstone, so a pending server-side creation of the
/// same project is cancelled rather than resurrected.
pub fn delete(app: &App, key: &str, output: &Output) -> Result<()> {
    let key = parse_key(key)?;
    let workspace = active_workspace(app);
    let Some(project) = workspace.get_project(&key)? else {
        bail!("Project not found: {}", key);
    };

    if output.should_prompt() {
        println!("Delete project: {} - {}", key, project.title);
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    workspace.delete_project(&key, DeleteOptions::default())?;
    output.success(&format!("Deleted project {}", key));
    Ok(())
}
