//! Storage context command handlers

use anyhow::{bail, Context, Result};

use crate::output::{Output, OutputFormat};
use crate::App;

use super::remote_api;

/// List all contexts
pub fn list(app: &App, output: &Output) -> Result<()> {
    let contexts = app.registry.list();
    output.print_contexts(&contexts, app.registry.active_id());
    Ok(())
}

/// Register a server endpoint
pub fn add(
    app: &mut App,
    endpoint: &str,
    name: Option<&str>,
    activate: bool,
    output: &Output,
) -> Result<()> {
    let descriptor = app
        .registry
        .register(endpoint, name)
        .with_context(|| format!("Failed to add context for {}", endpoint))?;

    if activate {
        app.registry
            .switch_active(&descriptor.id)
            .context("Failed to switch context")?;
    }

    match output.format {
        OutputFormat::Json => output.json(&descriptor),
        OutputFormat::Quiet => println!("{}", descriptor.id),
        OutputFormat::Human => {
            output.success(&format!(
                "Added context {} ({})",
                descriptor.display_name, descriptor.id
            ));
            if !activate {
                println!("Switch to it with: quire context use {}", descriptor.id);
            }
        }
    }
    Ok(())
}

/// Switch the active context
pub fn switch(app: &mut App, id_or_name: &str, output: &Output) -> Result<()> {
    let Some(id) = app.registry.find(id_or_name).map(|d| d.id.clone()) else {
        bail!("No context named '{}'. See `quire context list`.", id_or_name);
    };

    app.registry
        .switch_active(&id)
        .context("Failed to switch context")?;

    let active = app.registry.active();
    output.success(&format!("Now using {} ({})", active.display_name, active.id));
    Ok(())
}

/// Remove a server context
pub fn remove(app: &mut App, id_or_name: &str, output: &Output) -> Result<()> {
    let Some(id) = app.registry.find(id_or_name).map(|d| d.id.clone()) else {
        bail!("No context named '{}'. See `quire context list`.", id_or_name);
    };
    if id.is_local() {
        bail!("The local context cannot be removed");
    }

    app.registry.remove(&id).context("Failed to remove context")?;
    output.success(&format!("Removed context {}", id));

    let active = app.registry.active();
    output.message(&format!("Active context: {} ({})", active.display_name, active.id));
    Ok(())
}

/// Fetch profile and version information from the active server
pub async fn refresh(app: &mut App, output: &Output) -> Result<()> {
    let handle = app.registry.active_handle();
    let api = remote_api(app, &handle)?;

    output.message(&format!("Contacting {}...", handle.endpoint_label()));

    let version = match api.fetch_version().await {
        Ok(v) => Some(v),
        Err(e) => {
            output.failure(&format!("Could not fetch server version: {}", e));
            None
        }
    };
    let profile = match api.fetch_profile().await {
        Ok(p) => Some(p),
        Err(e) => {
            output.failure(&format!("Could not fetch profile: {}", e));
            None
        }
    };

    if profile.is_none() && version.is_none() {
        bail!("Server {} did not respond", handle.endpoint_label());
    }

    app.registry
        .update_cached_info(&handle.id, profile, version)
        .context("Failed to store server information")?;

    let active = app.registry.active();
    match output.format {
        OutputFormat::Json => output.json(&active),
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            if let Some(ref profile) = active.cached_profile {
                println!("Signed in as: {}", profile.username);
            }
            if let Some(ref version) = active.cached_version_info {
                println!("Server:       {}", version.server_version);
            }
        }
    }
    Ok(())
}
