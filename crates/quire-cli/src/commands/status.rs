//! Status command handler

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use quire_core::{SyncStatus, TokenStore};

use crate::output::{Output, OutputFormat};
use crate::App;

use super::active_workspace;

/// Show the active context and what is waiting to sync
pub fn show(app: &App, output: &Output) -> Result<()> {
    let active = app.registry.active();
    let handle = active.handle();
    let workspace = active_workspace(app);

    let projects = workspace.list_projects()?;
    let states = workspace
        .sync_state()
        .all_states()
        .context("Failed to read sync state")?;
    let pending = workspace
        .sync_state()
        .projects_with_pending_changes()
        .context("Failed to read sync state")?;
    let tombstones = workspace
        .tombstones()
        .list_all()
        .context("Failed to read tombstones")?;
    let signed_in = if handle.is_local() {
        false
    } else {
        TokenStore::new(app.kv.clone())
            .get(&handle)
            .context("Failed to read session token")?
            .is_some()
    };

    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for state in &states {
        *by_status.entry(state.status.as_str()).or_default() += 1;
    }
    let errors: Vec<_> = states
        .iter()
        .filter(|s| s.status == SyncStatus::Error)
        .collect();

    match output.format {
        OutputFormat::Json => {
            output.json(&serde_json::json!({
                "context": active,
                "signed_in": signed_in,
                "data_dir": app.config.data_dir,
                "projects": projects.len(),
                "pending": pending,
                "tombstones": tombstones.len(),
                "by_status": by_status,
                "errors": errors,
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", active.id);
        }
        OutputFormat::Human => {
            println!("Quire Status");
            println!("============");
            println!();
            println!("Context:     {} ({})", active.display_name, active.id);
            println!("Server:      {}", handle.endpoint_label());
            if !handle.is_local() {
                let user = active
                    .cached_profile
                    .as_ref()
                    .map(|p| p.username.as_str())
                    .unwrap_or("(unknown)");
                println!("User:        {}", user);
                println!("Signed in:   {}", if signed_in { "yes" } else { "no" });
            }
            println!("Data dir:    {}", app.config.data_dir.display());
            println!();
            println!("Projects:    {}", projects.len());
            println!("Pending:     {}", pending.len());
            println!("Tombstones:  {}", tombstones.len());
            for (status, count) in &by_status {
                println!("  {:<12} {}", status, count);
            }

            if !errors.is_empty() {
                println!();
                println!("Sync errors:");
                for state in errors {
                    println!(
                        "  {}: {}",
                        state.project_key,
                        state.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
        }
    }

    Ok(())
}
