//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use quire_core::context::{ContextId, StorageContextDescriptor};
use quire_core::models::ProjectRecord;
use quire_core::sync_state::ProjectSyncState;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to encode JSON output: {}", e),
        }
    }

    /// Print configured storage contexts, marking the active one
    pub fn print_contexts(&self, contexts: &[&StorageContextDescriptor], active: &ContextId) {
        match self.format {
            OutputFormat::Human => {
                for ctx in contexts {
                    let marker = if &ctx.id == active { "*" } else { " " };
                    let endpoint = ctx.endpoint.as_deref().unwrap_or("(this device)");
                    let user = ctx
                        .cached_profile
                        .as_ref()
                        .map(|p| format!(" as {}", p.username))
                        .unwrap_or_default();
                    println!(
                        "{} {:<8} | {} | {}{}",
                        marker,
                        ctx.id,
                        truncate(&ctx.display_name, 24),
                        endpoint,
                        user
                    );
                }
                println!("\n{} context(s)", contexts.len());
            }
            OutputFormat::Json => {
                let entries: Vec<_> = contexts
                    .iter()
                    .map(|ctx| serde_json::json!({"active": &ctx.id == active, "context": ctx}))
                    .collect();
                self.json(&entries);
            }
            OutputFormat::Quiet => {
                for ctx in contexts {
                    println!("{}", ctx.id);
                }
            }
        }
    }

    /// Print projects with their sync status
    pub fn print_projects(&self, projects: &[(ProjectRecord, ProjectSyncState)]) {
        match self.format {
            OutputFormat::Human => {
                if projects.is_empty() {
                    println!("No projects found.");
                    return;
                }
                for (project, state) in projects {
                    println!(
                        "{:<30} | {:<12} | {}",
                        truncate(&project.key.to_string(), 30),
                        state.status.as_str(),
                        truncate(&project.title, 40)
                    );
                }
                println!("\n{} project(s)", projects.len());
            }
            OutputFormat::Json => {
                let entries: Vec<_> = projects
                    .iter()
                    .map(|(project, state)| serde_json::json!({"project": project, "sync": state}))
                    .collect();
                self.json(&entries);
            }
            OutputFormat::Quiet => {
                for (project, _) in projects {
                    println!("{}", project.key);
                }
            }
        }
    }

    /// Print a single project
    pub fn print_project(&self, project: &ProjectRecord, state: &ProjectSyncState) {
        match self.format {
            OutputFormat::Human => {
                println!("Project:     {}", project.key);
                println!("Title:       {}", project.title);
                if let Some(ref desc) = project.description {
                    println!("Description: {}", desc);
                }
                if let Some(ref id) = project.remote_id {
                    println!("Remote ID:   {}", id);
                }
                println!("Status:      {}", state.status.as_str());
                if let Some(ref err) = state.last_error {
                    println!("Last error:  {}", err);
                }
                println!("Created:     {}", project.created_at.format("%Y-%m-%d %H:%M"));
                println!("Updated:     {}", project.updated_at.format("%Y-%m-%d %H:%M"));
            }
            OutputFormat::Json => {
                self.json(&serde_json::json!({"project": project, "sync": state}));
            }
            OutputFormat::Quiet => {
                println!("{}", project.key);
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print a failure that does not abort the command
    pub fn failure(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✗ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "error", "message": message})
                );
            }
            OutputFormat::Quiet => eprintln!("{}", message),
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }
}
