//! Command handlers

pub mod context;
pub mod login;
pub mod migrate;
pub mod project;
pub mod status;
pub mod sync;

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use quire_core::{ContextHandle, HttpProjectApi, StorageContextDescriptor, TokenStore, Workspace};

use crate::App;

/// Workspace of the active context
pub fn active_workspace(app: &App) -> Workspace {
    Workspace::open(app.kv.clone(), app.registry.active_handle())
}

/// Owner name for new projects in a context
///
/// Local-only mode uses the configured local owner; a server context uses the
/// username cached by `quire context refresh`.
pub fn default_owner(app: &App, descriptor: &StorageContextDescriptor) -> Result<String> {
    if descriptor.id.is_local() {
        return Ok(app.config.local_owner.clone());
    }
    match descriptor.cached_profile {
        Some(ref profile) => Ok(profile.username.clone()),
        None => bail!(
            "No signed-in user known for {}. Run:\n  quire login <token>\n  quire context refresh",
            descriptor.display_name
        ),
    }
}

/// HTTP client for a remote context
pub fn remote_api(app: &App, handle: &ContextHandle) -> Result<Arc<HttpProjectApi>> {
    if handle.is_local() {
        bail!("The local context has no server. Switch with `quire context use <id>`.");
    }
    let api = HttpProjectApi::new(
        handle,
        TokenStore::new(app.kv.clone()),
        app.config.request_timeout(),
    )
    .with_context(|| format!("Failed to create client for {}", handle.endpoint_label()))?;
    Ok(Arc::new(api))
}

/// Ask a yes/no question on the terminal; anything but yes is no
pub fn confirm(prompt: &str) -> Result<bool> {
    use std::io::{self, IsTerminal, Write};

    if !io::stdin().is_terminal() {
        return Ok(false);
    }

    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    let input = input.trim().to_lowercase();
    Ok(input == "y" || input == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::context::CachedProfile;
    use quire_core::{Config, ContextRegistry, MemoryKvStore, ProjectDraft, ProjectKey};
    use tempfile::TempDir;

    fn test_app(dir: &TempDir) -> App {
        let kv: Arc<dyn quire_core::KvStore> = Arc::new(MemoryKvStore::new());
        let registry = ContextRegistry::open(kv.clone()).unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            local_owner: "writer".to_string(),
            ..Config::default()
        };
        App {
            config,
            kv,
            registry,
        }
    }

    #[test]
    fn test_local_context_uses_configured_owner() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let owner = default_owner(&app, &app.registry.active()).unwrap();
        assert_eq!(owner, "writer");
    }

    #[test]
    fn test_remote_owner_requires_profile() {
        let dir = TempDir::new().unwrap();
        let mut app = test_app(&dir);
        let descriptor = app
            .registry
            .register("https://quire.example.com", None)
            .unwrap();
        assert!(default_owner(&app, &descriptor).is_err());

        let profile = CachedProfile {
            username: "alice".to_string(),
            display_name: None,
        };
        app.registry
            .update_cached_info(&descriptor.id, Some(profile), None)
            .unwrap();
        let descriptor = app.registry.get(&descriptor.id).unwrap().clone();
        assert_eq!(default_owner(&app, &descriptor).unwrap(), "alice");
    }

    #[test]
    fn test_local_context_has_no_remote() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        assert!(remote_api(&app, &app.registry.active_handle()).is_err());
    }

    #[test]
    fn test_active_workspace_follows_switch() {
        let dir = TempDir::new().unwrap();
        let mut app = test_app(&dir);
        let key = ProjectKey::new("writer", "novel").unwrap();
        active_workspace(&app)
            .create_project(
                &key,
                ProjectDraft {
                    title: "Novel".to_string(),
                    description: None,
                },
                None,
            )
            .unwrap();

        let remote = app
            .registry
            .register("https://quire.example.com", None)
            .unwrap();
        app.registry.switch_active(&remote.id).unwrap();

        assert!(active_workspace(&app).get_project(&key).unwrap().is_none());
    }
}
