//! Session token command handlers

use anyhow::{bail, Context, Result};

use quire_core::TokenStore;

use crate::output::Output;
use crate::App;

/// Store a session token for the active server
pub fn login(app: &App, token: &str, output: &Output) -> Result<()> {
    let handle = app.registry.active_handle();
    if handle.is_local() {
        bail!("The local context has no server to sign in to");
    }
    let token = token.trim();
    if token.is_empty() {
        bail!("Token is empty");
    }

    TokenStore::new(app.kv.clone())
        .set(&handle, token)
        .context("Failed to store session token")?;

    output.success(&format!("Token saved for {}", handle.endpoint_label()));
    output.message("Run `quire context refresh` to fetch your profile.");
    Ok(())
}

/// Forget the session token of the active server
pub fn logout(app: &App, output: &Output) -> Result<()> {
    let handle = app.registry.active_handle();
    if handle.is_local() {
        bail!("The local context has no server session");
    }

    TokenStore::new(app.kv.clone())
        .clear(&handle)
        .context("Failed to remove session token")?;

    output.success(&format!("Signed out of {}", handle.endpoint_label()));
    Ok(())
}
