//! Sync command handlers

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::debug;

use quire_core::{Connectivity, ConnectivityMonitor, PassReport, Reconciler, RemoteProjectApi};

use crate::output::{Output, OutputFormat};
use crate::App;

use super::{active_workspace, remote_api};

/// Run one reconciliation pass against the active server
pub async fn sync(app: &App, output: &Output) -> Result<()> {
    let workspace = Arc::new(active_workspace(app));
    let api = remote_api(app, workspace.context())?;

    output.message(&format!("Syncing with {}...", workspace.context().endpoint_label()));

    let online = api.fetch_version().await.is_ok();
    if !online {
        output.message("Server unreachable; only local cleanup will run.");
    }

    let remote: Arc<dyn RemoteProjectApi> = api;
    let reconciler = Reconciler::new(workspace, remote);
    let Some(report) = reconciler.run_pass(online).await else {
        bail!("A sync is already running");
    };

    print_report(&report, output);

    if !report.is_success() {
        bail!("{} project(s) failed to sync", report.failures.len());
    }
    Ok(())
}

/// Reconcile every time the server becomes reachable, until interrupted
pub async fn watch(app: &App, interval_secs: u64, output: &Output) -> Result<()> {
    let workspace = Arc::new(active_workspace(app));
    let api = remote_api(app, workspace.context())?;
    let remote: Arc<dyn RemoteProjectApi> = api.clone();

    let monitor = ConnectivityMonitor::new(Connectivity::Offline);
    let reconciler = Arc::new(Reconciler::new(workspace.clone(), remote));
    let handle = reconciler.spawn(monitor.subscribe());

    output.message(&format!(
        "Watching {} (Ctrl-C to stop)...",
        workspace.context().endpoint_label()
    ));

    let interval = Duration::from_secs(interval_secs.max(1));
    let check = || async {
        match api.fetch_version().await {
            Ok(_) => Connectivity::Online,
            Err(e) => {
                debug!(error = %e, "Server unreachable");
                Connectivity::Offline
            }
        }
    };
    let stop = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    poll_connectivity(interval, check, stop, &monitor, output).await;

    drop(monitor);
    let _ = handle.await;
    output.message("Stopped.");
    Ok(())
}

/// Feed reachability checks into `monitor` every `interval` until `stop` resolves
///
/// A check that hangs does not delay `stop`.
async fn poll_connectivity<C, F>(
    interval: Duration,
    mut check: C,
    stop: impl Future<Output = ()>,
    monitor: &ConnectivityMonitor,
    output: &Output,
) where
    C: FnMut() -> F,
    F: Future<Output = Connectivity>,
{
    tokio::pin!(stop);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut stop => break,
        }

        let connectivity = tokio::select! {
            connectivity = check() => connectivity,
            _ = &mut stop => break,
        };
        if connectivity != monitor.current() {
            output.message(match connectivity {
                Connectivity::Online => "Server reachable, reconciling",
                Connectivity::Offline => "Server unreachable, waiting",
            });
        }
        monitor.set(connectivity);
    }
}

fn print_report(report: &PassReport, output: &Output) {
    match output.format {
        OutputFormat::Json => {
            let failures: BTreeMap<String, &str> = report
                .failures
                .iter()
                .map(|(key, error)| (key.to_string(), error.as_str()))
                .collect();
            output.json(&serde_json::json!({
                "success": report.is_success(),
                "swept": report.swept,
                "created": report.created,
                "metadata_synced": report.metadata_synced,
                "uploads_synced": report.uploads_synced,
                "failures": failures,
            }));
        }
        OutputFormat::Quiet => {}
        OutputFormat::Human => {
            if report.swept.is_empty()
                && report.created.is_empty()
                && report.metadata_synced.is_empty()
                && report.uploads_synced == 0
                && report.failures.is_empty()
            {
                output.success("Sync complete - nothing to do");
                return;
            }
            for key in &report.swept {
                println!("  removed   {} (deleted on the server)", key);
            }
            for key in &report.created {
                println!("  created   {}", key);
            }
            for key in &report.metadata_synced {
                println!("  updated   {}", key);
            }
            if report.uploads_synced > 0 {
                println!("  uploaded  {} media file(s)", report.uploads_synced);
            }
            for (key, error) in &report.failures {
                output.failure(&format!("{}: {}", key, error));
            }
            if report.is_success() {
                output.success("Sync complete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_stop_interrupts_a_hung_check() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let output = Output::new(OutputFormat::Quiet);

        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            poll_connectivity(
                Duration::from_millis(10),
                std::future::pending::<Connectivity>,
                tokio::time::sleep(Duration::from_millis(50)),
                &monitor,
                &output,
            ),
        )
        .await;
        assert!(finished.is_ok());
        assert_eq!(monitor.current(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_checks_update_the_monitor() {
        let monitor = ConnectivityMonitor::new(Connectivity::Offline);
        let output = Output::new(OutputFormat::Quiet);
        let calls = AtomicUsize::new(0);

        poll_connectivity(
            Duration::from_millis(10),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Connectivity::Online }
            },
            tokio::time::sleep(Duration::from_millis(100)),
            &monitor,
            &output,
        )
        .await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(monitor.current(), Connectivity::Online);
    }
}
