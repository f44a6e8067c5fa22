//! End-to-end reconciliation against a scripted remote

mod common;

use common::*;
use quire_core::media::MediaRecord;
use quire_core::models::MetadataPatch;
use quire_core::sync_state::SyncStatus;
use quire_core::{Connectivity, ConnectivityMonitor, DeleteOptions, Reconciler};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn offline_create_is_uploaded_on_reconnect() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    assert_eq!(ws.sync_state().get_state(&novel).status, SyncStatus::Pending);

    // Offline passes never reach the server
    reconciler.run_pass(false).await.unwrap();
    assert!(remote.create_calls().is_empty());
    assert!(ws.sync_state().get_state(&novel).pending_creation.is_some());

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.created, vec![novel.clone()]);

    let state = ws.sync_state().get_state(&novel);
    assert!(state.pending_creation.is_none());
    assert_eq!(state.status, SyncStatus::Synced);
    assert!(state.last_sync_at.is_some());

    let record = ws.get_project(&novel).unwrap().unwrap();
    assert_eq!(record.remote_id.as_deref(), Some("srv-alice-novel"));
    assert_eq!(remote.project(&novel).unwrap().title, "Novel");
}

#[tokio::test]
async fn one_failing_creation_does_not_block_the_others() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let keys: Vec<_> = ["one", "two", "three"]
        .iter()
        .map(|slug| {
            let k = key("alice", slug);
            ws.create_project(&k, draft(slug), None).unwrap();
            k
        })
        .collect();
    remote.fail_slug("two");

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(report.created.len(), 2);
    assert!(report.failures.contains_key(&keys[1]));

    let failed = ws.sync_state().get_state(&keys[1]);
    assert!(failed.pending_creation.is_some());
    assert_eq!(failed.status, SyncStatus::Error);
    assert!(failed.last_error.as_deref().unwrap().contains("503"));

    for k in [&keys[0], &keys[2]] {
        assert_eq!(ws.sync_state().get_state(k).status, SyncStatus::Synced);
    }

    // The next trigger retries only what is still pending
    remote.heal_slug("two");
    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.created, vec![keys[1].clone()]);
    assert_eq!(ws.sync_state().get_state(&keys[1]).status, SyncStatus::Synced);
    assert_eq!(remote.project_count(), 3);
}

#[tokio::test]
async fn duplicate_create_counts_as_success() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    remote.seed_project(&novel, "Created on another device");
    ws.create_project(&novel, draft("Novel"), None).unwrap();

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.created, vec![novel.clone()]);

    let state = ws.sync_state().get_state(&novel);
    assert!(state.pending_creation.is_none());
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(
        ws.get_project(&novel).unwrap().unwrap().remote_id.as_deref(),
        Some("srv-alice-novel")
    );
}

#[tokio::test]
async fn server_assigned_key_replaces_local_placeholder() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let placeholder = key("alice", "draft");
    let assigned = key("alice", "draft-2");
    remote.rename_slug("draft", "draft-2");
    ws.create_project(&placeholder, draft("Draft"), None).unwrap();

    let report = reconciler.run_pass(true).await.unwrap();
    assert_eq!(report.created, vec![assigned.clone()]);

    assert!(ws.get_project(&placeholder).unwrap().is_none());
    assert!(ws.get_project(&assigned).unwrap().is_some());
    // Re-keying is not a user deletion
    assert!(!ws.tombstones().exists(&placeholder).unwrap());
    assert_eq!(ws.sync_state().get_state(&assigned).status, SyncStatus::Synced);
}

#[tokio::test]
async fn remote_tombstone_wins_over_pending_creation() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    remote.tombstone(&novel);

    let report = reconciler.run_pass(true).await.unwrap();
    assert_eq!(report.swept, vec![novel.clone()]);
    assert!(report.created.is_empty());
    assert!(remote.create_calls().is_empty());

    assert!(ws.get_project(&novel).unwrap().is_none());
    assert!(!ws.sync_state().get_state(&novel).has_pending());
    // The sweep itself does not raise a new tombstone
    assert!(!ws.tombstones().exists(&novel).unwrap());
}

#[tokio::test]
async fn tombstoned_project_is_never_created_when_its_delete_fails() {
    let kv: Arc<dyn quire_core::KvStore> = StuckDeletes::new("doc:alice:novel");
    let ws = remote_workspace(kv);
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    let poem = key("alice", "poem");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    ws.create_project(&poem, draft("Poem"), None).unwrap();
    remote.tombstone(&novel);

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.failures.contains_key(&novel));
    assert_eq!(report.created, vec![poem.clone()]);
    assert_eq!(remote.create_calls(), vec![poem]);

    // The delete is retried on the next pass, still without creating it
    let state = ws.sync_state().get_state(&novel);
    assert!(state.pending_creation.is_some());
    assert_eq!(state.status, SyncStatus::Error);

    reconciler.run_pass(true).await.unwrap();
    assert!(remote.project(&novel).is_none());
    assert!(!remote.create_calls().contains(&novel));
}

#[tokio::test]
async fn corrupt_project_is_swept_instead_of_recreated() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    ws.kv()
        .put(ws.namespace(), "doc:alice:novel:elements", b"junk")
        .unwrap();
    remote.tombstone(&novel);

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.swept, vec![novel.clone()]);
    assert!(remote.create_calls().is_empty());
    assert!(ws.get_project(&novel).unwrap().is_none());
}

#[tokio::test]
async fn creations_wait_while_remote_tombstones_are_unknown() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    remote.tombstone(&novel);
    remote.set_tombstone_check_down(true);

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.created.is_empty());
    assert!(remote.create_calls().is_empty());
    assert!(ws.sync_state().get_state(&novel).pending_creation.is_some());

    remote.set_tombstone_check_down(false);
    let report = reconciler.run_pass(true).await.unwrap();
    assert_eq!(report.swept, vec![novel.clone()]);
    assert!(remote.create_calls().is_empty());
}

#[tokio::test]
async fn metadata_and_media_follow_creation() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Reconciler::new(ws.clone(), remote.clone());

    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    reconciler.run_pass(true).await.unwrap();

    ws.update_metadata(
        &novel,
        &MetadataPatch {
            title: Some("Novel".to_string()),
            description: Some("A long story".to_string()),
            ..Default::default()
        },
    )
    .unwrap();
    let cover = MediaRecord::new("cover.png", "image/png", vec![1, 2, 3]);
    ws.add_media(&novel, &cover).unwrap();

    let report = reconciler.run_pass(true).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.metadata_synced, vec![novel.clone()]);
    assert_eq!(report.uploads_synced, 1);

    // The unchanged title never left the device
    let updates = remote.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.title, None);
    assert_eq!(updates[0].1.description.as_deref(), Some("A long story"));
    assert_eq!(remote.uploads(), vec![(novel.clone(), cover.id.clone())]);

    let state = ws.sync_state().get_state(&novel);
    assert!(!state.has_pending());
    assert_eq!(state.status, SyncStatus::Synced);
}

#[tokio::test]
async fn local_delete_leaves_a_durable_tombstone() {
    let ws = remote_workspace(memory_kv());
    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();

    ws.delete_project(&novel, DeleteOptions::default()).unwrap();
    let first = ws.tombstones().get(&novel).unwrap().unwrap();

    // Deleting again keeps the original deletion time
    ws.delete_project(&novel, DeleteOptions::default()).unwrap();
    assert_eq!(ws.tombstones().get(&novel).unwrap().unwrap(), first);

    assert!(ws.create_project(&novel, draft("Novel"), None).is_err());
    assert!(ws.list_projects().unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_triggers_a_background_pass() {
    let ws = remote_workspace(memory_kv());
    let remote = ScriptedRemote::new();
    let reconciler = Arc::new(Reconciler::new(ws.clone(), remote.clone()));
    let monitor = ConnectivityMonitor::new(Connectivity::Offline);
    let handle = reconciler.clone().spawn(monitor.subscribe());

    let novel = key("alice", "novel");
    ws.create_project(&novel, draft("Novel"), None).unwrap();
    monitor.set(Connectivity::Online);

    let mut synced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if ws.sync_state().get_state(&novel).status == SyncStatus::Synced {
            synced = true;
            break;
        }
    }
    assert!(synced, "background pass did not run after reconnect");
    assert_eq!(remote.create_calls(), vec![novel]);

    drop(monitor);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
