//! Migrating local projects into a server context

mod common;

use common::*;
use quire_core::document::{ContentDocument, Element, ElementKind};
use quire_core::media::MediaRecord;
use quire_core::migration::{MigrationProgress, StageStatus};
use quire_core::storage::SqliteKvStore;
use quire_core::sync_state::SyncStatus;
use quire_core::{
    ContextRegistry, KvStore, MigrationEngine, MigrationRequest, MigrationStage, Reconciler,
    Workspace,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Create a local project with one chapter and one image
fn seed_local(ws: &Workspace, slug: &str, text: &str) -> String {
    let k = key("local", slug);
    ws.create_project(&k, draft(slug), None).unwrap();

    let chapter = Element::new("Chapter 1", ElementKind::Document);
    let mut structure = ws
        .documents()
        .load_project(ws.namespace(), &k)
        .unwrap()
        .unwrap_or_default();
    structure.put_element(&chapter).unwrap();
    ws.documents()
        .save_project(ws.namespace(), &k, &mut structure)
        .unwrap();

    let mut body = ContentDocument::new();
    body.set_text(text).unwrap();
    ws.documents().save_content(&k, &chapter.id, &mut body).unwrap();

    ws.add_media(&k, &MediaRecord::new("map.png", "image/png", vec![9; 16]))
        .unwrap();
    chapter.id
}

#[tokio::test]
async fn migrated_projects_reach_the_server() {
    let kv = memory_kv();
    let local = local_workspace(kv.clone());
    let target = remote_workspace(kv.clone());

    let chapter = seed_local(&local, "novel", "It was a dark night.");
    seed_local(&local, "notes", "Ideas.");

    let mut progress: Vec<(MigrationStage, StageStatus)> = Vec::new();
    let report = MigrationEngine::new(&local, &target)
        .run(&MigrationRequest::new("alice"), |p: &MigrationProgress| {
            progress.push((p.stage, p.status.clone()))
        })
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(
        progress
            .iter()
            .filter(|(_, s)| *s == StageStatus::Completed)
            .count(),
        2 * MigrationStage::ALL.len()
    );

    // The migrated copy is complete before anything is sent
    let migrated = key("alice", "novel");
    let body = target
        .documents()
        .load_content(&migrated, &chapter)
        .unwrap()
        .unwrap();
    assert_eq!(body.text().unwrap(), "It was a dark night.");
    assert_eq!(target.media().list(&migrated).unwrap().len(), 1);

    let state = target.sync_state().get_state(&migrated);
    assert!(state.pending_creation.is_some());
    assert_eq!(state.pending_uploads.len(), 1);

    // The source is untouched
    assert_eq!(local.list_projects().unwrap().len(), 2);

    let remote = ScriptedRemote::new();
    let pass = Reconciler::new(target.clone(), remote.clone())
        .run_pass(true)
        .await
        .unwrap();
    assert!(pass.is_success());
    assert_eq!(pass.created.len(), 2);
    assert_eq!(pass.uploads_synced, 2);
    assert_eq!(
        target.sync_state().get_state(&migrated).status,
        SyncStatus::Synced
    );
}

#[test]
fn repeating_a_migration_copies_nothing_twice() {
    let kv = memory_kv();
    let local = local_workspace(kv.clone());
    let target = remote_workspace(kv.clone());
    seed_local(&local, "novel", "Once.");

    let engine = MigrationEngine::new(&local, &target);
    let first = engine
        .run(&MigrationRequest::new("alice"), |_| {})
        .unwrap();
    assert_eq!(first.outcomes.len(), 1);

    let record = engine
        .migration_record(&key("local", "novel"))
        .unwrap()
        .unwrap();
    assert_eq!(record.migrated_key, key("alice", "novel"));
    assert_eq!(record.target_endpoint, ENDPOINT);

    assert!(engine.eligible_projects().unwrap().is_empty());
    let second = engine
        .run(&MigrationRequest::new("alice"), |_| {})
        .unwrap();
    assert!(second.outcomes.is_empty());

    // Re-running a stage by hand is harmless
    engine
        .run_stage(
            MigrationStage::Elements,
            &key("local", "novel"),
            &key("alice", "novel"),
        )
        .unwrap();
    let structure = target
        .documents()
        .load_project(target.namespace(), &key("alice", "novel"))
        .unwrap()
        .unwrap();
    assert_eq!(structure.elements().unwrap().len(), 1);
}

#[test]
fn contexts_survive_restart_and_stay_isolated() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("quire.db");

    {
        let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&db_path).unwrap());
        let mut registry = ContextRegistry::open(kv.clone()).unwrap();
        let descriptor = registry.register(ENDPOINT, Some("Example")).unwrap();
        registry.switch_active(&descriptor.id).unwrap();

        let server = Workspace::open(kv.clone(), registry.active_handle());
        server
            .create_project(&key("alice", "novel"), draft("Novel"), None)
            .unwrap();

        let local = Workspace::open(kv, registry.handle(&quire_core::ContextId::local()).unwrap());
        local
            .create_project(&key("local", "diary"), draft("Diary"), None)
            .unwrap();
    }

    let kv: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&db_path).unwrap());
    let registry = ContextRegistry::open(kv.clone()).unwrap();
    let active = registry.active_handle();
    assert!(!active.is_local());
    assert_eq!(active.endpoint.as_deref(), Some(ENDPOINT));

    let server = Workspace::open(kv.clone(), active);
    let titles: Vec<_> = server
        .list_projects()
        .unwrap()
        .into_iter()
        .map(|p| p.title)
        .collect();
    assert_eq!(titles, vec!["Novel".to_string()]);
    assert!(server
        .sync_state()
        .get_state(&key("alice", "novel"))
        .pending_creation
        .is_some());

    let local = Workspace::open(kv, quire_core::ContextHandle::local());
    assert_eq!(local.list_projects().unwrap().len(), 1);
    assert!(local
        .get_project(&key("alice", "novel"))
        .unwrap()
        .is_none());
}
