use std::sync::Arc;

use strata_cache::ArtifactStore;
use strata_index::services::{
    begin_standard_transaction, ArtifactMode, ArtifactTransaction, ClassIndexEventsTransaction,
    ModifiedFilesRegistry, ModifiedFilesTransaction, ServiceEnv,
};
use strata_index::{IndexError, ServiceKind, TransactionError};
use url::Url;

use super::support::{handles, RecordingListener, Workspace};

fn env(ws: &Workspace, listener: Arc<RecordingListener>) -> ServiceEnv {
    ServiceEnv {
        cache_dir: ws.cache.clone(),
        attributes: ws.attributes.clone(),
        listeners: vec![listener],
        modified_files: ModifiedFilesRegistry::new(),
    }
}

#[test]
fn standard_services_are_registered_in_commit_order() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let listener = Arc::new(RecordingListener::default());
    let mut tx = begin_standard_transaction(&root, &env(&ws, listener)).unwrap();

    assert_eq!(
        tx.kinds(),
        vec![
            ServiceKind::Artifacts,
            ServiceKind::GeneratedFiles,
            ServiceKind::PersistentIndex,
            ServiceKind::CacheAttributes,
            ServiceKind::ClassIndexEvents,
            ServiceKind::ModifiedFiles,
        ]
    );
    tx.commit().unwrap();
    assert!(matches!(
        tx.get::<ArtifactTransaction>(),
        Err(IndexError::Transaction(TransactionError::Finished))
    ));
}

#[test]
fn events_and_modified_files_are_published_only_on_commit() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let listener = Arc::new(RecordingListener::default());
    let env = env(&ws, Arc::clone(&listener));
    let file = Url::parse("file:///work/app/p/A.java").unwrap();

    let mut tx = begin_standard_transaction(&root, &env).unwrap();
    tx.get_mut::<ClassIndexEventsTransaction>()
        .unwrap()
        .added_types(handles(&["p.A"]));
    tx.get_mut::<ModifiedFilesTransaction>()
        .unwrap()
        .record([file.clone()]);
    tx.roll_back().unwrap();
    assert!(listener.events.lock().unwrap().is_empty());
    assert!(env.modified_files.modified(&root).is_empty());

    let mut tx = begin_standard_transaction(&root, &env).unwrap();
    tx.get_mut::<ClassIndexEventsTransaction>()
        .unwrap()
        .added_types(handles(&["p.A"]));
    tx.get_mut::<ModifiedFilesTransaction>()
        .unwrap()
        .record([file.clone()]);
    tx.commit().unwrap();

    let events = listener.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].root, root);
    assert_eq!(events[0].added, handles(&["p.A"]));
    assert_eq!(env.modified_files.take(&root).into_iter().collect::<Vec<_>>(), vec![file]);
}

#[test]
fn dropped_transaction_discards_staged_artifacts() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let store = ws.artifacts(&root);
    store.write_artifact("p.A", b"committed").unwrap();
    let env = env(&ws, Arc::new(RecordingListener::default()));

    {
        let tx = begin_standard_transaction(&root, &env).unwrap();
        let artifacts = tx.get::<ArtifactTransaction>().unwrap();
        assert_eq!(artifacts.mode(), ArtifactMode::WriteBack);
        artifacts.write_artifact("p.A", b"staged").unwrap();
        artifacts.write_artifact("p.B", b"staged").unwrap();
        assert_eq!(
            artifacts.read_artifact("p.B").unwrap().as_deref(),
            Some(&b"staged"[..])
        );
    }

    assert_eq!(
        store.read_artifact("p.A").unwrap().as_deref(),
        Some(&b"committed"[..])
    );
    assert_eq!(store.read_artifact("p.B").unwrap(), None);

    // The thread-local slot was released by the drop.
    let mut tx = begin_standard_transaction(&root, &env).unwrap();
    tx.commit().unwrap();
}

#[test]
#[should_panic(expected = "nested transaction")]
fn nested_transactions_on_one_thread_panic() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let env = env(&ws, Arc::new(RecordingListener::default()));
    let _outer = begin_standard_transaction(&root, &env).unwrap();
    let _inner = begin_standard_transaction(&root, &env);
}
