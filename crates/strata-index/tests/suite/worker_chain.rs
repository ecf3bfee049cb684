use std::sync::atomic::Ordering;

use strata_cache::ArtifactStore;
use strata_index::prefetch::{CompileTuple, PrefetchEnv};
use strata_index::services::{
    begin_standard_transaction, ArtifactTransaction, ModifiedFilesRegistry,
    PersistentIndexTransaction, ServiceEnv,
};
use strata_index::worker::{run_worker_chain, CompileContext};
use strata_index::{
    Artifact, CompileStatus, CompileWorkerProvider, FixedMemoryStatus, MemoryStatus,
    StandardWorkers, Transaction,
};
use strata_core::RootUrl;
use strata_scheduler::CancellationToken;

use super::support::{FakeBinaryCache, FakeCompiler, FlakyMemory, Workspace};

fn open(ws: &Workspace, root: &RootUrl) -> Transaction {
    let env = ServiceEnv {
        cache_dir: ws.cache.clone(),
        attributes: ws.attributes.clone(),
        listeners: Vec::new(),
        modified_files: ModifiedFilesRegistry::new(),
    };
    begin_standard_transaction(root, &env).unwrap()
}

fn tuple(ws: &Workspace, root: &RootUrl, path: &str, text: &str) -> CompileTuple {
    let indexable = ws.write(root, path, text);
    let file = indexable.to_path().unwrap();
    CompileTuple::file(indexable, file)
}

fn run(
    tx: &mut Transaction,
    root: &RootUrl,
    workers: &StandardWorkers,
    memory: &dyn MemoryStatus,
    token: &CancellationToken,
    batch: &[CompileTuple],
) -> strata_index::CompileOutput {
    let prefetch = PrefetchEnv::sequential();
    let chain = workers.workers(root);
    let mut ctx = CompileContext {
        root,
        tx,
        prefetch: &prefetch,
        memory,
        token,
    };
    run_worker_chain(&chain, &mut ctx, batch)
}

#[test]
fn crash_in_first_worker_is_retried_by_the_next() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let batch = vec![
        tuple(&ws, &root, "p/A.java", "class p.A\ncrash\n"),
        tuple(&ws, &root, "p/B.java", "class p.B extends p.A\n"),
    ];
    let compiler = FakeCompiler::crashing(2);
    let workers = StandardWorkers::new(compiler.clone());
    let mut tx = open(&ws, &root);

    let out = run(
        &mut tx,
        &root,
        &workers,
        &FixedMemoryStatus::default(),
        &CancellationToken::new(),
        &batch,
    );

    assert_eq!(out.status, CompileStatus::Success);
    assert_eq!(out.finished_files.len(), 2);
    assert_eq!(compiler.analyzed(), 2);
    let artifacts = tx.get::<ArtifactTransaction>().unwrap();
    let a = artifacts.read_artifact("p.A").unwrap().unwrap();
    assert!(String::from_utf8(a).unwrap().starts_with("p.A|class p.A"));
    assert_eq!(
        artifacts.read_manifest("p/B.java").unwrap(),
        Some(vec!["p.B".to_string()])
    );
}

#[test]
fn persistent_crash_falls_back_to_binary_cache() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let batch = vec![tuple(&ws, &root, "p/A.java", "class p.A\ncrash\n")];
    let compiler = FakeCompiler::crashing(usize::MAX);
    let workers = StandardWorkers::new(compiler.clone()).with_binary_cache(FakeBinaryCache::with(
        "p/A.java",
        vec![Artifact::new("p.A", "prebuilt")],
    ));
    let mut tx = open(&ws, &root);

    let out = run(
        &mut tx,
        &root,
        &workers,
        &FixedMemoryStatus::default(),
        &CancellationToken::new(),
        &batch,
    );

    assert_eq!(out.status, CompileStatus::Success);
    assert_eq!(compiler.analyzed(), 0);
    assert!(out.finished_files.contains(batch[0].url()));
    assert_eq!(
        tx.get::<ArtifactTransaction>()
            .unwrap()
            .read_artifact("p.A")
            .unwrap()
            .as_deref(),
        Some(&b"prebuilt"[..])
    );
    let index = tx.get::<PersistentIndexTransaction>().unwrap();
    let facts = index.class_index().facts(batch[0].url()).unwrap();
    assert!(facts.has_errors);
    assert!(facts.dirty);
    assert_eq!(facts.declared, vec!["p.A".to_string()]);
}

#[test]
fn low_memory_frees_caches_and_retries_the_same_worker() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let batch = vec![
        tuple(&ws, &root, "p/A.java", "class p.A\n"),
        tuple(&ws, &root, "p/B.java", "class p.B\n"),
    ];
    let compiler = FakeCompiler::new();
    let workers = StandardWorkers::new(compiler.clone());
    let memory = FlakyMemory::new(1);
    let mut tx = open(&ws, &root);

    let out = run(
        &mut tx,
        &root,
        &workers,
        memory.as_ref(),
        &CancellationToken::new(),
        &batch,
    );

    assert_eq!(out.status, CompileStatus::Success);
    assert!(out.low_memory);
    assert_eq!(memory.freed.load(Ordering::SeqCst), 1);
    assert_eq!(out.finished_files.len(), 2);
}

#[test]
fn cancellation_stops_the_chain() {
    let ws = Workspace::new();
    let root = ws.root("app");
    let batch = vec![tuple(&ws, &root, "p/A.java", "class p.A\n")];
    let compiler = FakeCompiler::new();
    let workers = StandardWorkers::new(compiler.clone());
    let token = CancellationToken::new();
    token.cancel();
    let mut tx = open(&ws, &root);

    let out = run(
        &mut tx,
        &root,
        &workers,
        &FixedMemoryStatus::default(),
        &token,
        &batch,
    );

    assert_eq!(out.status, CompileStatus::Cancelled);
    assert!(out.finished_files.is_empty());
    assert_eq!(compiler.analyzed(), 0);
}
