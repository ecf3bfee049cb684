use std::collections::BTreeMap;
use std::sync::Arc;

use strata_config::PrefetchConfig;
use strata_index::prefetch::{BufferBudget, CompileTuple, PrefetchEnv, PrefetchPolicy, SourcePrefetcher};
use strata_scheduler::{build_pool, CancellationToken, SuspendSignal};

use super::support::Workspace;

fn concurrent_env(threads: usize, budget: u64) -> PrefetchEnv {
    PrefetchEnv {
        policy: PrefetchPolicy {
            enabled: true,
            min_processors: 1,
            min_batch_size: 2,
            processors: 4,
            threads,
            budget_bytes: budget,
            max_chunk_bytes: 1024,
        },
        pool: Arc::new(build_pool("test-prefetch", threads)),
        budget: Arc::new(BufferBudget::new(budget)),
        suspend: SuspendSignal::new(),
    }
}

fn tuples(ws: &Workspace, count: usize) -> Vec<CompileTuple> {
    let root = ws.root("app");
    (0..count)
        .map(|i| {
            let indexable = ws.write(&root, &format!("p/C{i}.java"), &format!("class p.C{i}\n"));
            let path = indexable.to_path().unwrap();
            CompileTuple::file(indexable, path)
        })
        .collect()
}

#[test]
fn every_tuple_is_yielded_exactly_once_with_a_small_pool() {
    let ws = Workspace::new();
    let mut batch = tuples(&ws, 24);
    let root = ws.root("app");
    let generated = strata_core::Indexable::java(&root, "gen/G.java").unwrap();
    batch.push(CompileTuple::virtual_source(generated.clone(), "class G\n", true));

    let env = concurrent_env(2, 64);
    let token = CancellationToken::new();
    let mut prefetcher = SourcePrefetcher::new(batch.clone(), &env, &token);
    assert!(prefetcher.is_concurrent());

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut first = None;
    while let Some(item) = prefetcher.next() {
        first.get_or_insert_with(|| item.tuple.url().clone());
        let text = item.text().unwrap();
        assert!(text.starts_with("class "));
        *seen.entry(item.tuple.url().to_string()).or_default() += 1;
        prefetcher.release(&item);
    }

    assert_eq!(first.as_ref(), Some(&generated.url));
    assert_eq!(seen.len(), batch.len());
    assert!(seen.values().all(|count| *count == 1));
    drop(prefetcher);
    assert_eq!(env.budget.in_use(), 0);
}

#[test]
fn small_batches_and_disabled_policies_read_sequentially() {
    let ws = Workspace::new();
    let token = CancellationToken::new();

    let env = concurrent_env(2, 64);
    let small = SourcePrefetcher::new(tuples(&ws, 2), &env, &token);
    assert!(!small.is_concurrent());

    let sequential = PrefetchEnv::sequential();
    let batch = tuples(&ws, 12);
    let order: Vec<_> = SourcePrefetcher::new(batch.clone(), &sequential, &token)
        .map(|item| {
            assert!(!item.is_prefetched());
            item.tuple.url().clone()
        })
        .collect();
    let expected: Vec<_> = batch.iter().map(|tuple| tuple.url().clone()).collect();
    assert_eq!(order, expected);

    let configured = PrefetchEnv::from_config(
        &PrefetchConfig {
            enabled: false,
            ..PrefetchConfig::default()
        },
        SuspendSignal::new(),
    );
    assert!(!SourcePrefetcher::new(tuples(&ws, 30), &configured, &token).is_concurrent());
}

#[test]
fn closing_early_returns_every_buffered_byte() {
    let ws = Workspace::new();
    let env = concurrent_env(3, 48);
    let token = CancellationToken::new();
    let mut prefetcher = SourcePrefetcher::new(tuples(&ws, 16), &env, &token);

    let first = prefetcher.next().unwrap();
    assert!(first.text().is_ok());
    prefetcher.close();
    assert!(prefetcher.next().is_none());
    drop(prefetcher);

    // Loaders that were still running give their permits back once they notice.
    for _ in 0..200 {
        if env.budget.in_use() == 0 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(env.budget.in_use(), 0);
}

#[test]
fn unreadable_sources_are_skipped_by_the_loaders() {
    let ws = Workspace::new();
    let batch = tuples(&ws, 8);
    let gone = batch[2].url().clone();
    std::fs::remove_file(batch[2].indexable.to_path().unwrap()).unwrap();

    let env = concurrent_env(2, 64);
    let token = CancellationToken::new();
    let prefetcher = SourcePrefetcher::new(batch.clone(), &env, &token);
    assert!(prefetcher.is_concurrent());
    let seen: Vec<_> = prefetcher.map(|item| item.tuple.url().clone()).collect();

    assert_eq!(seen.len(), batch.len() - 1);
    assert!(!seen.contains(&gone));
    assert_eq!(env.budget.in_use(), 0);
}
