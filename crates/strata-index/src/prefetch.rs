//! Read-ahead of source text for compile workers.
//!
//! Large batches on machines with enough cores are read concurrently on a dedicated
//! pool, bounded by a process-wide [`BufferBudget`]. Everything else falls back to a
//! sequential iterator that reads each source when the worker asks for it.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use url::Url;

use strata_config::PrefetchConfig;
use strata_core::Indexable;
use strata_scheduler::{build_pool, BlockingPool, CancellationToken, Cancelled, SuspendSignal};

#[derive(Clone, Debug)]
pub enum SourceContent {
    File(PathBuf),
    Memory(Arc<str>),
}

/// One source handed to a compile worker.
#[derive(Clone, Debug)]
pub struct CompileTuple {
    pub indexable: Indexable,
    pub content: SourceContent,
    /// In-memory source with no backing file of its own.
    pub is_virtual: bool,
    /// Whether the compiled result goes into the class index.
    pub index: bool,
    pub is_processor_generated: bool,
}

impl CompileTuple {
    pub fn file(indexable: Indexable, path: impl Into<PathBuf>) -> Self {
        Self {
            indexable,
            content: SourceContent::File(path.into()),
            is_virtual: false,
            index: true,
            is_processor_generated: false,
        }
    }

    pub fn virtual_source(indexable: Indexable, text: impl Into<Arc<str>>, index: bool) -> Self {
        Self {
            indexable,
            content: SourceContent::Memory(text.into()),
            is_virtual: true,
            index,
            is_processor_generated: false,
        }
    }

    pub fn processor_generated(indexable: Indexable, text: impl Into<Arc<str>>) -> Self {
        Self {
            is_processor_generated: true,
            ..Self::virtual_source(indexable, text, true)
        }
    }

    pub fn url(&self) -> &Url {
        &self.indexable.url
    }

    pub fn read_text(&self) -> io::Result<Arc<str>> {
        match &self.content {
            SourceContent::Memory(text) => Ok(text.clone()),
            SourceContent::File(path) => std::fs::read_to_string(path).map(Arc::from),
        }
    }
}

/// When concurrent prefetch is used and how much it may read ahead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefetchPolicy {
    pub enabled: bool,
    pub min_processors: usize,
    pub min_batch_size: usize,
    pub processors: usize,
    pub threads: usize,
    pub budget_bytes: u64,
    pub max_chunk_bytes: u64,
}

impl PrefetchPolicy {
    pub fn from_config(config: &PrefetchConfig) -> Self {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            enabled: config.enabled,
            min_processors: config.min_processors,
            min_batch_size: config.min_batch_size,
            processors,
            threads: config.threads.unwrap_or(processors).max(1),
            budget_bytes: config.buffer_budget_bytes.0.max(1),
            max_chunk_bytes: config.max_chunk_bytes.0,
        }
    }

    pub fn sequential() -> Self {
        Self {
            enabled: false,
            ..Self::from_config(&PrefetchConfig::default())
        }
    }

    pub fn allows_concurrent(&self, batch_len: usize, suspend: &SuspendSignal) -> bool {
        self.enabled
            && self.processors >= self.min_processors
            && batch_len > self.min_batch_size
            && suspend.supports_suspend()
    }
}

/// Counting semaphore over bytes of prefetched source text.
///
/// Requests larger than the capacity are clamped to it, so a single oversized file
/// waits for an empty budget instead of blocking forever.
#[derive(Debug)]
pub struct BufferBudget {
    capacity: u64,
    used: Mutex<u64>,
    freed: Condvar,
}

impl BufferBudget {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            used: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// The process-wide budget. The capacity of the first caller wins.
    pub fn global(capacity: u64) -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<BufferBudget>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(BufferBudget::new(capacity)))
            .clone()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn in_use(&self) -> u64 {
        *self.used.lock()
    }

    pub fn acquire(
        self: &Arc<Self>,
        bytes: u64,
        token: &CancellationToken,
    ) -> Result<BufferPermit, Cancelled> {
        let bytes = bytes.min(self.capacity);
        let mut used = self.used.lock();
        while *used + bytes > self.capacity {
            Cancelled::check(token)?;
            self.freed.wait_for(&mut used, Duration::from_millis(50));
        }
        Cancelled::check(token)?;
        *used += bytes;
        Ok(BufferPermit {
            budget: Arc::clone(self),
            bytes,
        })
    }

    /// Wake every waiter so it re-checks its cancellation token.
    pub fn wake_all(&self) {
        self.freed.notify_all();
    }

    fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
        drop(used);
        self.freed.notify_all();
    }
}

#[derive(Debug)]
pub struct BufferPermit {
    budget: Arc<BufferBudget>,
    bytes: u64,
}

impl BufferPermit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BufferPermit {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}

/// Everything a prefetcher needs from its surroundings.
#[derive(Clone)]
pub struct PrefetchEnv {
    pub policy: PrefetchPolicy,
    pub pool: Arc<BlockingPool>,
    pub budget: Arc<BufferBudget>,
    pub suspend: SuspendSignal,
}

impl PrefetchEnv {
    pub fn from_config(config: &PrefetchConfig, suspend: SuspendSignal) -> Self {
        let policy = PrefetchPolicy::from_config(config);
        let pool = if policy.enabled {
            build_pool("strata-prefetch", policy.threads)
        } else {
            BlockingPool::Inline
        };
        let budget = BufferBudget::global(policy.budget_bytes);
        Self {
            policy,
            pool: Arc::new(pool),
            budget,
            suspend,
        }
    }

    pub fn sequential() -> Self {
        let policy = PrefetchPolicy::sequential();
        Self {
            budget: Arc::new(BufferBudget::new(policy.budget_bytes)),
            policy,
            pool: Arc::new(BlockingPool::Inline),
            suspend: SuspendSignal::unsupported(),
        }
    }
}

/// A tuple handed out by [`SourcePrefetcher`], with its text if it was read ahead.
#[derive(Debug)]
pub struct Prefetched {
    pub tuple: CompileTuple,
    text: Option<Arc<str>>,
}

impl Prefetched {
    pub fn is_prefetched(&self) -> bool {
        self.text.is_some()
    }

    /// The source text, read now if it was not prefetched.
    pub fn text(&self) -> io::Result<Arc<str>> {
        match &self.text {
            Some(text) => Ok(text.clone()),
            None => self.tuple.read_text(),
        }
    }
}

enum Loaded {
    Item {
        tuple: CompileTuple,
        text: Option<Arc<str>>,
        permit: Option<BufferPermit>,
    },
    Skipped,
}

struct Concurrent {
    virtuals: VecDeque<CompileTuple>,
    rx: Receiver<Loaded>,
    remaining: usize,
    token: CancellationToken,
    budget: Arc<BufferBudget>,
}

enum Mode {
    Sequential(VecDeque<CompileTuple>),
    Concurrent(Concurrent),
}

/// Iterator over a batch of [`CompileTuple`]s.
///
/// In concurrent mode tuples come back in completion order, virtual tuples first. The
/// buffer permit of the item most recently returned stays with the prefetcher until
/// [`SourcePrefetcher::release`] is called or the next item is requested.
pub struct SourcePrefetcher {
    mode: Mode,
    active: Option<(Url, BufferPermit)>,
}

impl SourcePrefetcher {
    pub fn new(tuples: Vec<CompileTuple>, env: &PrefetchEnv, token: &CancellationToken) -> Self {
        if !env.pool.is_inline() && env.policy.allows_concurrent(tuples.len(), &env.suspend) {
            Self::concurrent(tuples, env, token)
        } else {
            Self::sequential(tuples)
        }
    }

    pub fn sequential(tuples: Vec<CompileTuple>) -> Self {
        Self {
            mode: Mode::Sequential(tuples.into()),
            active: None,
        }
    }

    fn concurrent(tuples: Vec<CompileTuple>, env: &PrefetchEnv, token: &CancellationToken) -> Self {
        let token = token.child_token();
        let (virtuals, files): (Vec<_>, Vec<_>) =
            tuples.into_iter().partition(|tuple| tuple.is_virtual);
        let (tx, rx) = crossbeam_channel::unbounded();
        let remaining = files.len();
        tracing::debug!(
            target = "strata.index",
            files = remaining,
            virtuals = virtuals.len(),
            threads = env.pool.threads(),
            "prefetching sources concurrently"
        );
        for tuple in files {
            let tx = tx.clone();
            let token = token.clone();
            let suspend = env.suspend.clone();
            let budget = Arc::clone(&env.budget);
            let max_chunk = env.policy.max_chunk_bytes;
            env.pool
                .spawn(move || load(tuple, &tx, &token, &suspend, &budget, max_chunk));
        }
        Self {
            mode: Mode::Concurrent(Concurrent {
                virtuals: virtuals.into(),
                rx,
                remaining,
                token,
                budget: Arc::clone(&env.budget),
            }),
            active: None,
        }
    }

    pub fn is_concurrent(&self) -> bool {
        matches!(self.mode, Mode::Concurrent(_))
    }

    /// Release the buffer held for `item`. A no-op in sequential mode.
    pub fn release(&mut self, item: &Prefetched) {
        if self
            .active
            .as_ref()
            .is_some_and(|(url, _)| *url == item.tuple.indexable.url)
        {
            self.active = None;
        }
    }

    /// Stop loading, drop everything read ahead and wake blocked loaders.
    pub fn close(&mut self) {
        self.active = None;
        match &mut self.mode {
            Mode::Sequential(pending) => pending.clear(),
            Mode::Concurrent(state) => {
                state.token.cancel();
                state.budget.wake_all();
                state.virtuals.clear();
                while state.rx.try_recv().is_ok() {}
                state.remaining = 0;
            }
        }
    }
}

impl Iterator for SourcePrefetcher {
    type Item = Prefetched;

    fn next(&mut self) -> Option<Prefetched> {
        self.active = None;
        match &mut self.mode {
            Mode::Sequential(pending) => pending
                .pop_front()
                .map(|tuple| Prefetched { tuple, text: None }),
            Mode::Concurrent(state) => {
                if let Some(tuple) = state.virtuals.pop_front() {
                    let text = tuple.read_text().ok();
                    return Some(Prefetched { tuple, text });
                }
                while state.remaining > 0 {
                    let loaded = state.rx.recv().ok()?;
                    state.remaining -= 1;
                    if let Loaded::Item {
                        tuple,
                        text,
                        permit,
                    } = loaded
                    {
                        if let Some(permit) = permit {
                            self.active = Some((tuple.indexable.url.clone(), permit));
                        }
                        return Some(Prefetched { tuple, text });
                    }
                }
                None
            }
        }
    }
}

impl Drop for SourcePrefetcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn load(
    tuple: CompileTuple,
    tx: &Sender<Loaded>,
    token: &CancellationToken,
    suspend: &SuspendSignal,
    budget: &Arc<BufferBudget>,
    max_chunk: u64,
) {
    let loaded = match try_load(tuple, token, suspend, budget, max_chunk) {
        Ok(loaded) => loaded,
        Err(_) => Loaded::Skipped,
    };
    // The receiver is gone once the prefetcher is closed.
    let _ = tx.send(loaded);
}

fn try_load(
    tuple: CompileTuple,
    token: &CancellationToken,
    suspend: &SuspendSignal,
    budget: &Arc<BufferBudget>,
    max_chunk: u64,
) -> Result<Loaded, Cancelled> {
    suspend.park_while_suspended(token)?;
    let SourceContent::File(path) = &tuple.content else {
        let text = tuple.read_text().ok();
        return Ok(Loaded::Item {
            tuple,
            text,
            permit: None,
        });
    };
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) => {
            tracing::warn!(
                target = "strata.index",
                path = %path.display(),
                error = %err,
                "skipping unreadable source"
            );
            return Ok(Loaded::Skipped);
        }
    };
    if len > max_chunk {
        // Too large to hold in the budget; the worker reads it when it gets there.
        return Ok(Loaded::Item {
            tuple,
            text: None,
            permit: None,
        });
    }
    let permit = budget.acquire(len, token)?;
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Loaded::Item {
            tuple,
            text: Some(Arc::from(text)),
            permit: Some(permit),
        }),
        Err(err) => {
            tracing::warn!(
                target = "strata.index",
                path = %path.display(),
                error = %err,
                "skipping unreadable source"
            );
            Ok(Loaded::Skipped)
        }
    }
}
