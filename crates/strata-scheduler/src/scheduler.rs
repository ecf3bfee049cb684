use std::sync::Arc;

use rayon::ThreadPool;
use tokio::runtime::{Handle, Runtime};

use strata_core::panic_payload_to_str;

/// A rayon pool, or inline execution when no worker thread could be started.
pub enum BlockingPool {
    Rayon(ThreadPool),
    Inline,
}

impl BlockingPool {
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            BlockingPool::Rayon(pool) => pool.spawn(job),
            BlockingPool::Inline => job(),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, BlockingPool::Inline)
    }

    pub fn threads(&self) -> usize {
        match self {
            BlockingPool::Rayon(pool) => pool.current_num_threads(),
            BlockingPool::Inline => 0,
        }
    }
}

/// Build a named rayon pool, halving the thread count on failure.
///
/// Thread creation can fail under low process limits; when not even one worker can be
/// started the pool degrades to inline execution.
pub fn build_pool(prefix: &'static str, threads: usize) -> BlockingPool {
    let mut threads = threads.max(1);
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()
        {
            Ok(pool) => return BlockingPool::Rayon(pool),
            Err(err) if threads > 1 => {
                tracing::debug!(
                    target = "strata.scheduler",
                    prefix,
                    threads,
                    error = %err,
                    "failed to build pool, retrying with fewer threads"
                );
                threads = (threads / 2).max(1);
            }
            Err(err) => {
                tracing::warn!(
                    target = "strata.scheduler",
                    prefix,
                    error = %err,
                    "no worker threads available, running inline"
                );
                return BlockingPool::Inline;
            }
        }
    }
}

fn build_timer_runtime() -> Runtime {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_time()
        .thread_name("strata-timer")
        .build()
    {
        Ok(rt) => rt,
        Err(err) => tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap_or_else(|_| panic!("failed to build timer runtime: {err}")),
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Threads running deferred writes.
    pub background_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            background_threads: available.clamp(1, 2),
        }
    }
}

/// Timers plus a small pool for work that must not block an indexing pass, such as
/// attribute write-back.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    background_pool: BlockingPool,
    timer_runtime: Option<Runtime>,
    timer_handle: Handle,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let runtime = build_timer_runtime();
        let timer_handle = runtime.handle().clone();
        Self {
            inner: Arc::new(SchedulerInner {
                background_pool: build_pool("strata-background", config.background_threads),
                timer_runtime: Some(runtime),
                timer_handle,
            }),
        }
    }

    pub(crate) fn timer_handle(&self) -> &Handle {
        &self.inner.timer_handle
    }

    /// Run `job` on the background pool. A panic is logged and swallowed.
    pub fn spawn_blocking<F>(&self, name: &'static str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.background_pool.spawn(move || {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                tracing::error!(
                    target = "strata.scheduler",
                    job = name,
                    panic = %panic_payload_to_str(&*panic),
                    "background job panicked"
                );
            }
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.timer_runtime.take() {
            runtime.shutdown_background();
        }
    }
}
