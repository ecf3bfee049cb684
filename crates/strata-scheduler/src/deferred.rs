use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::Scheduler;

type WriteFn<K> = dyn Fn(&K) + Send + Sync;

struct Pending {
    generation: u64,
    timer: JoinHandle<()>,
}

struct WriterInner<K> {
    scheduler: Scheduler,
    delay: Duration,
    write: Box<WriteFn<K>>,
    next_generation: AtomicU64,
    pending: Mutex<HashMap<K, Pending>>,
}

/// Write-behind for per-key state.
///
/// [`DeferredWriter::mark`] records that a key has unsaved changes. The write runs on
/// the scheduler's background pool once the key has been quiet for `delay`; marking it
/// again restarts the wait, so a burst of changes costs one write.
pub struct DeferredWriter<K> {
    inner: Arc<WriterInner<K>>,
}

impl<K> Clone for DeferredWriter<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for DeferredWriter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredWriter")
            .field("delay", &self.inner.delay)
            .field("pending", &self.inner.pending.lock().len())
            .finish()
    }
}

impl<K> DeferredWriter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(
        scheduler: Scheduler,
        delay: Duration,
        write: impl Fn(&K) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                scheduler,
                delay,
                write: Box::new(write),
                next_generation: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn mark(&self, key: K) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        // The timer claims its entry under this lock, so it must be inserted first.
        let mut pending = self.inner.pending.lock();
        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        let timer = self.inner.scheduler.timer_handle().spawn(async move {
            tokio::time::sleep(inner.delay).await;
            let claimed = {
                let mut pending = inner.pending.lock();
                match pending.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&timer_key);
                        true
                    }
                    _ => false,
                }
            };
            if claimed {
                let writer = Arc::clone(&inner);
                inner.scheduler.spawn_blocking("deferred-write", move || {
                    (writer.write)(&timer_key);
                });
            }
        });
        if let Some(previous) = pending.insert(key, Pending { generation, timer }) {
            previous.timer.abort();
        }
    }

    /// Drop the pending write of `key`. Returns `false` when none was pending.
    ///
    /// A write whose delay already elapsed is not stopped and may still be running
    /// when this returns.
    pub fn cancel(&self, key: &K) -> bool {
        match self.inner.pending.lock().remove(key) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let entries: Vec<Pending> = self.inner.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.timer.abort();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.inner.pending.lock().contains_key(key)
    }
}
