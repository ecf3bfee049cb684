use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use strata_core::RootUrl;
use strata_scheduler::{DeferredWriter, Scheduler};

use crate::cache_dir::CacheDir;
use crate::error::Result;
use crate::properties::Properties;

#[derive(Clone, Debug)]
pub struct AttributeStoreConfig {
    /// Quiet period before a modified root is written back.
    pub write_delay: Duration,
    /// How long a clean cached root is trusted before it is re-read from disk.
    pub cache_ttl: Duration,
}

impl Default for AttributeStoreConfig {
    fn default() -> Self {
        Self {
            write_delay: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(30),
        }
    }
}

struct Slot {
    root: RootUrl,
    props: Properties,
    loaded_at: Instant,
    dirty: bool,
}

#[derive(Default)]
struct State {
    slot: Option<Slot>,
    /// Modified roots evicted from the slot before their write-back ran.
    pending: HashMap<RootUrl, Properties>,
}

struct Inner {
    cache_dir: CacheDir,
    config: AttributeStoreConfig,
    state: Mutex<State>,
    // Serializes write-backs so an older snapshot never lands after a newer one.
    io: Mutex<()>,
}

/// Per-root string attributes with a single-root cache and coalesced write-back.
///
/// With a scheduler, modifications are written after [`AttributeStoreConfig::write_delay`]
/// of quiet; [`AttributeStore::flush`] writes synchronously and cancels the pending
/// write. Without a scheduler every modification is written through immediately.
#[derive(Clone)]
pub struct AttributeStore {
    inner: Arc<Inner>,
    writer: Option<DeferredWriter<RootUrl>>,
}

impl AttributeStore {
    pub fn new(cache_dir: CacheDir, config: AttributeStoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_dir,
                config,
                state: Mutex::new(State::default()),
                io: Mutex::new(()),
            }),
            writer: None,
        }
    }

    pub fn with_scheduler(
        cache_dir: CacheDir,
        config: AttributeStoreConfig,
        scheduler: Scheduler,
    ) -> Self {
        let delay = config.write_delay;
        let mut store = Self::new(cache_dir, config);
        let inner = Arc::clone(&store.inner);
        store.writer = Some(DeferredWriter::new(scheduler, delay, move |root: &RootUrl| {
            if let Err(err) = inner.write_back(root) {
                tracing::warn!(
                    target = "strata.cache",
                    root = %root,
                    error = %err,
                    "deferred attribute write failed"
                );
            }
        }));
        store
    }

    pub fn cache_dir(&self) -> &CacheDir {
        &self.inner.cache_dir
    }

    pub fn get(&self, root: &RootUrl, key: &str, default: Option<&str>) -> Result<Option<String>> {
        self.inner.with_props(root, |props, _| {
            props
                .get(key)
                .or(default)
                .map(str::to_string)
        })
    }

    /// Set `key` to `value`, or remove it when `value` is `None`.
    pub fn set(&self, root: &RootUrl, key: &str, value: Option<&str>) -> Result<()> {
        let changed = self
            .inner
            .with_props(root, |props, dirty| apply(props, dirty, key, value))?;
        if changed {
            self.schedule_write(root)?;
        }
        Ok(())
    }

    /// Compare the stored value of `key` with `value` and report whether they differ.
    ///
    /// Unless `check_only` is set, a difference is also written (deferred).
    pub fn ensure(
        &self,
        root: &RootUrl,
        key: &str,
        value: Option<&str>,
        check_only: bool,
    ) -> Result<bool> {
        let changed = self.inner.with_props(root, |props, dirty| {
            if props.get(key) == value {
                return false;
            }
            if !check_only {
                apply(props, dirty, key, value);
            }
            true
        })?;
        if changed && !check_only {
            self.schedule_write(root)?;
        }
        Ok(changed)
    }

    /// Write `root` synchronously if it has unsaved changes.
    pub fn flush(&self, root: &RootUrl) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.cancel(root);
        }
        self.inner.write_back(root)
    }

    pub fn flush_all(&self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.cancel_all();
        }
        let roots: Vec<RootUrl> = {
            let state = self.inner.state.lock();
            state
                .slot
                .iter()
                .filter(|slot| slot.dirty)
                .map(|slot| slot.root.clone())
                .chain(state.pending.keys().cloned())
                .collect()
        };
        let mut first_err = None;
        for root in roots {
            if let Err(err) = self.inner.write_back(&root) {
                tracing::warn!(
                    target = "strata.cache",
                    root = %root,
                    error = %err,
                    "failed to write attributes"
                );
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drop all in-memory state for `root`, discarding unsaved changes.
    pub fn evict(&self, root: &RootUrl) {
        if let Some(writer) = &self.writer {
            writer.cancel(root);
        }
        let mut state = self.inner.state.lock();
        if state.slot.as_ref().is_some_and(|slot| &slot.root == root) {
            state.slot = None;
        }
        state.pending.remove(root);
    }

    pub fn has_pending_write(&self, root: &RootUrl) -> bool {
        let state = self.inner.state.lock();
        state
            .slot
            .as_ref()
            .is_some_and(|slot| &slot.root == root && slot.dirty)
            || state.pending.contains_key(root)
    }

    fn schedule_write(&self, root: &RootUrl) -> Result<()> {
        match &self.writer {
            Some(writer) => {
                writer.mark(root.clone());
                Ok(())
            }
            None => self.inner.write_back(root),
        }
    }
}

fn apply(props: &mut Properties, dirty: &mut bool, key: &str, value: Option<&str>) -> bool {
    let changed = match value {
        Some(value) => props.set(key, value).as_deref() != Some(value),
        None => props.remove(key).is_some(),
    };
    *dirty |= changed;
    changed
}

impl Inner {
    fn with_props<R>(
        &self,
        root: &RootUrl,
        f: impl FnOnce(&mut Properties, &mut bool) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        let ttl = self.config.cache_ttl;
        if let Some(slot) = state
            .slot
            .as_mut()
            .filter(|slot| &slot.root == root && (slot.dirty || slot.loaded_at.elapsed() < ttl))
        {
            return Ok(f(&mut slot.props, &mut slot.dirty));
        }

        if let Some(previous) = state.slot.take() {
            if previous.dirty {
                state.pending.insert(previous.root, previous.props);
            }
        }
        let (props, dirty) = match state.pending.remove(root) {
            Some(props) => (props, true),
            None => {
                let path = self.cache_dir.root_dir(root).attributes_path();
                (Properties::load_lenient(&path)?, false)
            }
        };
        let slot = state.slot.insert(Slot {
            root: root.clone(),
            props,
            loaded_at: Instant::now(),
            dirty,
        });
        Ok(f(&mut slot.props, &mut slot.dirty))
    }

    fn write_back(&self, root: &RootUrl) -> Result<()> {
        let _io = self.io.lock();
        let snapshot = {
            let mut state = self.state.lock();
            match state.slot.as_mut() {
                Some(slot) if &slot.root == root && slot.dirty => {
                    slot.dirty = false;
                    Some(slot.props.clone())
                }
                _ => state.pending.remove(root),
            }
        };
        let Some(props) = snapshot else {
            return Ok(());
        };

        let path = self.cache_dir.root_dir(root).attributes_path();
        tracing::trace!(target = "strata.cache", root = %root, "writing attributes");
        if let Err(err) = props.store(&path) {
            let mut state = self.state.lock();
            match state.slot.as_mut() {
                Some(slot) if &slot.root == root => slot.dirty = true,
                _ => {
                    state.pending.entry(root.clone()).or_insert(props);
                }
            }
            return Err(err);
        }
        Ok(())
    }
}
