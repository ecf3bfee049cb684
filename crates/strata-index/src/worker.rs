//! Compile workers and the fallback chain that drives them.
//!
//! A worker turns a batch of [`CompileTuple`]s into artifacts, class index facts and
//! digests, all written through the pass's [`Transaction`]. Workers are tried in order;
//! each one resumes from what the previous one finished. The last worker in the
//! standard chain never fails, so a pass always makes progress.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use url::Url;

use strata_cache::ArtifactStore;
use strata_core::{panic_payload_to_str, Indexable, RootUrl, TypeHandle};
use strata_scheduler::CancellationToken;

use crate::class_index::FileFacts;
use crate::compiler::{AnalyzedUnit, Artifact, CompilationUnit, Compiler, SourceText};
use crate::error::IndexError;
use crate::memory::MemoryStatus;
use crate::prefetch::{CompileTuple, PrefetchEnv, SourcePrefetcher};
use crate::services::{ArtifactTransaction, PersistentIndexTransaction, ProcessorGeneratedFiles};
use crate::transaction::Transaction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileStatus {
    Success,
    LowMemory,
    Cancelled,
    Failed(String),
}

/// Accumulated result of compiling one batch.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub status: CompileStatus,
    /// Set once any worker ran out of memory, even if a later one succeeded.
    pub low_memory: bool,
    pub module_name: Option<String>,
    pub added_types: BTreeSet<TypeHandle>,
    /// Types whose structural digest changed.
    pub modified_types: BTreeSet<TypeHandle>,
    pub added_modules: BTreeSet<TypeHandle>,
    /// Binary names of every artifact written.
    pub created_artifacts: BTreeSet<String>,
    pub finished_files: BTreeSet<Url>,
    /// Sources generated by annotation processors, to be compiled in the next round.
    pub apt_generated: Vec<CompileTuple>,
}

impl Default for CompileOutput {
    fn default() -> Self {
        Self {
            status: CompileStatus::Success,
            low_memory: false,
            module_name: None,
            added_types: BTreeSet::new(),
            modified_types: BTreeSet::new(),
            added_modules: BTreeSet::new(),
            created_artifacts: BTreeSet::new(),
            finished_files: BTreeSet::new(),
            apt_generated: Vec::new(),
        }
    }
}

impl CompileOutput {
    pub fn is_success(&self) -> bool {
        self.status == CompileStatus::Success
    }

    /// Continue from `previous`, keeping what it finished.
    pub fn resume(previous: Option<CompileOutput>) -> Self {
        let mut out = previous.unwrap_or_default();
        out.status = CompileStatus::Success;
        out
    }

    /// Fold the result of a later processor round into this one.
    pub fn merge(&mut self, later: CompileOutput) {
        self.status = later.status;
        self.low_memory |= later.low_memory;
        if later.module_name.is_some() {
            self.module_name = later.module_name;
        }
        self.added_types.extend(later.added_types);
        self.modified_types.extend(later.modified_types);
        self.added_modules.extend(later.added_modules);
        self.created_artifacts.extend(later.created_artifacts);
        self.finished_files.extend(later.finished_files);
        self.apt_generated.extend(later.apt_generated);
    }
}

pub struct CompileContext<'a> {
    pub root: &'a RootUrl,
    pub tx: &'a mut Transaction,
    pub prefetch: &'a PrefetchEnv,
    pub memory: &'a dyn MemoryStatus,
    pub token: &'a CancellationToken,
}

pub trait CompileWorker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compile the tuples of `batch` that `previous` has not finished.
    fn compile(
        &self,
        previous: Option<CompileOutput>,
        ctx: &mut CompileContext<'_>,
        batch: &[CompileTuple],
    ) -> CompileOutput;

    /// Drop caches before the worker is retried after running out of memory.
    fn free_memory(&self) {}
}

/// Run `workers` over `batch` until one succeeds.
///
/// A worker that panics, fails, or runs out of memory is retried once, then the next
/// worker continues from its partial output. Cancellation ends the chain at once.
pub fn run_worker_chain(
    workers: &[Box<dyn CompileWorker>],
    ctx: &mut CompileContext<'_>,
    batch: &[CompileTuple],
) -> CompileOutput {
    let mut previous: Option<CompileOutput> = None;
    for worker in workers {
        for attempt in 1..=2 {
            let input = previous.clone();
            let result = panic::catch_unwind(AssertUnwindSafe(|| worker.compile(input, ctx, batch)));
            let mut out = match result {
                Ok(out) => out,
                Err(payload) => {
                    let message = panic_payload_to_str(&*payload).to_string();
                    tracing::error!(
                        target = "strata.index",
                        root = %ctx.root,
                        worker = worker.name(),
                        panic = %message,
                        "compile worker panicked"
                    );
                    let mut out = CompileOutput::resume(previous.clone());
                    out.status = CompileStatus::Failed(message);
                    out
                }
            };
            match &out.status {
                CompileStatus::Success | CompileStatus::Cancelled => return out,
                CompileStatus::LowMemory => {
                    tracing::debug!(
                        target = "strata.index",
                        root = %ctx.root,
                        worker = worker.name(),
                        attempt,
                        finished = out.finished_files.len(),
                        "compile worker ran out of memory"
                    );
                    out.low_memory = true;
                    worker.free_memory();
                    ctx.memory.free_memory();
                }
                CompileStatus::Failed(reason) => {
                    tracing::warn!(
                        target = "strata.index",
                        root = %ctx.root,
                        worker = worker.name(),
                        attempt,
                        reason = %reason,
                        "compile worker failed"
                    );
                }
            }
            previous = Some(out);
        }
    }
    previous.unwrap_or_else(|| CompileOutput {
        status: CompileStatus::Failed("no compile workers".to_string()),
        ..CompileOutput::default()
    })
}

/// Compiles through the [`Compiler`], analyzing up to `chunk` sources at a time.
struct CompilerDriven {
    compiler: Arc<dyn Compiler>,
    chunk: Option<usize>,
}

impl CompilerDriven {
    fn compile(
        &self,
        previous: Option<CompileOutput>,
        ctx: &mut CompileContext<'_>,
        batch: &[CompileTuple],
    ) -> CompileOutput {
        let mut out = CompileOutput::resume(previous);
        let todo: Vec<CompileTuple> = batch
            .iter()
            .filter(|tuple| !out.finished_files.contains(tuple.url()))
            .cloned()
            .collect();
        out.status = match self.compile_todo(&mut out, ctx, todo) {
            Ok(status) => status,
            Err(err) => CompileStatus::Failed(err.to_string()),
        };
        out
    }

    fn compile_todo(
        &self,
        out: &mut CompileOutput,
        ctx: &mut CompileContext<'_>,
        todo: Vec<CompileTuple>,
    ) -> Result<CompileStatus, IndexError> {
        if todo.is_empty() {
            return Ok(CompileStatus::Success);
        }
        let chunk = self.chunk.unwrap_or(todo.len()).max(1);
        let mut prefetcher = SourcePrefetcher::new(todo, ctx.prefetch, ctx.token);
        let mut units = Vec::with_capacity(chunk);
        while let Some(item) = prefetcher.next() {
            if ctx.token.is_cancelled() {
                return Ok(CompileStatus::Cancelled);
            }
            let text = match item.text() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(
                        target = "strata.index",
                        file = %item.tuple.url(),
                        error = %err,
                        "skipping unreadable source"
                    );
                    prefetcher.release(&item);
                    continue;
                }
            };
            let parsed = self.compiler.parse(SourceText {
                indexable: &item.tuple.indexable,
                text: &text,
                is_processor_generated: item.tuple.is_processor_generated,
            });
            prefetcher.release(&item);
            let mut unit: CompilationUnit = parsed.map_err(|err| IndexError::Compiler {
                message: err.message,
            })?;
            unit.index = item.tuple.index;
            units.push(unit);

            if ctx.memory.pressure().is_low_memory() {
                return Ok(CompileStatus::LowMemory);
            }
            if units.len() >= chunk {
                self.analyze(out, ctx, std::mem::take(&mut units))?;
            }
        }
        drop(prefetcher);
        if ctx.token.is_cancelled() {
            return Ok(CompileStatus::Cancelled);
        }
        if !units.is_empty() {
            self.analyze(out, ctx, units)?;
        }
        Ok(CompileStatus::Success)
    }

    fn analyze(
        &self,
        out: &mut CompileOutput,
        ctx: &mut CompileContext<'_>,
        units: Vec<CompilationUnit>,
    ) -> Result<(), IndexError> {
        let analysis = self
            .compiler
            .analyze(units)
            .map_err(|err| IndexError::Compiler {
                message: err.message,
            })?;
        if analysis.module_name.is_some() {
            out.module_name = analysis.module_name;
        }
        for unit in &analysis.units {
            record_unit(ctx, out, unit)?;
        }
        for generated in &analysis.generated {
            ctx.tx.get_mut::<ProcessorGeneratedFiles>()?.record(generated)?;
            out.apt_generated.push(CompileTuple::processor_generated(
                generated.indexable.clone(),
                generated.text.as_str(),
            ));
        }
        Ok(())
    }
}

/// Write everything `unit` produced into the transaction.
fn record_unit(
    ctx: &mut CompileContext<'_>,
    out: &mut CompileOutput,
    unit: &AnalyzedUnit,
) -> Result<(), IndexError> {
    let url = &unit.indexable.url;
    let (modules, types): (Vec<TypeHandle>, Vec<TypeHandle>) = unit
        .type_handles()
        .into_iter()
        .partition(TypeHandle::is_module);
    let names: Vec<String> = types
        .iter()
        .map(|ty| ty.binary_name().to_string())
        .collect();

    if unit.index {
        let index = ctx.tx.get_mut::<PersistentIndexTransaction>()?;
        if !index.checksums_mut().check_and_set(url, &unit.declared) {
            out.modified_types.extend(types.iter().cloned());
        }
        index
            .fqns_mut()
            .set(names.iter().map(String::as_str), url);
        index.class_index_mut().update_file(
            url,
            FileFacts::new(&types, &unit.supertypes, &unit.references, unit.has_errors()),
        );
    }
    if unit.has_errors() {
        tracing::trace!(
            target = "strata.index",
            file = %url,
            errors = unit.diagnostics.iter().filter(|d| d.is_error()).count(),
            "compiled with errors"
        );
    }

    let artifacts = ctx.tx.get::<ArtifactTransaction>()?;
    for artifact in &unit.artifacts {
        artifacts.write_artifact(&artifact.binary_name, &artifact.bytes)?;
        out.created_artifacts.insert(artifact.binary_name.clone());
    }
    artifacts.write_manifest(&unit.indexable.relative_path, &names)?;

    out.added_types.extend(types);
    out.added_modules.extend(modules);
    out.finished_files.insert(url.clone());
    Ok(())
}

/// Parses and analyzes the whole batch at once.
pub struct VanillaCompileWorker {
    inner: CompilerDriven,
}

impl VanillaCompileWorker {
    pub fn new(compiler: Arc<dyn Compiler>) -> Self {
        Self {
            inner: CompilerDriven {
                compiler,
                chunk: None,
            },
        }
    }
}

impl CompileWorker for VanillaCompileWorker {
    fn name(&self) -> &'static str {
        "vanilla"
    }

    fn compile(
        &self,
        previous: Option<CompileOutput>,
        ctx: &mut CompileContext<'_>,
        batch: &[CompileTuple],
    ) -> CompileOutput {
        self.inner.compile(previous, ctx, batch)
    }
}

/// Analyzes one source at a time, trading speed for a small memory footprint.
pub struct MultiPassCompileWorker {
    inner: CompilerDriven,
}

impl MultiPassCompileWorker {
    pub fn new(compiler: Arc<dyn Compiler>) -> Self {
        Self {
            inner: CompilerDriven {
                compiler,
                chunk: Some(1),
            },
        }
    }
}

impl CompileWorker for MultiPassCompileWorker {
    fn name(&self) -> &'static str {
        "multi-pass"
    }

    fn compile(
        &self,
        previous: Option<CompileOutput>,
        ctx: &mut CompileContext<'_>,
        batch: &[CompileTuple],
    ) -> CompileOutput {
        self.inner.compile(previous, ctx, batch)
    }
}

/// Previously built artifacts kept outside the index, e.g. a build tool's output.
pub trait BinaryCache: Send + Sync {
    fn artifacts(&self, root: &RootUrl, source: &Indexable) -> Option<Vec<Artifact>>;
}

/// Last resort of the chain: never compiles, never fails.
///
/// Unfinished sources get their artifacts from the binary cache when it has them.
/// Either way they are recorded as erroneous so a later pass revisits them.
pub struct BinaryCacheWorker {
    cache: Option<Arc<dyn BinaryCache>>,
}

impl BinaryCacheWorker {
    pub fn new(cache: Option<Arc<dyn BinaryCache>>) -> Self {
        Self { cache }
    }

    fn copy(
        &self,
        out: &mut CompileOutput,
        ctx: &mut CompileContext<'_>,
        tuple: &CompileTuple,
    ) -> Result<(), IndexError> {
        let url = tuple.url();
        let artifacts = self
            .cache
            .as_ref()
            .and_then(|cache| cache.artifacts(ctx.root, &tuple.indexable))
            .unwrap_or_default();
        let names: Vec<String> = artifacts
            .iter()
            .map(|artifact| artifact.binary_name.clone())
            .collect();
        let types: Vec<TypeHandle> = names.iter().map(TypeHandle::other).collect();

        let store = ctx.tx.get::<ArtifactTransaction>()?;
        for artifact in &artifacts {
            store.write_artifact(&artifact.binary_name, &artifact.bytes)?;
            out.created_artifacts.insert(artifact.binary_name.clone());
        }
        if !names.is_empty() {
            store.write_manifest(&tuple.indexable.relative_path, &names)?;
        }

        if tuple.index {
            let index = ctx.tx.get_mut::<PersistentIndexTransaction>()?;
            index
                .fqns_mut()
                .set(names.iter().map(String::as_str), url);
            let mut facts = FileFacts::new(&types, std::iter::empty(), std::iter::empty(), true);
            facts.dirty = true;
            index.class_index_mut().update_file(url, facts);
        }
        out.added_types.extend(types);
        out.finished_files.insert(url.clone());
        Ok(())
    }
}

impl CompileWorker for BinaryCacheWorker {
    fn name(&self) -> &'static str {
        "binary-cache"
    }

    fn compile(
        &self,
        previous: Option<CompileOutput>,
        ctx: &mut CompileContext<'_>,
        batch: &[CompileTuple],
    ) -> CompileOutput {
        let mut out = CompileOutput::resume(previous);
        for tuple in batch {
            if out.finished_files.contains(tuple.url()) {
                continue;
            }
            if ctx.token.is_cancelled() {
                out.status = CompileStatus::Cancelled;
                return out;
            }
            if let Err(err) = self.copy(&mut out, ctx, tuple) {
                tracing::warn!(
                    target = "strata.index",
                    file = %tuple.url(),
                    error = %err,
                    "failed to restore artifacts from the binary cache"
                );
                out.finished_files.insert(tuple.url().clone());
            }
        }
        tracing::debug!(
            target = "strata.index",
            root = %ctx.root,
            files = batch.len(),
            "fallback worker finished batch"
        );
        out
    }
}

/// Builds the worker chain for a root.
pub trait CompileWorkerProvider: Send + Sync {
    fn workers(&self, root: &RootUrl) -> Vec<Box<dyn CompileWorker>>;
}

/// Vanilla, then multi-pass, then the binary cache fallback.
pub struct StandardWorkers {
    compiler: Arc<dyn Compiler>,
    binary_cache: Option<Arc<dyn BinaryCache>>,
}

impl StandardWorkers {
    pub fn new(compiler: Arc<dyn Compiler>) -> Self {
        Self {
            compiler,
            binary_cache: None,
        }
    }

    pub fn with_binary_cache(mut self, cache: Arc<dyn BinaryCache>) -> Self {
        self.binary_cache = Some(cache);
        self
    }
}

impl CompileWorkerProvider for StandardWorkers {
    fn workers(&self, _root: &RootUrl) -> Vec<Box<dyn CompileWorker>> {
        vec![
            Box::new(VanillaCompileWorker::new(Arc::clone(&self.compiler))),
            Box::new(MultiPassCompileWorker::new(Arc::clone(&self.compiler))),
            Box::new(BinaryCacheWorker::new(self.binary_cache.clone())),
        ]
    }
}
