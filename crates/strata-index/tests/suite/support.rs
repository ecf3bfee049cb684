//! A toy compiler and a scratch workspace for driving whole indexing passes.
//!
//! Sources use a line format instead of Java:
//!
//! ```text
//! class p.B extends p.A
//! nested p.B$Inner
//! public method run ()V
//! uses p.X
//! error missing semicolon
//! generate p.BBuilder
//! module app
//! crash
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use strata_cache::{
    ArtifactStore, AttributeStore, AttributeStoreConfig, CacheConfig, CacheDir, FsArtifactStore,
};
use strata_core::{
    DeclaredElement, Diagnostic, ElementKind, Indexable, Modifier, RootUrl, TrackingMode,
    TypeHandle,
};
use strata_index::{
    Analysis, AnalyzedUnit, Artifact, BinaryCache, ClassIndexEvent, ClassIndexListener,
    CollectingSink, CompilationUnit, CompileWorkerProvider, Compiler, CompilerError,
    FixedMemoryStatus, GeneratedSource, MemoryPressure, MemoryStatus, RootIndexer,
    ScanMetadata, SourceText, StandardWorkers, StaticRootGraph,
};

#[derive(Default)]
pub struct FakeCompiler {
    crashes_left: AtomicUsize,
    analyzed: AtomicUsize,
}

impl FakeCompiler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `crash` lines panic the first `times` analyses that see them.
    pub fn crashing(times: usize) -> Arc<Self> {
        Arc::new(Self {
            crashes_left: AtomicUsize::new(times),
            analyzed: AtomicUsize::new(0),
        })
    }

    /// Number of units analyzed so far.
    pub fn analyzed(&self) -> usize {
        self.analyzed.load(Ordering::SeqCst)
    }

    fn analyze_one(
        &self,
        indexable: &Indexable,
        index: bool,
        text: &str,
        analysis: &mut Analysis,
    ) -> AnalyzedUnit {
        let mut declared: Vec<DeclaredElement> = Vec::new();
        let mut supertypes = Vec::new();
        let mut references = BTreeSet::new();
        let mut diagnostics = Vec::new();

        for (line_no, line) in text.lines().enumerate() {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                [] => {}
                [kind @ ("class" | "interface"), name, rest @ ..] => {
                    let kind = if *kind == "class" {
                        ElementKind::Class
                    } else {
                        ElementKind::Interface
                    };
                    let mut element = DeclaredElement::new(kind, *name)
                        .with_modifiers([Modifier::Public]);
                    if let ["extends", base] = rest {
                        element = element.with_signature(*base);
                        supertypes.push((TypeHandle::class(*name), TypeHandle::class(*base)));
                        references.insert(TypeHandle::class(*base));
                    }
                    declared.push(element);
                }
                ["nested", name] => {
                    if let Some(outer) = declared.last_mut() {
                        outer
                            .members
                            .push(DeclaredElement::new(ElementKind::Class, *name));
                    }
                }
                [visibility @ ("public" | "private"), "method", name, signature] => {
                    let modifier = if *visibility == "public" {
                        Modifier::Public
                    } else {
                        Modifier::Private
                    };
                    if let Some(outer) = declared.last_mut() {
                        outer.members.push(
                            DeclaredElement::new(ElementKind::Method, *name)
                                .with_signature(*signature)
                                .with_modifiers([modifier]),
                        );
                    }
                }
                ["uses", name] => {
                    references.insert(TypeHandle::class(*name));
                }
                ["error", message @ ..] => {
                    diagnostics.push(Diagnostic::error(line_no as u32 + 1, message.join(" ")));
                }
                ["generate", name] => {
                    let root = indexable
                        .url
                        .as_str()
                        .strip_suffix(indexable.relative_path.as_str())
                        .and_then(|base| RootUrl::parse(base).ok());
                    let relative = format!("generated/{}.java", name.replace('.', "/"));
                    if let Some(generated) =
                        root.and_then(|root| Indexable::java(&root, &relative))
                    {
                        analysis.generated.push(GeneratedSource {
                            origin: indexable.url.clone(),
                            indexable: generated,
                            text: format!("class {name}\n"),
                        });
                    }
                }
                ["module", name] => {
                    analysis.module_name = Some(name.to_string());
                    declared.push(DeclaredElement::new(ElementKind::Module, *name));
                }
                ["crash"] => {
                    let crash = self
                        .crashes_left
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                            left.checked_sub(1)
                        })
                        .is_ok();
                    if crash {
                        panic!("compiler crashed on {}", indexable.url);
                    }
                }
                _ => diagnostics.push(Diagnostic::error(line_no as u32 + 1, "unknown line")),
            }
        }

        let artifacts = declared
            .iter()
            .flat_map(DeclaredElement::all_type_handles)
            .map(|ty| {
                let bytes = format!("{}|{}", ty.binary_name(), text.trim());
                Artifact::new(ty.binary_name(), bytes)
            })
            .collect();
        self.analyzed.fetch_add(1, Ordering::SeqCst);
        AnalyzedUnit {
            indexable: indexable.clone(),
            declared,
            supertypes,
            references,
            diagnostics,
            artifacts,
            index,
        }
    }
}

impl Compiler for FakeCompiler {
    fn parse(&self, source: SourceText<'_>) -> Result<CompilationUnit, CompilerError> {
        Ok(CompilationUnit {
            indexable: source.indexable.clone(),
            is_processor_generated: source.is_processor_generated,
            index: true,
            tree: Box::new(source.text.to_string()),
        })
    }

    fn analyze(&self, units: Vec<CompilationUnit>) -> Result<Analysis, CompilerError> {
        let mut analysis = Analysis::default();
        for unit in units {
            let text = unit
                .tree
                .downcast_ref::<String>()
                .ok_or_else(|| CompilerError::new("foreign tree"))?;
            let analyzed = self.analyze_one(&unit.indexable, unit.index, text, &mut analysis);
            analysis.units.push(analyzed);
        }
        Ok(analysis)
    }
}

/// Prebuilt artifacts keyed by root-relative source path.
#[derive(Default)]
pub struct FakeBinaryCache {
    artifacts: Mutex<BTreeMap<String, Vec<Artifact>>>,
}

impl FakeBinaryCache {
    pub fn with(relative_path: &str, artifacts: Vec<Artifact>) -> Arc<Self> {
        let cache = Self::default();
        cache
            .artifacts
            .lock()
            .unwrap()
            .insert(relative_path.to_string(), artifacts);
        Arc::new(cache)
    }
}

impl BinaryCache for FakeBinaryCache {
    fn artifacts(&self, _root: &RootUrl, source: &Indexable) -> Option<Vec<Artifact>> {
        self.artifacts
            .lock()
            .unwrap()
            .get(&source.relative_path)
            .cloned()
    }
}

/// Reports high memory pressure for the first `high_samples` samples.
pub struct FlakyMemory {
    high_samples: AtomicUsize,
    pub freed: AtomicUsize,
}

impl FlakyMemory {
    pub fn new(high_samples: usize) -> Arc<Self> {
        Arc::new(Self {
            high_samples: AtomicUsize::new(high_samples),
            freed: AtomicUsize::new(0),
        })
    }
}

impl MemoryStatus for FlakyMemory {
    fn pressure(&self) -> MemoryPressure {
        let high = self
            .high_samples
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if high {
            MemoryPressure::High
        } else {
            MemoryPressure::Low
        }
    }

    fn free_memory(&self) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<ClassIndexEvent>>,
}

impl ClassIndexListener for RecordingListener {
    fn types_changed(&self, event: &ClassIndexEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn handles(names: &[&str]) -> BTreeSet<TypeHandle> {
    names.iter().map(|name| TypeHandle::class(*name)).collect()
}

pub fn metadata() -> ScanMetadata {
    ScanMetadata {
        source_path: "src".to_string(),
        compiler_options: "-g".to_string(),
        source_level: "17".to_string(),
    }
}

pub struct Workspace {
    pub temp: tempfile::TempDir,
    pub cache: CacheDir,
    pub attributes: AttributeStore,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let cache = CacheDir::new(CacheConfig {
            cache_root_override: Some(temp.path().join("cache")),
        })
        .unwrap();
        let attributes = AttributeStore::new(cache.clone(), AttributeStoreConfig::default());
        Self {
            temp,
            cache,
            attributes,
        }
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.temp.path().join("work").join(name)
    }

    pub fn root(&self, name: &str) -> RootUrl {
        let dir = self.dir(name);
        std::fs::create_dir_all(&dir).unwrap();
        RootUrl::from_dir(&dir).unwrap()
    }

    pub fn write(&self, root: &RootUrl, relative_path: &str, text: &str) -> Indexable {
        let indexable = Indexable::java(root, relative_path).unwrap();
        let path = indexable.to_path().unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, text).unwrap();
        indexable
    }

    pub fn remove(&self, root: &RootUrl, relative_path: &str) -> Indexable {
        let indexable = Indexable::java(root, relative_path).unwrap();
        std::fs::remove_file(indexable.to_path().unwrap()).unwrap();
        indexable
    }

    pub fn artifacts(&self, root: &RootUrl) -> FsArtifactStore {
        FsArtifactStore::new(self.cache.root_dir(root).classes_dir())
    }

    pub fn artifact(&self, root: &RootUrl, binary_name: &str) -> Option<String> {
        self.artifacts(root)
            .read_artifact(binary_name)
            .unwrap()
            .map(|bytes| String::from_utf8(bytes).unwrap())
    }

    pub fn indexer(
        &self,
        graph: StaticRootGraph,
        compiler: Arc<FakeCompiler>,
    ) -> (RootIndexer, CollectingSink) {
        self.indexer_with(graph, Arc::new(StandardWorkers::new(compiler)))
    }

    pub fn indexer_with(
        &self,
        graph: StaticRootGraph,
        workers: Arc<dyn CompileWorkerProvider>,
    ) -> (RootIndexer, CollectingSink) {
        let sink = CollectingSink::new();
        let indexer = RootIndexer::new(
            self.attributes.clone(),
            Arc::new(graph),
            workers,
            Arc::new(sink.clone()),
        )
        .with_tracking_mode(TrackingMode::Enabled)
        .with_memory_status(Arc::new(FixedMemoryStatus::default()));
        (indexer, sink)
    }
}
