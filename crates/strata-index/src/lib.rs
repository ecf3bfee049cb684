//! Incremental indexing of source roots into an on-disk semantic index.
//!
//! [`RootIndexer`] drives a scan of one root: it clears what changed files produced
//! last time, runs the compile worker chain over them inside a [`Transaction`],
//! computes which files of dependent roots have to be revisited, and commits every
//! participating store together.
//!
//! The compiler itself is pluggable through [`Compiler`]; this crate only schedules it
//! and persists what it reports.

pub mod class_index;
pub mod compiler;
pub mod deps;
mod error;
mod indexer;
pub mod memory;
pub mod prefetch;
pub mod services;
mod transaction;
pub mod worker;

pub use class_index::{
    ClassIndex, ClassIndexProvider, DiskClassIndexProvider, FileFacts, PersistentClassIndex,
};
pub use compiler::{
    Analysis, AnalyzedUnit, Artifact, CompilationUnit, Compiler, CompilerError,
    GeneratedSource, SourceText,
};
pub use deps::{
    topological_sort, CycleError, DependencyQuery, DependencyResolver, Dependents, RootGraph,
    StaticRootGraph,
};
pub use error::{IndexError, IndexingError, Phase, TransactionError};
pub use indexer::{
    BinaryForSource, BinaryRoots, CollectingSink, PassOutcome, PassSummary, RootIndexer,
    ScanMetadata, ScanSession, SupplementarySink,
};
pub use memory::{FixedMemoryStatus, MemoryPressure, MemoryStatus, SystemMemoryStatus};
pub use prefetch::{CompileTuple, PrefetchEnv, PrefetchPolicy, SourcePrefetcher};
pub use services::{ClassIndexEvent, ClassIndexListener, ModifiedFilesRegistry};
pub use transaction::{RegisteredService, Service, ServiceKind, Transaction};
pub use worker::{
    BinaryCache, CompileOutput, CompileStatus, CompileWorker, CompileWorkerProvider,
    StandardWorkers,
};
