//! Per-root persistent state for the Strata indexer.
//!
//! Every root gets its own directory below the cache root. Everything stored there is a
//! plain properties file, a JSON document, or a path-addressed artifact, written atomically
//! so a crash never leaves a half-written file behind.

mod artifacts;
mod attributes;
mod cache_dir;
mod checksums;
mod error;
mod fingerprint;
mod fqn;
mod generated;
mod properties;
mod set_map;
mod util;

pub use artifacts::{package_of, ArtifactStore, FsArtifactStore, ARTIFACT_EXTENSION, MANIFEST_EXTENSION};
pub use attributes::{AttributeStore, AttributeStoreConfig};
pub use cache_dir::{CacheConfig, CacheDir, RootCacheDir};
pub use checksums::{structural_digest, CheckSums};
pub use error::{CacheError, Result};
pub use fingerprint::Fingerprint;
pub use fqn::FqnStore;
pub use generated::GeneratedSources;
pub use properties::Properties;
pub use util::{atomic_write, now_millis};

/// Well-known attribute keys.
pub mod keys {
    /// Module name declared by the root, if any.
    pub const MODULE_NAME: &str = "module.name";
    /// Set when the root must be fully reindexed on the next scan.
    pub const DIRTY: &str = "dirty";
    /// Persisted [`strata_core::IndexState`].
    pub const INDEX_STATE: &str = "index.state";
    /// Signature of the source path the root was last indexed with.
    pub const SOURCE_PATH: &str = "source.path";
    /// Signature of the compiler options the root was last indexed with.
    pub const COMPILER_OPTIONS: &str = "compiler.options";
    /// Source level the root was last indexed with.
    pub const SOURCE_LEVEL: &str = "source.level";
    /// Strata version that produced the cache.
    pub const STRATA_VERSION: &str = "strata.version";
}
