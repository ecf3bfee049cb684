use std::fmt;

use strata_cache::CacheError;
use strata_core::RootUrl;

use crate::transaction::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Commit,
    RollBack,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Commit => "commit",
            Phase::RollBack => "roll back",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("service {kind} is already registered")]
    DuplicateService { kind: ServiceKind },

    #[error("service {kind} failed to {phase}: {source}")]
    Service {
        kind: ServiceKind,
        phase: Phase,
        #[source]
        source: Box<IndexError>,
    },

    #[error("transaction already finished")]
    Finished,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("index of {root} is broken: {reason}")]
    Broken { root: RootUrl, reason: String },

    #[error("compiler failed: {message}")]
    Compiler { message: String },

    #[error("required service {kind} is not registered")]
    MissingService { kind: ServiceKind },
}

/// Failure of an indexing pass reported to the scheduler, which decides whether to
/// retry the root.
#[derive(Debug, thiserror::Error)]
#[error("indexing failed for root {root}: {source}")]
pub struct IndexingError {
    pub root: RootUrl,
    #[source]
    pub source: IndexError,
}

impl IndexingError {
    pub fn new(root: &RootUrl, source: impl Into<IndexError>) -> Self {
        Self {
            root: root.clone(),
            source: source.into(),
        }
    }
}
