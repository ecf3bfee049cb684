//! Core shared types for Strata.
//!
//! Everything in here is a plain value type: roots, indexables, type handles and the
//! declared-element model produced by the compiler collaborator. None of these types
//! hold references into compiler internals, so they can be persisted and passed
//! between threads freely.

mod decl;
pub mod fs;
mod handle;
mod root;
mod state;

pub use decl::{DeclaredElement, Diagnostic, ElementKind, Modifier, Severity};
pub use handle::{TypeHandle, TypeKind};
pub use root::{Indexable, ProjectId, RootUrl, JAVA_MIME_TYPE};
pub use state::{IndexState, TrackingMode};

/// Strata version string, recorded in persisted attributes so a version change forces a
/// full rescan.
pub const STRATA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extract a human readable message from a panic payload.
pub fn panic_payload_to_str(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        return message;
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.as_str();
    }
    "<non-string panic payload>"
}
