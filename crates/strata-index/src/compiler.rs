use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;

use url::Url;

use strata_core::{DeclaredElement, Diagnostic, Indexable, TypeHandle};

/// Source text handed to [`Compiler::parse`].
#[derive(Clone, Copy, Debug)]
pub struct SourceText<'a> {
    pub indexable: &'a Indexable,
    pub text: &'a str,
    pub is_processor_generated: bool,
}

/// A parsed source. `tree` is owned by the compiler and never inspected here.
pub struct CompilationUnit {
    pub indexable: Indexable,
    pub is_processor_generated: bool,
    pub index: bool,
    pub tree: Box<dyn Any + Send>,
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("indexable", &self.indexable)
            .field("is_processor_generated", &self.is_processor_generated)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// A compiled signature artifact for one binary name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub binary_name: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(binary_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            binary_name: binary_name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Everything the compiler learned about one source.
#[derive(Clone, Debug)]
pub struct AnalyzedUnit {
    pub indexable: Indexable,
    /// Top-level declarations; nested types live in `members`.
    pub declared: Vec<DeclaredElement>,
    /// `(subtype, supertype)` edges of the declared types.
    pub supertypes: Vec<(TypeHandle, TypeHandle)>,
    /// Every type the source refers to, supertypes included.
    pub references: BTreeSet<TypeHandle>,
    pub diagnostics: Vec<Diagnostic>,
    pub artifacts: Vec<Artifact>,
    pub index: bool,
}

impl AnalyzedUnit {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// Handles of every declared type, nested ones included.
    pub fn type_handles(&self) -> Vec<TypeHandle> {
        self.declared
            .iter()
            .flat_map(DeclaredElement::all_type_handles)
            .collect()
    }
}

/// A source produced by an annotation processor while analyzing `origin`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedSource {
    pub origin: Url,
    pub indexable: Indexable,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct Analysis {
    pub units: Vec<AnalyzedUnit>,
    pub generated: Vec<GeneratedSource>,
    pub module_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CompilerError {
    pub message: String,
}

impl CompilerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The language front end. Parsing happens one source at a time so workers can check
/// memory and cancellation between sources; analysis sees the whole batch.
pub trait Compiler: Send + Sync {
    fn parse(&self, source: SourceText<'_>) -> Result<CompilationUnit, CompilerError>;

    fn analyze(&self, units: Vec<CompilationUnit>) -> Result<Analysis, CompilerError>;
}
