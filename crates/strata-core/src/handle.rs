use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Class,
    Interface,
    Enum,
    Record,
    Annotation,
    Module,
    /// A type whose precise kind is unknown, e.g. one reconstructed from an artifact
    /// manifest rather than from compiler output.
    Other,
}

impl TypeKind {
    fn is_module(self) -> bool {
        matches!(self, TypeKind::Module)
    }
}

/// Stable, serializable identity of a declared type or module.
///
/// Equality ignores the precise type kind: a handle recovered from an artifact manifest
/// (`TypeKind::Other`) is the same type as the `TypeKind::Class` handle the compiler
/// reports for it. Modules live in their own namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypeHandle {
    kind: TypeKind,
    binary_name: String,
}

impl TypeHandle {
    pub fn new(kind: TypeKind, binary_name: impl Into<String>) -> Self {
        Self {
            kind,
            binary_name: binary_name.into(),
        }
    }

    pub fn class(binary_name: impl Into<String>) -> Self {
        Self::new(TypeKind::Class, binary_name)
    }

    pub fn other(binary_name: impl Into<String>) -> Self {
        Self::new(TypeKind::Other, binary_name)
    }

    pub fn module(name: impl Into<String>) -> Self {
        Self::new(TypeKind::Module, name)
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    pub fn is_module(&self) -> bool {
        self.kind.is_module()
    }

    /// Anonymous and local classes (`Outer$1`, `Outer$1Local`) have no name another
    /// compilation unit could refer to.
    pub fn is_anonymous(&self) -> bool {
        self.binary_name
            .split('$')
            .skip(1)
            .any(|segment| segment.starts_with(|c: char| c.is_ascii_digit()))
    }

    /// Binary name of the outermost enclosing type (`p.A$B$C` -> `p.A`).
    pub fn top_level_name(&self) -> &str {
        match self.binary_name.find('$') {
            Some(idx) => &self.binary_name[..idx],
            None => &self.binary_name,
        }
    }

    /// Package part of the binary name, empty for the default package.
    pub fn package(&self) -> &str {
        let top = self.top_level_name();
        match top.rfind('.') {
            Some(idx) => &top[..idx],
            None => "",
        }
    }
}

impl PartialEq for TypeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.kind.is_module() == other.kind.is_module() && self.binary_name == other.binary_name
    }
}

impl Eq for TypeHandle {}

impl Hash for TypeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.is_module().hash(state);
        self.binary_name.hash(state);
    }
}

impl PartialOrd for TypeHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .is_module()
            .cmp(&other.kind.is_module())
            .then_with(|| self.binary_name.cmp(&other.binary_name))
    }
}

impl fmt::Display for TypeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_module() {
            write!(f, "module {}", self.binary_name)
        } else {
            f.write_str(&self.binary_name)
        }
    }
}
