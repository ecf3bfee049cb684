use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::handle::{TypeHandle, TypeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Class,
    Interface,
    Enum,
    Record,
    Annotation,
    Module,
    Field,
    Method,
    Constructor,
    EnumConstant,
    RecordComponent,
}

impl ElementKind {
    pub fn is_type(self) -> bool {
        self.type_kind().is_some()
    }

    pub fn type_kind(self) -> Option<TypeKind> {
        match self {
            ElementKind::Class => Some(TypeKind::Class),
            ElementKind::Interface => Some(TypeKind::Interface),
            ElementKind::Enum => Some(TypeKind::Enum),
            ElementKind::Record => Some(TypeKind::Record),
            ElementKind::Annotation => Some(TypeKind::Annotation),
            ElementKind::Module => Some(TypeKind::Module),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ElementKind::Class => "class",
            ElementKind::Interface => "interface",
            ElementKind::Enum => "enum",
            ElementKind::Record => "record",
            ElementKind::Annotation => "annotation",
            ElementKind::Module => "module",
            ElementKind::Field => "field",
            ElementKind::Method => "method",
            ElementKind::Constructor => "constructor",
            ElementKind::EnumConstant => "enum_constant",
            ElementKind::RecordComponent => "record_component",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Public,
    Protected,
    Private,
    Static,
    Final,
    Abstract,
    Default,
    Sealed,
    NonSealed,
    Synchronized,
    Native,
    Transient,
    Volatile,
    Strictfp,
}

impl Modifier {
    pub fn as_str(self) -> &'static str {
        match self {
            Modifier::Public => "public",
            Modifier::Protected => "protected",
            Modifier::Private => "private",
            Modifier::Static => "static",
            Modifier::Final => "final",
            Modifier::Abstract => "abstract",
            Modifier::Default => "default",
            Modifier::Sealed => "sealed",
            Modifier::NonSealed => "non-sealed",
            Modifier::Synchronized => "synchronized",
            Modifier::Native => "native",
            Modifier::Transient => "transient",
            Modifier::Volatile => "volatile",
            Modifier::Strictfp => "strictfp",
        }
    }
}

/// One declared program element as reported by the compiler collaborator.
///
/// `name` is the simple name for members and the binary name for types. `signature` is
/// the erased signature (field type, method descriptor, or supertypes for a type).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredElement {
    pub kind: ElementKind,
    pub name: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub modifiers: BTreeSet<Modifier>,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub constant_value: Option<String>,
    #[serde(default)]
    pub members: Vec<DeclaredElement>,
}

impl DeclaredElement {
    pub fn new(kind: ElementKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            signature: String::new(),
            modifiers: BTreeSet::new(),
            deprecated: false,
            constant_value: None,
            members: Vec::new(),
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_modifiers(mut self, modifiers: impl IntoIterator<Item = Modifier>) -> Self {
        self.modifiers.extend(modifiers);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn with_constant(mut self, value: impl Into<String>) -> Self {
        self.constant_value = Some(value.into());
        self
    }

    pub fn with_member(mut self, member: DeclaredElement) -> Self {
        self.members.push(member);
        self
    }

    pub fn is_private(&self) -> bool {
        self.modifiers.contains(&Modifier::Private)
    }

    /// Handle of this element if it is a type or module.
    pub fn type_handle(&self) -> Option<TypeHandle> {
        self.kind
            .type_kind()
            .map(|kind| TypeHandle::new(kind, self.name.clone()))
    }

    /// Handles of this type and all nested types, outermost first.
    pub fn all_type_handles(&self) -> Vec<TypeHandle> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(element) = stack.pop() {
            if let Some(handle) = element.type_handle() {
                out.push(handle);
            }
            for member in element.members.iter().rev() {
                if member.kind.is_type() {
                    stack.push(member);
                }
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn error(line: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            line,
            message: message.into(),
        }
    }

    pub fn warning(line: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            line,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}
