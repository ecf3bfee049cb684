use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use url::Url;

pub const JAVA_MIME_TYPE: &str = "text/x-java";

/// Identity of one classpath/source entry: the unit of indexing and of transactional
/// atomicity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RootUrl(Url);

impl RootUrl {
    pub fn new(url: Url) -> Self {
        Self(normalize_dir_url(url))
    }

    pub fn parse(input: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(input)?))
    }

    /// Build a `file:` root from an absolute directory path.
    ///
    /// Returns `None` for relative paths.
    pub fn from_dir(path: impl AsRef<Path>) -> Option<Self> {
        Url::from_directory_path(path.as_ref()).ok().map(Self)
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Local directory backing this root, if it is a `file:` URL.
    pub fn to_dir(&self) -> Option<PathBuf> {
        if self.0.scheme() != "file" {
            return None;
        }
        self.0.to_file_path().ok()
    }

    /// Resolve a `/`-separated path relative to this root.
    pub fn join(&self, relative_path: &str) -> Option<Url> {
        self.0.join(relative_path.trim_start_matches('/')).ok()
    }

    /// Compute the root-relative path of `url`, if `url` lives under this root.
    pub fn relativize(&self, url: &Url) -> Option<String> {
        let base = self.0.as_str();
        url.as_str().strip_prefix(base).map(str::to_string)
    }
}

fn normalize_dir_url(mut url: Url) -> Url {
    // Directory URLs must end in `/` or `Url::join` replaces the last segment.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl fmt::Display for RootUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of the project owning a root, as reported by the root-graph collaborator.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// A unit of source identified independent of file-system liveness.
///
/// The URL may point at a file that no longer exists (deleted sources are still
/// reported as indexables so their artifacts can be cleared).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Indexable {
    pub relative_path: String,
    pub url: Url,
    pub mime_type: String,
}

impl Indexable {
    pub fn new(relative_path: impl Into<String>, url: Url, mime_type: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            url,
            mime_type: mime_type.into(),
        }
    }

    /// Create a Java indexable for `relative_path` under `root`.
    pub fn java(root: &RootUrl, relative_path: &str) -> Option<Self> {
        let url = root.join(relative_path)?;
        Some(Self::new(relative_path, url, JAVA_MIME_TYPE))
    }

    /// Relative path without its extension (`p/A.java` -> `p/A`).
    pub fn stem(&self) -> &str {
        let path = self.relative_path.as_str();
        let file_start = path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
        match path[file_start..].rfind('.') {
            Some(dot) => &path[..file_start + dot],
            None => path,
        }
    }

    /// File name including extension.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(self.relative_path.as_str())
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        name.rfind('.').map(|dot| &name[dot + 1..])
    }

    pub fn to_path(&self) -> Option<PathBuf> {
        if self.url.scheme() != "file" {
            return None;
        }
        self.url.to_file_path().ok()
    }
}
