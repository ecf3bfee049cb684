use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CacheError, Result};
use crate::util::atomic_write;

/// Sorted `key=value` map persisted as a line-based text file.
///
/// Keys and values escape `\`, `=`, `:`, newlines and tabs with a backslash. Lines
/// starting with `#` are comments. Output is sorted so identical maps produce identical
/// files.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let corrupt = |reason| CacheError::CorruptProperties {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            };
            let split = find_separator(line).ok_or_else(|| corrupt("missing separator"))?;
            let key = unescape(&line[..split]).ok_or_else(|| corrupt("invalid escape in key"))?;
            let value =
                unescape(&line[split + 1..]).ok_or_else(|| corrupt("invalid escape in value"))?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            escape_into(key, &mut out);
            out.push('=');
            escape_into(value, &mut out);
            out.push('\n');
        }
        out
    }

    /// Load `path`. A missing file is an empty map.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(err.into()),
        };
        let text = String::from_utf8(bytes).map_err(|_| CacheError::CorruptProperties {
            path: path.to_path_buf(),
            line: 0,
            reason: "not valid utf-8",
        })?;
        Self::parse(&text, path)
    }

    /// Like [`Properties::load`], but a corrupt file is logged and read as empty.
    ///
    /// Other IO errors still propagate.
    pub fn load_lenient(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(props) => Ok(props),
            Err(err) if err.is_corrupt() => {
                tracing::warn!(
                    target = "strata.cache",
                    path = %path.display(),
                    error = %err,
                    "discarding corrupt properties file"
                );
                Ok(Self::new())
            }
            Err(err) => Err(err),
        }
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        atomic_write(path, self.render().as_bytes())
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn find_separator(line: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' | ':' => return Some(idx),
            _ => {}
        }
    }
    None
}

fn escape_into(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\="),
            ':' => out.push_str("\\:"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '#' if out.is_empty() || out.ends_with('\n') => out.push_str("\\#"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            other @ ('\\' | '=' | ':' | '#' | ' ') => out.push(other),
            _ => return None,
        }
    }
    Some(out)
}
