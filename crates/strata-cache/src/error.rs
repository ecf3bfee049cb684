use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by cache management and persistence.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("corrupt properties file {path} (line {line}): {reason}")]
    CorruptProperties {
        path: PathBuf,
        line: usize,
        reason: &'static str,
    },

    #[error("root url {url} does not name a local directory")]
    InvalidRootUrl { url: String },

    #[error("invalid binary name {name:?}")]
    InvalidBinaryName { name: String },
}

impl CacheError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CacheError::CorruptProperties { .. } | CacheError::Json { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        // Index documents hold user paths; keep only structure and position.
        let message = redact_quoted(&err.to_string());
        Self::Json { message }
    }
}

fn redact_quoted(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let bytes = rest.as_bytes();
        let end = bytes.iter().enumerate().position(|(idx, &b)| {
            if b != b'"' {
                return false;
            }
            let backslashes = bytes[..idx].iter().rev().take_while(|&&c| c == b'\\').count();
            backslashes % 2 == 0
        });

        let Some(end) = end else {
            out.push_str("<redacted>");
            rest = "";
            break;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}
