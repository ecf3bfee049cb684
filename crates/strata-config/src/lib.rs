//! Configuration and logging setup for Strata.
//!
//! A workspace is configured through a single TOML file (see [`discover_config_path`]).
//! Every field has a default, so an empty file and a missing file behave the same.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

pub use strata_core::TrackingMode;

/// Top-level configuration document.
///
/// ```toml
/// [logging]
/// level = "strata.index=debug,info"
///
/// [indexing]
/// dependency_tracking = "within_project"
/// max_processor_rounds = 2
///
/// [indexing.prefetch]
/// buffer_budget_bytes = "1MiB"
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrataConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file. If it cannot be opened, file logging is disabled while
    /// other sinks remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective filter: configured directives with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexingConfig {
    /// How far changes propagate to dependent roots.
    #[serde(default)]
    pub dependency_tracking: TrackingMode,

    /// Upper bound on compile rounds triggered by processor-generated sources.
    #[serde(default = "IndexingConfig::default_max_processor_rounds")]
    pub max_processor_rounds: u32,

    /// Override for the cache directory. `STRATA_CACHE_DIR` takes precedence.
    #[serde(default)]
    pub cache_root: Option<PathBuf>,

    #[serde(default)]
    pub prefetch: PrefetchConfig,

    #[serde(default)]
    pub attributes: AttributesConfig,
}

impl IndexingConfig {
    fn default_max_processor_rounds() -> u32 {
        2
    }

    /// Cache root from the environment, then from this config.
    pub fn effective_cache_root(&self) -> Option<PathBuf> {
        std::env::var_os("STRATA_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| self.cache_root.clone())
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            dependency_tracking: TrackingMode::default(),
            max_processor_rounds: Self::default_max_processor_rounds(),
            cache_root: None,
            prefetch: PrefetchConfig::default(),
            attributes: AttributesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrefetchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent prefetch needs at least this many logical processors.
    #[serde(default = "PrefetchConfig::default_min_processors")]
    pub min_processors: usize,

    /// Batches of this many tuples or fewer are read sequentially.
    #[serde(default = "PrefetchConfig::default_min_batch_size")]
    pub min_batch_size: usize,

    /// Process-wide budget for prefetched but not yet released source bytes.
    #[serde(default = "PrefetchConfig::default_buffer_budget")]
    pub buffer_budget_bytes: ByteSize,

    /// Largest amount of a single file read ahead into memory.
    #[serde(default = "PrefetchConfig::default_max_chunk")]
    pub max_chunk_bytes: ByteSize,

    /// Worker threads; defaults to the number of logical processors.
    #[serde(default)]
    pub threads: Option<usize>,
}

impl PrefetchConfig {
    fn default_min_processors() -> usize {
        4
    }

    fn default_min_batch_size() -> usize {
        10
    }

    fn default_buffer_budget() -> ByteSize {
        ByteSize(1024 * 1024)
    }

    fn default_max_chunk() -> ByteSize {
        ByteSize(64 * 1024)
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_processors: Self::default_min_processors(),
            min_batch_size: Self::default_min_batch_size(),
            buffer_budget_bytes: Self::default_buffer_budget(),
            max_chunk_bytes: Self::default_max_chunk(),
            threads: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributesConfig {
    #[serde(default = "AttributesConfig::default_write_delay_ms")]
    pub write_delay_ms: u64,

    #[serde(default = "AttributesConfig::default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
}

impl AttributesConfig {
    fn default_write_delay_ms() -> u64 {
        500
    }

    fn default_cache_ttl_ms() -> u64 {
        30_000
    }

    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            write_delay_ms: Self::default_write_delay_ms(),
            cache_ttl_ms: Self::default_cache_ttl_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A byte count written either as an integer or with a unit suffix (`64KiB`, `1MiB`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => parse_byte_size(&value)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| "byte size must start with a number".to_string())?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return Err("unknown byte size unit".to_string()),
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| "byte size overflows".to_string())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

fn sanitize_toml_error_message(message: &str) -> String {
    // Messages may embed user-provided values such as paths.
    static QUOTED: OnceLock<Option<regex::Regex>> = OnceLock::new();
    static BACKTICKED_VALUE: OnceLock<Option<regex::Regex>> = OnceLock::new();

    let quoted = QUOTED.get_or_init(|| regex::Regex::new(r#""(?:\\.|[^"\\])*""#).ok());
    let mut out = match quoted {
        Some(re) => re.replace_all(message, r#""<redacted>""#).into_owned(),
        None => message.to_owned(),
    };

    let backticked = BACKTICKED_VALUE
        .get_or_init(|| regex::Regex::new(r"(unknown (?:field|variant) )`[^`]*`").ok());
    if let Some(re) = backticked {
        out = re.replace_all(&out, "$1`<redacted>`").into_owned();
    }
    out
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(sanitize_toml_error_message(err.message()))
    }
}

impl StrataConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }
}

pub const STRATA_CONFIG_ENV_VAR: &str = "STRATA_CONFIG_PATH";

static CONFIG_ENV_LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();

fn config_env_lock() -> &'static ReentrantMutex<()> {
    CONFIG_ENV_LOCK.get_or_init(|| ReentrantMutex::new(()))
}

/// Run `f` while holding the config environment lock.
///
/// Tests that set [`STRATA_CONFIG_ENV_VAR`] must do so inside this lock so concurrent
/// discovery in other tests does not observe the override.
pub fn with_config_env_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = config_env_lock().lock();
    f()
}

/// Discover the configuration file for a workspace root.
///
/// Search order:
/// 1) `STRATA_CONFIG_PATH` (absolute or relative to `workspace_root`)
/// 2) `strata.toml` in `workspace_root`
/// 3) `.strata.toml` in `workspace_root`
pub fn discover_config_path(workspace_root: &Path) -> Option<PathBuf> {
    let _guard = config_env_lock().lock();
    if let Some(value) = std::env::var_os(STRATA_CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(value);
        let path = if candidate.is_absolute() {
            candidate
        } else {
            workspace_root.join(candidate)
        };
        return Some(path.canonicalize().unwrap_or(path));
    }

    ["strata.toml", ".strata.toml"]
        .into_iter()
        .map(|name| workspace_root.join(name))
        .find(|path| path.is_file())
        .map(|path| path.canonicalize().unwrap_or(path))
}

/// Load the configuration for a workspace root.
///
/// If no config is present, returns [`StrataConfig::default`] and `None`.
pub fn load_for_workspace(
    workspace_root: &Path,
) -> Result<(StrataConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(workspace_root) else {
        return Ok((StrataConfig::default(), None));
    };

    let config = StrataConfig::load_from_path(&path)?;
    Ok((config, Some(path)))
}

struct SharedFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            guard: self.file.lock(),
        }
    }
}

struct SharedFileWriter<'a> {
    guard: parking_lot::MutexGuard<'a, std::fs::File>,
}

impl Write for SharedFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber.
///
/// Safe to call multiple times; only the first call has an effect. Returns `true` if this
/// call installed the subscriber.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let mut installed = false;
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let file = config.file.as_ref().and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
        let file_open_failed = config.file.is_some() && file.is_none();

        let mut make_writer = BoxMakeWriter::new(io::sink);
        if config.stderr {
            // Keeps `cargo test` output capture working in debug builds.
            make_writer = if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(io::stderr)
            };
        }
        if let Some(file) = file {
            let file = Arc::new(Mutex::new(file));
            make_writer = BoxMakeWriter::new(make_writer.and(SharedFileMakeWriter { file }));
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        installed = tracing::subscriber::set_global_default(subscriber).is_ok();
        if installed && file_open_failed {
            if let Some(path) = config.file.as_ref() {
                tracing::warn!(
                    target: "strata.config",
                    path = %path.display(),
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
    installed
}
