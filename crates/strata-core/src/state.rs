use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Validity of a root's persisted index.
///
/// `New` on first sight, `Initialized` once a pass commits cleanly, `Invalid` after a
/// detected inconsistency. An `Invalid` root only becomes `Initialized` again after a
/// full (non-incremental) pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    #[default]
    New,
    Initialized,
    Invalid,
}

impl IndexState {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexState::New => "new",
            IndexState::Initialized => "initialized",
            IndexState::Invalid => "invalid",
        }
    }

    /// State after a pass that committed successfully.
    #[must_use]
    pub fn after_commit(self, full_pass: bool) -> IndexState {
        match self {
            IndexState::New | IndexState::Initialized => IndexState::Initialized,
            IndexState::Invalid if full_pass => IndexState::Initialized,
            IndexState::Invalid => IndexState::Invalid,
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(IndexState::New),
            "initialized" => Ok(IndexState::Initialized),
            "invalid" => Ok(IndexState::Invalid),
            other => Err(format!("unknown index state `{other}`")),
        }
    }
}

/// Granularity of cross-root dependency propagation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Mark dependent roots dirty and defer all work to the next full scan.
    Disabled,
    /// Only the changed root is examined; dependent roots are marked dirty.
    WithinRoot,
    /// Roots of the same project (and roots without a project) are examined.
    WithinProject,
    /// The full transitive closure of dependent roots is examined.
    #[default]
    Enabled,
}
