//! Domain model types used throughout reposcope.
//!
//! These types bridge the conflict store, the stable-location lookups, the
//! wire protocol and the presentation layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Identity of one external operation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OperationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OperationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an operation as seen by the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Issued or reported started, not yet concluded.
    Running,
    /// Concluded with failure while conflicts are still outstanding.
    Interrupted,
    Succeeded,
    Failed,
}

impl OperationStatus {
    /// Whether the operation has finished for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One external, potentially multi-step command the user initiated
/// (e.g. `amend --rebase`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub id: OperationId,
    /// Short label such as `rebase` or `amend --rebase`.
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub status: OperationStatus,
}

impl Operation {
    /// Create a running operation with a fresh id, started now.
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: OperationId::generate(),
            kind: kind.into(),
            args,
            started_at: Utc::now(),
            status: OperationStatus::Running,
        }
    }

    /// Create a running operation for an id reported by the backend.
    pub fn reported(id: OperationId, kind: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.into(),
            args: Vec::new(),
            started_at,
            status: OperationStatus::Running,
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

/// Resolution status of a single conflicted path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
    /// The backend cannot resolve this path (e.g. a deleted/changed
    /// conflict); it does not block continuing.
    Unresolvable,
}

impl ConflictStatus {
    /// Whether this status allows the operation to continue.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Resolved | Self::Unresolvable)
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::Resolved => write!(f, "resolved"),
            Self::Unresolvable => write!(f, "unresolvable"),
        }
    }
}

/// One path under conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictFile {
    /// Repo-relative path.
    pub path: String,
    pub status: ConflictStatus,
    /// Tool used to resolve it, e.g. `internal:union`.
    #[serde(default)]
    pub tool: Option<String>,
    /// Set while a local resolve is waiting for the backend to confirm it.
    #[serde(default)]
    pub pending_resolve: bool,
}

impl ConflictFile {
    pub fn unresolved(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: ConflictStatus::Unresolved,
            tool: None,
            pending_resolve: false,
        }
    }
}

/// Live snapshot of an in-progress operation's merge conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictSet {
    pub operation_id: OperationId,
    /// Ordered as reported by the backend.
    pub files: Vec<ConflictFile>,
    /// Which step of a multi-step operation produced this set, starting at 1.
    pub round: u32,
    /// Superseded by a newer operation.
    pub stale: bool,
    /// Last command failure reported for this set, if any.
    #[serde(default)]
    pub failure: Option<String>,
}

impl ConflictSet {
    pub fn new(operation_id: OperationId, files: Vec<ConflictFile>, round: u32) -> Self {
        Self {
            operation_id,
            files,
            round,
            stale: false,
            failure: None,
        }
    }

    pub fn file(&self, path: &str) -> Option<&ConflictFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut ConflictFile> {
        self.files.iter_mut().find(|f| f.path == path)
    }

    pub fn unresolved_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == ConflictStatus::Unresolved)
            .count()
    }

    /// Every file is resolved or unresolvable.
    pub fn all_settled(&self) -> bool {
        self.files.iter().all(|f| f.status.is_settled())
    }
}

/// Coarse state of the conflict subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Idle,
    InConflict,
    Resolvable,
}

impl std::fmt::Display for ConflictState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::InConflict => write!(f, "in_conflict"),
            Self::Resolvable => write!(f, "resolvable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Stable locations
// ---------------------------------------------------------------------------

/// A named location resolved to a commit at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StableInfo {
    pub name: String,
    pub hash: String,
    pub date: DateTime<Utc>,
    /// Free-form description shown as a tooltip.
    #[serde(default)]
    pub info: Option<String>,
}

/// A value-or-error pair as produced by the backend for each lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fetched<T> {
    pub value: Option<T>,
    pub error: Option<String>,
}

impl<T> Fetched<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            value: None,
            error: Some(error.into()),
        }
    }

    /// An error takes precedence over a value; neither means "empty".
    pub fn into_result(self) -> Result<Option<T>, String> {
        match (self.value, self.error) {
            (_, Some(error)) => Err(error),
            (value, None) => Ok(value),
        }
    }
}

/// Stable locations known to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StableLocationData {
    /// Locations the repository defines itself.
    #[serde(default)]
    pub special: Vec<Fetched<StableInfo>>,
    /// User-added locations; `None` while the backend is still resolving.
    #[serde(default)]
    pub manual: BTreeMap<String, Option<Fetched<StableInfo>>>,
    #[serde(default)]
    pub repo_supports_custom_stables: bool,
}

/// One entry offered while typing a custom stable location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeaheadOption {
    pub value: String,
    pub label: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// The newest public commit the client knows about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitRef {
    pub hash: String,
    pub date: DateTime<Utc>,
}

/// Why a placeholder entry has no details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum PlaceholderState {
    Loading,
    Failed(String),
}

/// A row in a bookmark or stable-location list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookmarkEntry {
    /// Just a bookmark name.
    Named { name: String },
    /// A resolved location with its commit details.
    Detailed {
        info: StableInfo,
        /// The location points past the latest pulled public commit.
        newer_than_latest: bool,
        /// User-added, so it can be removed.
        removable: bool,
    },
    /// A location whose details are not available.
    Placeholder {
        name: String,
        state: PlaceholderState,
    },
}

impl BookmarkEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Named { name } | Self::Placeholder { name, .. } => name,
            Self::Detailed { info, .. } => &info.name,
        }
    }
}
