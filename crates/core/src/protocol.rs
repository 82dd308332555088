//! Wire protocol spoken with the backend process.
//!
//! Messages are newline-delimited JSON objects tagged by a camelCase `type`
//! field. Inbound message types this client does not know about decode to
//! [`ServerMessage::Unrecognized`] and are ignored by the conflict subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ConflictStatus, Fetched, OperationId, StableLocationData, TypeaheadOption,
};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Commands sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Run a free-form command, e.g. `["amend", "--rebase"]`.
    #[serde(rename_all = "camelCase")]
    RunOperation {
        operation_id: OperationId,
        kind: String,
        args: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ResolveFile {
        operation_id: OperationId,
        path: String,
        tool: String,
    },
    #[serde(rename_all = "camelCase")]
    ContinueOperation { operation_id: OperationId },
    #[serde(rename_all = "camelCase")]
    AbortOperation { operation_id: OperationId },
    /// Ask the backend to re-report the current conflict state.
    FetchMergeConflicts,
    FetchStableLocations,
    FetchStableLocationAutocompleteOptions,
    AddManualStable { name: String },
    RemoveManualStable { name: String },
    FetchLatestPublicCommit,
    FetchRemoteBookmarks,
}

/// Which command a [`ServerMessage::CommandFailed`] refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Run,
    Resolve,
    Continue,
    Abort,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Resolve => write!(f, "resolve"),
            Self::Continue => write!(f, "continue"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// How an operation ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Failure,
}

/// One path in a conflict status report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportedConflict {
    pub path: String,
    pub status: ConflictStatus,
    #[serde(default)]
    pub tool: Option<String>,
}

/// Events received from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    OperationStarted {
        operation_id: OperationId,
        kind: String,
        started_at: DateTime<Utc>,
    },
    /// An operation step stopped on merge conflicts.
    #[serde(rename_all = "camelCase")]
    ConflictsStarted {
        operation_id: OperationId,
        paths: Vec<String>,
    },
    /// Authoritative per-file status. `partial` reports only cover the
    /// listed paths; full reports replace the whole set.
    #[serde(rename_all = "camelCase")]
    ConflictStatus {
        operation_id: OperationId,
        files: Vec<ReportedConflict>,
        #[serde(default)]
        partial: bool,
    },
    #[serde(rename_all = "camelCase")]
    OperationConcluded {
        operation_id: OperationId,
        outcome: Outcome,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CommandFailed {
        operation_id: OperationId,
        command: CommandKind,
        error: String,
    },
    FetchedStableLocations { stables: StableLocationData },
    FetchedStableLocationAutocompleteOptions {
        result: Fetched<Vec<TypeaheadOption>>,
    },
    LatestPublicCommit { hash: String, date: DateTime<Utc> },
    /// Remote bookmark names, in the backend's order.
    FetchedRemoteBookmarks { bookmarks: Vec<String> },
    /// Any message type this client does not handle.
    #[serde(other)]
    Unrecognized,
}

/// Discriminant of a [`ServerMessage`], used to register waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    OperationStarted,
    ConflictsStarted,
    ConflictStatus,
    OperationConcluded,
    CommandFailed,
    FetchedStableLocations,
    FetchedStableLocationAutocompleteOptions,
    LatestPublicCommit,
    FetchedRemoteBookmarks,
    Unrecognized,
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::OperationStarted { .. } => MessageKind::OperationStarted,
            Self::ConflictsStarted { .. } => MessageKind::ConflictsStarted,
            Self::ConflictStatus { .. } => MessageKind::ConflictStatus,
            Self::OperationConcluded { .. } => MessageKind::OperationConcluded,
            Self::CommandFailed { .. } => MessageKind::CommandFailed,
            Self::FetchedStableLocations { .. } => MessageKind::FetchedStableLocations,
            Self::FetchedStableLocationAutocompleteOptions { .. } => {
                MessageKind::FetchedStableLocationAutocompleteOptions
            }
            Self::LatestPublicCommit { .. } => MessageKind::LatestPublicCommit,
            Self::FetchedRemoteBookmarks { .. } => MessageKind::FetchedRemoteBookmarks,
            Self::Unrecognized => MessageKind::Unrecognized,
        }
    }

    /// The operation this message refers to, for conflict-related events.
    pub fn operation_id(&self) -> Option<&OperationId> {
        match self {
            Self::OperationStarted { operation_id, .. }
            | Self::ConflictsStarted { operation_id, .. }
            | Self::ConflictStatus { operation_id, .. }
            | Self::OperationConcluded { operation_id, .. }
            | Self::CommandFailed { operation_id, .. } => Some(operation_id),
            _ => None,
        }
    }
}

/// Encode a message as a single JSON line (without the trailing newline).
pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decode one JSON line.
pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}
