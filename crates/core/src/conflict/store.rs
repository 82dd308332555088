//! Conflict state store.
//!
//! Holds the current operation and its conflict set, and applies backend
//! events to them. Events for an operation that is no longer current are
//! dropped without touching state.

use std::collections::VecDeque;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::models::{
    ConflictFile, ConflictSet, ConflictState, ConflictStatus, Operation, OperationId,
    OperationStatus,
};
use crate::protocol::{Outcome, ReportedConflict, ServerMessage};

/// How many concluded operation ids are remembered for staleness checks.
const RETIRED_CAPACITY: usize = 64;

/// Result of applying one event to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State may have changed.
    Updated,
    /// The event refers to an operation that is no longer current.
    Stale,
    /// The event is not a conflict event.
    Ignored,
}

#[derive(Debug, Default)]
pub struct ConflictStore {
    current: Option<Operation>,
    conflicts: Option<ConflictSet>,
    /// Last set invalidated by a newer operation, flagged stale.
    superseded: Option<ConflictSet>,
    /// Conflict sets seen so far for the current operation.
    rounds: u32,
    retired: VecDeque<OperationId>,
}

impl ConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConflictState {
        match &self.conflicts {
            None => ConflictState::Idle,
            Some(set) if set.all_settled() => ConflictState::Resolvable,
            Some(_) => ConflictState::InConflict,
        }
    }

    pub fn current_operation(&self) -> Option<&Operation> {
        self.current.as_ref()
    }

    /// The active (non-stale) conflict set.
    pub fn conflicts(&self) -> Option<&ConflictSet> {
        self.conflicts.as_ref()
    }

    /// The set most recently invalidated by a newer operation. Never
    /// mutated by events.
    pub fn superseded(&self) -> Option<&ConflictSet> {
        self.superseded.as_ref()
    }

    pub fn is_retired(&self, id: &OperationId) -> bool {
        self.retired.contains(id)
    }

    /// Make a locally issued operation current, invalidating any prior
    /// conflict set.
    pub fn begin_operation(&mut self, operation: Operation) {
        info!(operation_id = %operation.id, kind = %operation.kind, "operation started");
        self.supersede(operation);
    }

    /// Optimistically mark `path` resolved with `tool` until the backend
    /// reports otherwise. Returns the id of the operation it belongs to.
    pub fn mark_resolving(
        &mut self,
        path: &str,
        tool: &str,
    ) -> Result<OperationId, OrchestratorError> {
        let set = self
            .conflicts
            .as_mut()
            .ok_or(OrchestratorError::NotInConflict)?;
        let file = set
            .file_mut(path)
            .ok_or_else(|| OrchestratorError::UnknownPath(path.to_string()))?;
        file.status = ConflictStatus::Resolved;
        file.tool = Some(tool.to_string());
        file.pending_resolve = true;
        debug!(path, tool, "optimistically marked resolved");
        Ok(set.operation_id.clone())
    }

    /// Forget the last command failure recorded on the active set.
    pub fn clear_failure(&mut self) {
        if let Some(set) = self.conflicts.as_mut() {
            set.failure = None;
        }
    }

    /// Apply one backend event.
    pub fn apply(&mut self, message: &ServerMessage) -> Applied {
        let applied = match message {
            ServerMessage::OperationStarted {
                operation_id,
                kind,
                started_at,
            } => self.on_started(Operation::reported(operation_id.clone(), kind, *started_at)),
            ServerMessage::ConflictsStarted {
                operation_id,
                paths,
            } => {
                if !self.admit(operation_id, !paths.is_empty()) {
                    Applied::Stale
                } else {
                    self.on_conflicts_started(operation_id, paths);
                    Applied::Updated
                }
            }
            ServerMessage::ConflictStatus {
                operation_id,
                files,
                partial,
            } => {
                if !self.admit(operation_id, !files.is_empty()) {
                    Applied::Stale
                } else {
                    self.on_status(operation_id, files, *partial);
                    Applied::Updated
                }
            }
            ServerMessage::OperationConcluded {
                operation_id,
                outcome,
                error,
            } => {
                if !self.admit(operation_id, false) {
                    Applied::Stale
                } else {
                    self.on_concluded(*outcome, error.as_deref());
                    Applied::Updated
                }
            }
            ServerMessage::CommandFailed {
                operation_id,
                command,
                error,
            } => {
                if !self.admit(operation_id, false) {
                    Applied::Stale
                } else {
                    warn!(%operation_id, %command, error = %error, "backend command failed");
                    if let Some(set) = self.conflicts.as_mut() {
                        set.failure = Some(format!("{} failed: {}", command, error));
                    }
                    Applied::Updated
                }
            }
            _ => Applied::Ignored,
        };

        if applied == Applied::Stale {
            debug!(kind = ?message.kind(), operation_id = ?message.operation_id(), "dropped stale event");
        }
        applied
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn on_started(&mut self, operation: Operation) -> Applied {
        if self.is_retired(&operation.id) {
            return Applied::Stale;
        }
        if let Some(current) = self.current.as_mut() {
            if current.id == operation.id {
                // Confirmation of an operation we issued ourselves.
                current.started_at = operation.started_at;
                return Applied::Updated;
            }
            if current.started_at > operation.started_at {
                return Applied::Stale;
            }
        }
        info!(operation_id = %operation.id, kind = %operation.kind, "backend reported new operation");
        self.supersede(operation);
        Applied::Updated
    }

    fn on_conflicts_started(&mut self, operation_id: &OperationId, paths: &[String]) {
        if paths.is_empty() {
            debug!(%operation_id, "operation step finished without conflicts");
            self.conflicts = None;
            return;
        }
        self.rounds += 1;
        let files = paths.iter().map(ConflictFile::unresolved).collect();
        info!(%operation_id, round = self.rounds, count = paths.len(), "operation stopped on conflicts");
        self.conflicts = Some(ConflictSet::new(operation_id.clone(), files, self.rounds));
    }

    fn on_status(&mut self, operation_id: &OperationId, reported: &[ReportedConflict], partial: bool) {
        if self.conflicts.is_none() {
            if !reported.is_empty() {
                self.rounds += 1;
                let files = reported.iter().map(to_file).collect();
                info!(%operation_id, round = self.rounds, "conflict set created from status report");
                self.conflicts = Some(ConflictSet::new(operation_id.clone(), files, self.rounds));
            }
            return;
        }
        let Some(set) = self.conflicts.as_mut() else {
            return;
        };

        if partial {
            for entry in reported {
                match set.file_mut(&entry.path) {
                    Some(file) => *file = to_file(entry),
                    None => set.files.push(to_file(entry)),
                }
            }
        } else {
            set.files = reported.iter().map(to_file).collect();
        }

        debug!(
            %operation_id,
            partial,
            files = set.files.len(),
            unresolved = set.unresolved_count(),
            "conflict status updated"
        );
        if set.files.is_empty() {
            info!(%operation_id, "all conflicts cleared");
            self.conflicts = None;
        }
    }

    fn on_concluded(&mut self, outcome: Outcome, error: Option<&str>) {
        let Some(mut operation) = self.current.take() else {
            return;
        };
        operation.status = match outcome {
            Outcome::Success => OperationStatus::Succeeded,
            // Stopped on conflicts: the operation stays current so it can be
            // continued or aborted.
            Outcome::Failure if self.conflicts.is_some() => OperationStatus::Interrupted,
            Outcome::Failure => OperationStatus::Failed,
        };

        match operation.status {
            OperationStatus::Succeeded => {
                info!(operation_id = %operation.id, "operation concluded");
                self.conflicts = None;
            }
            OperationStatus::Interrupted => {
                if let (Some(set), Some(error)) = (self.conflicts.as_mut(), error) {
                    set.failure = Some(error.to_string());
                }
                info!(operation_id = %operation.id, "operation interrupted by conflicts");
            }
            _ => {
                warn!(operation_id = %operation.id, error = error.unwrap_or("unknown"), "operation failed");
            }
        }

        if operation.status.is_terminal() {
            self.retire(operation.id);
        } else {
            self.current = Some(operation);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Whether an event for `id` applies to the current operation. With
    /// `adopt`, an event arriving while nothing is current makes its
    /// operation current (it was started outside this client). Only events
    /// that carry conflicts adopt.
    fn admit(&mut self, id: &OperationId, adopt: bool) -> bool {
        if self.is_retired(id) {
            return false;
        }
        match &self.current {
            Some(current) => current.id == *id,
            None if adopt => {
                info!(operation_id = %id, "adopting operation started elsewhere");
                self.current = Some(Operation::reported(id.clone(), "external", Utc::now()));
                self.rounds = 0;
                true
            }
            None => false,
        }
    }

    fn supersede(&mut self, operation: Operation) {
        if let Some(mut previous) = self.conflicts.take() {
            previous.stale = true;
            debug!(operation_id = %previous.operation_id, "conflict set superseded");
            self.superseded = Some(previous);
        }
        if let Some(previous) = self.current.take() {
            if previous.id != operation.id {
                self.retire(previous.id);
            }
        }
        self.rounds = 0;
        self.current = Some(operation);
    }

    fn retire(&mut self, id: OperationId) {
        if self.retired.len() == RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}

fn to_file(entry: &ReportedConflict) -> ConflictFile {
    ConflictFile {
        path: entry.path.clone(),
        status: entry.status,
        tool: entry.tool.clone(),
        pending_resolve: false,
    }
}
