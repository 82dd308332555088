//! Conflict orchestrator.
//!
//! User-facing actions on an interrupted operation: resolve a file,
//! continue, abort, or start a new operation. Every action goes out over
//! the request channel; the store is only changed optimistically by
//! `resolve` and otherwise follows the backend's events.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, instrument, warn};

use crate::channel::RequestChannel;
use crate::conflict::store::ConflictStore;
use crate::errors::OrchestratorError;
use crate::models::{ConflictSet, ConflictState, Operation, OperationId};
use crate::protocol::{ClientMessage, CommandKind, MessageKind, Outcome, ServerMessage};

/// Store handle shared between the orchestrator and the event pump.
pub type SharedConflictStore = Arc<Mutex<ConflictStore>>;

#[derive(Debug, Clone)]
pub struct ConflictOrchestrator {
    channel: RequestChannel,
    store: SharedConflictStore,
}

impl ConflictOrchestrator {
    pub fn new(channel: RequestChannel, store: SharedConflictStore) -> Self {
        Self { channel, store }
    }

    fn store(&self) -> MutexGuard<'_, ConflictStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_in_conflict(&self) -> bool {
        self.store().conflicts().is_some()
    }

    /// True iff a conflict set is active and every file in it is resolved
    /// or unresolvable.
    pub fn can_continue(&self) -> bool {
        self.store().state() == ConflictState::Resolvable
    }

    pub fn state(&self) -> ConflictState {
        self.store().state()
    }

    /// Snapshot of the active conflict set.
    pub fn conflicts(&self) -> Option<ConflictSet> {
        self.store().conflicts().cloned()
    }

    pub fn current_operation(&self) -> Option<Operation> {
        self.store().current_operation().cloned()
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Start a new operation. Any previous conflict set is invalidated.
    pub fn run_operation(&self, kind: impl Into<String>, args: Vec<String>) -> OperationId {
        let operation = Operation::new(kind, args);
        let id = operation.id.clone();
        let message = ClientMessage::RunOperation {
            operation_id: id.clone(),
            kind: operation.kind.clone(),
            args: operation.args.clone(),
        };
        self.store().begin_operation(operation);
        self.channel.send(message);
        id
    }

    /// Resolve `path` with `tool`. The file shows as resolved immediately;
    /// the next status report from the backend decides whether it stays so.
    pub fn resolve(&self, path: &str, tool: &str) -> Result<(), OrchestratorError> {
        let operation_id = {
            let mut store = self.store();
            let id = store.mark_resolving(path, tool)?;
            store.clear_failure();
            id
        };
        info!(%operation_id, path, tool, "resolving file");
        self.channel.send(ClientMessage::ResolveFile {
            operation_id,
            path: path.to_string(),
            tool: tool.to_string(),
        });
        Ok(())
    }

    /// Ask the backend to continue the interrupted operation. State is left
    /// alone until the backend reports the next step.
    pub fn continue_operation(&self) -> Result<OperationId, OrchestratorError> {
        let operation_id = {
            let mut store = self.store();
            let set = store.conflicts().ok_or(OrchestratorError::NotInConflict)?;
            if !set.all_settled() {
                return Err(OrchestratorError::Unresolved {
                    remaining: set.unresolved_count(),
                });
            }
            let id = set.operation_id.clone();
            store.clear_failure();
            id
        };
        info!(%operation_id, "continuing operation");
        self.channel.send(ClientMessage::ContinueOperation {
            operation_id: operation_id.clone(),
        });
        Ok(operation_id)
    }

    /// Abort the current operation and wait for the backend to conclude it.
    ///
    /// On failure the conflict set is left exactly as it was.
    #[instrument(skip(self))]
    pub async fn abort(&self) -> Result<(), OrchestratorError> {
        let operation_id = self
            .store()
            .current_operation()
            .map(|op| op.id.clone())
            .ok_or(OrchestratorError::NotInConflict)?;

        // Register both waits before sending so neither reply can be missed.
        let concluded = {
            let id = operation_id.clone();
            self.channel
                .await_matching(MessageKind::OperationConcluded, move |m| {
                    m.operation_id() == Some(&id)
                })
        };
        let rejected = {
            let id = operation_id.clone();
            self.channel.await_matching(MessageKind::CommandFailed, move |m| {
                matches!(
                    m,
                    ServerMessage::CommandFailed { operation_id, command: CommandKind::Abort, .. }
                        if *operation_id == id
                )
            })
        };

        info!(%operation_id, "aborting operation");
        self.channel.send(ClientMessage::AbortOperation {
            operation_id: operation_id.clone(),
        });

        let reply = tokio::select! {
            reply = concluded => reply?,
            reply = rejected => reply?,
        };

        match reply {
            ServerMessage::OperationConcluded {
                outcome: Outcome::Success,
                ..
            } => {
                info!(%operation_id, "operation aborted");
                Ok(())
            }
            ServerMessage::OperationConcluded { error, .. } => {
                let detail = error.unwrap_or_else(|| "abort failed".to_string());
                warn!(%operation_id, %detail, "abort concluded with failure");
                Err(OrchestratorError::OperationFailed {
                    operation_id,
                    detail,
                })
            }
            ServerMessage::CommandFailed { error, .. } => {
                warn!(%operation_id, %error, "abort rejected");
                Err(OrchestratorError::OperationFailed {
                    operation_id,
                    detail: error,
                })
            }
            other => Err(OrchestratorError::OperationFailed {
                operation_id,
                detail: format!("unexpected reply: {:?}", other.kind()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::DEFAULT_EVENT_BUFFER;
    use crate::errors::ChannelError;
    use crate::models::ConflictStatus;
    use crate::protocol::ReportedConflict;
    use tokio::sync::mpsc;

    struct Harness {
        orchestrator: ConflictOrchestrator,
        channel: RequestChannel,
        store: SharedConflictStore,
        sent: mpsc::UnboundedReceiver<ClientMessage>,
    }

    impl Harness {
        fn new() -> Self {
            let (tx, sent) = mpsc::unbounded_channel();
            let channel = RequestChannel::new(tx, DEFAULT_EVENT_BUFFER);
            let store = Arc::new(Mutex::new(ConflictStore::new()));
            Self {
                orchestrator: ConflictOrchestrator::new(channel.clone(), store.clone()),
                channel,
                store,
                sent,
            }
        }

        /// Apply then dispatch, the way the session pump does.
        fn deliver(&self, message: ServerMessage) {
            self.store.lock().unwrap().apply(&message);
            self.channel.dispatch(&message);
        }

        fn conflicts(&self, id: &OperationId, paths: &[&str]) {
            self.deliver(ServerMessage::ConflictsStarted {
                operation_id: id.clone(),
                paths: paths.iter().map(|p| p.to_string()).collect(),
            });
        }
    }

    #[test]
    fn test_run_operation_sends_command() {
        let mut h = Harness::new();
        let id = h
            .orchestrator
            .run_operation("rebase", vec!["-d".into(), "main".into()]);

        assert_eq!(
            h.sent.try_recv().unwrap(),
            ClientMessage::RunOperation {
                operation_id: id.clone(),
                kind: "rebase".into(),
                args: vec!["-d".into(), "main".into()],
            }
        );
        assert_eq!(h.orchestrator.current_operation().unwrap().id, id);
        assert!(!h.orchestrator.is_in_conflict());
    }

    #[test]
    fn test_can_continue_gating() {
        let h = Harness::new();
        assert!(!h.orchestrator.can_continue());

        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.conflicts(&id, &["a", "b"]);
        assert!(h.orchestrator.is_in_conflict());
        assert!(!h.orchestrator.can_continue());

        h.deliver(ServerMessage::ConflictStatus {
            operation_id: id.clone(),
            files: vec![
                ReportedConflict {
                    path: "a".into(),
                    status: ConflictStatus::Resolved,
                    tool: None,
                },
                ReportedConflict {
                    path: "b".into(),
                    status: ConflictStatus::Unresolvable,
                    tool: None,
                },
            ],
            partial: false,
        });
        assert!(h.orchestrator.can_continue());
    }

    #[test]
    fn test_continue_refused_while_unresolved() {
        let mut h = Harness::new();
        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.sent.try_recv().unwrap();

        assert_eq!(
            h.orchestrator.continue_operation(),
            Err(OrchestratorError::NotInConflict)
        );

        h.conflicts(&id, &["a", "b"]);
        assert_eq!(
            h.orchestrator.continue_operation(),
            Err(OrchestratorError::Unresolved { remaining: 2 })
        );
        assert!(h.sent.try_recv().is_err());
    }

    #[test]
    fn test_resolve_then_continue() {
        let mut h = Harness::new();
        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.sent.try_recv().unwrap();
        h.conflicts(&id, &["file1.txt"]);

        h.orchestrator.resolve("file1.txt", "internal:union").unwrap();
        assert_eq!(
            h.sent.try_recv().unwrap(),
            ClientMessage::ResolveFile {
                operation_id: id.clone(),
                path: "file1.txt".into(),
                tool: "internal:union".into(),
            }
        );
        assert!(h.orchestrator.can_continue());

        assert_eq!(h.orchestrator.continue_operation(), Ok(id.clone()));
        assert_eq!(
            h.sent.try_recv().unwrap(),
            ClientMessage::ContinueOperation { operation_id: id }
        );
        // Continuing does not clear state by itself.
        assert!(h.orchestrator.is_in_conflict());
    }

    #[test]
    fn test_resolve_unknown_path_sends_nothing() {
        let mut h = Harness::new();
        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.sent.try_recv().unwrap();
        h.conflicts(&id, &["a"]);

        assert_eq!(
            h.orchestrator.resolve("nope", "internal:union"),
            Err(OrchestratorError::UnknownPath("nope".into()))
        );
        assert!(h.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abort_success_clears_conflicts() {
        let h = Harness::new();
        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.conflicts(&id, &["a"]);

        let orchestrator = h.orchestrator.clone();
        let abort = tokio::spawn(async move { orchestrator.abort().await });
        tokio::task::yield_now().await;
        while h.channel.pending_waiters() < 2 {
            tokio::task::yield_now().await;
        }

        h.deliver(ServerMessage::OperationConcluded {
            operation_id: id,
            outcome: Outcome::Success,
            error: None,
        });
        assert_eq!(abort.await.unwrap(), Ok(()));
        assert_eq!(h.orchestrator.state(), ConflictState::Idle);
    }

    #[tokio::test]
    async fn test_abort_failure_keeps_conflicts() {
        let h = Harness::new();
        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.conflicts(&id, &["a", "b"]);
        let before = h.orchestrator.conflicts();

        let orchestrator = h.orchestrator.clone();
        let abort = tokio::spawn(async move { orchestrator.abort().await });
        while h.channel.pending_waiters() < 2 {
            tokio::task::yield_now().await;
        }

        h.deliver(ServerMessage::CommandFailed {
            operation_id: id.clone(),
            command: CommandKind::Abort,
            error: "working copy is locked".into(),
        });
        assert_eq!(
            abort.await.unwrap(),
            Err(OrchestratorError::OperationFailed {
                operation_id: id,
                detail: "working copy is locked".into(),
            })
        );
        let after = h.orchestrator.conflicts().unwrap();
        assert_eq!(Some(after.files.clone()), before.map(|s| s.files));
        assert_eq!(h.orchestrator.state(), ConflictState::InConflict);
    }

    #[tokio::test]
    async fn test_abort_fails_when_channel_closes() {
        let h = Harness::new();
        let id = h.orchestrator.run_operation("rebase", vec![]);
        h.conflicts(&id, &["a"]);

        let orchestrator = h.orchestrator.clone();
        let abort = tokio::spawn(async move { orchestrator.abort().await });
        while h.channel.pending_waiters() < 2 {
            tokio::task::yield_now().await;
        }
        h.channel.close();

        assert_eq!(
            abort.await.unwrap(),
            Err(OrchestratorError::Channel(ChannelError::ChannelClosed))
        );
    }

    #[tokio::test]
    async fn test_abort_without_operation() {
        let h = Harness::new();
        assert_eq!(
            h.orchestrator.abort().await,
            Err(OrchestratorError::NotInConflict)
        );
    }
}
