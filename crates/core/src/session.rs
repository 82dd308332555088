//! Client session.
//!
//! A [`Session`] owns everything one connection to a backend needs: the
//! request channel, the conflict store and orchestrator, and the stable
//! location caches. A single pump task reads inbound events in arrival
//! order, applies each to the store, then hands it to channel waiters and
//! subscribers, so a waiter that wakes up already sees the updated store.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::channel::RequestChannel;
use crate::conflict::{Applied, ConflictOrchestrator, ConflictStore, SharedConflictStore};
use crate::config::{AppConfig, SessionConfig};
use crate::errors::{ChannelError, TransportError};
use crate::models::ConflictSet;
use crate::protocol::{ClientMessage, MessageKind, ServerMessage};
use crate::stable::StableLocations;
use crate::transport::process::{self, ProcessHandle};
use crate::transport::Endpoint;

#[derive(Debug)]
pub struct Session {
    channel: RequestChannel,
    store: SharedConflictStore,
    orchestrator: ConflictOrchestrator,
    stables: Arc<StableLocations>,
    request_timeout: Duration,
    pump: JoinHandle<()>,
    process: Option<ProcessHandle>,
}

impl Session {
    /// Start a session over an existing transport. Must be called from
    /// within a Tokio runtime.
    pub fn connect(endpoint: Endpoint, config: &SessionConfig) -> Self {
        let Endpoint { outbound, inbound } = endpoint;
        let channel = RequestChannel::new(outbound, config.event_buffer);
        let store: SharedConflictStore = Arc::new(Mutex::new(ConflictStore::new()));
        let orchestrator = ConflictOrchestrator::new(channel.clone(), store.clone());
        let stables = Arc::new(StableLocations::new(channel.clone()));

        let pump = tokio::spawn(pump_events(
            inbound,
            channel.clone(),
            store.clone(),
            stables.clone(),
        ));
        info!("session connected");

        Self {
            channel,
            store,
            orchestrator,
            stables,
            request_timeout: config.request_timeout(),
            pump,
            process: None,
        }
    }

    /// Spawn the configured backend process and connect to it.
    pub fn spawn_backend(config: &AppConfig) -> Result<Self, TransportError> {
        let (endpoint, handle) = process::spawn(&config.backend)?;
        let mut session = Self::connect(endpoint, &config.session);
        session.process = Some(handle);
        Ok(session)
    }

    pub fn channel(&self) -> &RequestChannel {
        &self.channel
    }

    pub fn orchestrator(&self) -> &ConflictOrchestrator {
        &self.orchestrator
    }

    pub fn stables(&self) -> &StableLocations {
        &self.stables
    }

    /// How long callers should wait for a reply before giving up.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Snapshot of the active conflict set.
    pub fn conflicts(&self) -> Option<ConflictSet> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .conflicts()
            .cloned()
    }

    /// Every inbound message from now on, after it has been applied.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.channel.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.channel.is_closed()
    }

    /// Ask the backend to re-report the conflict state and wait for the
    /// report to be applied.
    #[instrument(skip(self))]
    pub async fn refresh_conflicts(&self) -> Result<Option<ConflictSet>, ChannelError> {
        let report = self.channel.await_next(MessageKind::ConflictStatus);
        self.channel.send(ClientMessage::FetchMergeConflicts);
        report.await?;
        Ok(self.conflicts())
    }

    /// Close the channel and stop the pump, then let the backend process
    /// take the commands still queued and exit.
    #[instrument(skip(self))]
    pub async fn shutdown(self) -> Result<(), TransportError> {
        self.channel.close();
        self.pump.abort();
        if let Some(process) = self.process {
            process.shutdown().await?;
        }
        info!("session shut down");
        Ok(())
    }
}

async fn pump_events(
    mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    channel: RequestChannel,
    store: SharedConflictStore,
    stables: Arc<StableLocations>,
) {
    while let Some(message) = inbound.recv().await {
        let applied = store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&message);
        if applied == Applied::Stale {
            debug!(kind = ?message.kind(), "stale event not applied");
        }
        stables.observe(&message);
        channel.dispatch(&message);
    }
    warn!("backend disconnected");
    channel.close();
}
