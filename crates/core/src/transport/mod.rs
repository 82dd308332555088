//! Transports between a [`Session`](crate::session::Session) and a backend.
//!
//! A transport is just a pair of message queues. The in-memory pair from
//! [`memory`] is used by tests and embedders; [`process::spawn`] runs the
//! backend as a child process speaking JSON lines over stdin/stdout.

pub mod process;

use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, ServerMessage};

/// Client side of a transport.
#[derive(Debug)]
pub struct Endpoint {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    /// Ends when the backend goes away.
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Backend side of an in-memory transport.
#[derive(Debug)]
pub struct BackendEndpoint {
    pub commands: mpsc::UnboundedReceiver<ClientMessage>,
    pub events: mpsc::UnboundedSender<ServerMessage>,
}

impl BackendEndpoint {
    /// Push an event to the client. Returns false once the client is gone.
    pub fn emit(&self, message: ServerMessage) -> bool {
        self.events.send(message).is_ok()
    }

    /// Next command sent by the client, or `None` once it is gone.
    pub async fn next_command(&mut self) -> Option<ClientMessage> {
        self.commands.recv().await
    }
}

/// Create a connected in-memory transport.
pub fn memory() -> (Endpoint, BackendEndpoint) {
    let (outbound, commands) = mpsc::unbounded_channel();
    let (events, inbound) = mpsc::unbounded_channel();
    (
        Endpoint { outbound, inbound },
        BackendEndpoint { commands, events },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_is_connected() {
        let (mut client, mut backend) = memory();
        client.outbound.send(ClientMessage::FetchMergeConflicts).unwrap();
        assert_eq!(
            backend.next_command().await,
            Some(ClientMessage::FetchMergeConflicts)
        );

        assert!(backend.emit(ServerMessage::Unrecognized));
        assert_eq!(client.inbound.recv().await, Some(ServerMessage::Unrecognized));

        drop(backend);
        assert_eq!(client.inbound.recv().await, None);
    }
}
