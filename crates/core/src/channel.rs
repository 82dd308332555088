//! Duplex request channel to the backend process.
//!
//! Outbound commands are fire-and-forget. Replies are correlated with
//! [`RequestChannel::await_matching`], which registers a waiter for a message
//! kind plus a predicate; each inbound message handed to
//! [`RequestChannel::dispatch`] wakes every waiter of that kind whose
//! predicate accepts it. There is no replay: a waiter only sees messages
//! dispatched after it was registered.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::errors::ChannelError;
use crate::protocol::{ClientMessage, MessageKind, ServerMessage};

/// Default capacity of the subscriber broadcast buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

type Predicate = Box<dyn Fn(&ServerMessage) -> bool + Send>;

struct Waiter {
    predicate: Predicate,
    reply: oneshot::Sender<ServerMessage>,
}

#[derive(Default)]
struct WaiterTable {
    closed: bool,
    by_kind: HashMap<MessageKind, Vec<Waiter>>,
}

struct Inner {
    /// Taken on close, so the writer sees the end of the queue once it has
    /// drained what was already sent.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    waiters: Mutex<WaiterTable>,
    events: broadcast::Sender<ServerMessage>,
}

/// Cloneable handle to the channel. All clones share the same waiters.
#[derive(Clone)]
pub struct RequestChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestChannel")
            .field("closed", &self.is_closed())
            .field("pending_waiters", &self.pending_waiters())
            .finish()
    }
}

impl RequestChannel {
    /// Create a channel that writes commands into `outbound`.
    pub fn new(outbound: mpsc::UnboundedSender<ClientMessage>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                outbound: Mutex::new(Some(outbound)),
                waiters: Mutex::new(WaiterTable::default()),
                events,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, WaiterTable> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a command. Never blocks; a command on a closed channel is
    /// dropped with a warning.
    pub fn send(&self, message: ClientMessage) {
        if self.is_closed() {
            warn!(?message, "dropping command: request channel closed");
            return;
        }
        let queue = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(outbound) = queue.as_ref() else {
            warn!(?message, "dropping command: request channel closed");
            return;
        };
        trace!(?message, "sending command");
        if let Err(e) = outbound.send(message) {
            warn!(message = ?e.0, "dropping command: backend writer gone");
        }
    }

    /// Wait for the first message of `kind` accepted by `predicate`.
    ///
    /// The waiter is registered when this method is called, not when the
    /// returned future is first polled, so callers register first and then
    /// send the request that triggers the reply. The predicate runs while
    /// the channel's waiter table is locked and must not call back into the
    /// channel.
    pub fn await_matching<P>(
        &self,
        kind: MessageKind,
        predicate: P,
    ) -> impl Future<Output = Result<ServerMessage, ChannelError>> + Send + 'static
    where
        P: Fn(&ServerMessage) -> bool + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        {
            let mut table = self.table();
            if table.closed {
                debug!(?kind, "wait registered on closed channel");
            } else {
                table.by_kind.entry(kind).or_default().push(Waiter {
                    predicate: Box::new(predicate),
                    reply,
                });
            }
        }
        async move { rx.await.map_err(|_| ChannelError::ChannelClosed) }
    }

    /// Wait for the next message of `kind`, whatever its content.
    pub fn await_next(
        &self,
        kind: MessageKind,
    ) -> impl Future<Output = Result<ServerMessage, ChannelError>> + Send + 'static {
        self.await_matching(kind, |_| true)
    }

    /// Deliver an inbound message to matching waiters and to subscribers.
    ///
    /// Returns how many waiters were satisfied. Waiters whose future was
    /// dropped are pruned here.
    pub fn dispatch(&self, message: &ServerMessage) -> usize {
        let kind = message.kind();
        let mut delivered = 0;
        {
            let mut table = self.table();
            if let Some(waiters) = table.by_kind.get_mut(&kind) {
                for waiter in std::mem::take(waiters) {
                    if waiter.reply.is_closed() {
                        continue;
                    }
                    if (waiter.predicate)(message) {
                        if waiter.reply.send(message.clone()).is_ok() {
                            delivered += 1;
                        }
                    } else {
                        waiters.push(waiter);
                    }
                }
                if waiters.is_empty() {
                    table.by_kind.remove(&kind);
                }
            }
        }
        trace!(?kind, delivered, "dispatched inbound message");
        // No subscribers is fine.
        let _ = self.inner.events.send(message.clone());
        delivered
    }

    /// Mark the channel closed. Every outstanding wait fails with
    /// [`ChannelError::ChannelClosed`]. Commands already sent stay queued
    /// for the writer; the outbound queue ends after them.
    pub fn close(&self) {
        let dropped = {
            let mut table = self.table();
            if table.closed {
                return;
            }
            table.closed = true;
            let dropped: usize = table.by_kind.values().map(Vec::len).sum();
            table.by_kind.clear();
            dropped
        };
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(dropped, "request channel closed");
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    /// Number of registered waiters, including abandoned ones not yet pruned.
    pub fn pending_waiters(&self) -> usize {
        self.table().by_kind.values().map(Vec::len).sum()
    }

    /// Receive every inbound message from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationId;
    use crate::protocol::Outcome;

    fn channel() -> (RequestChannel, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RequestChannel::new(tx, DEFAULT_EVENT_BUFFER), rx)
    }

    fn concluded(id: &str) -> ServerMessage {
        ServerMessage::OperationConcluded {
            operation_id: OperationId::from(id),
            outcome: Outcome::Success,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_send_reaches_outbound() {
        let (channel, mut rx) = channel();
        channel.send(ClientMessage::FetchStableLocations);
        assert_eq!(rx.recv().await, Some(ClientMessage::FetchStableLocations));
    }

    #[tokio::test]
    async fn test_waiters_with_different_predicates_resolve_independently() {
        let (channel, _rx) = channel();
        let wait_a = channel.await_matching(MessageKind::OperationConcluded, |m| {
            m.operation_id() == Some(&OperationId::from("a"))
        });
        let wait_b = channel.await_matching(MessageKind::OperationConcluded, |m| {
            m.operation_id() == Some(&OperationId::from("b"))
        });
        let wait_any = channel.await_next(MessageKind::OperationConcluded);

        assert_eq!(channel.dispatch(&concluded("b")), 2);
        assert_eq!(channel.dispatch(&concluded("a")), 1);

        assert_eq!(wait_a.await.unwrap(), concluded("a"));
        assert_eq!(wait_b.await.unwrap(), concluded("b"));
        // The catch-all waiter saw the first message, not the second.
        assert_eq!(wait_any.await.unwrap(), concluded("b"));
        assert_eq!(channel.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_other_kinds_do_not_satisfy_waiter() {
        let (channel, _rx) = channel();
        let wait = channel.await_next(MessageKind::FetchedStableLocations);
        assert_eq!(channel.dispatch(&concluded("a")), 0);
        assert_eq!(channel.dispatch(&ServerMessage::Unrecognized), 0);
        assert_eq!(channel.pending_waiters(), 1);
        drop(wait);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_waiters() {
        let (channel, _rx) = channel();
        channel.dispatch(&concluded("a"));
        let late = channel.await_next(MessageKind::OperationConcluded);
        channel.dispatch(&concluded("b"));
        assert_eq!(late.await.unwrap(), concluded("b"));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_and_future_waits() {
        let (channel, _rx) = channel();
        let pending = channel.await_next(MessageKind::ConflictStatus);
        channel.close();
        assert_eq!(pending.await, Err(ChannelError::ChannelClosed));

        let after = channel.await_next(MessageKind::ConflictStatus);
        assert_eq!(after.await, Err(ChannelError::ChannelClosed));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_waiters_are_pruned() {
        let (channel, _rx) = channel();
        let abandoned = channel.await_next(MessageKind::OperationConcluded);
        drop(abandoned);
        assert_eq!(channel.pending_waiters(), 1);
        assert_eq!(channel.dispatch(&concluded("a")), 0);
        assert_eq!(channel.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_every_message() {
        let (channel, _rx) = channel();
        let mut events = channel.subscribe();
        channel.dispatch(&concluded("a"));
        channel.dispatch(&ServerMessage::Unrecognized);
        assert_eq!(events.recv().await.unwrap(), concluded("a"));
        assert_eq!(events.recv().await.unwrap(), ServerMessage::Unrecognized);
    }

    #[tokio::test]
    async fn test_send_after_close_is_dropped() {
        let (channel, mut rx) = channel();
        channel.close();
        channel.send(ClientMessage::FetchMergeConflicts);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_keeps_queued_commands_then_ends_queue() {
        let (channel, mut rx) = channel();
        let handle = channel.clone();
        channel.send(ClientMessage::AddManualStable { name: "mine".into() });
        channel.close();

        // A live clone does not keep the queue open.
        assert!(handle.is_closed());
        assert_eq!(
            rx.recv().await,
            Some(ClientMessage::AddManualStable { name: "mine".into() })
        );
        assert_eq!(rx.recv().await, None);
    }
}
