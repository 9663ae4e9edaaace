//! Seam between the engine and whatever delivers decoded book events.

use std::future::Future;
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use crate::controller::Shared;
use crate::error::TransportError;
use crate::types::{BookSnapshot, ProcessEntry};

/// A decoded event from a book subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Full replacement of the book.
    Snapshot(BookSnapshot),
    /// Ordered upserts/deletes from one delivered message.
    Diff(Vec<ProcessEntry>),
    /// The subscription's connection was lost.
    Disconnected,
}

/// Opaque token identifying a live subscription. Cancelling it tells the
/// transport's worker to tear the subscription down.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token the transport's worker should watch for cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Callback handed to [`Transport::subscribe`]. Events must be delivered in
/// the order the feed produced them.
///
/// A sink is bound to the subscription it was created for; once the
/// controller has moved on (stop or resync) its events are discarded.
#[derive(Clone)]
pub struct EventSink {
    session: u64,
    target: Weak<Shared>,
}

impl EventSink {
    pub(crate) fn new(session: u64, target: &Arc<Shared>) -> Self {
        Self {
            session,
            target: Arc::downgrade(target),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Deliver one event. Returns `false` once the controller is gone, so a
    /// transport worker can stop early.
    pub fn send(&self, event: SyncEvent) -> bool {
        match self.target.upgrade() {
            Some(shared) => {
                shared.handle_event(self.session, event);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("session", &self.session)
            .finish()
    }
}

/// Source of snapshot and diff events for one market.
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to `market` with at most `depth` levels per side. Resolves
    /// once the subscription is acknowledged; events flow into `sink` from then on.
    fn subscribe(
        &self,
        market: &str,
        depth: usize,
        sink: EventSink,
    ) -> impl Future<Output = Result<SubscriptionHandle, TransportError>> + Send;

    /// Release a subscription. Must not block.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

impl<T: Transport> Transport for Arc<T> {
    fn subscribe(
        &self,
        market: &str,
        depth: usize,
        sink: EventSink,
    ) -> impl Future<Output = Result<SubscriptionHandle, TransportError>> + Send {
        (**self).subscribe(market, depth, sink)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        (**self).unsubscribe(handle)
    }
}
