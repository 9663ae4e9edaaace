//! Live order book synchronization.
//!
//! [`SyncController`] owns the [`PriceLevelStore`], the [`UpdateBuffer`] and
//! the [`SyncStateMachine`] for one market. Transport workers push events into
//! it through an [`EventSink`]; every mutation happens under one mutex and
//! ends by publishing an immutable [`BookView`] on a `watch` channel, which is
//! what all queries read.
//!
//! # Architecture
//!
//! ```text
//!   transport worker(s) --EventSink::send--> Shared::handle_event
//!                                              | (mutex: SyncCore)
//!                                              |  snapshot -> store.reset, drain buffer
//!                                              |  diff     -> buffer.push | store.apply
//!                                              |  lost     -> Resyncing, notify supervisor
//!                                              v
//!                     watch::Sender<Arc<BookView>>   watch::Sender<SyncState>
//!                                |                              |
//!                 best_bid / depth / subscribe_book     start / resync waiters
//!
//!   supervisor task (per start): auto-resync on disconnect, staleness checks
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::UpdateBuffer;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::state::{SyncState, SyncStateMachine, Transition};
use crate::store::{BookView, PriceLevelStore};
use crate::transport::{EventSink, SubscriptionHandle, SyncEvent, Transport};
use crate::types::{BookSnapshot, PriceLevel, ProcessEntry, Side};

/// Smallest period accepted for the supervisor's staleness interval.
const MIN_STALE_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResyncReason {
    Disconnected,
    Stale,
}

// ---------------------------------------------------------------------------
// Mutable core (guarded by Shared::core)
// ---------------------------------------------------------------------------

struct SyncCore {
    market: String,
    machine: SyncStateMachine,
    store: PriceLevelStore,
    buffer: UpdateBuffer,
    /// Identifies the subscription whose events are currently accepted.
    session: u64,
    handle: Option<SubscriptionHandle>,
    /// Cancelled by stop(); lives from start() until then.
    lifetime: Option<CancellationToken>,
    resync_tx: Option<mpsc::UnboundedSender<ResyncReason>>,
    last_event: Option<Instant>,
    last_error: Option<SyncError>,
}

impl SyncCore {
    fn new(config: &SyncConfig) -> Self {
        Self {
            market: config.market.clone(),
            machine: SyncStateMachine::new(),
            store: PriceLevelStore::new(config.depth_limit),
            buffer: UpdateBuffer::new(),
            session: 0,
            handle: None,
            lifetime: None,
            resync_tx: None,
            last_event: None,
            last_error: None,
        }
    }

    /// Data for the live session proves the subscription was acknowledged,
    /// even if `subscribe` has not returned to us yet.
    fn acknowledge(&mut self) {
        let transition = match self.machine.state() {
            SyncState::Connecting => Transition::Subscribed,
            SyncState::Resyncing => Transition::Resubscribed,
            _ => return,
        };
        if let Err(e) = self.machine.apply(transition) {
            error!(market = %self.market, error = %e, "subscription acknowledgement rejected");
        }
    }

    fn on_snapshot_received(&mut self, snapshot: BookSnapshot) {
        self.acknowledge();
        self.store.reset(&snapshot);
        if let Err(e) = self.machine.apply(Transition::SnapshotApplied) {
            error!(market = %self.market, error = %e, "snapshot applied in unexpected state");
            return;
        }
        // Drain strictly after reset, or buffered deletions would be wiped.
        match self.buffer.drain_into(&mut self.store) {
            Ok(replayed) => info!(
                market = %self.market,
                session = self.session,
                bids = self.store.len(Side::Bid),
                asks = self.store.len(Side::Ask),
                replayed,
                "snapshot applied",
            ),
            Err(e) => error!(market = %self.market, error = %e, "buffered diff replay failed"),
        }
    }

    fn on_diff_received(&mut self, entries: Vec<ProcessEntry>) {
        self.acknowledge();
        match self.machine.state() {
            SyncState::Syncing => {
                self.buffer.push(entries);
                debug!(market = %self.market, buffered = self.buffer.len(), "diff buffered until snapshot");
            }
            SyncState::Synced => {
                if let Err(e) = self.store.apply(&entries) {
                    error!(market = %self.market, error = %e, "diff rejected by store");
                }
            }
            state => {
                warn!(market = %self.market, %state, entries = entries.len(), "discarding diff");
            }
        }
    }

    fn on_connection_lost(&mut self) {
        let state = self.machine.state();
        // The transport acknowledged and then lost the connection before
        // subscribe() returned to us. Resync it like any other loss.
        self.acknowledge();
        if let Err(e) = self.machine.apply(Transition::ConnectionLost) {
            error!(market = %self.market, error = %e, "cannot enter resync");
            return;
        }
        // The dead subscription must not feed the book any more.
        self.session += 1;
        self.buffer.clear();
        warn!(market = %self.market, from = %state, "connection lost, serving last-known book until resynced");
        if let Some(tx) = &self.resync_tx {
            let _ = tx.send(ResyncReason::Disconnected);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state reachable from transport workers
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    core: Mutex<SyncCore>,
    status_tx: watch::Sender<SyncState>,
    book_tx: watch::Sender<Arc<BookView>>,
}

impl Shared {
    fn new(config: &SyncConfig) -> Self {
        let (status_tx, _) = watch::channel(SyncState::Disconnected);
        let (book_tx, _) = watch::channel(Arc::new(BookView::empty()));
        Self {
            core: Mutex::new(SyncCore::new(config)),
            status_tx,
            book_tx,
        }
    }

    /// Entry point for every transport event.
    pub(crate) fn handle_event(&self, session: u64, event: SyncEvent) {
        let mut core = self.core.lock();
        let state = core.machine.state();
        if session != core.session || !state.is_active() {
            warn!(
                market = %core.market,
                session,
                current = core.session,
                %state,
                "discarding event from inactive subscription",
            );
            return;
        }

        core.last_event = Some(Instant::now());
        match event {
            SyncEvent::Snapshot(snapshot) => core.on_snapshot_received(snapshot),
            SyncEvent::Diff(entries) => core.on_diff_received(entries),
            SyncEvent::Disconnected => core.on_connection_lost(),
        }
        self.publish(&core);
    }

    /// Publish the book, then the state, so a waiter that observes `Synced`
    /// also observes the book that got it there.
    fn publish(&self, core: &SyncCore) {
        let view = core.store.view();
        self.book_tx.send_if_modified(|current| {
            if current.sequence == view.sequence && current.updated_at == view.updated_at {
                return false;
            }
            *current = Arc::new(view);
            true
        });

        let state = core.machine.state();
        self.status_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn status(&self) -> SyncState {
        *self.status_tx.borrow()
    }

    fn book(&self) -> Arc<BookView> {
        Arc::clone(&self.book_tx.borrow())
    }
}

// ---------------------------------------------------------------------------
// SyncController
// ---------------------------------------------------------------------------

/// Maintains a live book for one market from a snapshot plus ordered diffs.
///
/// Call [`start`](Self::start) to subscribe and wait for the first snapshot;
/// read with [`best_bid`](Self::best_bid), [`best_ask`](Self::best_ask),
/// [`depth`](Self::depth) or [`book`](Self::book), or await changes through
/// [`subscribe_book`](Self::subscribe_book). Dropping the controller stops it.
pub struct SyncController<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> SyncController<T> {
    pub fn new(config: SyncConfig, transport: T) -> Self {
        let shared = Arc::new(Shared::new(&config));
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                shared,
            }),
        }
    }

    /// Subscribe and wait until the first snapshot is applied.
    ///
    /// Returns immediately when already `Synced`; joins the in-progress wait
    /// when a start or resync is under way.
    ///
    /// # Errors
    ///
    /// - [`SyncError::SubscriptionFailed`] if the transport rejects the
    ///   subscription (the controller returns to `Disconnected`).
    /// - [`SyncError::Timeout`] if no snapshot arrives within
    ///   `snapshot_timeout`. The subscription stays open.
    /// - [`SyncError::Cancelled`] if [`stop`](Self::stop) is called meanwhile.
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    /// Re-subscribe and wait for a fresh snapshot. Readers keep seeing the
    /// previous book, with status `Resyncing`, until it arrives.
    ///
    /// Returns `Ok(false)` if the controller is not started.
    pub async fn resync(&self) -> Result<bool> {
        self.inner.resync().await
    }

    /// Release the subscription, clear the book and return to
    /// `Disconnected`. Any pending `start`/`resync` returns
    /// [`SyncError::Cancelled`].
    pub fn stop(&self) {
        self.inner.shutdown(None);
    }

    pub fn status(&self) -> SyncState {
        self.inner.shared.status()
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.inner.shared.book().best_bid()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.inner.shared.book().best_ask()
    }

    /// Up to `n` levels of `side`, best first, from one consistent view.
    pub fn depth(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        self.inner.shared.book().depth(side, n)
    }

    /// Latest published view of the whole book.
    pub fn book(&self) -> Arc<BookView> {
        self.inner.shared.book()
    }

    /// Receiver that changes on every published book mutation.
    pub fn subscribe_book(&self) -> watch::Receiver<Arc<BookView>> {
        self.inner.shared.book_tx.subscribe()
    }

    /// Receiver that changes on every state transition.
    pub fn subscribe_status(&self) -> watch::Receiver<SyncState> {
        self.inner.shared.status_tx.subscribe()
    }

    /// Error that made the supervisor give up, if any, since the last start.
    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.shared.core.lock().last_error.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }
}

impl<T: Transport> Drop for SyncController<T> {
    fn drop(&mut self) {
        if self.inner.shared.status().is_active() {
            self.inner.shutdown(None);
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

struct Inner<T> {
    config: SyncConfig,
    transport: T,
    shared: Arc<Shared>,
}

enum StartPlan {
    AlreadySynced,
    Join(Option<CancellationToken>),
    Subscribe {
        session: u64,
        lifetime: CancellationToken,
    },
}

impl<T: Transport> Inner<T> {
    async fn start(self: &Arc<Self>) -> Result<()> {
        let plan = {
            let mut core = self.shared.core.lock();
            match core.machine.state() {
                SyncState::Synced => StartPlan::AlreadySynced,
                SyncState::Disconnected => {
                    core.machine.apply(Transition::Start)?;
                    core.session += 1;
                    core.last_error = None;

                    let lifetime = CancellationToken::new();
                    let (resync_tx, resync_rx) = mpsc::unbounded_channel();
                    core.lifetime = Some(lifetime.clone());
                    core.resync_tx = Some(resync_tx);
                    self.shared.publish(&core);

                    tokio::spawn(supervise(Arc::clone(self), resync_rx, lifetime.clone()));
                    StartPlan::Subscribe {
                        session: core.session,
                        lifetime,
                    }
                }
                _ => StartPlan::Join(core.lifetime.clone()),
            }
        };

        match plan {
            StartPlan::AlreadySynced => Ok(()),
            StartPlan::Join(Some(lifetime)) => self.wait_for_synced(&lifetime).await,
            StartPlan::Join(None) => Err(SyncError::Cancelled),
            StartPlan::Subscribe { session, lifetime } => {
                info!(market = %self.config.market, depth = self.config.depth_limit, "starting book sync");
                if let Err(e) = self.subscribe_session(session, &lifetime).await {
                    if !lifetime.is_cancelled() {
                        self.shutdown(None);
                    }
                    return Err(e);
                }
                self.wait_for_synced(&lifetime).await
            }
        }
    }

    async fn resync(&self) -> Result<bool> {
        let (session, previous, lifetime) = {
            let mut core = self.shared.core.lock();
            if core.machine.state() == SyncState::Disconnected {
                return Ok(false);
            }
            core.machine.apply(Transition::Resync)?;
            core.session += 1;
            core.buffer.clear();
            self.shared.publish(&core);
            (core.session, core.handle.take(), core.lifetime.clone())
        };

        let Some(lifetime) = lifetime else {
            return Err(SyncError::Cancelled);
        };
        if let Some(handle) = previous {
            self.transport.unsubscribe(handle);
        }

        info!(market = %self.config.market, session, "resyncing book");
        self.subscribe_session(session, &lifetime).await?;
        self.wait_for_synced(&lifetime).await?;
        Ok(true)
    }

    /// Issue the transport subscription for `session` and record its handle.
    async fn subscribe_session(&self, session: u64, lifetime: &CancellationToken) -> Result<()> {
        let sink = EventSink::new(session, &self.shared);
        let handle = match self
            .transport
            .subscribe(&self.config.market, self.config.depth_limit, sink)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                if lifetime.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }
                warn!(market = %self.config.market, session, error = %e, "subscription failed");
                return Err(SyncError::SubscriptionFailed(e));
            }
        };

        let superseded = {
            let mut core = self.shared.core.lock();
            // A session bumped meanwhile was stopped or already lost its
            // connection; the supervisor owns the replacement.
            if lifetime.is_cancelled() || core.session != session {
                Some(handle)
            } else {
                core.acknowledge();
                core.handle = Some(handle);
                self.shared.publish(&core);
                None
            }
        };

        if let Some(handle) = superseded {
            debug!(market = %self.config.market, session, "releasing superseded subscription");
            self.transport.unsubscribe(handle);
        }
        if lifetime.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Suspend until the state reaches `Synced`, the lifetime is cancelled,
    /// or `snapshot_timeout` elapses.
    async fn wait_for_synced(&self, lifetime: &CancellationToken) -> Result<()> {
        let timeout = self.config.snapshot_timeout;
        let mut status_rx = self.shared.status_tx.subscribe();
        let synced = async {
            loop {
                let state = *status_rx.borrow_and_update();
                if state == SyncState::Synced {
                    return Ok(());
                }
                if status_rx.changed().await.is_err() {
                    return Err(SyncError::Cancelled);
                }
            }
        };

        tokio::select! {
            _ = lifetime.cancelled() => {
                let recorded = self.shared.core.lock().last_error.clone();
                Err(recorded.unwrap_or(SyncError::Cancelled))
            }
            result = tokio::time::timeout(timeout, synced) => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!(market = %self.config.market, ?timeout, "no snapshot before timeout");
                    Err(SyncError::Timeout(timeout))
                }
            },
        }
    }

    fn shutdown(&self, error: Option<SyncError>) {
        let handle = {
            let mut core = self.shared.core.lock();
            let was = core.machine.state();
            if let Some(lifetime) = core.lifetime.take() {
                lifetime.cancel();
            }
            core.resync_tx = None;
            core.session += 1;
            let _ = core.machine.apply(Transition::Stop);
            core.buffer.clear();
            core.store.clear();
            core.last_event = None;
            if error.is_some() {
                core.last_error = error;
            }
            self.shared.publish(&core);
            if was.is_active() {
                info!(market = %core.market, from = %was, "book sync stopped");
            }
            core.handle.take()
        };

        if let Some(handle) = handle {
            self.transport.unsubscribe(handle);
        }
    }

    fn is_stale(&self) -> bool {
        let Some(after) = self.config.stale_after else {
            return false;
        };
        let core = self.shared.core.lock();
        core.machine.state() == SyncState::Synced
            && core.last_event.is_some_and(|at| at.elapsed() > after)
    }

    /// Resync with retries. Gives up after `max_resync_attempts` failures by
    /// stopping the controller and recording the last error.
    async fn auto_resync(
        &self,
        reason: ResyncReason,
        lifetime: &CancellationToken,
        resync_rx: &mut mpsc::UnboundedReceiver<ResyncReason>,
    ) {
        let attempts = self.config.max_resync_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            tokio::select! {
                _ = tokio::time::sleep(self.config.resync_delay) => {}
                _ = lifetime.cancelled() => return,
            }

            match self.resync().await {
                Ok(true) => {
                    // Requests queued while resyncing refer to replaced subscriptions.
                    while resync_rx.try_recv().is_ok() {}
                    if self.shared.status() != SyncState::Resyncing {
                        info!(market = %self.config.market, ?reason, attempt, "book resynchronized");
                        return;
                    }
                }
                Ok(false) | Err(SyncError::Cancelled) => return,
                Err(e) => {
                    warn!(market = %self.config.market, ?reason, attempt, attempts, error = %e, "resync attempt failed");
                    last_error = Some(e);
                }
            }
        }

        error!(market = %self.config.market, attempts, "giving up on resync, stopping");
        self.shutdown(last_error);
    }
}

/// Background task started by `start()`; exits on `stop()`.
async fn supervise<T: Transport>(
    inner: Arc<Inner<T>>,
    mut resync_rx: mpsc::UnboundedReceiver<ResyncReason>,
    lifetime: CancellationToken,
) {
    let mut stale_check =
        tokio::time::interval(inner.config.stale_check_interval.max(MIN_STALE_CHECK));
    stale_check.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            _ = lifetime.cancelled() => {
                debug!(market = %inner.config.market, "supervisor shutdown");
                break;
            }
            request = resync_rx.recv() => match request {
                Some(reason) => inner.auto_resync(reason, &lifetime, &mut resync_rx).await,
                None => break,
            },
            _ = stale_check.tick() => {
                if inner.is_stale() {
                    warn!(market = %inner.config.market, "book stale, resyncing");
                    inner.auto_resync(ResyncReason::Stale, &lifetime, &mut resync_rx).await;
                }
            }
        }
    }
}
