//! Kraken public WebSocket (v1) `book` channel as a [`Transport`].
//!
//! Each subscription runs on its own connection task. The task sends the
//! subscribe request, resolves the pending `subscribe` call on
//! `subscriptionStatus`, then forwards decoded book frames to the
//! [`EventSink`] until it is cancelled or the connection fails. A failure
//! after acknowledgement is reported as [`SyncEvent::Disconnected`] and the
//! task exits; re-subscribing is the controller's decision.

pub mod events;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;
use crate::transport::{EventSink, SubscriptionHandle, SyncEvent, Transport};

use events::{KrakenEvent, KrakenMessage, SubscriptionState, SUPPORTED_DEPTHS};

pub const KRAKEN_PUBLIC_WS: &str = "wss://ws.kraken.com";

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

type AckSender = oneshot::Sender<Result<(), TransportError>>;

#[derive(Debug)]
pub struct KrakenTransport {
    url: Url,
    ack_timeout: Duration,
    next_id: AtomicU64,
}

impl KrakenTransport {
    /// Create a transport for the given `ws://` or `wss://` endpoint. Does
    /// not connect; every `subscribe` opens its own connection.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let parsed = Url::parse(url)
            .map_err(|e| TransportError::InvalidRequest(format!("invalid url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidRequest(format!(
                "unsupported url scheme {}",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url: parsed,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            next_id: AtomicU64::new(0),
        })
    }

    /// How long `subscribe` waits for `subscriptionStatus`.
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Transport for KrakenTransport {
    fn subscribe(
        &self,
        market: &str,
        depth: usize,
        sink: EventSink,
    ) -> impl Future<Output = Result<SubscriptionHandle, TransportError>> + Send {
        let pair = market.to_owned();
        async move {
            if !SUPPORTED_DEPTHS.contains(&depth) {
                return Err(TransportError::InvalidRequest(format!(
                    "book depth {depth} not one of {SUPPORTED_DEPTHS:?}"
                )));
            }

            let reqid = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let handle = SubscriptionHandle::new(reqid);
            // Tears the worker down if we fail (or are dropped) before acknowledgement.
            let guard = handle.cancel_token().drop_guard();

            let (ack_tx, ack_rx) = oneshot::channel();
            let worker = BookWorker {
                url: self.url.to_string(),
                pair,
                depth,
                reqid,
                sink,
                cancel: handle.cancel_token(),
            };
            tokio::spawn(worker.run(ack_tx));

            match time::timeout(self.ack_timeout, ack_rx).await {
                Ok(Ok(Ok(()))) => {
                    let _ = guard.disarm();
                    Ok(handle)
                }
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(_)) => Err(TransportError::Connect(
                    "book worker exited before acknowledgement".into(),
                )),
                Err(_) => Err(TransportError::Timeout(self.ack_timeout)),
            }
        }
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        debug!(reqid = handle.id(), "unsubscribing book");
        handle.cancel();
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

struct BookWorker {
    url: String,
    pair: String,
    depth: usize,
    reqid: u64,
    sink: EventSink,
    cancel: CancellationToken,
}

impl BookWorker {
    async fn run(self, ack_tx: AckSender) {
        let mut ack = Some(ack_tx);
        let result = self.run_connection(&mut ack).await;

        match (result, ack.take()) {
            (Err(e), Some(tx)) => {
                let _ = tx.send(Err(e));
            }
            (Ok(()), Some(tx)) => {
                let _ = tx.send(Err(TransportError::Connect(
                    "cancelled before acknowledgement".into(),
                )));
            }
            (Err(e), None) => {
                warn!(pair = %self.pair, error = %e, "book connection lost");
                if !self.cancel.is_cancelled() {
                    self.sink.send(SyncEvent::Disconnected);
                }
            }
            (Ok(()), None) => {
                debug!(pair = %self.pair, "book connection closed");
            }
        }
    }

    async fn run_connection(&self, ack: &mut Option<AckSender>) -> Result<(), TransportError> {
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
            _ = self.cancel.cancelled() => return Ok(()),
        };
        let (ws_stream, _response) =
            connected.map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        info!(url = %self.url, pair = %self.pair, depth = self.depth, "connected, subscribing to book");

        write
            .send(Message::Text(events::subscribe_request(
                self.reqid, &self.pair, self.depth,
            )))
            .await?;

        let mut ping_interval = time::interval(PING_INTERVAL);
        ping_interval.tick().await; // consume the immediate first tick
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_text(&text, ack)? {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(TransportError::WebSocket("server closed connection".into()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(TransportError::WebSocket("stream ended".into())),
                },
                _ = ping_interval.tick() => {
                    if pong_deadline.is_some_and(|deadline| Instant::now() > deadline) {
                        return Err(TransportError::WebSocket("pong timeout".into()));
                    }
                    write.send(Message::Ping(Vec::new())).await?;
                    pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                }
                _ = self.cancel.cancelled() => {
                    debug!(pair = %self.pair, "unsubscribe requested");
                    let request = events::unsubscribe_request(self.reqid, &self.pair, self.depth);
                    let _ = write.send(Message::Text(request)).await;
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Handle one text frame. Returns `Ok(false)` when the controller is gone.
    fn handle_text(&self, text: &str, ack: &mut Option<AckSender>) -> Result<bool, TransportError> {
        let Some(message) = decode_frame(&self.pair, text) else {
            return Ok(true);
        };
        match message {
            KrakenMessage::Event(KrakenEvent::SubscriptionStatus(status)) => {
                let ours = status.reqid == Some(self.reqid)
                    || status.pair.as_deref() == Some(self.pair.as_str());
                if !ours {
                    return Ok(true);
                }
                match status.status {
                    SubscriptionState::Subscribed => {
                        info!(pair = %self.pair, channel = ?status.channel_name, "book subscribed");
                        if let Some(tx) = ack.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    SubscriptionState::Error => {
                        let message = status.error_message.unwrap_or_default();
                        return Err(TransportError::Rejected(message));
                    }
                    SubscriptionState::Unsubscribed => {
                        debug!(pair = %self.pair, "book unsubscribed");
                    }
                }
                Ok(true)
            }
            KrakenMessage::Event(KrakenEvent::SystemStatus { status, version }) => {
                debug!(%status, ?version, "kraken system status");
                Ok(true)
            }
            KrakenMessage::Event(_) => Ok(true),
            KrakenMessage::Book(update) => {
                if update.pair != self.pair {
                    return Ok(true);
                }
                Ok(self.sink.send(update.event))
            }
        }
    }
}

/// Decode one text frame. Frames we cannot decode are logged and skipped;
/// only transport failures end the connection.
fn decode_frame(pair: &str, text: &str) -> Option<KrakenMessage> {
    match events::parse_message(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(%pair, error = %e, frame = %text, "skipping undecodable frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_validates_scheme() {
        assert!(KrakenTransport::new(KRAKEN_PUBLIC_WS).is_ok());
        assert!(KrakenTransport::new("ws://127.0.0.1:9000").is_ok());
        assert!(matches!(
            KrakenTransport::new("https://ws.kraken.com"),
            Err(TransportError::InvalidRequest(_))
        ));
        assert!(matches!(
            KrakenTransport::new("not a url"),
            Err(TransportError::InvalidRequest(_))
        ));
    }

    #[test]
    fn undecodable_frames_are_skipped() {
        assert!(decode_frame("XBT/USD", "not json").is_none());
        assert!(decode_frame("XBT/USD", r#"[1,{"a":[["abc","1","0"]]},"book-10","XBT/USD"]"#).is_none());
        assert!(decode_frame("XBT/USD", r#"[1,[["5541.2","0.1"]],"trade","XBT/USD"]"#).is_none());

        let heartbeat = decode_frame("XBT/USD", r#"{"event":"heartbeat"}"#);
        assert_eq!(heartbeat, Some(KrakenMessage::Event(KrakenEvent::Heartbeat)));
    }

    #[test]
    fn ack_timeout_is_configurable() {
        let transport = KrakenTransport::new(KRAKEN_PUBLIC_WS)
            .unwrap()
            .with_ack_timeout(Duration::from_secs(3));
        assert_eq!(transport.ack_timeout, Duration::from_secs(3));
        assert_eq!(transport.url().scheme(), "wss");
    }
}
