//! Kraken WebSocket v1 messages relevant to the `book` channel.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use crate::error::TransportError;
use crate::transport::SyncEvent;
use crate::types::{BookSnapshot, ProcessEntry, Side};

/// Depths Kraken accepts for a `book` subscription.
pub const SUPPORTED_DEPTHS: [usize; 5] = [10, 25, 100, 500, 1000];

/// Object-shaped (control) messages, tagged by their `event` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum KrakenEvent {
    Heartbeat,
    Pong {
        #[serde(default)]
        reqid: Option<u64>,
    },
    SystemStatus {
        #[serde(default)]
        status: String,
        #[serde(default)]
        version: Option<String>,
    },
    SubscriptionStatus(SubscriptionStatus),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Subscribed,
    Unsubscribed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    #[serde(rename = "channelID", default)]
    pub channel_id: Option<u64>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub pair: Option<String>,
    pub status: SubscriptionState,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub reqid: Option<u64>,
}

/// One decoded `book-N` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub channel_id: u64,
    pub channel_name: String,
    pub pair: String,
    /// `Snapshot` for `as`/`bs` payloads, `Diff` for `a`/`b` payloads.
    pub event: SyncEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum KrakenMessage {
    Event(KrakenEvent),
    Book(BookUpdate),
}

/// `{"as": [...], "bs": [...]}` or `{"a": [...], "b": [...], "c": "..."}`.
/// The `c` checksum is not verified and is left undecoded.
/// Each level is `[price, volume, timestamp, ("r")]`, all strings.
#[derive(Debug, Default, Deserialize)]
struct BookPayload {
    #[serde(rename = "as", default)]
    snapshot_asks: Option<Vec<Vec<String>>>,
    #[serde(rename = "bs", default)]
    snapshot_bids: Option<Vec<Vec<String>>>,
    #[serde(rename = "a", default)]
    asks: Option<Vec<Vec<String>>>,
    #[serde(rename = "b", default)]
    bids: Option<Vec<Vec<String>>>,
}

pub fn parse_message(text: &str) -> Result<KrakenMessage, TransportError> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Object(_) => Ok(KrakenMessage::Event(serde_json::from_value(value)?)),
        Value::Array(items) => parse_book_frame(items).map(KrakenMessage::Book),
        other => Err(TransportError::Decode(format!("unexpected frame: {other}"))),
    }
}

fn parse_book_frame(mut items: Vec<Value>) -> Result<BookUpdate, TransportError> {
    if items.len() < 4 {
        return Err(TransportError::Decode(format!(
            "book frame has {} elements, expected at least 4",
            items.len()
        )));
    }

    let pair = take_string(items.pop(), "pair")?;
    let channel_name = take_string(items.pop(), "channel name")?;
    if !channel_name.starts_with("book") {
        return Err(TransportError::Decode(format!(
            "unsupported channel {channel_name}"
        )));
    }
    let channel_id = items[0]
        .as_u64()
        .ok_or_else(|| TransportError::Decode("missing channel id".into()))?;

    let mut snapshot = None;
    let mut diff = Vec::new();

    for payload in items.into_iter().skip(1) {
        let payload: BookPayload = serde_json::from_value(payload)?;

        if payload.snapshot_asks.is_some() || payload.snapshot_bids.is_some() {
            let entries = snapshot.get_or_insert_with(Vec::new);
            push_levels(entries, Side::Ask, payload.snapshot_asks)?;
            push_levels(entries, Side::Bid, payload.snapshot_bids)?;
        }
        push_levels(&mut diff, Side::Ask, payload.asks)?;
        push_levels(&mut diff, Side::Bid, payload.bids)?;
    }

    let event = match snapshot {
        Some(entries) => SyncEvent::Snapshot(BookSnapshot::new(entries)),
        None => SyncEvent::Diff(diff),
    };

    Ok(BookUpdate {
        channel_id,
        channel_name,
        pair,
        event,
    })
}

fn take_string(value: Option<Value>, what: &str) -> Result<String, TransportError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(TransportError::Decode(format!("missing {what}"))),
    }
}

fn push_levels(
    out: &mut Vec<ProcessEntry>,
    side: Side,
    levels: Option<Vec<Vec<String>>>,
) -> Result<(), TransportError> {
    for level in levels.unwrap_or_default() {
        let [price, volume, ..] = level.as_slice() else {
            return Err(TransportError::Decode(format!(
                "{side} level has {} fields",
                level.len()
            )));
        };
        out.push(ProcessEntry::new(
            side,
            Decimal::from_str(price)?,
            Decimal::from_str(volume)?,
        ));
    }
    Ok(())
}

/// `subscribe` request for the book channel.
pub fn subscribe_request(reqid: u64, pair: &str, depth: usize) -> String {
    serde_json::json!({
        "event": "subscribe",
        "reqid": reqid,
        "pair": [pair],
        "subscription": { "name": "book", "depth": depth },
    })
    .to_string()
}

pub fn unsubscribe_request(reqid: u64, pair: &str, depth: usize) -> String {
    serde_json::json!({
        "event": "unsubscribe",
        "reqid": reqid,
        "pair": [pair],
        "subscription": { "name": "book", "depth": depth },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_snapshot_frame() {
        let text = r#"[0,{"as":[["5541.30000","2.50700000","1534614248.123678"],["5541.80000","0.33000000","1534614098.345543"]],"bs":[["5541.20000","1.52900000","1534614248.765567"]]},"book-10","XBT/USD"]"#;

        let KrakenMessage::Book(update) = parse_message(text).unwrap() else {
            panic!("expected book frame");
        };
        assert_eq!(update.channel_id, 0);
        assert_eq!(update.channel_name, "book-10");
        assert_eq!(update.pair, "XBT/USD");
        assert_eq!(
            update.event,
            SyncEvent::Snapshot(BookSnapshot::new(vec![
                ProcessEntry::ask(dec!(5541.30000), dec!(2.50700000)),
                ProcessEntry::ask(dec!(5541.80000), dec!(0.33000000)),
                ProcessEntry::bid(dec!(5541.20000), dec!(1.52900000)),
            ]))
        );
    }

    #[test]
    fn parses_split_update_asks_then_bids() {
        let text = r#"[1234,{"a":[["5541.30000","2.50700000","1534614248.456738"],["5542.50000","0.40100000","1534614248.456738"]]},{"b":[["5541.30000","0.00000000","1534614335.345903"]],"c":"974942666"},"book-10","XBT/USD"]"#;

        let KrakenMessage::Book(update) = parse_message(text).unwrap() else {
            panic!("expected book frame");
        };
        assert_eq!(
            update.event,
            SyncEvent::Diff(vec![
                ProcessEntry::ask(dec!(5541.30000), dec!(2.50700000)),
                ProcessEntry::ask(dec!(5542.50000), dec!(0.40100000)),
                ProcessEntry::bid(dec!(5541.30000), dec!(0)),
            ])
        );
    }

    #[test]
    fn republish_flag_is_tolerated() {
        let text = r#"[1234,{"a":[["5541.30000","2.50700000","1534614248.456738","r"]],"c":"1"},"book-10","XBT/USD"]"#;
        let KrakenMessage::Book(update) = parse_message(text).unwrap() else {
            panic!("expected book frame");
        };
        assert_eq!(
            update.event,
            SyncEvent::Diff(vec![ProcessEntry::ask(dec!(5541.3), dec!(2.507))])
        );
    }

    #[test]
    fn parses_subscription_status() {
        let text = r#"{"channelID":10001,"channelName":"book-10","event":"subscriptionStatus","pair":"XBT/USD","reqid":7,"status":"subscribed","subscription":{"depth":10,"name":"book"}}"#;
        let KrakenMessage::Event(KrakenEvent::SubscriptionStatus(status)) = parse_message(text).unwrap()
        else {
            panic!("expected subscription status");
        };
        assert_eq!(status.status, SubscriptionState::Subscribed);
        assert_eq!(status.channel_id, Some(10001));
        assert_eq!(status.pair.as_deref(), Some("XBT/USD"));
        assert_eq!(status.reqid, Some(7));
    }

    #[test]
    fn parses_subscription_error() {
        let text = r#"{"errorMessage":"Currency pair not supported","event":"subscriptionStatus","pair":"XBT/EUR","status":"error","subscription":{"depth":10,"name":"book"}}"#;
        let KrakenMessage::Event(KrakenEvent::SubscriptionStatus(status)) = parse_message(text).unwrap()
        else {
            panic!("expected subscription status");
        };
        assert_eq!(status.status, SubscriptionState::Error);
        assert_eq!(status.error_message.as_deref(), Some("Currency pair not supported"));
    }

    #[test]
    fn heartbeat_and_unknown_events() {
        assert_eq!(
            parse_message(r#"{"event":"heartbeat"}"#).unwrap(),
            KrakenMessage::Event(KrakenEvent::Heartbeat)
        );
        assert_eq!(
            parse_message(r#"{"event":"somethingNew","x":1}"#).unwrap(),
            KrakenMessage::Event(KrakenEvent::Unknown)
        );
    }

    #[test]
    fn rejects_malformed_levels() {
        let text = r#"[1,{"a":[["5541.30000"]]},"book-10","XBT/USD"]"#;
        assert!(matches!(parse_message(text), Err(TransportError::Decode(_))));

        let text = r#"[1,{"a":[["abc","1","0"]]},"book-10","XBT/USD"]"#;
        assert!(matches!(parse_message(text), Err(TransportError::Decode(_))));
    }

    #[test]
    fn rejects_other_channels() {
        let text = r#"[1,[["5541.2","0.1","1534614057.3","s","l",""]],"trade","XBT/USD"]"#;
        assert!(parse_message(text).is_err());
    }

    #[test]
    fn subscribe_request_shape() {
        let value: Value = serde_json::from_str(&subscribe_request(3, "XBT/USD", 25)).unwrap();
        assert_eq!(value["event"], "subscribe");
        assert_eq!(value["reqid"], 3);
        assert_eq!(value["pair"][0], "XBT/USD");
        assert_eq!(value["subscription"]["name"], "book");
        assert_eq!(value["subscription"]["depth"], 25);
    }
}
