use std::io::{self, Write};

use booksync::{BookView, PriceLevel, Side, SyncState};
use serde::Serialize;

#[derive(Serialize)]
struct BookLine<'a> {
    pair: &'a str,
    state: SyncState,
    sequence: u64,
    updated_at: Option<String>,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

/// Write one line describing `view` to `writer`.
///
/// TSV columns: pair, state, sequence, then `levels` bid prices/quantities
/// best first, then the same for asks. Missing levels print as `-`.
pub fn write_book<W: Write>(
    writer: &mut W,
    pair: &str,
    state: SyncState,
    view: &BookView,
    levels: usize,
    json_mode: bool,
    buf: &mut String,
) -> io::Result<()> {
    let bids = view.depth(Side::Bid, levels);
    let asks = view.depth(Side::Ask, levels);

    buf.clear();
    if json_mode {
        let line = BookLine {
            pair,
            state,
            sequence: view.sequence,
            updated_at: view.updated_at.map(|t| t.to_rfc3339()),
            bids,
            asks,
        };
        let json = serde_json::to_string(&line).map_err(io::Error::other)?;
        buf.push_str(&json);
    } else {
        buf.push_str(pair);
        buf.push('\t');
        buf.push_str(state.as_str());
        buf.push('\t');
        buf.push_str(&view.sequence.to_string());
        push_levels(buf, &bids, levels);
        push_levels(buf, &asks, levels);
    }

    buf.push('\n');
    writer.write_all(buf.as_bytes())?;
    writer.flush()
}

fn push_levels(buf: &mut String, levels: &[PriceLevel], width: usize) {
    for i in 0..width {
        buf.push('\t');
        match levels.get(i) {
            Some(level) => {
                buf.push_str(&level.price.to_string());
                buf.push('\t');
                buf.push_str(&level.quantity.to_string());
            }
            None => buf.push_str("-\t-"),
        }
    }
}
