use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the book an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy interest. Best = highest price.
    Bid,
    /// Sell interest. Best = lowest price.
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated quantity resting at one price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// A zero quantity is a removal instruction, never a stored level.
    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// One upsert-or-delete instruction for a single level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub side: Side,
    pub level: PriceLevel,
}

impl ProcessEntry {
    pub fn new(side: Side, price: Decimal, quantity: Decimal) -> Self {
        Self {
            side,
            level: PriceLevel::new(price, quantity),
        }
    }

    pub fn bid(price: Decimal, quantity: Decimal) -> Self {
        Self::new(Side::Bid, price, quantity)
    }

    pub fn ask(price: Decimal, quantity: Decimal) -> Self {
        Self::new(Side::Ask, price, quantity)
    }
}

/// Full state of the book at a point in time. Replaces everything before it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub entries: Vec<ProcessEntry>,
}

impl BookSnapshot {
    pub fn new(entries: Vec<ProcessEntry>) -> Self {
        Self { entries }
    }

    /// Build a snapshot from separate bid and ask level lists.
    pub fn from_levels(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        let entries = bids
            .into_iter()
            .map(|level| ProcessEntry {
                side: Side::Bid,
                level,
            })
            .chain(asks.into_iter().map(|level| ProcessEntry {
                side: Side::Ask,
                level,
            }))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
