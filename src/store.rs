//! Authoritative price-level storage for one market.
//!
//! [`PriceLevelStore`] is mutated only by the controller. Each side lives
//! behind an `Arc` and is changed through `Arc::make_mut`, so a [`BookView`]
//! handed to readers is never modified in place: the next mutation clones the
//! side it touches and the old view stays intact.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::{Result, SyncError};
use crate::types::{BookSnapshot, PriceLevel, ProcessEntry, Side};

// ---------------------------------------------------------------------------
// BookSide
// ---------------------------------------------------------------------------

/// One side of the book backed by a `BTreeMap` keyed by price. Ordering and
/// depth are read off the map; nothing else is maintained alongside it.
#[derive(Clone, Debug)]
pub struct BookSide {
    levels: BTreeMap<Decimal, Decimal>,
    side: Side,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self {
            levels: BTreeMap::new(),
            side,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Insert or replace the level at `price`; a zero quantity removes it.
    /// Removing a price that is not present is a no-op.
    pub fn upsert(&mut self, level: PriceLevel) {
        if level.is_removal() {
            self.levels.remove(&level.price);
        } else {
            self.levels.insert(level.price, level.quantity);
        }
    }

    /// Top of this side, or `None` if it is empty.
    ///
    /// - **Asks**: lowest price (first key).
    /// - **Bids**: highest price (last key).
    pub fn best(&self) -> Option<PriceLevel> {
        let entry = match self.side {
            Side::Ask => self.levels.iter().next(),
            Side::Bid => self.levels.iter().next_back(),
        };
        entry.map(|(price, quantity)| PriceLevel::new(*price, *quantity))
    }

    /// Up to `n` levels, best first.
    pub fn depth(&self, n: usize) -> Vec<PriceLevel> {
        let to_level = |(price, quantity): (&Decimal, &Decimal)| PriceLevel::new(*price, *quantity);
        match self.side {
            Side::Ask => self.levels.iter().take(n).map(to_level).collect(),
            Side::Bid => self.levels.iter().rev().take(n).map(to_level).collect(),
        }
    }

    /// Quantity resting at exactly `price`.
    pub fn quantity_at(&self, price: Decimal) -> Option<Decimal> {
        self.levels.get(&price).copied()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Drop the worst prices until at most `max` levels remain.
    fn trim(&mut self, max: usize) {
        while self.levels.len() > max {
            match self.side {
                Side::Ask => self.levels.pop_last(),
                Side::Bid => self.levels.pop_first(),
            };
        }
    }
}

// ---------------------------------------------------------------------------
// BookView
// ---------------------------------------------------------------------------

/// Immutable, point-in-time view of both sides.
#[derive(Clone, Debug)]
pub struct BookView {
    bids: Arc<BookSide>,
    asks: Arc<BookSide>,
    /// Bumped on every reset or apply.
    pub sequence: u64,
    /// When the store was last mutated; `None` before the first snapshot.
    pub updated_at: Option<DateTime<Utc>>,
}

impl BookView {
    pub fn empty() -> Self {
        Self {
            bids: Arc::new(BookSide::new(Side::Bid)),
            asks: Arc::new(BookSide::new(Side::Ask)),
            sequence: 0,
            updated_at: None,
        }
    }

    pub fn side(&self, side: Side) -> &BookSide {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best()
    }

    /// Best bid and best ask read from the same view.
    pub fn best_offers(&self) -> (Option<PriceLevel>, Option<PriceLevel>) {
        (self.best_bid(), self.best_ask())
    }

    pub fn depth(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        self.side(side).depth(n)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl Default for BookView {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// PriceLevelStore
// ---------------------------------------------------------------------------

pub struct PriceLevelStore {
    bids: Arc<BookSide>,
    asks: Arc<BookSide>,
    max_depth: usize,
    snapshot_loaded: bool,
    sequence: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl PriceLevelStore {
    /// Create an empty store retaining at most `max_depth` levels per side.
    pub fn new(max_depth: usize) -> Self {
        Self {
            bids: Arc::new(BookSide::new(Side::Bid)),
            asks: Arc::new(BookSide::new(Side::Ask)),
            max_depth,
            snapshot_loaded: false,
            sequence: 0,
            updated_at: None,
        }
    }

    /// Replace both sides with the snapshot contents. Zero-quantity entries
    /// are ignored. The new sides are built aside and swapped in together.
    pub fn reset(&mut self, snapshot: &BookSnapshot) {
        let mut bids = BookSide::new(Side::Bid);
        let mut asks = BookSide::new(Side::Ask);
        for entry in &snapshot.entries {
            if entry.level.is_removal() {
                continue;
            }
            match entry.side {
                Side::Bid => bids.upsert(entry.level),
                Side::Ask => asks.upsert(entry.level),
            }
        }
        bids.trim(self.max_depth);
        asks.trim(self.max_depth);

        self.bids = Arc::new(bids);
        self.asks = Arc::new(asks);
        self.snapshot_loaded = true;
        self.touch();
    }

    /// Apply entries in order. Fails with [`SyncError::StoreMisuse`] if no
    /// snapshot has been loaded since creation or the last [`clear`](Self::clear).
    pub fn apply(&mut self, entries: &[ProcessEntry]) -> Result<()> {
        if !self.snapshot_loaded {
            return Err(SyncError::StoreMisuse);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let mut touched_bids = false;
        let mut touched_asks = false;
        for entry in entries {
            match entry.side {
                Side::Bid => {
                    Arc::make_mut(&mut self.bids).upsert(entry.level);
                    touched_bids = true;
                }
                Side::Ask => {
                    Arc::make_mut(&mut self.asks).upsert(entry.level);
                    touched_asks = true;
                }
            }
        }
        if touched_bids {
            Arc::make_mut(&mut self.bids).trim(self.max_depth);
        }
        if touched_asks {
            Arc::make_mut(&mut self.asks).trim(self.max_depth);
        }
        self.touch();
        Ok(())
    }

    /// Drop all levels and forget the snapshot.
    pub fn clear(&mut self) {
        self.bids = Arc::new(BookSide::new(Side::Bid));
        self.asks = Arc::new(BookSide::new(Side::Ask));
        self.snapshot_loaded = false;
        self.touch();
        self.updated_at = None;
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot_loaded
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.best()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.best()
    }

    pub fn depth(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        match side {
            Side::Bid => self.bids.depth(n),
            Side::Ask => self.asks.depth(n),
        }
    }

    pub fn len(&self, side: Side) -> usize {
        match side {
            Side::Bid => self.bids.len(),
            Side::Ask => self.asks.len(),
        }
    }

    /// Cheap immutable view sharing the current sides.
    pub fn view(&self) -> BookView {
        BookView {
            bids: Arc::clone(&self.bids),
            asks: Arc::clone(&self.asks),
            sequence: self.sequence,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.sequence += 1;
        self.updated_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn loaded(max_depth: usize) -> PriceLevelStore {
        let mut store = PriceLevelStore::new(max_depth);
        store.reset(&BookSnapshot::default());
        store
    }

    // -- BookSide ordering -----------------------------------------------

    #[test]
    fn ask_best_is_lowest_price() {
        let mut side = BookSide::new(Side::Ask);
        side.upsert(PriceLevel::new(dec!(105), dec!(1)));
        side.upsert(PriceLevel::new(dec!(100), dec!(2)));
        side.upsert(PriceLevel::new(dec!(110), dec!(3)));
        assert_eq!(side.best(), Some(PriceLevel::new(dec!(100), dec!(2))));
    }

    #[test]
    fn bid_best_is_highest_price() {
        let mut side = BookSide::new(Side::Bid);
        side.upsert(PriceLevel::new(dec!(95), dec!(1)));
        side.upsert(PriceLevel::new(dec!(100), dec!(2)));
        side.upsert(PriceLevel::new(dec!(90), dec!(3)));
        assert_eq!(side.best(), Some(PriceLevel::new(dec!(100), dec!(2))));
    }

    #[test]
    fn depth_is_best_first() {
        let mut store = loaded(10);
        store
            .apply(&[
                ProcessEntry::bid(dec!(99), dec!(1)),
                ProcessEntry::bid(dec!(101), dec!(1)),
                ProcessEntry::bid(dec!(100), dec!(1)),
                ProcessEntry::ask(dec!(103), dec!(1)),
                ProcessEntry::ask(dec!(102), dec!(1)),
            ])
            .unwrap();

        let bids: Vec<Decimal> = store.depth(Side::Bid, 2).iter().map(|l| l.price).collect();
        assert_eq!(bids, vec![dec!(101), dec!(100)]);
        let asks: Vec<Decimal> = store.depth(Side::Ask, 5).iter().map(|l| l.price).collect();
        assert_eq!(asks, vec![dec!(102), dec!(103)]);
    }

    // -- apply: insert, update, remove -----------------------------------

    #[test]
    fn apply_replaces_quantity_at_same_price() {
        let mut store = loaded(10);
        store.apply(&[ProcessEntry::bid(dec!(100), dec!(5))]).unwrap();
        store.apply(&[ProcessEntry::bid(dec!(100), dec!(7))]).unwrap();
        assert_eq!(store.best_bid(), Some(PriceLevel::new(dec!(100), dec!(7))));
        assert_eq!(store.len(Side::Bid), 1);
    }

    #[test]
    fn apply_removes_on_zero_quantity() {
        let mut store = loaded(10);
        store
            .apply(&[
                ProcessEntry::bid(dec!(100), dec!(5)),
                ProcessEntry::bid(dec!(99), dec!(3)),
            ])
            .unwrap();
        store.apply(&[ProcessEntry::bid(dec!(100), dec!(0))]).unwrap();
        assert_eq!(store.best_bid(), Some(PriceLevel::new(dec!(99), dec!(3))));
    }

    #[test]
    fn removing_absent_price_is_noop() {
        let mut store = loaded(10);
        store.apply(&[ProcessEntry::ask(dec!(101), dec!(1))]).unwrap();
        store.apply(&[ProcessEntry::ask(dec!(150), dec!(0))]).unwrap();
        store.apply(&[ProcessEntry::ask(dec!(150), dec!(0))]).unwrap();
        assert_eq!(store.len(Side::Ask), 1);
        assert_eq!(store.best_ask(), Some(PriceLevel::new(dec!(101), dec!(1))));
    }

    #[test]
    fn entries_within_one_batch_apply_in_order() {
        let mut store = loaded(10);
        store
            .apply(&[
                ProcessEntry::bid(dec!(100), dec!(1)),
                ProcessEntry::bid(dec!(100), dec!(0)),
                ProcessEntry::bid(dec!(100), dec!(4)),
            ])
            .unwrap();
        assert_eq!(store.best_bid(), Some(PriceLevel::new(dec!(100), dec!(4))));
    }

    #[test]
    fn apply_before_snapshot_is_misuse() {
        let mut store = PriceLevelStore::new(10);
        let err = store.apply(&[ProcessEntry::bid(dec!(100), dec!(1))]).unwrap_err();
        assert_eq!(err, SyncError::StoreMisuse);
        assert!(store.best_bid().is_none());
    }

    // -- reset -----------------------------------------------------------

    #[test]
    fn reset_replaces_all_levels() {
        let mut store = loaded(10);
        store
            .apply(&[
                ProcessEntry::bid(dec!(100), dec!(5)),
                ProcessEntry::ask(dec!(101), dec!(3)),
            ])
            .unwrap();

        store.reset(&BookSnapshot::new(vec![ProcessEntry::bid(dec!(200), dec!(1))]));
        assert_eq!(store.len(Side::Bid), 1);
        assert_eq!(store.len(Side::Ask), 0);
        assert_eq!(store.best_bid(), Some(PriceLevel::new(dec!(200), dec!(1))));
        assert!(store.best_ask().is_none());
    }

    #[test]
    fn reset_ignores_zero_quantity_entries() {
        let mut store = PriceLevelStore::new(10);
        store.reset(&BookSnapshot::new(vec![
            ProcessEntry::ask(dec!(100), dec!(5)),
            ProcessEntry::ask(dec!(101), dec!(0)),
            ProcessEntry::ask(dec!(102), dec!(2)),
        ]));
        assert_eq!(store.len(Side::Ask), 2);
        assert!(store.view().side(Side::Ask).quantity_at(dec!(101)).is_none());
    }

    #[test]
    fn clear_requires_new_snapshot() {
        let mut store = loaded(10);
        store.apply(&[ProcessEntry::bid(dec!(100), dec!(5))]).unwrap();
        store.clear();
        assert!(!store.has_snapshot());
        assert!(store.view().is_empty());
        assert_eq!(
            store.apply(&[ProcessEntry::bid(dec!(100), dec!(5))]),
            Err(SyncError::StoreMisuse)
        );
    }

    // -- Trimming --------------------------------------------------------

    #[test]
    fn asks_trim_removes_highest_prices() {
        let mut store = loaded(3);
        let entries: Vec<ProcessEntry> = (0..5)
            .map(|i| ProcessEntry::ask(Decimal::from(100 + i), dec!(1)))
            .collect();
        store.apply(&entries).unwrap();

        assert_eq!(store.len(Side::Ask), 3);
        assert_eq!(store.best_ask().map(|l| l.price), Some(dec!(100)));
        assert!(store.view().side(Side::Ask).quantity_at(dec!(104)).is_none());
    }

    #[test]
    fn bids_trim_removes_lowest_prices() {
        let mut store = PriceLevelStore::new(3);
        let entries: Vec<ProcessEntry> = (0..5)
            .map(|i| ProcessEntry::bid(Decimal::from(100 + i), dec!(1)))
            .collect();
        store.reset(&BookSnapshot::new(entries));

        assert_eq!(store.len(Side::Bid), 3);
        assert_eq!(store.best_bid().map(|l| l.price), Some(dec!(104)));
        assert!(store.view().side(Side::Bid).quantity_at(dec!(100)).is_none());
    }

    // -- Views -----------------------------------------------------------

    #[test]
    fn view_is_unaffected_by_later_mutation() {
        let mut store = loaded(10);
        store.apply(&[ProcessEntry::bid(dec!(100), dec!(5))]).unwrap();
        let before = store.view();

        store.apply(&[ProcessEntry::bid(dec!(100), dec!(0))]).unwrap();
        store.reset(&BookSnapshot::new(vec![ProcessEntry::ask(dec!(1), dec!(1))]));

        assert_eq!(before.best_bid(), Some(PriceLevel::new(dec!(100), dec!(5))));
        assert!(before.best_ask().is_none());
        assert!(store.view().sequence > before.sequence);
    }

    #[test]
    fn empty_view_has_no_offers() {
        let view = BookView::empty();
        assert_eq!(view.best_offers(), (None, None));
        assert!(view.depth(Side::Bid, 5).is_empty());
        assert!(view.updated_at.is_none());
    }
}
