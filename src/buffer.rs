//! Holding area for diffs that arrive before the first snapshot.

use crate::error::Result;
use crate::store::PriceLevelStore;
use crate::types::ProcessEntry;

/// Diff batches captured in arrival order.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    batches: Vec<Vec<ProcessEntry>>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entries: Vec<ProcessEntry>) {
        if !entries.is_empty() {
            self.batches.push(entries);
        }
    }

    /// Replay every buffered batch into `store` in arrival order, then empty
    /// the buffer. Returns the number of entries replayed.
    ///
    /// The buffer is emptied even if the store rejects a batch, so a failed
    /// drain never replays stale entries on the next snapshot.
    pub fn drain_into(&mut self, store: &mut PriceLevelStore) -> Result<usize> {
        let mut replayed = 0;
        for batch in self.batches.drain(..) {
            store.apply(&batch)?;
            replayed += batch.len();
        }
        Ok(replayed)
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }

    /// Number of buffered entries across all batches.
    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
