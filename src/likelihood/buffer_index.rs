use std::error::Error;
use std::fmt;

use anyhow::bail;
use fixedbitset::FixedBitSet;

use crate::Result;

/// Raised when the store/restore protocol is violated, e.g. a restore without a stored state.
pub struct StateLifecycleError {
    pub(crate) message: String,
}

impl fmt::Debug for StateLifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StateLifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for StateLifecycleError {}

/// Maps logical slots to one of two physical buffers.
///
/// Slots below `min_index_value` have a single buffer. Every other slot owns the pair
/// `i` and `i + (max - min)`, one bit per slot records which of the two is live. Storing
/// and restoring only copies the bits, never the buffer contents.
///
/// [`flip_once`](Self::flip_once) flips a slot at most once per round. While a state is
/// stored the round lasts until the next store, restore or accept, so the stored buffers
/// are never written however many evaluations a proposal runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleBufferIndex {
    max_index_value: usize,
    min_index_value: usize,
    active: FixedBitSet,
    flipped: FixedBitSet,
    stored: Option<FixedBitSet>,
}

impl DoubleBufferIndex {
    pub fn new(max_index_value: usize, min_index_value: usize) -> Self {
        let min_index_value = min_index_value.min(max_index_value);
        DoubleBufferIndex {
            max_index_value,
            min_index_value,
            active: FixedBitSet::with_capacity(max_index_value - min_index_value),
            flipped: FixedBitSet::with_capacity(max_index_value - min_index_value),
            stored: None,
        }
    }

    /// Number of physical buffers, `2 * (max - min) + min`.
    pub fn buffer_count(&self) -> usize {
        2 * self.double_buffered_count() + self.min_index_value
    }

    pub fn slot_count(&self) -> usize {
        self.max_index_value
    }

    fn double_buffered_count(&self) -> usize {
        self.max_index_value - self.min_index_value
    }

    pub fn flip(&mut self, i: usize) {
        if i >= self.min_index_value {
            self.active.toggle(i - self.min_index_value);
        }
    }

    /// Flips `i` unless it was already flipped this round. Returns true if it flipped.
    pub fn flip_once(&mut self, i: usize) -> bool {
        if i < self.min_index_value || self.flipped.put(i - self.min_index_value) {
            return false;
        }
        self.active.toggle(i - self.min_index_value);
        true
    }

    /// Starts a new round of flips, unless a stored state still needs its buffers.
    pub fn begin_round(&mut self) {
        if self.stored.is_none() {
            self.flipped.clear();
        }
    }

    pub fn offset_index(&self, i: usize) -> usize {
        if i < self.min_index_value || !self.active[i - self.min_index_value] {
            i
        } else {
            i + self.double_buffered_count()
        }
    }

    /// Live offsets of all slots in slot order.
    pub fn indices(&self) -> Vec<usize> {
        (0..self.max_index_value)
            .map(|i| self.offset_index(i))
            .collect()
    }

    pub fn has_stored_state(&self) -> bool {
        self.stored.is_some()
    }

    pub fn store_state(&mut self) {
        self.stored = Some(self.active.clone());
        self.flipped.clear();
    }

    /// Brings back the live offsets seen at the last [`store_state`](Self::store_state).
    /// The stored state is consumed, a second restore fails.
    pub fn restore_state(&mut self) -> Result<()> {
        match self.stored.take() {
            Some(stored) => {
                self.active = stored;
                self.flipped.clear();
                Ok(())
            }
            None => bail!(StateLifecycleError {
                message: String::from("Buffer indices restored without a stored state.")
            }),
        }
    }

    pub fn accept_state(&mut self) {
        self.stored = None;
        self.flipped.clear();
    }
}
