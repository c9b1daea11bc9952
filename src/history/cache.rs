//! Index-addressable window over the persisted history.
//!
//! Index 0 is the newest observation. The cache holds a contiguous run of
//! decoded points starting at `head_index` and reloads from the block store
//! whenever a lookup falls outside it.

use alloc::collections::VecDeque;

use log::debug;

use crate::config::ContiguityHeuristic;
use crate::error::RecorderError;
use crate::stats::estimator;
use crate::storage::{BLOCK_CAPACITY, Block, BlockStore, Observation, Storage};

/// A decoded observation with the charge rate in effect at it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryPoint {
    pub observation: Observation,
    pub charge_rate: i32,
}

impl HistoryPoint {
    pub fn new(observation: Observation, charge_rate: i32) -> Self {
        Self {
            observation,
            charge_rate,
        }
    }
}

/// Decode the points of one block, oldest first.
///
/// Per-record rates are not persisted: the first record takes the rate in
/// the block header and the rest are replayed through the estimator.
pub fn decode_block(
    block: &Block,
    heuristic: &ContiguityHeuristic,
) -> heapless::Vec<HistoryPoint, BLOCK_CAPACITY> {
    let mut points = heapless::Vec::new();
    let mut rate = block.initial_charge_rate;
    let mut prev: Option<&Observation> = None;

    for obs in &block.records {
        if let Some(prev) = prev {
            rate = estimator::next_rate(prev, obs, rate, heuristic);
        }
        // Never exceeds capacity: a block holds at most BLOCK_CAPACITY records
        let _ = points.push(HistoryPoint::new(*obs, rate));
        prev = Some(obs);
    }

    points
}

pub struct WindowCache {
    head_index: u16,
    /// Newest first
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl WindowCache {
    /// Create an empty cache spanning `block_count` blocks
    pub fn new(block_count: usize) -> Self {
        let capacity = block_count.max(1) * BLOCK_CAPACITY;
        Self {
            head_index: 0,
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, index: u16) -> bool {
        index >= self.head_index && ((index - self.head_index) as usize) < self.points.len()
    }

    /// Look up a cached point without touching storage
    pub fn get(&self, index: u16) -> Option<&HistoryPoint> {
        if !self.contains(index) {
            return None;
        }
        self.points.get((index - self.head_index) as usize)
    }

    /// Drop the cached window and load the one containing `index`
    pub fn reload<S: Storage>(
        &mut self,
        store: &BlockStore<S>,
        index: u16,
        heuristic: &ContiguityHeuristic,
    ) -> Result<(), RecorderError> {
        self.points.clear();

        let range = store.read_range(index, self.capacity)?;
        self.head_index = range.head_index;

        for block in &range.blocks {
            for point in decode_block(block, heuristic).iter().rev() {
                if self.points.len() >= self.capacity {
                    break;
                }
                self.points.push_back(*point);
            }
        }

        debug!(
            "History cache reloaded at index {} ({} points)",
            self.head_index,
            self.points.len()
        );
        Ok(())
    }

    /// Fetch the point at `index`, reloading on a miss.
    ///
    /// Returns [`RecorderError::NotFound`] when the index lies outside the
    /// retained history.
    pub fn get_or_load<S: Storage>(
        &mut self,
        store: &BlockStore<S>,
        index: u16,
        heuristic: &ContiguityHeuristic,
    ) -> Result<HistoryPoint, RecorderError> {
        if !self.contains(index) {
            self.reload(store, index, heuristic)?;
        }
        self.get(index).copied().ok_or(RecorderError::NotFound(index))
    }

    /// Record a freshly persisted point as the new index 0.
    ///
    /// A window that does not start at the newest point is simply dropped,
    /// since every cached index would shift by one.
    pub fn push_front(&mut self, point: HistoryPoint) {
        if self.head_index != 0 {
            self.invalidate();
            return;
        }
        self.points.push_front(point);
        self.points.truncate(self.capacity);
    }

    pub fn invalidate(&mut self) {
        self.points.clear();
        self.head_index = 0;
    }

    /// Walk the history newest-first starting at `start`
    pub fn iter_from<'a, S: Storage>(
        &'a mut self,
        store: &'a BlockStore<S>,
        start: u16,
        heuristic: ContiguityHeuristic,
    ) -> HistoryCursor<'a, S> {
        HistoryCursor {
            cache: self,
            store,
            heuristic,
            index: Some(start),
        }
    }
}

/// Sequential reader over the history, reloading the cache as it goes.
///
/// Ends at the first missing index. A storage error is yielded once and then
/// the cursor stops.
pub struct HistoryCursor<'a, S> {
    cache: &'a mut WindowCache,
    store: &'a BlockStore<S>,
    heuristic: ContiguityHeuristic,
    index: Option<u16>,
}

impl<S: Storage> Iterator for HistoryCursor<'_, S> {
    type Item = Result<HistoryPoint, RecorderError>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.index?;
        match self.cache.get_or_load(self.store, index, &self.heuristic) {
            Ok(point) => {
                self.index = index.checked_add(1);
                Some(Ok(point))
            }
            Err(RecorderError::NotFound(_)) => {
                self.index = None;
                None
            }
            Err(err) => {
                self.index = None;
                Some(Err(err))
            }
        }
    }
}
