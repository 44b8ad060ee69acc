//! Order-preserving batched loads.
//!
//! Bulk key-based lookups return rows in storage order. Several consumers
//! (oldest-first gain computation, snapshot assembly) depend on the caller's
//! sequence, so each batch is re-ordered to the input order before yielding.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Storage seam for unordered batched lookups.
pub trait BatchSource<K, V> {
    type Error;

    /// Fetch the entities for `keys`, in any order. Unknown keys are simply
    /// absent from the result.
    fn fetch_batch(&self, keys: &[K]) -> Result<Vec<(K, V)>, Self::Error>;
}

/// Iterator yielding one `Option<V>` per input id, in input order, loading
/// from the source in chunks of `batch_size`.
///
/// Missing ids yield `None` - an explicit absent marker rather than a skip -
/// preserving the 1:1 correspondence with the input. Duplicate ids resolve
/// to the same entity each time. A source error is yielded once and ends the
/// iteration.
pub struct OrderedBatchFetch<S, K, V> {
    source: S,
    ids: Vec<K>,
    batch_size: usize,
    position: usize,
    buffer: VecDeque<Option<V>>,
    failed: bool,
}

impl<S, K, V> OrderedBatchFetch<S, K, V>
where
    S: BatchSource<K, V>,
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `batch_size` is clamped to at least 1.
    pub fn new(source: S, ids: Vec<K>, batch_size: usize) -> Self {
        Self {
            source,
            ids,
            batch_size: batch_size.max(1),
            position: 0,
            buffer: VecDeque::new(),
            failed: false,
        }
    }

    fn refill(&mut self) -> Result<(), S::Error> {
        let chunk_end = (self.position + self.batch_size).min(self.ids.len());
        let chunk = &self.ids[self.position..chunk_end];

        let fetched = self.source.fetch_batch(chunk)?;
        let mut by_key: HashMap<K, V> = HashMap::with_capacity(fetched.len());
        for (key, value) in fetched {
            by_key.insert(key, value);
        }

        for id in chunk {
            self.buffer.push_back(by_key.get(id).cloned());
        }
        self.position = chunk_end;
        Ok(())
    }
}

impl<S, K, V> Iterator for OrderedBatchFetch<S, K, V>
where
    S: BatchSource<K, V>,
    K: Eq + Hash + Clone,
    V: Clone,
{
    type Item = Result<Option<V>, S::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        if self.buffer.is_empty() {
            if self.position >= self.ids.len() {
                return None;
            }
            if let Err(e) = self.refill() {
                self.failed = true;
                return Some(Err(e));
            }
        }

        self.buffer.pop_front().map(Ok)
    }
}
