//! Bounded record of ids whose live state has been dropped.
//!
//! Finalized job ledgers and finished aggregation sessions are removed from their maps;
//! the id and its final value stay here (oldest evicted first) so late callers get a
//! "closed" answer instead of "unknown".

use std::collections::{HashMap, VecDeque};

pub(crate) const RETIRED_CAPACITY: usize = 4096;

#[derive(Debug)]
pub(crate) struct Retired<V> {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, V>,
}

impl<V: Clone> Retired<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), order: VecDeque::with_capacity(capacity.min(64)), entries: HashMap::new() }
    }

    pub(crate) fn insert(&mut self, id: &str, value: V) {
        if self.entries.insert(id.to_string(), value).is_some() { return; }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() { self.entries.remove(&oldest); }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<V> { self.entries.get(id).cloned() }

    pub(crate) fn contains(&self, id: &str) -> bool { self.entries.contains_key(id) }

    /// Forgets `id`, e.g. when a job id is initialized again.
    pub(crate) fn remove(&mut self, id: &str) {
        if self.entries.remove(id).is_some() { self.order.retain(|o| o != id); }
    }

    pub(crate) fn len(&self) -> usize { self.entries.len() }
}

impl<V: Clone> Default for Retired<V> {
    fn default() -> Self { Self::new(RETIRED_CAPACITY) }
}
