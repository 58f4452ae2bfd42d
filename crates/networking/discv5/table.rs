//! The Kademlia routing table.
//!
//! 256 buckets indexed by the log2 of the XOR distance to the local node id,
//! each a bounded deque ordered by recency (most recent first) plus an
//! unbounded replacement cache. A separate LRU of bucket indices tracks
//! which non-empty bucket went longest without an update, which is what the
//! liveness prober feeds on.
//!
//! The table is a plain data structure with no I/O; it is owned exclusively
//! by the routing table manager.

use ethereum_types::{H256, U256};
use std::collections::VecDeque;
use thiserror::Error;

/// Default bucket capacity (the `k` in k-bucket).
pub const DEFAULT_BUCKET_SIZE: usize = 16;
const NUM_BUCKETS: usize = 256;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoutingTableError {
    #[error("cannot insert the local node into its own routing table")]
    LocalNode,
}

/// XOR distance between two node ids.
pub fn distance(left: &H256, right: &H256) -> U256 {
    U256::from_big_endian((*left ^ *right).as_bytes())
}

/// Log2 of the XOR distance, i.e. the index of the highest differing bit.
/// Undefined for equal ids, hence `None`.
pub fn log_distance(left: &H256, right: &H256) -> Option<usize> {
    let distance = distance(left, right);
    if distance.is_zero() {
        return None;
    }
    Some(distance.bits() - 1)
}

#[derive(Debug)]
pub struct KademliaRoutingTable {
    local_node_id: H256,
    bucket_size: usize,
    buckets: Vec<VecDeque<H256>>,
    replacement_caches: Vec<VecDeque<H256>>,
    /// Non-empty bucket indices, most recently updated first.
    bucket_update_order: VecDeque<usize>,
}

impl KademliaRoutingTable {
    pub fn new(local_node_id: H256, bucket_size: usize) -> Self {
        Self {
            local_node_id,
            bucket_size,
            buckets: vec![VecDeque::new(); NUM_BUCKETS],
            replacement_caches: vec![VecDeque::new(); NUM_BUCKETS],
            bucket_update_order: VecDeque::new(),
        }
    }

    pub fn local_node_id(&self) -> H256 {
        self.local_node_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Inserts a node or moves it to the head of its bucket.
    ///
    /// If the bucket is full the node goes to the head of the replacement
    /// cache instead and the bucket tail is returned as an eviction
    /// candidate: the caller is expected to probe it and call [`remove`]
    /// on probe failure. The candidate is returned even when the cache was
    /// empty before; the bucket simply shrinks if the probe fails.
    ///
    /// [`remove`]: KademliaRoutingTable::remove
    pub fn update(&mut self, node_id: H256) -> Result<Option<H256>, RoutingTableError> {
        let index = self.bucket_index(node_id).ok_or(RoutingTableError::LocalNode)?;

        let is_bucket_full = self.buckets[index].len() >= self.bucket_size;
        let is_node_in_bucket = self.buckets[index].contains(&node_id);

        if is_node_in_bucket || !is_bucket_full {
            self.update_bucket_unchecked(node_id, index);
            return Ok(None);
        }

        let cache = &mut self.replacement_caches[index];
        if let Some(position) = cache.iter().position(|id| *id == node_id) {
            cache.remove(position);
        }
        cache.push_front(node_id);
        Ok(self.buckets[index].back().copied())
    }

    /// Add or update assuming the node is either present already or the
    /// bucket is not full.
    fn update_bucket_unchecked(&mut self, node_id: H256, index: usize) {
        let bucket = &mut self.buckets[index];
        if let Some(position) = bucket.iter().position(|id| *id == node_id) {
            bucket.remove(position);
        }
        bucket.push_front(node_id);

        let cache = &mut self.replacement_caches[index];
        if let Some(position) = cache.iter().position(|id| *id == node_id) {
            cache.remove(position);
        }

        if let Some(position) = self.bucket_update_order.iter().position(|i| *i == index) {
            self.bucket_update_order.remove(position);
        }
        self.bucket_update_order.push_front(index);
    }

    /// Removes a node from the table if present. A removed bucket entry is
    /// backfilled with the newest replacement-cache entry, appended at the
    /// tail as the least recently seen member.
    pub fn remove(&mut self, node_id: H256) {
        let Some(index) = self.bucket_index(node_id) else {
            return;
        };

        let bucket = &mut self.buckets[index];
        if let Some(position) = bucket.iter().position(|id| *id == node_id) {
            bucket.remove(position);
            if let Some(replacement) = self.replacement_caches[index].pop_front() {
                bucket.push_back(replacement);
            }
        }

        let cache = &mut self.replacement_caches[index];
        if let Some(position) = cache.iter().position(|id| *id == node_id) {
            cache.remove(position);
        }

        // the update order only tracks non-empty buckets
        if self.buckets[index].is_empty()
            && let Some(position) = self.bucket_update_order.iter().position(|i| *i == index)
        {
            self.bucket_update_order.remove(position);
        }
    }

    pub fn contains(&self, node_id: &H256) -> bool {
        match self.bucket_index(*node_id) {
            Some(index) => self.buckets[index].contains(node_id),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// All bucket members at the given log distance to the local node.
    pub fn nodes_at_log_distance(&self, log_distance: usize) -> Vec<H256> {
        match self.buckets.get(log_distance) {
            Some(bucket) => bucket.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// The log distance whose bucket was updated least recently, if any
    /// bucket is non-empty.
    pub fn least_recently_updated_log_distance(&self) -> Option<usize> {
        self.bucket_update_order.back().copied()
    }

    /// The tail entry of the least recently updated bucket: the stalest
    /// node the table knows about, the prober's next target.
    pub fn oldest_entry(&self) -> Option<H256> {
        let index = self.least_recently_updated_log_distance()?;
        self.buckets[index].back().copied()
    }

    /// All bucket members in ascending XOR distance to a reference id.
    pub fn iter_nodes_around(&self, reference_node_id: &H256) -> impl Iterator<Item = H256> {
        let mut node_ids: Vec<H256> = self.buckets.iter().flatten().copied().collect();
        node_ids.sort_by_key(|node_id| distance(reference_node_id, node_id));
        node_ids.into_iter()
    }

    fn bucket_index(&self, node_id: H256) -> Option<usize> {
        log_distance(&self.local_node_id, &node_id)
    }

    #[cfg(test)]
    fn bucket(&self, index: usize) -> &VecDeque<H256> {
        &self.buckets[index]
    }

    #[cfg(test)]
    fn replacement_cache(&self, index: usize) -> &VecDeque<H256> {
        &self.replacement_caches[index]
    }
}
