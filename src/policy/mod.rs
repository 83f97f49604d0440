//! Batch key-cache policies.

pub mod lfu;
pub mod lru;
pub mod sharded_lru;
