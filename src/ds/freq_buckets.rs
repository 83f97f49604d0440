//! Frequency buckets backing the LFU policy.
//!
//! Every resident key lives in exactly one bucket; a bucket is an MRU-first
//! intrusive list over a shared slot vector, and buckets are held in a
//! `BTreeMap` keyed by frequency so min/max lookup and arbitrary frequency
//! jumps (the explicit-freq update path adds deltas larger than one) stay
//! ordered without a dense table.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
struct Entry<K> {
    key: K,
    freq: u64,
}

#[derive(Debug)]
struct Slot<K> {
    entry: Option<Entry<K>>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    head: usize,
    tail: usize,
}

/// Frequency-ordered key store. A bucket exists iff it holds at least one
/// key, so `min_freq`/`max_freq` are always the map's first and last keys.
#[derive(Debug)]
pub struct FreqBuckets<K> {
    slots: Vec<Slot<K>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    buckets: BTreeMap<u64, Bucket>,
}

impl<K> FreqBuckets<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            buckets: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Returns the frequency of `key`, if resident.
    pub fn frequency(&self, key: &K) -> Option<u64> {
        let idx = *self.index.get(key)?;
        self.slots[idx].entry.as_ref().map(|entry| entry.freq)
    }

    /// Lowest occupied frequency.
    pub fn min_freq(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    /// Highest occupied frequency.
    pub fn max_freq(&self) -> Option<u64> {
        self.buckets.keys().next_back().copied()
    }

    /// Inserts `key` with frequency 1; returns `false` if already resident.
    pub fn insert(&mut self, key: K) -> bool {
        self.insert_with_freq(key, 1)
    }

    /// Inserts `key` at an explicit frequency (pinned keys re-enter with
    /// their preserved count); returns `false` if already resident.
    /// Frequencies are clamped to at least 1.
    pub fn insert_with_freq(&mut self, key: K, freq: u64) -> bool {
        if self.index.contains_key(&key) {
            return false;
        }
        let freq = freq.max(1);
        let idx = self.allocate(Entry { key, freq });
        self.index.insert(key, idx);
        self.bucket_push_front(freq, idx);
        true
    }

    /// Increments the frequency of `key` by one; returns the new frequency.
    pub fn touch(&mut self, key: &K) -> Option<u64> {
        self.touch_by(key, 1)
    }

    /// Adds `delta` to the frequency of `key`; returns the new frequency.
    /// A delta of zero still refreshes recency within the bucket.
    pub fn touch_by(&mut self, key: &K, delta: u64) -> Option<u64> {
        let idx = *self.index.get(key)?;
        let old_freq = self.slots[idx].entry.as_ref()?.freq;
        let new_freq = old_freq.saturating_add(delta);

        self.bucket_remove(old_freq, idx);
        if let Some(entry) = self.slots[idx].entry.as_mut() {
            entry.freq = new_freq;
        }
        self.bucket_push_front(new_freq, idx);
        Some(new_freq)
    }

    /// Removes `key` and returns the frequency it held.
    pub fn remove(&mut self, key: &K) -> Option<u64> {
        let idx = self.index.remove(key)?;
        let freq = self.slots[idx].entry.as_ref()?.freq;
        self.bucket_remove(freq, idx);
        let entry = self.release(idx)?;
        Some(entry.freq)
    }

    /// Removes and returns the least-valuable key: the tail (least recent)
    /// of the lowest occupied frequency bucket.
    pub fn pop_min(&mut self) -> Option<(K, u64)> {
        let freq = self.min_freq()?;
        let idx = self.buckets.get(&freq)?.tail;
        self.bucket_remove(freq, idx);
        let entry = self.release(idx)?;
        self.index.remove(&entry.key);
        Some((entry.key, entry.freq))
    }

    /// Iterates `(key, freq)` from the highest frequency bucket down, each
    /// bucket front (most recent) to back.
    pub fn iter_desc(&self) -> impl Iterator<Item = (K, u64)> + '_ {
        self.buckets.iter().rev().flat_map(move |(_, bucket)| {
            let mut out = Vec::new();
            let mut current = Some(bucket.head);
            while let Some(idx) = current {
                let slot = &self.slots[idx];
                if let Some(entry) = slot.entry.as_ref() {
                    out.push((entry.key, entry.freq));
                }
                current = slot.next;
            }
            out
        })
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.buckets.clear();
    }

    fn allocate(&mut self, entry: Entry<K>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Slot {
                entry: Some(entry),
                prev: None,
                next: None,
            };
            idx
        } else {
            self.slots.push(Slot {
                entry: Some(entry),
                prev: None,
                next: None,
            });
            self.slots.len() - 1
        }
    }

    fn release(&mut self, idx: usize) -> Option<Entry<K>> {
        let entry = self.slots[idx].entry.take();
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
        self.free.push(idx);
        entry
    }

    fn bucket_push_front(&mut self, freq: u64, idx: usize) {
        match self.buckets.get_mut(&freq) {
            Some(bucket) => {
                let old_head = bucket.head;
                self.slots[idx].prev = None;
                self.slots[idx].next = Some(old_head);
                self.slots[old_head].prev = Some(idx);
                bucket.head = idx;
            },
            None => {
                self.slots[idx].prev = None;
                self.slots[idx].next = None;
                self.buckets.insert(
                    freq,
                    Bucket {
                        head: idx,
                        tail: idx,
                    },
                );
            },
        }
    }

    fn bucket_remove(&mut self, freq: u64, idx: usize) {
        let bucket = match self.buckets.get_mut(&freq) {
            Some(bucket) => bucket,
            None => return,
        };
        let single = bucket.head == idx && bucket.tail == idx;
        if single {
            self.buckets.remove(&freq);
        } else {
            if bucket.head == idx {
                if let Some(next) = self.slots[idx].next {
                    bucket.head = next;
                }
            }
            if bucket.tail == idx {
                if let Some(prev) = self.slots[idx].prev {
                    bucket.tail = prev;
                }
            }
            let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
            if let Some(p) = prev {
                self.slots[p].next = next;
            }
            if let Some(n) = next {
                self.slots[n].prev = prev;
            }
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let mut seen = 0usize;
        for (&freq, bucket) in &self.buckets {
            let mut current = Some(bucket.head);
            let mut last = None;
            while let Some(idx) = current {
                let slot = &self.slots[idx];
                let entry = slot.entry.as_ref().expect("bucket entry missing");
                assert_eq!(entry.freq, freq);
                assert_eq!(slot.prev, last);
                assert_eq!(self.index.get(&entry.key), Some(&idx));
                last = Some(idx);
                current = slot.next;
                seen += 1;
                assert!(seen <= self.len());
            }
            assert_eq!(Some(bucket.tail), last);
        }
        assert_eq!(seen, self.len());
    }
}

impl<K> Default for FreqBuckets<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
