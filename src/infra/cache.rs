use super::{Clock, SystemClock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

const NIL: usize = usize::MAX;

struct Entry<K, V> {
    key: K,
    value: V,
    inserted: Instant,
    prev: usize,
    next: usize,
}

/// Bounded map with LRU eviction on size and lazy eviction on age.
///
/// Entries live in a slab threaded by an intrusive recency list, so `get` and `put` stay O(1).
pub struct Cache<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
    index: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ttl,
            clock,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns a clone of the cached value and marks it most recently used. Expired entries are evicted.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        if self.is_expired(slot) {
            self.remove_slot(slot);
            return None;
        }
        self.unlink(slot);
        self.push_front(slot);
        self.slots[slot].as_ref().map(|entry| entry.value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        let now = self.clock.instant();
        if let Some(&slot) = self.index.get(&key) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.value = value;
                entry.inserted = now;
            }
            self.unlink(slot);
            self.push_front(slot);
            return;
        }

        if self.index.len() >= self.capacity && self.tail != NIL {
            self.remove_slot(self.tail);
        }

        let entry = Entry {
            key: key.clone(),
            value,
            inserted: now,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = *self.index.get(key)?;
        self.remove_slot(slot)
    }

    /// Drops every entry whose key matches.
    pub fn retain(&mut self, mut keep: impl FnMut(&K) -> bool) {
        let doomed = self
            .index
            .iter()
            .filter(|(key, _)| !keep(key))
            .map(|(_, slot)| *slot)
            .collect::<Vec<_>>();
        for slot in doomed {
            self.remove_slot(slot);
        }
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn is_expired(&self, slot: usize) -> bool {
        let (Some(ttl), Some(entry)) = (self.ttl, self.slots[slot].as_ref()) else {
            return false;
        };
        self.clock.instant().saturating_duration_since(entry.inserted) >= ttl
    }

    fn remove_slot(&mut self, slot: usize) -> Option<V> {
        self.unlink(slot);
        let entry = self.slots[slot].take()?;
        self.index.remove(&entry.key);
        self.free.push(slot);
        Some(entry.value)
    }

    fn unlink(&mut self, slot: usize) {
        let Some(entry) = self.slots[slot].as_mut() else {
            return;
        };
        let (prev, next) = (entry.prev, entry.next);
        entry.prev = NIL;
        entry.next = NIL;
        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else if self.tail == slot {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.prev = NIL;
            entry.next = old_head;
        }
        if old_head != NIL {
            if let Some(h) = self.slots[old_head].as_mut() {
                h.prev = slot;
            }
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{FileStamp, ManualClock};
    use std::path::PathBuf;
    use std::time::SystemTime;
    use time::macros::datetime;

    type Key = (PathBuf, SystemTime, u64);

    #[test]
    fn changed_mtime_or_size_is_a_miss() {
        let mut cache: Cache<Key, Arc<Vec<u8>>> = Cache::new(8, None);
        let path = PathBuf::from("/tmp/session.jsonl");
        let stamp = FileStamp {
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(100),
            size: 42,
        };
        let key = (path.clone(), stamp.modified, stamp.size);
        let value = Arc::new(vec![1, 2, 3]);
        cache.put(key.clone(), value.clone());

        assert_eq!(cache.get(&key), Some(value));
        assert_eq!(
            cache.get(&(path.clone(), stamp.modified + Duration::from_secs(1), 42)),
            None
        );
        assert_eq!(cache.get(&(path, stamp.modified, 43)), None);
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let mut cache = Cache::new(2, None);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));

        cache.put("a", 10);
        cache.put("d", 4);
        assert_eq!(cache.get(&"c"), None);
        assert_eq!(cache.get(&"a"), Some(10));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(datetime!(2026-02-19 00:00 UTC)));
        let mut cache = Cache::with_clock(4, Some(Duration::from_secs(30)), clock.clone());
        cache.put("k", "v");
        clock.advance(Duration::from_secs(29));
        assert_eq!(cache.get(&"k"), Some("v"));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut cache = Cache::new(3, None);
        for round in 0..10 {
            cache.put(round, round);
            cache.remove(&round);
        }
        assert!(cache.is_empty());
        assert!(cache.slots.len() <= 1);
        cache.put(1, 1);
        cache.put(2, 2);
        cache.retain(|key| *key == 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(2));
    }

    #[test]
    fn hit_is_fast() {
        let mut cache: Cache<u64, Arc<Vec<u64>>> = Cache::new(1024, None);
        for key in 0..1024 {
            cache.put(key, Arc::new(vec![key; 64]));
        }
        let started = std::time::Instant::now();
        assert!(cache.get(&512).is_some());
        assert!(started.elapsed() < Duration::from_millis(1));
    }
}
