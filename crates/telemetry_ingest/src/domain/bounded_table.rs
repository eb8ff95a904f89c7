use chrono::{DateTime, Utc};
use common::domain::{DomainError, DomainResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;

struct Slot<V> {
    value: V,
    last_touched: DateTime<Utc>,
}

/// Sharded map with a hard entry limit and idle eviction.
///
/// Each key is mutated under its shard's write guard, so closures passed to
/// [`BoundedTable::upsert`] and [`BoundedTable::update`] run atomically per
/// key. The closures must not block or call back into the same table.
///
/// Capacity is checked before the entry guard is taken, so concurrent
/// inserts of distinct new keys may overshoot it by at most the number of
/// racing writers.
pub struct BoundedTable<K, V> {
    name: &'static str,
    entries: DashMap<K, Slot<V>>,
    capacity: usize,
    idle_ttl: chrono::Duration,
    evictable: fn(&V) -> bool,
}

impl<K, V> BoundedTable<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, capacity: usize, idle_ttl: chrono::Duration) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            capacity,
            idle_ttl,
            evictable: |_| true,
        }
    }

    /// Restrict idle eviction to entries for which `evictable` returns true
    pub fn with_eviction_guard(mut self, evictable: fn(&V) -> bool) -> Self {
        self.evictable = evictable;
        self
    }

    /// Apply `f` to the entry for `key`, creating it with `create` if absent.
    ///
    /// Fails with `CapacityExhausted` when the key is new and the table is
    /// still full after evicting idle entries.
    pub fn upsert<R>(
        &self,
        key: K,
        now: DateTime<Utc>,
        create: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> DomainResult<R> {
        if !self.entries.contains_key(&key) {
            self.reserve(now)?;
        }

        let mut slot = match self.entries.entry(key) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => vacant.insert(Slot {
                value: create(),
                last_touched: now,
            }),
        };
        slot.last_touched = slot.last_touched.max(now);
        Ok(f(&mut slot.value))
    }

    /// Insert only if `key` is absent. Returns false when it already exists.
    pub fn insert_new(&self, key: K, now: DateTime<Utc>, value: V) -> DomainResult<bool> {
        if self.entries.contains_key(&key) {
            return Ok(false);
        }
        self.reserve(now)?;

        match self.entries.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value,
                    last_touched: now,
                });
                Ok(true)
            }
        }
    }

    /// Apply `f` to an existing entry; `None` if `key` is absent
    pub fn update<R>(&self, key: &K, now: DateTime<Utc>, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut slot = self.entries.get_mut(key)?;
        slot.last_touched = slot.last_touched.max(now);
        Some(f(&mut slot.value))
    }

    pub fn read<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.entries.get(key).map(|slot| f(&slot.value))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Visit every entry mutably, collecting whatever `f` yields.
    ///
    /// Shards are locked one at a time, so this never observes a torn
    /// per-key update.
    pub fn sweep<R>(&self, mut f: impl FnMut(&K, &mut V) -> Option<R>) -> Vec<R> {
        let mut results = Vec::new();
        for mut entry in self.entries.iter_mut() {
            let (key, slot) = entry.pair_mut();
            if let Some(result) = f(key, &mut slot.value) {
                results.push(result);
            }
        }
        results
    }

    pub fn count_where(&self, f: impl Fn(&V) -> bool) -> usize {
        self.entries.iter().filter(|slot| f(&slot.value)).count()
    }

    /// Remove entries that are evictable and untouched for longer than the idle TTL
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let evictable = self.evictable;
        self.entries
            .retain(|_, slot| now - slot.last_touched <= self.idle_ttl || !evictable(&slot.value));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            tracing::debug!(table = self.name, evicted, "evicted idle entries");
        }
        evicted
    }

    /// Remove entries matching `f` regardless of idle time
    pub fn evict_where(&self, f: impl Fn(&V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| !f(&slot.value));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reserve(&self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.entries.len() < self.capacity {
            return Ok(());
        }
        self.evict_idle(now);
        if self.entries.len() < self.capacity {
            return Ok(());
        }
        tracing::error!(table = self.name, capacity = self.capacity, "state table is full");
        Err(DomainError::CapacityExhausted {
            table: self.name,
            capacity: self.capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> BoundedTable<String, u32> {
        BoundedTable::new("test", capacity, chrono::Duration::seconds(60))
    }

    #[test]
    fn test_upsert_creates_then_mutates() {
        let table = table(4);
        let now = Utc::now();
        let first = table.upsert("a".to_string(), now, || 0, |v| {
            *v += 1;
            *v
        });
        let second = table.upsert("a".to_string(), now, || 0, |v| {
            *v += 1;
            *v
        });
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
    }

    #[test]
    fn test_full_table_evicts_idle_before_failing() {
        let table = table(1);
        let start = Utc::now();
        table.upsert("a".to_string(), start, || 0, |_| ()).unwrap();

        let later = start + chrono::Duration::seconds(61);
        table.upsert("b".to_string(), later, || 0, |_| ()).unwrap();
        assert!(!table.contains(&"a".to_string()));
        assert!(table.contains(&"b".to_string()));
    }

    #[test]
    fn test_full_table_without_idle_entries_is_exhausted() {
        let table = table(1);
        let now = Utc::now();
        table.upsert("a".to_string(), now, || 0, |_| ()).unwrap();

        let err = table.upsert("b".to_string(), now, || 0, |_| ()).unwrap_err();
        assert!(matches!(
            err,
            DomainError::CapacityExhausted { table: "test", capacity: 1 }
        ));
        // existing keys stay writable
        assert!(table.upsert("a".to_string(), now, || 0, |_| ()).is_ok());
    }

    #[test]
    fn test_eviction_guard_protects_entries() {
        let table = table(4).with_eviction_guard(|v| *v == 0);
        let start = Utc::now();
        table.upsert("idle".to_string(), start, || 0, |_| ()).unwrap();
        table.upsert("busy".to_string(), start, || 7, |_| ()).unwrap();

        let evicted = table.evict_idle(start + chrono::Duration::seconds(120));
        assert_eq!(evicted, 1);
        assert!(table.contains(&"busy".to_string()));
    }

    #[test]
    fn test_insert_new_refuses_existing_key() {
        let table = table(4);
        let now = Utc::now();
        assert!(table.insert_new("a".to_string(), now, 1).unwrap());
        assert!(!table.insert_new("a".to_string(), now, 2).unwrap());
        assert_eq!(table.read(&"a".to_string(), |v| *v), Some(1));
    }
}
