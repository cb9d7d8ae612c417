// vim: tw=80
use metrohash::{MetroBuildHasher, MetroHash64};
use std::{
    collections::HashMap,
    fmt::Debug,
    hash::{BuildHasherDefault, Hash}
};

#[derive(Clone, Copy, Debug)]
struct Links<K> {
    /// Pointer to the next less recently used entry
    lru: Option<K>,
    /// Pointer to the next more recently used entry
    mru: Option<K>,
}

/// An ordered set of keys, from least to most recently used.
///
/// Used both for the metadata block cache's list of clean blocks and for the
/// lists of mapped zones that reclaim chooses its victims from.  All
/// operations are O(1).
#[derive(Debug)]
pub struct LruList<K: Copy + Debug + Eq + Hash> {
    /// Pointer to the least recently used entry
    lru: Option<K>,
    /// Pointer to the most recently used entry
    mru: Option<K>,
    store: HashMap<K, Links<K>, BuildHasherDefault<MetroHash64>>,
}

impl<K: Copy + Debug + Eq + Hash> Default for LruList<K> {
    fn default() -> Self {
        LruList {
            lru: None,
            mru: None,
            store: HashMap::with_hasher(MetroBuildHasher::default())
        }
    }
}

impl<K: Copy + Debug + Eq + Hash> LruList<K> {
    pub fn contains(&self, key: &K) -> bool {
        self.store.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Iterate from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item=K> + '_ {
        let mut cursor = self.lru;
        std::iter::from_fn(move || {
            let k = cursor?;
            cursor = self.store[&k].mru;
            Some(k)
        })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Return the least recently used key without removing it
    pub fn peek_lru(&self) -> Option<K> {
        self.lru
    }

    /// Remove and return the least recently used key
    pub fn pop_lru(&mut self) -> Option<K> {
        let key = self.lru?;
        self.remove(&key);
        Some(key)
    }

    /// Insert `key` as the most recently used entry, moving it if it is
    /// already present.
    pub fn push_mru(&mut self, key: K) {
        if self.mru == Some(key) {
            return;
        }
        self.remove(&key);
        let links = Links { lru: self.mru, mru: None };
        self.store.insert(key, links);
        if let Some(mru) = self.mru {
            let v = self.store.get_mut(&mru).unwrap();
            debug_assert!(v.mru.is_none());
            v.mru = Some(key);
        }
        self.mru = Some(key);
        if self.lru.is_none() {
            self.lru = Some(key);
        }
    }

    /// Remove `key`, returning whether it was present
    pub fn remove(&mut self, key: &K) -> bool {
        self.store.remove(key).map(|v| {
            if let Some(mru) = v.mru {
                self.store.get_mut(&mru).unwrap().lru = v.lru;
            } else {
                debug_assert_eq!(self.mru, Some(*key));
                self.mru = v.lru;
            }
            if let Some(lru) = v.lru {
                self.store.get_mut(&lru).unwrap().mru = v.mru;
            } else {
                debug_assert_eq!(self.lru, Some(*key));
                self.lru = v.mru;
            }
        }).is_some()
    }
}

// LCOV_EXCL_STOP
