use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};

/// Thread-safe set of keys
///
/// Every operation takes the lock for its own duration only; [`difference`]
/// snapshots `other` first so two sets are never locked at the same time.
///
/// [`difference`]: ConcurrentSet::difference
#[derive(Debug)]
pub struct ConcurrentSet<T> {
    items: RwLock<HashSet<T>>,
}

impl<T> Default for ConcurrentSet<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashSet::new()),
        }
    }
}

impl<T: Eq + Hash + Clone> ConcurrentSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the item was not present
    pub fn add(&self, item: T) -> bool {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item)
    }

    /// Returns `true` if the item was present
    pub fn remove(&self, item: &T) -> bool {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(item)
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(item)
    }

    /// Items of `self` that are not in `other`
    pub fn difference(&self, other: &ConcurrentSet<T>) -> ConcurrentSet<T> {
        let other: HashSet<T> = other.iter().collect();
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        items
            .iter()
            .filter(|item| !other.contains(item))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current items, in no particular order
    pub fn to_vec(&self) -> Vec<T> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Iterates over a snapshot; later mutations are not observed
    pub fn iter(&self) -> std::vec::IntoIter<T> {
        self.to_vec().into_iter()
    }
}

impl<T: Eq + Hash> FromIterator<T> for ConcurrentSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            items: RwLock::new(iter.into_iter().collect()),
        }
    }
}
