use fxhash::FxHashMap;
use std::hash::Hash;

/// Slot storage with stable indices and a key index.
///
/// Removed slots are recycled; an index is only meaningful while its record is alive.
#[derive(Debug)]
pub(crate) struct Arena<K, V> {
    slots: Vec<Option<(K, V)>>,
    free: Vec<usize>,
    index: FxHashMap<K, usize>,
}

impl<K, V> Default for Arena<K, V> {
    fn default() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), index: FxHashMap::default() }
    }
}

impl<K: Clone + Eq + Hash, V> Arena<K, V> {
    pub(crate) fn find(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Returns the slot of `key`, inserting `make()` first if absent.
    pub(crate) fn find_or_insert_with(&mut self, key: &K, make: impl FnOnce() -> V) -> (usize, bool) {
        if let Some(slot) = self.find(key) {
            return (slot, false);
        }
        let entry = Some((key.clone(), make()));
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = entry;
            slot
        } else {
            self.slots.push(entry);
            self.slots.len() - 1
        };
        self.index.insert(key.clone(), slot);
        (slot, true)
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&V> {
        self.slots.get(slot)?.as_ref().map(|(_, v)| v)
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut V> {
        self.slots.get_mut(slot)?.as_mut().map(|(_, v)| v)
    }

    pub(crate) fn remove(&mut self, slot: usize) -> Option<(K, V)> {
        let (key, value) = self.slots.get_mut(slot)?.take()?;
        self.index.remove(&key);
        self.free.push(slot);
        Some((key, value))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &K, &V)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|(k, v)| (slot, k, v)))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_slots_are_recycled() {
        let mut arena: Arena<&str, u32> = Arena::default();
        let (a, fresh) = arena.find_or_insert_with(&"a", || 1);
        assert!(fresh);
        let (b, _) = arena.find_or_insert_with(&"b", || 2);
        assert_eq!(arena.find_or_insert_with(&"a", || 9), (a, false));

        assert_eq!(arena.remove(a), Some(("a", 1)));
        assert!(arena.get(a).is_none());
        let (c, _) = arena.find_or_insert_with(&"c", || 3);
        assert_eq!(c, a);
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.len(), 2);
    }
}
