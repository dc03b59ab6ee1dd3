use ahash::AHashMap;

use super::group_key::GroupKey;

/// Sorted association from group key to per-key state.
///
/// Entries are kept in a vector that is only re-sorted when needed: appending a
/// key larger than every existing key keeps it sorted, anything else marks it
/// dirty and the next lookup sorts it again.
///
/// [`GroupLookup::range`] visits every entry present when it starts exactly once,
/// in key order, even if the callback deletes the current, an earlier or a later
/// entry. Entries inserted during a range may or may not be visited.
#[derive(Debug)]
pub struct GroupLookup<V> {
    entries: Vec<(GroupKey, V)>,
    dirty: bool,
    // index of the next entry `range` hands out, only set while ranging
    cursor: Option<usize>,
}

impl<V> Default for GroupLookup<V> {
    fn default() -> Self {
        GroupLookup { entries: Vec::new(), dirty: false, cursor: None }
    }
}

impl<V> GroupLookup<V> {
    pub fn new() -> GroupLookup<V> {
        GroupLookup::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sort_if_dirty(&mut self) {
        if self.dirty {
            self.entries.sort_by(|a, b| a.0.cmp(&b.0));
            self.dirty = false;
        }
    }

    fn search(&mut self, key: &GroupKey) -> Result<usize, usize> {
        self.sort_if_dirty();
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn lookup(&mut self, key: &GroupKey) -> Option<&V> {
        let idx = self.search(key).ok()?;
        Some(&self.entries[idx].1)
    }

    pub fn lookup_mut(&mut self, key: &GroupKey) -> Option<&mut V> {
        let idx = self.search(key).ok()?;
        Some(&mut self.entries[idx].1)
    }

    pub fn set(&mut self, key: GroupKey, value: V) {
        match self.search(&key) {
            Ok(idx) => self.entries[idx].1 = value,
            Err(idx) if idx == self.entries.len() => self.entries.push((key, value)),
            Err(idx) => match self.cursor.as_mut() {
                // Ranging relies on the order staying put, so insert in place.
                Some(cursor) => {
                    self.entries.insert(idx, (key, value));
                    if idx < *cursor {
                        *cursor += 1;
                    }
                },
                None => {
                    self.entries.push((key, value));
                    self.dirty = true;
                },
            },
        }
    }

    pub fn lookup_or_create(&mut self, key: &GroupKey, create: impl FnOnce() -> V) -> &mut V {
        let idx = match self.search(key) {
            Ok(idx) => idx,
            Err(_) => {
                self.set(key.clone(), create());
                // set may have appended unsorted, find the entry again
                match self.search(key) {
                    Ok(idx) => idx,
                    Err(_) => unreachable!("entry was just inserted"),
                }
            },
        };
        &mut self.entries[idx].1
    }

    pub fn delete(&mut self, key: &GroupKey) -> Option<V> {
        let idx = self.search(key).ok()?;
        let (_, value) = self.entries.remove(idx);
        if let Some(cursor) = self.cursor.as_mut() {
            if idx < *cursor {
                *cursor -= 1;
            }
        }
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = false;
        if self.cursor.is_some() {
            self.cursor = Some(0);
        }
    }

    pub fn keys(&mut self) -> Vec<GroupKey> {
        self.sort_if_dirty();
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Calls `f` for every key in ascending order. The callback gets the lookup itself
    /// so it can read, update or delete entries while iterating.
    /// Stops at the first error. Not reentrant.
    pub fn range<E, F>(&mut self, mut f: F) -> Result<(), E>
        where F: FnMut(&mut Self, &GroupKey) -> Result<(), E> {
        self.begin_range();
        let mut result = Ok(());
        while let Some(key) = self.range_next() {
            if let Err(e) = f(self, &key) {
                result = Err(e);
                break;
            }
        }
        self.end_range();
        result
    }

    /// Starts a manual range. Owners that wrap the lookup use this when their
    /// callback needs more than the lookup itself.
    pub fn begin_range(&mut self) {
        self.sort_if_dirty();
        self.cursor = Some(0);
    }

    pub fn range_next(&mut self) -> Option<GroupKey> {
        let idx = self.cursor?;
        let (key, _) = self.entries.get(idx)?;
        let key = key.clone();
        self.cursor = Some(idx + 1);
        Some(key)
    }

    pub fn end_range(&mut self) {
        self.cursor = None;
    }

    /// Removes every entry, handing them out in key order.
    pub fn drain(&mut self) -> impl Iterator<Item = (GroupKey, V)> + '_ {
        self.sort_if_dirty();
        self.entries.drain(..)
    }
}

/// Group lookup with hashed access that iterates in insertion order.
/// Deleting while ranging is allowed.
#[derive(Debug)]
pub struct RandomAccessGroupLookup<V> {
    elements: Vec<Option<(GroupKey, V)>>,
    index: AHashMap<GroupKey, usize>,
    ranging: bool,
}

impl<V> Default for RandomAccessGroupLookup<V> {
    fn default() -> Self {
        RandomAccessGroupLookup { elements: Vec::new(), index: AHashMap::new(), ranging: false }
    }
}

impl<V> RandomAccessGroupLookup<V> {
    pub fn new() -> RandomAccessGroupLookup<V> {
        RandomAccessGroupLookup::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn lookup(&self, key: &GroupKey) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.elements[idx].as_ref().map(|(_, v)| v)
    }

    pub fn lookup_mut(&mut self, key: &GroupKey) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.elements[idx].as_mut().map(|(_, v)| v)
    }

    pub fn lookup_or_create(&mut self, key: &GroupKey, create: impl FnOnce() -> V) -> &mut V {
        let idx = match self.index.get(key).copied() {
            Some(idx) => idx,
            None => {
                self.elements.push(Some((key.clone(), create())));
                self.index.insert(key.clone(), self.elements.len() - 1);
                self.elements.len() - 1
            },
        };
        match self.elements[idx].as_mut() {
            Some((_, v)) => v,
            None => unreachable!("indexed entries are never tombstones"),
        }
    }

    pub fn set(&mut self, key: GroupKey, value: V) {
        match self.index.get(&key).copied() {
            Some(idx) => self.elements[idx] = Some((key, value)),
            None => {
                self.elements.push(Some((key.clone(), value)));
                self.index.insert(key, self.elements.len() - 1);
            },
        }
    }

    pub fn delete(&mut self, key: &GroupKey) -> Option<V> {
        let idx = self.index.remove(key)?;
        let value = self.elements[idx].take().map(|(_, v)| v);
        let tombstones = self.elements.len() - self.index.len();
        if !self.ranging && tombstones > 32 && tombstones > self.index.len() {
            self.compact();
        }
        value
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.index.clear();
    }

    /// Calls `f` for every live entry in insertion order.
    pub fn range<E, F>(&mut self, mut f: F) -> Result<(), E>
        where F: FnMut(&mut Self, &GroupKey) -> Result<(), E> {
        self.ranging = true;
        let mut idx = 0;
        let mut result = Ok(());
        while idx < self.elements.len() {
            if let Some(key) = self.elements[idx].as_ref().map(|(k, _)| k.clone()) {
                if let Err(e) = f(self, &key) {
                    result = Err(e);
                    break;
                }
            }
            idx += 1;
        }
        self.ranging = false;
        self.compact();
        result
    }

    // Drops the tombstones left behind by delete.
    fn compact(&mut self) {
        if self.elements.len() == self.index.len() {
            return;
        }
        self.elements.retain(|e| e.is_some());
        for (idx, entry) in self.elements.iter().enumerate() {
            if let Some((key, _)) = entry {
                self.index.insert(key.clone(), idx);
            }
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (GroupKey, V)> + '_ {
        self.index.clear();
        self.elements.drain(..).flatten()
    }
}
