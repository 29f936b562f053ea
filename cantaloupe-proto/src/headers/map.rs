use alloc::{
    collections::{btree_map::Entry, BTreeMap},
    vec::Vec,
};

use super::{HeaderName, HeaderValue};

/// A multimap of message headers
///
/// Each [`HeaderName`] maps to one or more values, preserving the
/// order in which they were appended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderMap {
    headers: BTreeMap<HeaderName, Vec<HeaderValue>>,
    len: usize,
}

impl HeaderMap {
    /// Create an empty `HeaderMap`
    ///
    /// This function does not allocate.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            headers: BTreeMap::new(),
            len: 0,
        }
    }

    /// Replace any existing values for `name` with `value`
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some(prev) = self.headers.insert(name, alloc::vec![value]) {
            self.len -= prev.len();
        }
        self.len += 1;
    }

    /// Append `value` to the values already present for `name`
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        match self.headers.entry(name) {
            Entry::Vacant(vacant) => {
                vacant.insert(alloc::vec![value]);
            }
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().push(value);
            }
        }
        self.len += 1;
    }

    /// Remove every value stored for `name`
    pub fn remove(&mut self, name: &HeaderName) {
        if let Some(prev) = self.headers.remove(name) {
            self.len -= prev.len();
        }
    }

    /// Get the first value stored for `name`
    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.headers.get(name).and_then(|values| values.first())
    }

    /// Get every value stored for `name` in insertion order
    pub fn get_all(&self, name: &HeaderName) -> impl Iterator<Item = &'_ HeaderValue> {
        self.headers.get(name).into_iter().flatten()
    }

    /// Returns the total number of values stored in the map
    ///
    /// This can be greater than the number of distinct names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map contains no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Clear the map, keeping the allocated memory for reuse
    pub fn clear(&mut self) {
        self.headers.clear();
        self.len = 0;
    }

    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = (&'_ HeaderName, impl Iterator<Item = &'_ HeaderValue>)>
    {
        self.headers
            .iter()
            .map(|(name, values)| (name, values.iter()))
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: I) -> Self {
        let mut this = Self::new();
        this.extend(iter);
        this
    }
}

impl Extend<(HeaderName, HeaderValue)> for HeaderMap {
    fn extend<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(&mut self, iter: T) {
        iter.into_iter().for_each(|(name, value)| {
            self.append(name, value);
        });
    }
}
