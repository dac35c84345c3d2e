use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Keyed rows with an undo log. The first write to a key inside a unit
/// remembers the row as it was; `rollback` puts those rows back and
/// `commit` forgets them. Work per unit is proportional to the rows it
/// touched, not to the size of the table.
#[derive(Debug, Clone)]
pub struct JournaledMap<K, V> {
    rows: BTreeMap<K, V>,
    undo: BTreeMap<K, Option<V>>,
}

impl<K, V> Default for JournaledMap<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            undo: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> JournaledMap<K, V> {
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.rows.get(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &BTreeMap<K, V> {
        &self.rows
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.remember(&key);
        self.rows.insert(key, value);
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let owned = self.rows.get_key_value(key)?.0.clone();
        self.remember(&owned);
        self.rows.remove(key)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let owned = self.rows.get_key_value(key)?.0.clone();
        self.remember(&owned);
        self.rows.get_mut(key)
    }

    /// First row matching `pred`, journaled for writing.
    pub fn find_mut(&mut self, pred: impl Fn(&V) -> bool) -> Option<&mut V> {
        let key = self
            .rows
            .iter()
            .find(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())?;
        self.get_mut(&key)
    }

    /// Keys of the rows matching `pred`.
    pub fn keys_where(&self, pred: impl Fn(&V) -> bool) -> Vec<K> {
        self.rows
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn commit(&mut self) {
        self.undo.clear();
    }

    pub fn rollback(&mut self) {
        for (key, before) in std::mem::take(&mut self.undo) {
            match before {
                Some(value) => {
                    self.rows.insert(key, value);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
    }

    fn remember(&mut self, key: &K) {
        if let Entry::Vacant(slot) = self.undo.entry(key.clone()) {
            slot.insert(self.rows.get(key).cloned());
        }
    }
}

/// Append-only log; `rollback` truncates to the last committed length and
/// hands back what it dropped.
#[derive(Debug, Clone)]
pub struct JournaledLog<T> {
    items: Vec<T>,
    committed: usize,
}

impl<T> Default for JournaledLog<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            committed: 0,
        }
    }
}

impl<T> JournaledLog<T> {
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn commit(&mut self) {
        self.committed = self.items.len();
    }

    pub fn rollback(&mut self) -> Vec<T> {
        self.items.split_off(self.committed)
    }
}
