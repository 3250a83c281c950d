use foldhash::HashMap;
use std::{borrow::Borrow, fmt, hash::Hash};

/// A map from immutable creation keys to lazily built objects.
///
/// An entry is written once, when its key is first requested, and then never again until the
/// cache is invalidated. The cache is not internally synchronized: `&mut self` guarantees that no
/// other build for the same key can be in flight.
pub struct KeyedObjectCache<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> Default for KeyedObjectCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedObjectCache<K, V> {
    /// Creates a new, empty `KeyedObjectCache`.
    pub fn new() -> Self {
        Self {
            inner: HashMap::default(),
        }
    }

    /// Returns the number of built objects.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over the built objects.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    /// Iterates mutably over the built objects.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.inner.values_mut()
    }

    /// Removes every entry, handing each key-value pair to `destroy`.
    pub fn invalidate_all(&mut self, mut destroy: impl FnMut(K, V)) {
        for (key, value) in self.inner.drain() {
            destroy(key, value);
        }
    }
}

impl<K, V> KeyedObjectCache<K, V>
where
    K: Eq + Hash,
{
    /// Returns the object for the specified `key`, if it has been built.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.get(key)
    }

    /// Returns the object for the specified `key`. The entry gets written to with the value
    /// returned by `build` if it doesn't exist. If `build` returns [`Err`], the error is
    /// propagated and the entry isn't written to.
    pub fn get_or_try_insert<Q, E>(
        &mut self,
        key: &Q,
        build: impl FnOnce(&Q) -> Result<V, E>,
    ) -> Result<&mut V, E>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ToOwned<Owned = K> + ?Sized,
    {
        if !self.inner.contains_key(key) {
            let value = build(key)?;
            self.inner.insert(key.to_owned(), value);
        }

        // The entry either existed or has just been inserted.
        Ok(self.inner.get_mut(key).unwrap())
    }

    /// Removes the entry for `key` and returns its object, which the caller must destroy.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.remove(key)
    }
}

impl<K, V> fmt::Debug for KeyedObjectCache<K, V>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.iter()).finish()
    }
}
