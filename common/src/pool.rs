use slab::Slab;

/// A slab with a hard capacity: allocation fails instead of growing.
///
/// Keys are dense, so a key is always below the capacity and can index a
/// parallel array (a DMA buffer region, for instance). Releasing a key that is
/// not allocated is a broken invariant and panics.
pub struct Pool<T> {
    slab: Slab<T>,
    capacity: usize,
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            capacity,
        }
    }

    pub fn alloc(&mut self, value: T) -> Option<usize> {
        if self.slab.len() >= self.capacity {
            return None;
        }
        Some(self.slab.insert(value))
    }

    pub fn release(&mut self, key: usize) -> T {
        match self.slab.try_remove(key) {
            Some(value) => value,
            None => panic!("pool entry {} released twice or never allocated", key),
        }
    }

    pub fn get(&self, key: usize) -> Option<&T> {
        self.slab.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut T> {
        self.slab.get_mut(key)
    }

    pub fn contains(&self, key: usize) -> bool {
        self.slab.contains(key)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slab.iter()
    }

    /// Keys of every entry matching `pred`.
    pub fn keys_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<usize> {
        self.slab
            .iter()
            .filter(|(_, value)| pred(value))
            .map(|(key, _)| key)
            .collect()
    }
}
