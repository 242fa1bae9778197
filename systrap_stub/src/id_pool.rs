// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Stack-id allocation for stub threads.

/// A fixed-capacity pool of stack ids backed by a bitmap.
///
/// Set bits are ids in use. [`allocate`](Self::allocate) always hands out the lowest free id, so
/// the per-thread slots of a subprocess stay packed towards the stack base.
pub struct IdPool {
    /// Word `w`, bit `b` is id `w * 64 + b`.
    bitmap: Vec<u64>,
    capacity: u32,
    in_use: u32,
}

impl IdPool {
    /// Create a pool that tracks ids `0..capacity`.
    #[must_use]
    pub fn with_capacity(capacity: u32) -> Self {
        let words = (capacity as usize).div_ceil(64);
        Self {
            bitmap: vec![0; words],
            capacity,
            in_use: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of ids currently handed out.
    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Take the lowest free id, or `None` if every id is in use.
    pub fn allocate(&mut self) -> Option<u32> {
        let (w, word) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = (!*word).trailing_zeros();
        // `w < bitmap.len()`, and the bitmap covers at most `u32::MAX` ids.
        #[allow(clippy::cast_possible_truncation)]
        let id = w as u32 * 64 + bit;
        // Bits past `capacity` in the last word are never set, so stop at the first of them.
        if id >= self.capacity {
            return None;
        }
        *word |= 1 << bit;
        self.in_use += 1;
        Some(id)
    }

    /// Return `id` to the pool.
    ///
    /// Returns `false` if `id` was not in use, which means the caller released it twice.
    #[must_use = "a double release indicates broken bookkeeping"]
    pub fn recycle(&mut self, id: u32) -> bool {
        debug_assert!(
            id < self.capacity,
            "recycled id {id} is out of range (capacity = {})",
            self.capacity
        );
        let Some(word) = self.bitmap.get_mut(id as usize / 64) else {
            return false;
        };
        let mask = 1u64 << (id % 64);
        if *word & mask == 0 {
            return false;
        }
        *word &= !mask;
        self.in_use -= 1;
        true
    }

    /// Whether `id` is currently handed out.
    pub fn is_allocated(&self, id: u32) -> bool {
        self.bitmap
            .get(id as usize / 64)
            .is_some_and(|word| word & (1 << (id % 64)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_lowest_free_id() {
        let mut pool = IdPool::with_capacity(4);
        assert_eq!(pool.allocate(), Some(0));
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        assert!(pool.recycle(0));
        assert_eq!(pool.allocate(), Some(0));
        assert_eq!(pool.allocate(), Some(3));
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn capacity_not_word_aligned() {
        let mut pool = IdPool::with_capacity(65);
        for i in 0..65 {
            assert_eq!(pool.allocate(), Some(i));
        }
        // Bits 65..128 of the second word are outside the pool.
        assert_eq!(pool.allocate(), None);
        assert!(pool.recycle(64));
        assert_eq!(pool.allocate(), Some(64));
    }

    #[test]
    fn double_recycle_is_reported() {
        let mut pool = IdPool::with_capacity(2);
        let id = pool.allocate().unwrap();
        assert!(pool.is_allocated(id));
        assert!(pool.recycle(id));
        assert!(!pool.recycle(id));
        assert!(!pool.is_allocated(id));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn empty_pool() {
        let mut pool = IdPool::with_capacity(0);
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "out of range")]
    fn recycle_out_of_range_panics_in_debug() {
        let mut pool = IdPool::with_capacity(10);
        let _ = pool.recycle(100);
    }
}
