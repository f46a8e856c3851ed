// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Bit-per-block liveness map of one table revision.
///
/// A block may only be handed out by the allocator if it is clear in every
/// bitmap that is still referenced by a base file, plus the in-progress one.
/// That is what makes freeing *deferred*: a block freed by revision N becomes
/// reusable only once the base that still listed it has been overwritten.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Bitmap {
    bytes: Vec<u8>,
}

impl Bitmap {
    /// Creates an empty bitmap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a bitmap from its on-disk bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The on-disk representation.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns whether block `n` is marked live.
    ///
    /// Blocks beyond the map's end are free.
    #[must_use]
    pub fn bit(&self, n: u32) -> bool {
        let byte = (n / 8) as usize;
        self.bytes
            .get(byte)
            .is_some_and(|b| b & (1 << (n % 8)) != 0)
    }

    /// Marks block `n` live, growing the map if needed.
    pub fn set(&mut self, n: u32) {
        let byte = (n / 8) as usize;
        if byte >= self.bytes.len() {
            self.bytes.resize(byte + 1, 0);
        }

        #[allow(clippy::indexing_slicing)]
        {
            self.bytes[byte] |= 1 << (n % 8);
        }
    }

    /// Marks block `n` free.
    pub fn clear(&mut self, n: u32) {
        let byte = (n / 8) as usize;
        if let Some(b) = self.bytes.get_mut(byte) {
            *b &= !(1 << (n % 8));
        }
    }

    /// Number of blocks the map can describe without growing.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn capacity(&self) -> u32 {
        (self.bytes.len() * 8) as u32
    }
}

/// Finds the lowest block number that is clear in *all* given maps.
#[must_use]
pub fn find_free(maps: &[&Bitmap]) -> u32 {
    let limit = maps.iter().map(|m| m.capacity()).max().unwrap_or(0);

    for n in 0..limit {
        if maps.iter().all(|m| !m.bit(n)) {
            return n;
        }
    }

    limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bitmap_set_clear() {
        let mut map = Bitmap::new();
        assert!(!map.bit(0));
        assert!(!map.bit(1_000));

        map.set(0);
        map.set(17);
        assert!(map.bit(0));
        assert!(map.bit(17));
        assert!(!map.bit(16));

        map.clear(17);
        assert!(!map.bit(17));
        assert!(map.bit(0));
    }

    #[test]
    fn bitmap_roundtrip() {
        let mut map = Bitmap::new();
        map.set(3);
        map.set(42);

        let restored = Bitmap::from_bytes(map.as_bytes().to_vec());
        assert_eq!(map, restored);
    }

    #[test]
    fn allocator_respects_all_maps() {
        let mut a = Bitmap::new();
        let mut b = Bitmap::new();

        a.set(0);
        b.set(1);
        a.set(2);
        assert_eq!(3, find_free(&[&a, &b]));

        // A block freed in one map is still pinned by the other
        a.clear(0);
        b.set(0);
        assert_eq!(3, find_free(&[&a, &b]));

        b.clear(0);
        assert_eq!(0, find_free(&[&a, &b]));
    }

    #[test]
    fn allocator_grows_past_all_maps() {
        let mut a = Bitmap::new();
        for n in 0..8 {
            a.set(n);
        }
        assert_eq!(8, find_free(&[&a]));
        assert_eq!(0, find_free(&[]));
    }
}
