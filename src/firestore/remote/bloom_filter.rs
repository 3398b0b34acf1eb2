use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::util::sha1_u64_pair;

/// Server-sent bloom filter over the resource names a target still matches.
///
/// Membership checks use double hashing: hash `i` tests bit
/// `(h1 + i * h2) mod bit_count`, with `h1`/`h2` taken from the SHA-1 digest of
/// the name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u32, hash_count: i32) -> FirestoreResult<Self> {
        if padding > 7 {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = sha1_u64_pair(value.as_bytes());
        (0..u64::from(self.hash_count)).all(|index| {
            let combined = hash1.wrapping_add(index.wrapping_mul(hash2));
            self.is_bit_set(combined % self.bit_count)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    /// Builds a filter containing `values`. Used by scripted servers in tests.
    pub fn from_values<'a, I>(values: I, bit_count: u64, hash_count: u32) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let byte_len = bit_count.div_ceil(8) as usize;
        let mut bitmap = vec![0u8; byte_len];
        for value in values {
            let (hash1, hash2) = sha1_u64_pair(value.as_bytes());
            for index in 0..u64::from(hash_count) {
                let bit = hash1.wrapping_add(index.wrapping_mul(hash2)) % bit_count;
                bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        Self {
            bitmap,
            hash_count,
            bit_count,
        }
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> u32 {
        (self.bitmap.len() as u64 * 8 - self.bit_count) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inconsistent_parameters() {
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![1], 8, 1).is_err());
        assert!(BloomFilter::new(vec![1], 0, 0).is_err());
        assert!(BloomFilter::new(vec![1], 0, -1).is_err());
        assert_eq!(BloomFilter::new(vec![0xff, 0xff], 3, 2).unwrap().bit_count(), 13);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert!(!filter.might_contain("projects/p/databases/(default)/documents/rooms/a"));
    }

    #[test]
    fn inserted_values_are_always_found() {
        let names = [
            "projects/p/databases/(default)/documents/rooms/a",
            "projects/p/databases/(default)/documents/rooms/b",
        ];
        let filter = BloomFilter::from_values(names, 253, 7);
        let decoded = BloomFilter::new(filter.bitmap().to_vec(), filter.padding(), 7).unwrap();
        assert_eq!(decoded, filter);
        for name in names {
            assert!(decoded.might_contain(name));
        }
    }
}
