use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{FrameId, PageId};

/// Hash function for directory indexing.
///
/// Integer keys hash to their own value, so the directory index of a key is
/// simply its low `global_depth` bits. Implement this for any other key type
/// that needs to live in an [`ExtendibleHashTable`].
pub trait HashKey: Copy + Eq {
    fn hash_key(&self) -> u64;
}

macro_rules! hash_key_int {
    ($($t:ty),*) => {
        $(impl HashKey for $t {
            fn hash_key(&self) -> u64 {
                *self as u64
            }
        })*
    };
}

hash_key_int!(u16, u32, u64, i16, i32, i64, usize);

impl HashKey for PageId {
    fn hash_key(&self) -> u64 {
        self.as_u32() as u64
    }
}

impl HashKey for FrameId {
    fn hash_key(&self) -> u64 {
        self.as_u32() as u64
    }
}

/// A bounded list of entries sharing a hash prefix of `depth` bits.
struct Bucket<K, V> {
    items: Vec<(K, V)>,
    capacity: usize,
    depth: u32,
}

impl<K: HashKey, V: Clone> Bucket<K, V> {
    fn new(capacity: usize, depth: u32) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
            depth,
        }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn find(&self, key: &K) -> Option<V> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn remove(&mut self, key: &K) -> bool {
        match self.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Overwrites on duplicate; otherwise appends if there is room.
    fn insert(&mut self, key: K, value: V) -> bool {
        if let Some(entry) = self.items.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return true;
        }
        if self.is_full() {
            return false;
        }
        self.items.push((key, value));
        true
    }
}

struct Directory<K, V> {
    global_depth: u32,
    num_buckets: u32,
    dir: Vec<Arc<Mutex<Bucket<K, V>>>>,
}

/// Extendible hash table.
///
/// The directory holds `2^global_depth` slots; a bucket whose local depth is
/// below the global depth is shared by several aliasing slots. A full bucket
/// is split into two buckets of one greater depth, doubling the directory
/// first when the bucket was at the global depth. Insertion therefore always
/// succeeds; an undersized `bucket_size` only costs directory growth.
///
/// All operations serialize on a single table mutex.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    inner: Mutex<Directory<K, V>>,
}

impl<K: HashKey, V: Clone> ExtendibleHashTable<K, V> {
    /// Creates a table with one empty bucket of the given capacity.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            inner: Mutex::new(Directory {
                global_depth: 0,
                num_buckets: 1,
                dir: vec![Arc::new(Mutex::new(Bucket::new(bucket_size, 0)))],
            }),
        }
    }

    fn index_of(key: &K, global_depth: u32) -> usize {
        let mask = (1u64 << global_depth) - 1;
        (key.hash_key() & mask) as usize
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> u32 {
        self.inner.lock().dir[dir_index].lock().depth
    }

    pub fn num_buckets(&self) -> u32 {
        self.inner.lock().num_buckets
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let index = Self::index_of(key, inner.global_depth);
        let bucket = inner.dir[index].lock();
        bucket.find(key)
    }

    pub fn remove(&self, key: &K) -> bool {
        let inner = self.inner.lock();
        let index = Self::index_of(key, inner.global_depth);
        let mut bucket = inner.dir[index].lock();
        bucket.remove(key)
    }

    /// Inserts `(key, value)`, overwriting the value of an existing key.
    /// Splits the target bucket (growing the directory as needed) until the
    /// insertion fits.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        let index = Self::index_of(&key, inner.global_depth);
        if inner.dir[index].lock().find(&key).is_some() {
            inner.dir[index].lock().insert(key, value);
            return;
        }

        let mut index = index;
        while inner.dir[index].lock().is_full() {
            let target = Arc::clone(&inner.dir[index]);
            let local_depth = target.lock().depth;

            // A bucket already at the global depth needs the directory to
            // double before it can split: each new high-half slot aliases
            // the corresponding low-half bucket.
            if local_depth == inner.global_depth {
                inner.global_depth += 1;
                let old_len = inner.dir.len();
                for i in 0..old_len {
                    let alias = Arc::clone(&inner.dir[i]);
                    inner.dir.push(alias);
                }
            }

            // Split by the bit just above the old prefix.
            let split_bit = 1u64 << local_depth;
            let bucket_0 = Arc::new(Mutex::new(Bucket::new(self.bucket_size, local_depth + 1)));
            let bucket_1 = Arc::new(Mutex::new(Bucket::new(self.bucket_size, local_depth + 1)));

            for (k, v) in target.lock().items.iter() {
                let chosen = if k.hash_key() & split_bit == 0 {
                    &bucket_0
                } else {
                    &bucket_1
                };
                chosen.lock().insert(*k, v.clone());
            }
            inner.num_buckets += 1;

            // Rewire every slot that aliased the old bucket.
            for (i, slot) in inner.dir.iter_mut().enumerate() {
                if Arc::ptr_eq(slot, &target) {
                    *slot = if (i as u64) & split_bit == 0 {
                        Arc::clone(&bucket_0)
                    } else {
                        Arc::clone(&bucket_1)
                    };
                }
            }

            index = Self::index_of(&key, inner.global_depth);
        }

        inner.dir[index].lock().insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_table_new() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);
        assert_eq!(table.find(&1), None);
    }

    #[test]
    fn test_hash_table_insert_find() {
        let table = ExtendibleHashTable::new(4);

        for i in 0..32u32 {
            table.insert(i, i * 10);
        }
        for i in 0..32u32 {
            assert_eq!(table.find(&i), Some(i * 10), "missing key {}", i);
        }
        assert_eq!(table.find(&32), None);
    }

    #[test]
    fn test_hash_table_overwrite() {
        let table = ExtendibleHashTable::new(2);
        table.insert(7u32, "a");
        table.insert(7u32, "b");
        assert_eq!(table.find(&7), Some("b"));
        assert_eq!(table.num_buckets(), 1);
    }

    #[test]
    fn test_hash_table_remove() {
        let table = ExtendibleHashTable::new(2);
        table.insert(1u32, 1);
        table.insert(2u32, 2);

        assert!(table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert_eq!(table.find(&2), Some(2));
        assert!(!table.remove(&1));
    }

    #[test]
    fn test_hash_table_split_keeps_entries() {
        let table = ExtendibleHashTable::new(2);

        // Force repeated splits with colliding low bits
        for i in 0..16u32 {
            table.insert(i * 8, i);
        }
        for i in 0..16u32 {
            assert_eq!(table.find(&(i * 8)), Some(i));
        }
        assert!(table.global_depth() >= 3);
    }
}
