use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use parking_lot::Mutex;

/// A bucket holds up to `bucket_size` key/value entries and is referenced by
/// every directory slot whose low `depth` bits match its discriminator.
struct Bucket<K, V> {
    depth: usize,
    items: Vec<(K, V)>,
}

impl<K: PartialEq, V> Bucket<K, V> {
    fn new(depth: usize, capacity: usize) -> Self {
        Self {
            depth,
            items: Vec::with_capacity(capacity),
        }
    }

    fn find(&self, key: &K) -> Option<&V> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn remove(&mut self, key: &K) -> bool {
        if let Some(pos) = self.items.iter().position(|(k, _)| k == key) {
            self.items.remove(pos);
            return true;
        }
        false
    }

    /// Inserts or updates in place. The caller guarantees room for a new key.
    fn insert(&mut self, key: K, value: V) {
        if let Some((_, v)) = self.items.iter_mut().find(|(k, _)| *k == key) {
            *v = value;
            return;
        }
        self.items.push((key, value));
    }
}

struct TableInner<K, V> {
    global_depth: usize,
    num_buckets: usize,
    /// Directory of length 2^global_depth; each slot is an index into `buckets`.
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

/// Extendible hash table: a directory of bucket handles that doubles by
/// powers of two while splitting one overflowing bucket at a time.
///
/// Serves as the buffer pool's page table (page id -> frame id). All
/// operations are total and mutually exclusive under a single mutex. The
/// hasher is a type parameter so callers that need deterministic bucket
/// placement can supply their own `BuildHasher`.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hasher: S,
    inner: Mutex<TableInner<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            hasher,
            inner: Mutex::new(TableInner {
                global_depth: 0,
                num_buckets: 1,
                dir: vec![0],
                buckets: vec![Bucket::new(0, bucket_size)],
            }),
        }
    }

    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn dir_index(&self, key: &K, global_depth: usize) -> usize {
        let mask = (1usize << global_depth) - 1;
        (self.hash(key) as usize) & mask
    }

    /// Looks up the value stored under `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let slot = self.dir_index(key, inner.global_depth);
        inner.buckets[inner.dir[slot]].find(key).cloned()
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let slot = self.dir_index(key, inner.global_depth);
        let bucket = inner.dir[slot];
        inner.buckets[bucket].remove(key)
    }

    /// Inserts a key/value pair, updating the value if the key exists.
    ///
    /// While the target bucket is full: double the directory when the
    /// bucket's local depth has caught up with the global depth, then split
    /// the bucket and redistribute its entries by the freshly exposed hash
    /// bit. The loop repeats because a split can leave every entry on one
    /// side.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        loop {
            let slot = self.dir_index(&key, inner.global_depth);
            let target = inner.dir[slot];
            if inner.buckets[target].items.len() < self.bucket_size {
                break;
            }

            if inner.buckets[target].depth == inner.global_depth {
                // Double the directory: the upper half mirrors the lower.
                inner.global_depth += 1;
                let old_len = inner.dir.len();
                for i in 0..old_len {
                    let b = inner.dir[i];
                    inner.dir.push(b);
                }
            }

            // Split `target`: entries with the new discriminator bit set move
            // to a fresh bucket; the rest stay in place at depth + 1.
            let depth = inner.buckets[target].depth;
            let mask = 1usize << depth;
            let drained: Vec<(K, V)> = inner.buckets[target].items.drain(..).collect();
            inner.buckets[target].depth = depth + 1;
            let high = inner.buckets.len();
            inner.buckets.push(Bucket::new(depth + 1, self.bucket_size));

            for (k, v) in drained {
                let b = if (self.hash(&k) as usize) & mask != 0 {
                    high
                } else {
                    target
                };
                inner.buckets[b].items.push((k, v));
            }
            inner.num_buckets += 1;

            for i in 0..inner.dir.len() {
                if inner.dir[i] == target && i & mask != 0 {
                    inner.dir[i] = high;
                }
            }
        }

        let slot = self.dir_index(&key, inner.global_depth);
        let target = inner.dir[slot];
        inner.buckets[target].insert(key, value);
    }

    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let inner = self.inner.lock();
        inner.buckets[inner.dir[dir_index]].depth
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().num_buckets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find() {
        let table: ExtendibleHashTable<u32, String> = ExtendibleHashTable::new(4);

        table.insert(1, "one".to_string());
        table.insert(2, "two".to_string());
        table.insert(3, "three".to_string());

        assert_eq!(table.find(&1), Some("one".to_string()));
        assert_eq!(table.find(&2), Some("two".to_string()));
        assert_eq!(table.find(&3), Some("three".to_string()));
        assert_eq!(table.find(&4), None);
    }

    #[test]
    fn test_insert_updates_existing() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        table.insert(1, 20);

        assert_eq!(table.find(&1), Some(20));
    }

    #[test]
    fn test_remove() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);

        table.insert(1, 10);
        assert!(table.remove(&1));
        assert_eq!(table.find(&1), None);
        assert!(!table.remove(&1));
    }

    #[test]
    fn test_split_grows_directory() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);

        for i in 0..64 {
            table.insert(i, i * 10);
        }
        for i in 0..64 {
            assert_eq!(table.find(&i), Some(i * 10), "lost key {}", i);
        }
        assert!(table.global_depth() >= 1);
        assert!(table.num_buckets() > 1);
    }

    #[test]
    fn test_concurrent_insert_find() {
        use std::sync::Arc;
        use std::thread;

        let table: Arc<ExtendibleHashTable<u32, u32>> = Arc::new(ExtendibleHashTable::new(4));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..100u32 {
                        let key = t * 100 + i;
                        table.insert(key, key + 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..400u32 {
            assert_eq!(table.find(&key), Some(key + 1));
        }
    }
}
