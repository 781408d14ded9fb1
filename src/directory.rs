/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Open-addressing table keyed by socket fd.
//!
//! Linear probing with a bounded probe count, tombstoned deletes, and
//! grow-by-doubling rehash. Fds cluster in a small dense range, so the
//! multiplicative hash spreads them before masking. The bus wraps one of
//! these in a `Mutex` as its connection directory.

use std::os::unix::io::RawFd;

const MAX_PROBES: usize = 16;
const DEF_BUCKETS: usize = 16;

// largest prime under 2^32
const HASH_PRIME: u64 = 4_294_967_291;

enum Bucket<V> {
    Empty,
    /// A deleted entry; probes continue past it, inserts may reuse it.
    Tombstone,
    Used(RawFd, V),
}

pub struct Table<V> {
    buckets: Vec<Bucket<V>>,
    len: usize,
}

fn hash(key: RawFd) -> u64 {
    (key as u32 as u64).wrapping_mul(HASH_PRIME)
}

impl<V> Table<V> {
    pub fn new() -> Table<V> {
        Table::with_buckets(DEF_BUCKETS)
    }

    fn with_buckets(buckets: usize) -> Table<V> {
        debug_assert!(buckets.is_power_of_two());
        let mut v = Vec::with_capacity(buckets);
        for _ in 0..buckets {
            v.push(Bucket::Empty);
        }
        Table { buckets: v, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mask(&self) -> usize {
        self.buckets.len() - 1
    }

    fn max_probes(&self) -> usize {
        MAX_PROBES.min(self.buckets.len())
    }

    fn find(&self, key: RawFd) -> Option<usize> {
        let base = hash(key) as usize;
        let mask = self.mask();
        for i in 0..self.max_probes() {
            let idx = (base + i) & mask;
            match &self.buckets[idx] {
                Bucket::Empty => return None,
                Bucket::Tombstone => {}
                Bucket::Used(k, _) => {
                    if *k == key {
                        return Some(idx);
                    }
                }
            }
        }
        None
    }

    pub fn contains(&self, key: RawFd) -> bool {
        self.find(key).is_some()
    }

    pub fn get(&self, key: RawFd) -> Option<&V> {
        self.find(key).map(move |idx| match &self.buckets[idx] {
            Bucket::Used(_, v) => v,
            _ => unreachable!(),
        })
    }

    pub fn get_mut(&mut self, key: RawFd) -> Option<&mut V> {
        let idx = self.find(key)?;
        match &mut self.buckets[idx] {
            Bucket::Used(_, v) => Some(v),
            _ => unreachable!(),
        }
    }

    /// Insert or replace; returns the previous value for the key, if any.
    pub fn insert(&mut self, key: RawFd, value: V) -> Option<V> {
        let mut value = value;
        loop {
            match Self::place(&mut self.buckets, key, value) {
                Ok(old) => {
                    if old.is_none() {
                        self.len += 1;
                    }
                    return old;
                }
                Err(v) => {
                    // probe run exhausted; rehash into a bigger table
                    value = v;
                    self.grow();
                }
            }
        }
    }

    fn place(buckets: &mut Vec<Bucket<V>>, key: RawFd, value: V) -> Result<Option<V>, V> {
        let mask = buckets.len() - 1;
        let base = hash(key) as usize;
        let max_probes = MAX_PROBES.min(buckets.len());
        let mut first_tombstone = None;

        for i in 0..max_probes {
            let idx = (base + i) & mask;
            match &mut buckets[idx] {
                Bucket::Empty => {
                    let slot = first_tombstone.unwrap_or(idx);
                    buckets[slot] = Bucket::Used(key, value);
                    return Ok(None);
                }
                Bucket::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Bucket::Used(k, v) => {
                    if *k == key {
                        return Ok(Some(std::mem::replace(v, value)));
                    }
                }
            }
        }
        match first_tombstone {
            Some(slot) => {
                buckets[slot] = Bucket::Used(key, value);
                Ok(None)
            }
            None => Err(value),
        }
    }

    fn grow(&mut self) {
        let mut entries = Vec::with_capacity(self.len);
        for bucket in &mut self.buckets {
            if let Bucket::Used(..) = bucket {
                match std::mem::replace(bucket, Bucket::Empty) {
                    Bucket::Used(k, v) => entries.push((k, v)),
                    _ => unreachable!(),
                }
            }
        }

        let mut new_size = self.buckets.len() * 2;
        loop {
            let mut new_buckets: Vec<Bucket<V>> =
                (0..new_size).map(|_| Bucket::Empty).collect();
            let mut failed = None;
            while let Some((k, v)) = entries.pop() {
                if let Err(v) = Self::place(&mut new_buckets, k, v) {
                    failed = Some((k, v));
                    break;
                }
            }
            match failed {
                None => {
                    self.buckets = new_buckets;
                    return;
                }
                Some(kv) => {
                    // a collision run survived the doubling; pull everything
                    // back out and double again
                    entries.push(kv);
                    for bucket in &mut new_buckets {
                        if let Bucket::Used(..) = bucket {
                            match std::mem::replace(bucket, Bucket::Empty) {
                                Bucket::Used(k, v) => entries.push((k, v)),
                                _ => unreachable!(),
                            }
                        }
                    }
                    new_size *= 2;
                }
            }
        }
    }

    /// Remove a key, returning its value. The tombstone is skipped when the
    /// next bucket in the run is empty, since no probe can pass through it.
    pub fn remove(&mut self, key: RawFd) -> Option<V> {
        let idx = self.find(key)?;
        let next = (idx + 1) & self.mask();
        let replacement = if matches!(self.buckets[next], Bucket::Empty) {
            Bucket::Empty
        } else {
            Bucket::Tombstone
        };
        match std::mem::replace(&mut self.buckets[idx], replacement) {
            Bucket::Used(_, v) => {
                self.len -= 1;
                Some(v)
            }
            _ => unreachable!(),
        }
    }

    /// Empty the table, yielding every live entry.
    pub fn drain(&mut self) -> Vec<(RawFd, V)> {
        let mut out = Vec::with_capacity(self.len);
        for bucket in &mut self.buckets {
            if let Bucket::Used(..) = bucket {
                match std::mem::replace(bucket, Bucket::Empty) {
                    Bucket::Used(k, v) => out.push((k, v)),
                    _ => unreachable!(),
                }
            } else {
                *bucket = Bucket::Empty;
            }
        }
        self.len = 0;
        out
    }
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_reinsert() {
        let mut t: Table<String> = Table::new();
        assert!(t.get(3).is_none());
        assert_eq!(t.insert(3, "a".into()), None);
        assert_eq!(t.get(3).map(String::as_str), Some("a"));
        assert_eq!(t.insert(3, "b".into()), Some("a".into()));
        assert_eq!(t.len(), 1);

        assert_eq!(t.remove(3), Some("b".into()));
        assert!(t.get(3).is_none());
        assert_eq!(t.len(), 0);

        assert_eq!(t.insert(3, "c".into()), None);
        assert_eq!(t.get(3).map(String::as_str), Some("c"));
    }

    #[test]
    fn remove_missing_is_none() {
        let mut t: Table<u32> = Table::new();
        t.insert(1, 10);
        assert_eq!(t.remove(2), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn thousand_keys_every_third_removed() {
        let mut t: Table<i32> = Table::new();
        for i in 0..1000 {
            assert_eq!(t.insert(i, i * 2), None);
        }
        assert_eq!(t.len(), 1000);

        for i in 0..1000 {
            if i % 3 == 0 {
                assert_eq!(t.remove(i), Some(i * 2));
            }
        }

        for i in 0..1000 {
            if i % 3 == 0 {
                assert!(!t.contains(i), "key {} should be gone", i);
            } else {
                assert_eq!(t.get(i), Some(&(i * 2)), "key {} should remain", i);
            }
        }
    }

    #[test]
    fn growth_preserves_live_set() {
        let mut t: Table<i32> = Table::new();
        // churn: interleave inserts and deletes to seed tombstones, then
        // push well past the initial capacity
        for i in 0..64 {
            t.insert(i, i);
        }
        for i in 0..64 {
            if i % 2 == 0 {
                t.remove(i);
            }
        }
        for i in 64..512 {
            t.insert(i, i);
        }

        for i in 0..64 {
            if i % 2 == 0 {
                assert!(!t.contains(i));
            } else {
                assert_eq!(t.get(i), Some(&i));
            }
        }
        for i in 64..512 {
            assert_eq!(t.get(i), Some(&i));
        }
    }

    #[test]
    fn drain_returns_everything_live() {
        let mut t: Table<i32> = Table::new();
        for i in 0..10 {
            t.insert(i, i);
        }
        t.remove(4);

        let mut entries = t.drain();
        entries.sort_unstable();
        let expected: Vec<(RawFd, i32)> =
            (0..10).filter(|i| *i != 4).map(|i| (i, i)).collect();
        assert_eq!(entries, expected);
        assert!(t.is_empty());
        assert!(!t.contains(1));
    }
}
