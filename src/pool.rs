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

//! Fixed-capacity slot pool with a lock-free freelist.
//!
//! Slots are reclaimed through a tagged compare-and-swap index stack, so
//! any number of producer threads can reserve without locking while a
//! single consumer takes values out by index. Exhaustion is a non-fatal
//! `None`; the occupancy counter feeds backpressure reporting.
//!
//! The intended flow is: producer `reserve`s a slot, fills it with `set`,
//! `commit`s, and hands the returned index to the consumer over a channel.
//! The consumer `take`s the value and `release`s the index. Dropping an
//! uncommitted reservation releases the slot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const NIL: u32 = u32::MAX;

struct Slot<T> {
    /// Freelist link; meaningful only while the slot is free.
    next: AtomicU64,
    value: UnsafeCell<Option<T>>,
}

pub struct Pool<T> {
    slots: Box<[Slot<T>]>,
    /// Freelist head: upper 32 bits are an ABA tag bumped on every
    /// successful push or pop, lower 32 bits the head index (or `NIL`).
    head: AtomicU64,
    in_use: AtomicUsize,
}

// SAFETY: a slot's value cell is touched only by the thread that currently
// owns the slot. Ownership passes through the freelist CAS (reserve/release)
// and, for filled slots, through whatever channel carries the committed
// index, both of which order the accesses.
unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Pool<T> {
    pub fn new(capacity: usize) -> Pool<T> {
        assert!(capacity > 0 && capacity < NIL as usize);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity {
                (i + 1) as u64
            } else {
                u64::from(NIL)
            };
            slots.push(Slot {
                next: AtomicU64::new(next),
                value: UnsafeCell::new(None),
            });
        }
        Pool {
            slots: slots.into_boxed_slice(),
            head: AtomicU64::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Reserve a free slot, or `None` if the pool is exhausted.
    pub fn reserve(&self) -> Option<Reserved<'_, T>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let index = (head & u64::from(u32::MAX)) as u32;
            if index == NIL {
                return None;
            }
            let next = self.slots[index as usize].next.load(Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let new_head = (tag << 32) | (next & u64::from(u32::MAX));
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Some(Reserved {
                    pool: self,
                    index,
                    committed: false,
                });
            }
        }
    }

    /// Take the value out of a committed slot. Only the holder of the
    /// committed index may call this, exactly once before `release`.
    pub fn take(&self, index: u32) -> T {
        // SAFETY: the committed index was handed to exactly one consumer;
        // no other thread touches the cell until the index is released.
        let value = unsafe { (*self.slots[index as usize].value.get()).take() };
        match value {
            Some(v) => v,
            None => panic!("pool slot {} taken while empty", index),
        }
    }

    /// Return a slot to the freelist. The slot must be empty.
    pub fn release(&self, index: u32) {
        let slot = &self.slots[index as usize];
        // SAFETY: caller owns the slot until this push succeeds.
        debug_assert!(unsafe { (*slot.value.get()).is_none() });
        loop {
            let head = self.head.load(Ordering::Acquire);
            slot.next
                .store(head & u64::from(u32::MAX), Ordering::Relaxed);
            let tag = (head >> 32).wrapping_add(1);
            let new_head = (tag << 32) | u64::from(index);
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

/// An owned, not-yet-committed slot.
pub struct Reserved<'a, T> {
    pool: &'a Pool<T>,
    index: u32,
    committed: bool,
}

impl<'a, T> Reserved<'a, T> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set(&mut self, value: T) {
        // SAFETY: this reservation is the slot's sole owner.
        unsafe {
            *self.pool.slots[self.index as usize].value.get() = Some(value);
        }
    }

    /// Take back whatever was `set`, e.g. when handing the index off fails.
    pub fn take(&mut self) -> Option<T> {
        // SAFETY: this reservation is the slot's sole owner.
        unsafe { (*self.pool.slots[self.index as usize].value.get()).take() }
    }

    /// Finalize the reservation, passing slot ownership to whoever
    /// receives the index.
    pub fn commit(mut self) -> u32 {
        self.committed = true;
        self.index
    }
}

impl<'a, T> Drop for Reserved<'a, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.take();
            self.pool.release(self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reserve_commit_take_release_cycle() {
        let pool: Pool<String> = Pool::new(2);
        assert_eq!(pool.in_use(), 0);

        let mut r = pool.reserve().unwrap();
        r.set("hello".to_string());
        let index = r.commit();
        assert_eq!(pool.in_use(), 1);

        assert_eq!(pool.take(index), "hello");
        pool.release(index);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhaustion_returns_none_and_release_recovers() {
        let pool: Pool<u32> = Pool::new(2);
        let a = pool.reserve().unwrap().commit();
        let _b = pool.reserve().unwrap().commit();
        assert!(pool.reserve().is_none());

        pool.release(a);
        assert!(pool.reserve().is_some());
    }

    #[test]
    fn dropping_uncommitted_reservation_releases() {
        let pool: Pool<u32> = Pool::new(1);
        {
            let mut r = pool.reserve().unwrap();
            r.set(5);
            // dropped uncommitted
        }
        assert_eq!(pool.in_use(), 0);
        assert!(pool.reserve().is_some());
    }

    #[test]
    #[should_panic(expected = "taken while empty")]
    fn double_take_panics() {
        let pool: Pool<u32> = Pool::new(1);
        let mut r = pool.reserve().unwrap();
        r.set(1);
        let index = r.commit();
        assert_eq!(pool.take(index), 1);
        pool.take(index);
    }

    #[test]
    fn concurrent_producers_never_share_a_slot() {
        const CAP: usize = 32;
        const PER_THREAD: usize = 500;
        const THREADS: usize = 4;

        let pool: Arc<Pool<(usize, usize)>> = Arc::new(Pool::new(CAP));
        let (tx, rx) = mpsc::sync_channel::<u32>(CAP);

        let mut producers = Vec::new();
        for t in 0..THREADS {
            let pool = pool.clone();
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                let mut sent = 0;
                while sent < PER_THREAD {
                    match pool.reserve() {
                        Some(mut r) => {
                            r.set((t, sent));
                            let index = r.commit();
                            tx.send(index).unwrap();
                            sent += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
            }));
        }
        drop(tx);

        let consumer = thread::spawn(move || {
            let mut seen = vec![HashSet::new(); THREADS];
            let mut outstanding = HashSet::new();
            while let Ok(index) = rx.recv() {
                // a live index can never be handed out twice
                assert!(outstanding.insert(index));
                let (t, n) = pool.take(index);
                assert!(seen[t].insert(n));
                pool.release(index);
                outstanding.remove(&index);
            }
            for s in seen {
                assert_eq!(s.len(), PER_THREAD);
            }
        });

        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();
    }
}
