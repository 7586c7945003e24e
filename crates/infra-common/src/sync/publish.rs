//! Torn-read-free snapshot publication from one writer to many readers.
//!
//! [`Publish`] rotates a new snapshot through `SLOTS` buffers. The writer
//! copies into a slot no reader currently holds and then flips the active
//! index, so a reader always observes either the previous or a newer
//! *complete* snapshot. The writer never waits on a lock: a slot that a
//! reader is still draining is simply skipped. With `SLOTS` at least one
//! larger than the number of concurrent reader threads there is always a
//! free slot to write into.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const NO_SNAPSHOT: usize = usize::MAX;

/// Multi-slot single-writer snapshot cell.
pub struct Publish<T, const SLOTS: usize> {
    slots: [Mutex<T>; SLOTS],
    active: AtomicUsize,
}

impl<T: Clone + Default, const SLOTS: usize> Publish<T, SLOTS> {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(T::default())),
            active: AtomicUsize::new(NO_SNAPSHOT),
        }
    }

    /// Publish a new snapshot. Returns `false` when every non-active slot
    /// was held by a reader and the snapshot was discarded; the previous
    /// one stays visible. Single writer only.
    pub fn write(&self, value: T) -> bool {
        let active = self.active.load(Ordering::Relaxed);
        for (idx, slot) in self.slots.iter().enumerate() {
            if idx == active {
                continue;
            }
            if let Some(mut guard) = slot.try_lock() {
                *guard = value;
                drop(guard);
                self.active.store(idx, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Read the most recently published snapshot, or `None` before the
    /// first `write`. Safe from any thread; never blocks the writer.
    pub fn read(&self) -> Option<T> {
        let active = self.active.load(Ordering::Acquire);
        if active == NO_SNAPSHOT {
            return None;
        }
        Some(self.slots[active].lock().clone())
    }
}

impl<T: Clone + Default, const SLOTS: usize> Default for Publish<T, SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_until_first_write() {
        let cell: Publish<u64, 3> = Publish::new();
        assert_eq!(cell.read(), None);
        assert!(cell.write(7));
        assert_eq!(cell.read(), Some(7));
    }

    #[test]
    fn later_writes_replace_earlier_ones() {
        let cell: Publish<Vec<u32>, 3> = Publish::new();
        for i in 0..20u32 {
            assert!(cell.write(vec![i; 4]));
            assert_eq!(cell.read(), Some(vec![i; 4]));
        }
    }

    #[test]
    fn concurrent_readers_never_observe_torn_snapshots() {
        #[derive(Clone, Default)]
        struct Pair {
            a: u64,
            b: u64,
        }

        let cell: Arc<Publish<Pair, 6>> = Arc::new(Publish::new());
        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for i in 1..=50_000u64 {
                    cell.write(Pair { a: i, b: i * 2 });
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..20_000 {
                        if let Some(pair) = cell.read() {
                            assert_eq!(pair.b, pair.a * 2);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
