//! A reusable free-list of pooled objects with a used-set for periodic
//! reaping. Mirrors the connection/agent object pools described in the
//! spec: an object is either in the used set or the free queue, never
//! both, and the pool only grows, never shrinks.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// An opaque handle into a [`Pool`]. Stable for the lifetime of the slot
/// it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// The handle's raw numeric value, stable for the slot's lifetime.
    /// Used as a connection id where callers need a plain `u64`.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The number of fresh objects allocated whenever a pool's free count
/// drops to or below 1, matching the original's batch-of-128 rule.
const GROWTH_BATCH: u64 = 128;

struct Inner<T> {
    slots: HashMap<Handle, T>,
    free: VecDeque<Handle>,
    used: Vec<Handle>,
    next_id: u64,
}

/// A thread-safe object pool. `T` is typically per-connection state
/// (a `Connection` or `Agent`); pooling avoids reallocating it on every
/// accept.
pub struct Pool<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                free: VecDeque::new(),
                used: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Ensures at least two free slots are available, growing the pool
    /// by a batch of 128 if the free count is at or below 1. Callers
    /// (the TCP/UDP/WS accept paths) invoke this right before drawing a
    /// fresh slot for a new connection.
    pub fn reserve(&self, mut make: impl FnMut() -> T) {
        let mut inner = self.inner.lock();
        if inner.free.len() <= 1 {
            for _ in 0..GROWTH_BATCH {
                let handle = Handle(inner.next_id);
                inner.next_id += 1;
                inner.slots.insert(handle, make());
                inner.free.push_back(handle);
            }
        }
    }

    /// Draws a free slot and marks it used. Panics if the pool is empty
    /// — callers must `reserve` first.
    pub fn get(&self) -> Handle {
        let mut inner = self.inner.lock();
        let handle = inner
            .free
            .pop_front()
            .expect("pool exhausted; call reserve() first");
        inner.used.push(handle);
        handle
    }

    /// Returns a used slot to the free queue.
    pub fn free(&self, handle: Handle) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.used.iter().position(|h| *h == handle) {
            inner.used.swap_remove(pos);
        }
        inner.free.push_back(handle);
    }

    pub fn used_count(&self) -> usize {
        self.inner.lock().used.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Snapshots the used set under the lock and invokes `f` on each
    /// value. `f` must not call back into the pool.
    pub fn used_range(&self, mut f: impl FnMut(Handle, &T)) {
        let inner = self.inner.lock();
        for handle in inner.used.iter() {
            if let Some(value) = inner.slots.get(handle) {
                f(*handle, value);
            }
        }
    }

    pub fn with<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.slots.get(&handle).map(f)
    }

    pub fn with_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.slots.get_mut(&handle).map(f)
    }

    /// True if `handle` is currently checked out.
    pub fn is_used(&self, handle: Handle) -> bool {
        self.inner.lock().used.contains(&handle)
    }
}

/// Sweeps every used slot and calls `on_timeout` for the ones that have
/// been idle longer than `timeout`. Mirrors the periodic agent-pool
/// sweep the dispatch loop's reaper tick drives (see `dispatch`):
/// timeout of zero disables reaping entirely, matching the source's
/// "TcpTimeout > 0" guard.
pub fn reap_idle<T>(
    pool: &Pool<T>,
    timeout: std::time::Duration,
    idle_for: impl Fn(&T) -> std::time::Duration,
    on_timeout: impl Fn(&T),
) {
    if timeout.is_zero() {
        return;
    }
    pool.used_range(|_handle, value| {
        if idle_for(value) > timeout {
            on_timeout(value);
        }
    });
}

#[cfg(test)]
mod reaper_tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reaps_only_entries_past_the_timeout() {
        let pool: Pool<Duration> = Pool::new();
        pool.reserve(|| Duration::ZERO);
        let fresh = pool.get();
        let stale = pool.get();
        pool.with_mut(fresh, |d| *d = Duration::from_secs(1)).unwrap();
        pool.with_mut(stale, |d| *d = Duration::from_secs(99)).unwrap();

        let mut reaped = Vec::new();
        reap_idle(&pool, Duration::from_secs(10), |d| *d, |d| reaped.push(*d));
        assert_eq!(reaped, vec![Duration::from_secs(99)]);
    }

    #[test]
    fn zero_timeout_disables_reaping() {
        let pool: Pool<Duration> = Pool::new();
        pool.reserve(|| Duration::from_secs(999));
        pool.get();
        let mut reaped = 0;
        reap_idle(&pool, Duration::ZERO, |d| *d, |_| reaped += 1);
        assert_eq!(reaped, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_plus_free_equals_total_created() {
        let pool: Pool<u32> = Pool::new();
        let mut next = 0u32;
        pool.reserve(|| {
            next += 1;
            next
        });
        let total = pool.free_count();
        assert_eq!(pool.used_count() + pool.free_count(), total);

        let h = pool.get();
        assert_eq!(pool.used_count() + pool.free_count(), total);

        pool.free(h);
        assert_eq!(pool.used_count() + pool.free_count(), total);
    }

    #[test]
    fn grows_in_batches_of_128() {
        let pool: Pool<()> = Pool::new();
        pool.reserve(|| ());
        assert_eq!(pool.free_count(), 128);

        // Draw all but one; free_count is now 1, triggering another growth.
        for _ in 0..127 {
            pool.get();
        }
        pool.reserve(|| ());
        assert_eq!(pool.free_count(), 128 + 1);
    }

    #[test]
    fn object_never_in_both_sets() {
        let pool: Pool<u32> = Pool::new();
        pool.reserve(|| 7);
        let h = pool.get();
        assert!(pool.is_used(h));
        assert_eq!(pool.with(h, |v| *v), Some(7));

        pool.free(h);
        assert!(!pool.is_used(h));
    }

    #[test]
    fn used_range_does_not_see_free_objects() {
        let pool: Pool<u32> = Pool::new();
        pool.reserve(|| 0);
        let h1 = pool.get();
        let mut seen = Vec::new();
        pool.used_range(|handle, _| seen.push(handle));
        assert_eq!(seen, vec![h1]);
    }
}
