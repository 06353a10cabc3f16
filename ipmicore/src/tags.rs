//! Correlation identifier pools: the sessionless message tag pool shared by
//! all pre-session traffic, and the console session ID allocator.

use hashbrown::HashSet;
use ipmiproto::shared::{IpmiError, IpmiResult};
use std::sync::{Condvar, Mutex};

/// Number of tags in rotation. RMCP+ allots a 6-bit tag; the top values are
/// left unused so a stray reserved tag can never be confused with ours.
pub const TAG_RANGE: u8 = 60;

struct TagState {
    reserved: u64,
    last_issued: u8,
    shutdown: bool,
}

/// Pool of sessionless message tags in `[0, 59]`. A tag has at most one
/// owner; ownership travels pool, request, pool.
pub struct TagPool {
    state: Mutex<TagState>,
    available: Condvar,
}

impl TagPool {
    pub fn new() -> TagPool {
        TagPool {
            state: Mutex::new(TagState {
                reserved: 0,
                last_issued: TAG_RANGE - 1,
                shutdown: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Reserves the next free tag, rotating through the range before
    /// wrapping so recently used tags are reissued last. Blocks while the
    /// whole range is reserved; fails with `Cancelled` once the pool shuts
    /// down.
    pub fn acquire(&self) -> IpmiResult<u8> {
        let mut state = self.state.lock().expect("Tag pool poisoned");

        loop {
            if state.shutdown {
                return Err(IpmiError::Cancelled);
            }

            for offset in 0..TAG_RANGE {
                let tag = (state.last_issued + 1 + offset) % TAG_RANGE;

                if state.reserved & (1u64 << tag) == 0 {
                    state.reserved |= 1u64 << tag;
                    state.last_issued = tag;
                    return Ok(tag);
                }
            }

            state = self
                .available
                .wait(state)
                .expect("Tag pool poisoned");
        }
    }

    /// Returns a tag to the pool and wakes one waiter.
    pub fn release(&self, tag: u8) {
        let mut state = self.state.lock().expect("Tag pool poisoned");

        debug_assert!(state.reserved & (1u64 << tag) != 0, "Releasing free tag");

        state.reserved &= !(1u64 << tag);
        self.available.notify_one();
    }

    /// Fails all current and future waiters with `Cancelled`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("Tag pool poisoned");
        state.shutdown = true;
        self.available.notify_all();
    }

    /// Number of tags currently reserved.
    pub fn reserved_count(&self) -> usize {
        let state = self.state.lock().expect("Tag pool poisoned");
        state.reserved.count_ones() as usize
    }
}

/// First console session ID handed out.
const FIRST_SESSION_ID: u32 = 100;
/// Wrap bound, leaving headroom below the reserved upper ID space.
const SESSION_ID_WRAP: u32 = (i32::max_value() / 4) as u32;

struct IdState {
    next: u32,
    in_use: HashSet<u32>,
}

/// Issues console-side session IDs. IDs still bound to a live session are
/// skipped after the counter wraps.
pub struct SessionIdAllocator {
    state: Mutex<IdState>,
}

impl SessionIdAllocator {
    pub fn new() -> SessionIdAllocator {
        Self::starting_at(FIRST_SESSION_ID)
    }

    fn starting_at(next: u32) -> SessionIdAllocator {
        SessionIdAllocator {
            state: Mutex::new(IdState {
                next,
                in_use: HashSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> u32 {
        let mut state = self.state.lock().expect("Session id allocator poisoned");

        loop {
            let candidate = state.next;

            state.next = match state.next + 1 {
                next if next >= SESSION_ID_WRAP => FIRST_SESSION_ID,
                next => next,
            };

            if state.in_use.insert(candidate) {
                return candidate;
            }
        }
    }

    pub fn release(&self, id: u32) {
        let mut state = self.state.lock().expect("Session id allocator poisoned");
        state.in_use.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_tags_rotate() {
        let pool = TagPool::new();

        assert_eq!(pool.acquire().unwrap(), 0);
        assert_eq!(pool.acquire().unwrap(), 1);
        assert_eq!(pool.acquire().unwrap(), 2);

        // A released tag is not reissued until the rotation comes back
        // around to it.
        pool.release(1);
        assert_eq!(pool.acquire().unwrap(), 3);
    }

    #[test]
    fn test_tags_wrap_to_released() {
        let pool = TagPool::new();

        for expected in 0..TAG_RANGE {
            assert_eq!(pool.acquire().unwrap(), expected);
        }

        pool.release(17);
        assert_eq!(pool.acquire().unwrap(), 17);
    }

    #[test]
    fn test_exhausted_pool_blocks_until_release() {
        let pool = Arc::new(TagPool::new());

        for _ in 0..TAG_RANGE {
            pool.acquire().unwrap();
        }

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire());

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(5);
        assert_eq!(waiter.join().unwrap().unwrap(), 5);
    }

    #[test]
    fn test_shutdown_cancels_waiter() {
        let pool = Arc::new(TagPool::new());

        for _ in 0..TAG_RANGE {
            pool.acquire().unwrap();
        }

        let waiter_pool = pool.clone();
        let waiter = thread::spawn(move || waiter_pool.acquire());

        thread::sleep(Duration::from_millis(20));
        pool.shutdown();

        assert_eq!(waiter.join().unwrap().unwrap_err(), IpmiError::Cancelled);
    }

    #[test]
    fn test_reserved_matches_outstanding_under_contention() {
        let pool = Arc::new(TagPool::new());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let tag = pool.acquire().unwrap();
                        pool.release(tag);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.reserved_count(), 0);
    }

    #[test]
    fn test_session_ids_start_at_100() {
        let allocator = SessionIdAllocator::new();

        assert_eq!(allocator.allocate(), 100);
        assert_eq!(allocator.allocate(), 101);
    }

    #[test]
    fn test_session_ids_skip_in_use_after_wrap() {
        let allocator = SessionIdAllocator::starting_at(SESSION_ID_WRAP - 1);

        let last = allocator.allocate();
        assert_eq!(last, SESSION_ID_WRAP - 1);

        // The counter wraps back to the start; 100 is still held, so the
        // next allocation must skip it.
        let _held = {
            let hundred = allocator.allocate();
            assert_eq!(hundred, FIRST_SESSION_ID);
            hundred
        };

        assert_eq!(allocator.allocate(), FIRST_SESSION_ID + 1);
    }

    #[test]
    fn test_session_id_release_allows_reuse_after_wrap() {
        let allocator = SessionIdAllocator::starting_at(SESSION_ID_WRAP - 1);

        allocator.allocate();
        let id = allocator.allocate();
        assert_eq!(id, FIRST_SESSION_ID);

        allocator.release(id);

        let allocator_wrapped = SessionIdAllocator::starting_at(FIRST_SESSION_ID);
        assert_eq!(allocator_wrapped.allocate(), FIRST_SESSION_ID);
    }
}
