//! Constant-time free-ID allocator.
//!
//! A fixed pool of ids in `[begin, begin + length)` backed by a singly
//! linked free list embedded in an array: `next[rid]` chains free slots
//! from `start` to `end` in FIFO order, and a slot that is currently
//! allocated (or is the list tail) holds the `NONE` sentinel.

use crate::errors::CounterError;
use log::trace;

const NONE: u64 = u64::MAX;

/// Pool of reusable integer ids.
#[derive(Debug)]
pub struct Counter {
    begin: u64,
    len: u64,
    cap: u64,
    start: u64,
    end: u64,
    next: Vec<u64>,
}

impl Counter {
    /// Creates a pool of `length` ids starting at `begin`.
    pub fn new(begin: u64, length: u64) -> Self {
        let mut next: Vec<u64> = (1..=length).collect();
        if let Some(tail) = next.last_mut() {
            *tail = NONE;
        }
        let (start, end) = if length == 0 {
            (NONE, NONE)
        } else {
            (0, length - 1)
        };
        Counter {
            begin,
            len: length,
            cap: length,
            start,
            end,
            next,
        }
    }

    /// Remaining free ids.
    pub fn capacity(&self) -> u64 {
        self.cap
    }

    /// Pops the next free id. Ids come back in FIFO order of release
    /// once the initial sequential run is exhausted.
    pub fn get(&mut self) -> Result<u64, CounterError> {
        if self.cap == 0 || self.start == NONE {
            return Err(CounterError::Overflow);
        }
        let rid = self.start;
        self.cap -= 1;
        if self.start == self.end {
            self.start = NONE;
            self.end = NONE;
        } else {
            self.start = self.next[rid as usize];
            self.next[rid as usize] = NONE;
        }
        trace!("counter: get {}", rid + self.begin);
        Ok(rid + self.begin)
    }

    /// Returns `id` to the tail of the free list.
    pub fn put(&mut self, id: u64) -> Result<(), CounterError> {
        if id < self.begin || id >= self.begin + self.len {
            return Err(CounterError::Range);
        }
        let rid = id - self.begin;
        self.next[rid as usize] = NONE;
        if self.start == NONE {
            self.start = rid;
        } else {
            self.next[self.end as usize] = rid;
        }
        self.end = rid;
        self.cap += 1;
        trace!("counter: put {}", id);
        Ok(())
    }

    /// Withdraws a specific id from the free list so `get` cannot hand
    /// it out until a later `put`. Fails `Overflow` when the id is
    /// already allocated.
    pub fn reserve(&mut self, id: u64) -> Result<(), CounterError> {
        if id < self.begin || id >= self.begin + self.len {
            return Err(CounterError::Range);
        }
        if self.cap == 0 || self.start == NONE {
            return Err(CounterError::Overflow);
        }
        let rid = id - self.begin;
        if self.start == rid {
            if self.start == self.end {
                self.start = NONE;
                self.end = NONE;
            } else {
                self.start = self.next[rid as usize];
            }
        } else {
            // Unlink from the middle of the list; an id that never
            // turns up is already allocated.
            let mut prev = self.start;
            loop {
                let nxt = self.next[prev as usize];
                if nxt == rid {
                    break;
                }
                if nxt == NONE {
                    return Err(CounterError::Overflow);
                }
                prev = nxt;
            }
            self.next[prev as usize] = self.next[rid as usize];
            if self.end == rid {
                self.end = prev;
            }
        }
        self.next[rid as usize] = NONE;
        self.cap -= 1;
        trace!("counter: reserve {}", id);
        Ok(())
    }
}
