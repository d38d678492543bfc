//! Bounded-wait FIFO shared between producer and consumer threads.
//!
//! Items report a size so the queue can track the cumulative size of its
//! contents. Consumers wait forever, not at all, or up to a timeout.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Anything a [`BlockingQueue`] can hold.
pub trait QueuedItem {
    fn item_size(&self) -> usize;
}

impl QueuedItem for Vec<u8> {
    fn item_size(&self) -> usize {
        self.len()
    }
}

/// How long an extracting call may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Forever,
    NoWait,
    For(Duration),
}

/// Negative means forever, zero means do not wait, positive is milliseconds.
impl From<i64> for Wait {
    fn from(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Wait::Forever,
            0 => Wait::NoWait,
            ms => Wait::For(Duration::from_millis(ms as u64)),
        }
    }
}

impl From<Option<Duration>> for Wait {
    fn from(d: Option<Duration>) -> Self {
        d.map_or(Wait::Forever, |d| if d.is_zero() { Wait::NoWait } else { Wait::For(d) })
    }
}

/// Outcome of an extracting call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract<T> {
    Item(T),
    TimedOut,
    Closed,
}

impl<T> Extract<T> {
    pub fn item(self) -> Option<T> {
        match self {
            Extract::Item(t) => Some(t),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Extract<U> {
        match self {
            Extract::Item(t) => Extract::Item(f(t)),
            Extract::TimedOut => Extract::TimedOut,
            Extract::Closed => Extract::Closed,
        }
    }
}

impl Extract<usize> {
    /// Integer form: the size, -1 on timeout, 0 once closed.
    pub fn as_code(&self) -> i64 {
        match self {
            Extract::Item(n) => *n as i64,
            Extract::TimedOut => -1,
            Extract::Closed => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

enum Stop {
    TimedOut,
    Closed,
}

impl<T> From<Stop> for Extract<T> {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::TimedOut => Extract::TimedOut,
            Stop::Closed => Extract::Closed,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    cumulative_size: usize,
    closed: bool,
}

pub struct BlockingQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T: QueuedItem> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueuedItem> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                cumulative_size: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, item: T) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(QueueError::Closed);
        }
        inner.cumulative_size += item.item_size();
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Block until the queue is non-empty, closed, or the wait runs out.
    /// Items still queued at close remain extractable.
    fn wait_for_item(&self, wait: Wait) -> Result<MutexGuard<'_, Inner<T>>, Stop> {
        let deadline = match wait {
            Wait::For(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut inner = self.lock();
        loop {
            if !inner.items.is_empty() {
                return Ok(inner);
            }
            if inner.closed {
                return Err(Stop::Closed);
            }
            match (wait, deadline) {
                (Wait::NoWait, _) => return Err(Stop::TimedOut),
                (Wait::Forever, _) => {
                    inner = self
                        .available
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                (Wait::For(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Stop::TimedOut);
                    }
                    inner = self
                        .available
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                (Wait::For(_), None) => return Err(Stop::TimedOut),
            }
        }
    }

    /// Inspect the head without removing it.
    pub fn peek_with<R>(&self, wait: Wait, f: impl FnOnce(&T) -> R) -> Extract<R> {
        match self.wait_for_item(wait) {
            Ok(inner) => match inner.items.front() {
                Some(item) => Extract::Item(f(item)),
                None => Extract::TimedOut,
            },
            Err(stop) => stop.into(),
        }
    }

    pub fn extract(&self, wait: Wait) -> Extract<T> {
        match self.wait_for_item(wait) {
            Ok(mut inner) => match inner.items.pop_front() {
                Some(item) => {
                    inner.cumulative_size -= item.item_size();
                    Extract::Item(item)
                }
                None => Extract::TimedOut,
            },
            Err(stop) => stop.into(),
        }
    }

    /// Wake every waiter; subsequent inserts fail.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn cumulative_size(&self) -> usize {
        self.lock().cumulative_size
    }
}
