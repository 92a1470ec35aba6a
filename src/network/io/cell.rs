use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Poll, Waker};

enum State<T> {
    /// Nothing stored yet. Holds the waker of a suspended consumer, if any.
    Pending(Option<Waker>),
    Ready(T),
    /// The consumer went away. The producer recycles the owner.
    Detached,
}

struct Inner<T> {
    generation: u32,
    state: State<T>,
}

/// Single-result cell reused across operations.
///
/// Every consumption bumps the generation, so a consumer holding the
/// generation of an earlier operation can never observe a later result.
pub struct ResultCell<T> {
    inner: Mutex<Inner<T>>,
}

/// What the producer should do after [`ResultCell::store`].
#[derive(Debug, PartialEq, Eq)]
pub enum Stored<T> {
    /// A consumer will pick the result up.
    Delivered,
    /// Nobody is waiting anymore. The value is handed back.
    Abandoned(T),
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                generation: 0,
                state: State::Pending(None),
            }),
        }
    }
}

impl<T> ResultCell<T> {
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        // The critical sections never panic half-way, the data is consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation the next consumer must present.
    pub fn generation(&self) -> u32 {
        self.lock().generation
    }

    /// Stores the outcome of the current operation and wakes its consumer.
    pub fn store(&self, value: T) -> Stored<T> {
        let waker = {
            let mut inner = self.lock();
            match std::mem::replace(&mut inner.state, State::Pending(None)) {
                State::Pending(waker) => {
                    inner.state = State::Ready(value);
                    waker
                }
                State::Detached => {
                    inner.generation = inner.generation.wrapping_add(1);
                    return Stored::Abandoned(value);
                }
                State::Ready(previous) => {
                    // A second store for one submission; keep the first outcome.
                    inner.state = State::Ready(previous);
                    return Stored::Abandoned(value);
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Stored::Delivered
    }

    /// Takes the outcome for `generation`, or registers `waker` until it arrives.
    ///
    /// Returns `Ready(None)` for a stale generation.
    pub fn poll_take(&self, generation: u32, waker: &Waker) -> Poll<Option<T>> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return Poll::Ready(None);
        }
        match std::mem::replace(&mut inner.state, State::Pending(None)) {
            State::Ready(value) => {
                inner.generation = inner.generation.wrapping_add(1);
                Poll::Ready(Some(value))
            }
            State::Pending(previous) => {
                let waker = match previous {
                    Some(previous) if previous.will_wake(waker) => previous,
                    _ => waker.clone(),
                };
                inner.state = State::Pending(Some(waker));
                Poll::Pending
            }
            State::Detached => {
                inner.state = State::Detached;
                Poll::Ready(None)
            }
        }
    }

    /// Gives up on `generation`.
    ///
    /// Returns the outcome if it already arrived, in which case the caller
    /// recycles the owner. Otherwise the producer will.
    pub fn detach(&self, generation: u32) -> Option<T> {
        let mut inner = self.lock();
        if inner.generation != generation {
            return None;
        }
        match std::mem::replace(&mut inner.state, State::Detached) {
            State::Ready(value) => {
                inner.state = State::Pending(None);
                inner.generation = inner.generation.wrapping_add(1);
                Some(value)
            }
            State::Pending(_) | State::Detached => None,
        }
    }

    /// Whether an outcome is waiting to be consumed.
    pub fn is_ready(&self) -> bool {
        matches!(self.lock().state, State::Ready(_))
    }
}
