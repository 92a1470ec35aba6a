use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const CANCELED: u8 = 1;
const PENDING: u8 = 2;
const COMPLETED: u8 = 3;
const DISPOSED: u8 = 4;

/// Lock-free arbiter between a cancellation request and the driver's
/// acknowledgement that an operation is pending.
///
/// Whichever side arrives second issues the interrupt, so every requested
/// cancellation produces exactly one interrupt while the operation is in
/// flight, and none once it finished. The interrupt itself is passed in by
/// the caller.
#[derive(Debug, Default)]
pub struct CancellationCoordinator {
    state: AtomicU8,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a cancellation request. Interrupts immediately if the driver
    /// already reported the operation as pending.
    ///
    /// Returns `true` if `interrupt` ran.
    pub fn request_or_interrupt(&self, interrupt: impl FnOnce()) -> bool {
        let mut current = IDLE;
        loop {
            if current != IDLE && current != PENDING {
                return false;
            }
            match self
                .state
                .compare_exchange(current, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(PENDING) => {
                    interrupt();
                    return true;
                }
                Ok(_) => return false,
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks the operation pending. Interrupts immediately if a cancellation
    /// request got here first. Does nothing if the operation already finished.
    ///
    /// Returns `true` if `interrupt` ran.
    pub fn arm_pending_or_interrupt(&self, interrupt: impl FnOnce()) -> bool {
        match self
            .state
            .compare_exchange(IDLE, PENDING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(CANCELED) => {
                interrupt();
                true
            }
            Err(_) => false,
        }
    }

    /// Records that the driver finished the operation. Later requests and
    /// arms are no-ops until [`reset`](Self::reset).
    pub fn settle(&self) {
        self.transition(COMPLETED);
    }

    /// Returns to idle before the owner is reused.
    pub fn reset(&self) {
        self.transition(IDLE);
    }

    fn transition(&self, next: u8) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != DISPOSED).then_some(next)
            });
    }

    /// Terminal state. Every later transition is a no-op.
    pub fn retire(&self) {
        self.state.store(DISPOSED, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_retired(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISPOSED
    }
}
