//! Completion engine.
//!
//! An [`Engine`] turns one native receive or send into a single consumable
//! result. Engines are pooled per direction and reused; between reuses the
//! cancellation coordinator, the slot cell and the result cell all return
//! to their idle states.
//!
//! Every path that finishes an operation does the same three things in the
//! same order: settle the coordinator, release the slot, store the result.

use super::cancel::CancellationCoordinator;
use super::cell::{ResultCell, Stored};
use super::pool::OperationPool;
use super::slot::{Buffers, OperationSlot, SlotCell};
use crate::error::{CancelReason, DivertError, InvalidState, Result};
use crate::network::core::address::ADDRESS_SIZE;
use crate::network::core::handle::{DivertHandle, HandleRef};
use crate::sys::{
    Driver, NativeOverlapped, Submission, ERROR_NO_DATA, ERROR_OPERATION_ABORTED, ERROR_SUCCESS,
};
use log::{debug, trace};
use std::cell::UnsafeCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Receive,
    Send,
}

/// Byte and address counts moved by one successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transfer {
    pub bytes: usize,
    pub addresses: usize,
}

/// Outcome of one operation together with the caller's buffers.
#[derive(Debug)]
pub struct Completed {
    pub result: Result<Transfer>,
    pub buffers: Buffers,
}

impl Completed {
    pub(crate) fn failed(error: impl Into<DivertError>, buffers: Buffers) -> Self {
        Self {
            result: Err(error.into()),
            buffers,
        }
    }
}

/// Immediate outcome of [`Engine::submit`].
pub enum Submitted<D: Driver> {
    /// Finished without suspending.
    Ready(Completed),
    /// The driver completes it later.
    Pending(Completion<D>),
}

pub struct Engine<D: Driver> {
    direction: Direction,
    handle: Arc<DivertHandle<D>>,
    pool: Weak<OperationPool<D>>,
    coordinator: CancellationCoordinator,
    slot: SlotCell,
    cell: ResultCell<Completed>,
    overlapped: UnsafeCell<NativeOverlapped>,
    addresses_len: UnsafeCell<u32>,
}

// SAFETY: `overlapped` and `addresses_len` are written by the submitter
// before the native call and afterwards only by the driver until the
// completion routine runs. The slot and result cells synchronize themselves.
unsafe impl<D: Driver> Send for Engine<D> {}
unsafe impl<D: Driver> Sync for Engine<D> {}

impl<D: Driver> Engine<D> {
    pub(crate) fn new(
        direction: Direction,
        handle: Arc<DivertHandle<D>>,
        pool: Weak<OperationPool<D>>,
    ) -> Self {
        Self {
            direction,
            handle,
            pool,
            coordinator: CancellationCoordinator::new(),
            slot: SlotCell::default(),
            cell: ResultCell::default(),
            overlapped: UnsafeCell::new(NativeOverlapped::new(
                Self::on_native_completion,
                std::ptr::null(),
            )),
            addresses_len: UnsafeCell::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Starts one operation over `buffers`.
    ///
    /// An already canceled `token` short-circuits without reaching the driver.
    pub fn submit(self: Arc<Self>, buffers: Buffers, token: Option<&CancellationToken>) -> Submitted<D> {
        if token.is_some_and(CancellationToken::is_cancelled) {
            trace!("{:?} canceled before submission", self.direction);
            self.recycle();
            return Submitted::Ready(Completed::failed(
                DivertError::Canceled(CancelReason::Token),
                buffers,
            ));
        }

        let generation = self.cell.generation();
        let submission = {
            let handle = match self.handle.acquire() {
                Ok(handle) => handle,
                Err(error) => {
                    Arc::clone(&self).recycle();
                    return Submitted::Ready(Completed::failed(error, buffers));
                }
            };
            let in_flight = Arc::into_raw(Arc::clone(&self));
            // SAFETY: this engine is not shared with any other operation
            // until it goes back to its pool.
            let submission = unsafe { self.start(&handle, buffers, token, in_flight) };
            if !matches!(submission, Submission::Pending) {
                // SAFETY: the completion routine will not run, so the
                // reference handed to it comes back here.
                drop(unsafe { Arc::from_raw(in_flight) });
            }
            submission
        };

        match submission {
            Submission::Pending => {
                trace!("{:?} pending", self.direction);
                self.coordinator.arm_pending_or_interrupt(|| self.interrupt());
                Submitted::Pending(Completion {
                    engine: Some(self),
                    generation,
                })
            }
            Submission::Completed(bytes) => {
                trace!("{:?} completed inline with {} bytes", self.direction, bytes);
                let completed = self.finish(ERROR_SUCCESS, bytes);
                self.recycle();
                Submitted::Ready(completed)
            }
            Submission::Failed(code) => {
                trace!("{:?} failed inline with error {}", self.direction, code);
                self.coordinator.settle();
                let buffers = self
                    .slot
                    .take()
                    .map(OperationSlot::into_buffers)
                    .unwrap_or_default();
                self.recycle();
                Submitted::Ready(Completed::failed(DivertError::native(code), buffers))
            }
        }
    }

    unsafe fn start(
        &self,
        handle: &HandleRef<'_, D>,
        buffers: Buffers,
        token: Option<&CancellationToken>,
        state: *const Self,
    ) -> Submission {
        let (packet, len, addresses, addresses_bytes) = {
            let slot = &mut *self.slot.install(OperationSlot::new(buffers, token.cloned()));
            (
                slot.packet_ptr(),
                slot.packet_len(),
                slot.addresses_ptr(),
                slot.addresses_len(),
            )
        };
        let overlapped = self.overlapped.get();
        (*overlapped).prepare(Self::on_native_completion, state.cast());
        let addresses_len = self.addresses_len.get();
        *addresses_len = addresses_bytes;

        match self.direction {
            Direction::Receive => handle.driver().receive(
                handle.raw(),
                packet,
                len,
                addresses,
                addresses_len,
                overlapped,
            ),
            Direction::Send => handle.driver().send(
                handle.raw(),
                packet,
                len,
                addresses,
                addresses_bytes,
                overlapped,
            ),
        }
    }

    /// Completion routine installed in every descriptor. Runs on a driver worker.
    unsafe fn on_native_completion(state: *const (), status: u32, bytes: u32) {
        let engine = Arc::from_raw(state.cast::<Self>());
        engine.complete(status, bytes);
    }

    fn complete(self: Arc<Self>, status: u32, bytes: u32) {
        trace!(
            "{:?} completed with status {} and {} bytes",
            self.direction,
            status,
            bytes
        );
        let completed = self.finish(status, bytes);
        if let Stored::Abandoned(_) = self.cell.store(completed) {
            trace!("{:?} result abandoned by its caller", self.direction);
            self.recycle();
        }
    }

    /// Settles the coordinator, releases the slot and maps the native status.
    fn finish(&self, status: u32, bytes: u32) -> Completed {
        self.coordinator.settle();
        let Some(slot) = self.slot.take() else {
            return Completed::failed(DivertError::Canceled(CancelReason::Disposed), Buffers::default());
        };
        // SAFETY: the driver is done with the descriptor once it reports a status.
        let written = unsafe { *self.addresses_len.get() } as usize / ADDRESS_SIZE;
        let result = match status {
            ERROR_SUCCESS => Ok(Transfer {
                bytes: bytes as usize,
                addresses: match self.direction {
                    Direction::Receive => written,
                    Direction::Send => slot.address_count(),
                },
            }),
            ERROR_NO_DATA if self.direction == Direction::Receive => Ok(Transfer::default()),
            ERROR_OPERATION_ABORTED if slot.token_canceled() => {
                Err(DivertError::Canceled(CancelReason::Token))
            }
            ERROR_OPERATION_ABORTED => Err(DivertError::Canceled(CancelReason::Disposed)),
            code => Err(DivertError::native(code)),
        };
        Completed {
            result,
            buffers: slot.into_buffers(),
        }
    }

    fn interrupt(&self) {
        match self.handle.acquire() {
            Ok(handle) => {
                trace!("Interrupting {:?}", self.direction);
                handle.driver().cancel(handle.raw(), self.overlapped.get());
            }
            Err(_) => trace!("{:?} handle already closed, nothing to interrupt", self.direction),
        }
    }

    /// Hands the engine back to its pool, or disposes it if the pool is gone.
    fn recycle(self: Arc<Self>) {
        self.coordinator.reset();
        match self.pool.upgrade() {
            Some(pool) => pool.release(self),
            None => self.dispose(),
        }
    }

    /// Retires the engine for good and drops any slot it still holds.
    pub(crate) fn dispose(&self) {
        self.coordinator.retire();
        if self.slot.take().is_some() {
            debug!("Released slot of disposed {:?} engine", self.direction);
        }
    }

    /// Cancels whatever operation is in flight on behalf of the owning pool.
    /// An engine between acquisition and submission interrupts as soon as
    /// the driver reports the operation pending.
    pub(crate) fn abort(&self) {
        if self.coordinator.request_or_interrupt(|| self.interrupt()) {
            debug!("Aborted in-flight {:?} operation", self.direction);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_retired(&self) -> bool {
        self.coordinator.is_retired()
    }
}

/// Suspended caller side of a pending operation.
///
/// Resolves to the operation's outcome and recycles the engine. Dropping it
/// before that requests cancellation; the engine then recycles itself once
/// the driver finishes.
pub struct Completion<D: Driver> {
    engine: Option<Arc<Engine<D>>>,
    generation: u32,
}

impl<D: Driver> Completion<D> {
    /// Requests cancellation of the operation. A no-op once it finished.
    pub fn request_cancel(&self) {
        if let Some(engine) = &self.engine {
            engine
                .coordinator
                .request_or_interrupt(|| engine.interrupt());
        }
    }
}

impl<D: Driver> Future for Completion<D> {
    type Output = Completed;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completed> {
        let generation = self.generation;
        let Some(engine) = self.engine.as_ref() else {
            return Poll::Ready(Completed::failed(InvalidState::Stale, Buffers::default()));
        };
        match engine.cell.poll_take(generation, cx.waker()) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(completed)) => {
                if let Some(engine) = self.engine.take() {
                    engine.recycle();
                }
                Poll::Ready(completed)
            }
            Poll::Ready(None) => {
                self.engine = None;
                Poll::Ready(Completed::failed(InvalidState::Stale, Buffers::default()))
            }
        }
    }
}

impl<D: Driver> Drop for Completion<D> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine
                .coordinator
                .request_or_interrupt(|| engine.interrupt());
            if engine.cell.detach(self.generation).is_some() {
                engine.recycle();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::core::address::Address;
    use crate::network::core::handle::HandleConfig;
    use crate::sys::mock::{Call, MockDriver, Reply};
    use crate::sys::ERROR_INSUFFICIENT_BUFFER;
    use std::time::Duration;

    fn open(driver: &MockDriver) -> Arc<DivertHandle<MockDriver>> {
        let handle =
            DivertHandle::open(driver.clone(), c"true", HandleConfig::default()).unwrap();
        handle.bind().unwrap();
        Arc::new(handle)
    }

    fn engine(handle: &Arc<DivertHandle<MockDriver>>, direction: Direction) -> Arc<Engine<MockDriver>> {
        Arc::new(Engine::new(direction, Arc::clone(handle), Weak::new()))
    }

    fn receive_buffers() -> Buffers {
        Buffers::new(vec![0; 2000], vec![Address::default(); 1])
    }

    async fn wait(completion: Completion<MockDriver>) -> Completed {
        tokio::time::timeout(Duration::from_secs(5), completion)
            .await
            .expect("operation hung")
    }

    #[test]
    fn test_canceled_token_never_reaches_driver() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        let token = CancellationToken::new();
        token.cancel();

        let Submitted::Ready(completed) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), Some(&token))
        else {
            panic!("expected an immediate result");
        };
        assert!(matches!(
            completed.result,
            Err(DivertError::Canceled(CancelReason::Token))
        ));
        assert_eq!(completed.buffers.packet.len(), 2000);
        assert_eq!(driver.count(|call| matches!(call, Call::Receive)), 0);
    }

    #[test]
    fn test_inline_completion_releases_slot() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::packet(vec![0x45; 40], vec![Address::new(1, 0)]));

        let engine = engine(&handle, Direction::Receive);
        let Submitted::Ready(completed) = Arc::clone(&engine).submit(receive_buffers(), None) else {
            panic!("expected an immediate result");
        };
        assert_eq!(
            completed.result.unwrap(),
            Transfer {
                bytes: 40,
                addresses: 1
            }
        );
        assert_eq!(completed.buffers.packet[..40], [0x45; 40]);
        assert!(!engine.slot.is_armed());
    }

    #[test]
    fn test_inline_failure_is_native_error() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Fail(ERROR_INSUFFICIENT_BUFFER));

        let Submitted::Ready(completed) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), None)
        else {
            panic!("expected an immediate result");
        };
        assert_eq!(
            completed.result.unwrap_err().native_code(),
            Some(ERROR_INSUFFICIENT_BUFFER)
        );
        assert_eq!(completed.buffers.packet.len(), 2000);
    }

    #[tokio::test]
    async fn test_pending_receive_completes_from_worker() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);

        let Submitted::Pending(completion) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), None)
        else {
            panic!("expected a pending operation");
        };
        assert!(driver.deliver(&[1, 2, 3], &[Address::new(4, 0)]));

        let completed = wait(completion).await;
        assert_eq!(
            completed.result.unwrap(),
            Transfer {
                bytes: 3,
                addresses: 1
            }
        );
        assert_eq!(completed.buffers.packet[..3], [1, 2, 3]);
        assert_eq!(
            completed.buffers.addresses[0].network_data().unwrap().interface_index,
            4
        );
    }

    #[tokio::test]
    async fn test_no_data_is_empty_success() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);

        let Submitted::Pending(completion) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), None)
        else {
            panic!("expected a pending operation");
        };
        assert!(driver.complete_next(ERROR_NO_DATA));
        let completed = wait(completion).await;
        assert_eq!(completed.result.unwrap(), Transfer::default());
    }

    #[tokio::test]
    async fn test_cancel_after_pending_interrupts_once() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);
        let token = CancellationToken::new();

        let Submitted::Pending(completion) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), Some(&token))
        else {
            panic!("expected a pending operation");
        };
        token.cancel();
        completion.request_cancel();
        completion.request_cancel();

        let completed = wait(completion).await;
        assert!(matches!(
            completed.result,
            Err(DivertError::Canceled(CancelReason::Token))
        ));
        assert_eq!(driver.count(|call| matches!(call, Call::Cancel)), 1);
    }

    #[tokio::test]
    async fn test_dropped_completion_recycles_after_driver_finishes() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);

        let engine = engine(&handle, Direction::Receive);
        let Submitted::Pending(completion) = Arc::clone(&engine).submit(receive_buffers(), None)
        else {
            panic!("expected a pending operation");
        };
        drop(completion);
        assert_eq!(driver.count(|call| matches!(call, Call::Cancel)), 1);

        // The mock aborts on cancel from a worker thread; without a pool the
        // engine is disposed once that completion lands.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.is_retired() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("engine never recycled");
        assert!(!engine.slot.is_armed());
    }

    #[tokio::test]
    async fn test_drop_after_request_interrupts_once() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);

        let Submitted::Pending(completion) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), None)
        else {
            panic!("expected a pending operation");
        };
        completion.request_cancel();
        drop(completion);
        assert_eq!(driver.count(|call| matches!(call, Call::Cancel)), 1);
    }

    #[tokio::test]
    async fn test_completion_before_arm_is_not_interrupted() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Raced(vec![7; 12], vec![Address::new(2, 0)]));

        let Submitted::Pending(completion) =
            engine(&handle, Direction::Receive).submit(receive_buffers(), None)
        else {
            panic!("expected a pending operation");
        };
        completion.request_cancel();

        let completed = wait(completion).await;
        assert_eq!(
            completed.result.unwrap(),
            Transfer {
                bytes: 12,
                addresses: 1
            }
        );
        assert_eq!(driver.count(|call| matches!(call, Call::Cancel)), 0);
    }

    #[tokio::test]
    async fn test_abort_interrupts_in_flight_operation() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);

        let engine = engine(&handle, Direction::Receive);
        let Submitted::Pending(completion) = Arc::clone(&engine).submit(receive_buffers(), None)
        else {
            panic!("expected a pending operation");
        };
        engine.abort();
        engine.abort();

        let completed = wait(completion).await;
        assert!(matches!(
            completed.result,
            Err(DivertError::Canceled(CancelReason::Disposed))
        ));
        assert_eq!(driver.count(|call| matches!(call, Call::Cancel)), 1);
    }

    #[tokio::test]
    async fn test_send_reports_address_count() {
        let driver = MockDriver::new();
        let handle = open(&driver);
        driver.script(Reply::Pend);

        let buffers = Buffers::new(vec![0x45; 28], vec![Address::new(1, 1); 1]);
        let Submitted::Pending(completion) = engine(&handle, Direction::Send).submit(buffers, None)
        else {
            panic!("expected a pending operation");
        };
        assert!(driver.complete_next(ERROR_SUCCESS));
        let completed = wait(completion).await;
        assert_eq!(
            completed.result.unwrap(),
            Transfer {
                bytes: 28,
                addresses: 1
            }
        );
    }
}
