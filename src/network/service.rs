//! The service façade.
//!
//! A [`DivertService`] owns one driver handle, binds it to the completion
//! mechanism and hands out receives and sends through two per-direction
//! operation pools.
//!
//! ```rust,ignore
//! use divert::prelude::*;
//! use divert::sys::windows::WinDivert;
//!
//! let filter = Field::UDP & Field::LOOPBACK & Field::REMOTE_PORT.equals(9999);
//! let service = DivertService::open(WinDivert, &filter, HandleConfig::default())?;
//! let token = CancellationToken::new();
//! let (result, buffers) = service
//!     .receive(vec![0; 2000], vec![Address::default()], &token)
//!     .await;
//! ```

use crate::error::{CancelReason, DivertError, InvalidState, Result};
use crate::network::core::address::Address;
use crate::network::core::handle::{DivertHandle, HandleConfig};
use crate::network::filter::Filter;
use crate::network::helper::compile_filter;
use crate::network::io::control::{round_trip, ControlRequest};
use crate::network::io::engine::{Completed, Direction, Submitted};
use crate::network::io::pool::OperationPool;
use crate::network::io::slot::Buffers;
use crate::network::types::param::{
    validate_priority, validate_queue_length, validate_queue_size, validate_queue_time,
};
use crate::network::types::{Param, Shutdown, Version, MAX_BATCH_SIZE};
use crate::settings::{QueueOptions, ServiceOptions};
use crate::sys::{CompiledFilter, Driver, RawHandle};
use log::{info, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of an operation together with the buffers that were moved into it.
pub type BufResult<T> = (Result<T>, Buffers);

/// Sizes written by one successful receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveResult {
    /// Bytes written to the packet buffer
    pub data_length: usize,
    /// Address records written to the address buffer
    pub address_length: usize,
}

pub struct DivertService<D: Driver> {
    handle: Arc<DivertHandle<D>>,
    receive_pool: Arc<OperationPool<D>>,
    send_pool: Arc<OperationPool<D>>,
    disposed: AtomicBool,
}

impl<D: Driver> DivertService<D> {
    /// Compiles `filter` in-process and opens a handle with the result.
    ///
    /// # Errors
    ///
    /// * `ArgumentInvalid` - priority out of range
    /// * `FilterRejected` - the driver could not compile the filter
    /// * `Native` - the driver refused to open or bind the handle
    pub fn open(driver: D, filter: &Filter, config: HandleConfig) -> Result<Self> {
        validate_priority(config.priority)?;
        let compiled = compile_filter(&driver, filter, config.layer)?;
        Self::open_compiled(driver, &compiled, config)
    }

    /// Opens a handle with a filter compiled earlier.
    pub fn open_compiled(driver: D, filter: &CompiledFilter, config: HandleConfig) -> Result<Self> {
        let handle = DivertHandle::open(driver, filter.as_c_str(), config)?;
        Self::bind(handle)
    }

    /// Opens a handle from [`ServiceOptions`] and applies its queue settings.
    pub fn with_options(driver: D, filter: &Filter, options: &ServiceOptions) -> Result<Self> {
        options.validate()?;
        let service = Self::open(driver, filter, options.handle_config())?;
        service.apply_queue(&options.queue)?;
        Ok(service)
    }

    /// Drives a handle opened elsewhere. The service never closes it.
    pub fn from_handle(driver: D, raw: RawHandle) -> Result<Self> {
        Self::bind(DivertHandle::adopt(driver, raw))
    }

    fn bind(handle: DivertHandle<D>) -> Result<Self> {
        handle.bind()?;
        let handle = Arc::new(handle);
        Ok(Self {
            receive_pool: OperationPool::new(Direction::Receive, Arc::clone(&handle)),
            send_pool: OperationPool::new(Direction::Send, Arc::clone(&handle)),
            handle,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn raw_handle(&self) -> RawHandle {
        self.handle.raw()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(InvalidState::Disposed.into());
        }
        Ok(())
    }

    /// Receives packets into `packet` and their metadata into `addresses`.
    ///
    /// Both buffers come back with the result, filled on success.
    pub async fn receive(
        &self,
        packet: Vec<u8>,
        addresses: Vec<Address>,
        token: &CancellationToken,
    ) -> BufResult<ReceiveResult> {
        let Completed { result, buffers } = self
            .submit(Direction::Receive, Buffers::new(packet, addresses), token)
            .await;
        let result = result.map(|transfer| ReceiveResult {
            data_length: transfer.bytes,
            address_length: transfer.addresses,
        });
        (result, buffers)
    }

    /// Injects the packets in `packet`, one address record per packet.
    ///
    /// Returns the number of bytes the driver accepted.
    pub async fn send(
        &self,
        packet: Vec<u8>,
        addresses: Vec<Address>,
        token: &CancellationToken,
    ) -> BufResult<usize> {
        let buffers = Buffers::new(packet, addresses);
        if buffers.addresses.is_empty() {
            let error = DivertError::invalid_argument("addresses", "at least one address is required");
            return (Err(error), buffers);
        }
        let Completed { result, buffers } = self.submit(Direction::Send, buffers, token).await;
        (result.map(|transfer| transfer.bytes), buffers)
    }

    async fn submit(&self, direction: Direction, buffers: Buffers, token: &CancellationToken) -> Completed {
        if let Err(error) = self.ensure_open() {
            return Completed::failed(error, buffers);
        }
        if token.is_cancelled() {
            trace!("{:?} canceled before reaching the pool", direction);
            return Completed::failed(DivertError::Canceled(CancelReason::Token), buffers);
        }
        if buffers.addresses.len() > MAX_BATCH_SIZE {
            let reason = format!(
                "{} addresses exceed the batch limit of {}",
                buffers.addresses.len(),
                MAX_BATCH_SIZE
            );
            return Completed::failed(DivertError::invalid_argument("addresses", reason), buffers);
        }

        let pool = match direction {
            Direction::Receive => &self.receive_pool,
            Direction::Send => &self.send_pool,
        };
        match pool.acquire().submit(buffers, Some(token)) {
            Submitted::Ready(completed) => completed,
            Submitted::Pending(mut completion) => {
                tokio::select! {
                    biased;
                    completed = &mut completion => completed,
                    _ = token.cancelled() => {
                        completion.request_cancel();
                        completion.await
                    }
                }
            }
        }
    }

    fn get_param(&self, param: Param) -> Result<u64> {
        self.ensure_open()?;
        round_trip(&self.handle, ControlRequest::GetParam(param))
    }

    fn set_param(&self, param: Param, value: u64) -> Result<()> {
        self.ensure_open()?;
        round_trip(&self.handle, ControlRequest::SetParam(param, value))?;
        info!("Set {:?} to {} on handle {:#x}", param, value, self.handle.raw());
        Ok(())
    }

    /// Version of the driver serving this handle.
    pub fn version(&self) -> Result<Version> {
        let major = self.get_param(Param::VersionMajor)?;
        let minor = self.get_param(Param::VersionMinor)?;
        Ok(Version {
            major: u32::try_from(major).unwrap_or(u32::MAX),
            minor: u32::try_from(minor).unwrap_or(u32::MAX),
        })
    }

    pub fn queue_length(&self) -> Result<u32> {
        Ok(u32::try_from(self.get_param(Param::QueueLength)?).unwrap_or(u32::MAX))
    }

    pub fn set_queue_length(&self, length: u32) -> Result<()> {
        let length = validate_queue_length(length)?;
        self.set_param(Param::QueueLength, u64::from(length))
    }

    pub fn queue_time(&self) -> Result<Duration> {
        Ok(Duration::from_millis(self.get_param(Param::QueueTime)?))
    }

    pub fn set_queue_time(&self, time: Duration) -> Result<()> {
        let millis = validate_queue_time(time)?;
        self.set_param(Param::QueueTime, millis)
    }

    pub fn queue_size(&self) -> Result<u32> {
        Ok(u32::try_from(self.get_param(Param::QueueSize)?).unwrap_or(u32::MAX))
    }

    pub fn set_queue_size(&self, size: u32) -> Result<()> {
        let size = validate_queue_size(size)?;
        self.set_param(Param::QueueSize, u64::from(size))
    }

    /// Applies every queue setting present in `queue`.
    pub fn apply_queue(&self, queue: &QueueOptions) -> Result<()> {
        queue.validate()?;
        if let Some(length) = queue.length {
            self.set_queue_length(length)?;
        }
        if let Some(time) = queue.time() {
            self.set_queue_time(time)?;
        }
        if let Some(size) = queue.size {
            self.set_queue_size(size)?;
        }
        Ok(())
    }

    /// Stops receiving, sending or both. Pending receives finish once the
    /// driver's queue drains.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.ensure_open()?;
        round_trip(&self.handle, ControlRequest::Shutdown(how))?;
        info!("Shut down {:?} on handle {:#x}", how, self.handle.raw());
        Ok(())
    }

    /// Closes both pools, releases the completion binding, then the handle.
    ///
    /// Closing a pool interrupts its operations still in flight, so they end
    /// with `Canceled(Disposed)` even on an adopted handle that is left open.
    /// Calling this again does nothing.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "Disposing service on handle {:#x} ({} receive / {} send engines)",
            self.handle.raw(),
            self.receive_pool.created(),
            self.send_pool.created()
        );
        self.receive_pool.close();
        self.send_pool.close();
        self.handle.unbind();
        self.handle.release();
    }
}

impl<D: Driver> Drop for DivertService<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
