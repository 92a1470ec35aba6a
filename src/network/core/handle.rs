//! Driver handle ownership.
//!
//! A [`DivertHandle`] wraps one raw driver registration. In-flight native
//! calls take a [`HandleRef`] so the raw value cannot be closed underneath
//! them; the handle is closed exactly once, by whichever of `release` or the
//! last outstanding reference comes second.

use crate::error::{DivertError, InvalidState, Result};
use crate::network::types::param::validate_priority;
use crate::network::types::{Layer, OpenFlags};
use crate::sys::{Driver, RawHandle};
use log::{debug, error, info, warn};
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default priority for new handles.
pub const DEFAULT_PRIORITY: i16 = 0;

const RELEASED: usize = 0b01;
const CLOSED: usize = 0b10;
const REFERENCE: usize = 0b100;

/// Configuration for opening a driver handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleConfig {
    /// Layer the handle observes
    pub layer: Layer,
    /// Priority for the handle (higher = earlier interception)
    pub priority: i16,
    /// Open flags
    pub flags: OpenFlags,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            layer: Layer::Network,
            priority: DEFAULT_PRIORITY,
            flags: OpenFlags::empty(),
        }
    }
}

impl HandleConfig {
    /// Creates a configuration for the given layer.
    pub fn with_layer(layer: Layer) -> Self {
        Self {
            layer,
            ..Default::default()
        }
    }

    /// Sets the priority for the handle.
    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// One driver registration, shared by the service and its engines.
pub struct DivertHandle<D: Driver> {
    driver: D,
    raw: RawHandle,
    owned: bool,
    state: AtomicUsize,
    bound: AtomicBool,
}

/// Keeps the raw handle open for the duration of one native call.
pub struct HandleRef<'a, D: Driver> {
    handle: &'a DivertHandle<D>,
}

impl<D: Driver> DivertHandle<D> {
    /// Opens a handle for `filter`, which may be text or a compiled object.
    ///
    /// # Arguments
    ///
    /// * `driver` - The driver to open the handle on
    /// * `filter` - Filter text or compiled filter object
    /// * `config` - Layer, priority and flags
    ///
    /// # Returns
    ///
    /// * `Ok(DivertHandle)` - An owned handle, closed when released
    /// * `Err(DivertError)` - `ArgumentInvalid` for an out-of-range priority,
    ///   `Native` if the driver refused the handle
    pub fn open(driver: D, filter: &CStr, config: HandleConfig) -> Result<Self> {
        validate_priority(config.priority)?;
        let raw = driver
            .open(filter, config.layer, config.priority, config.flags)
            .map_err(|code| {
                warn!("Driver refused to open handle: error {}", code);
                DivertError::native(code)
            })?;
        info!(
            "Opened handle {:#x} on {:?} layer (priority {}, {:?})",
            raw, config.layer, config.priority, config.flags
        );
        Ok(Self::new(driver, raw, true))
    }

    /// Wraps a handle opened elsewhere. It is never closed by this crate.
    pub fn adopt(driver: D, raw: RawHandle) -> Self {
        debug!("Adopted external handle {:#x}", raw);
        Self::new(driver, raw, false)
    }

    fn new(driver: D, raw: RawHandle, owned: bool) -> Self {
        Self {
            driver,
            raw,
            owned,
            state: AtomicUsize::new(0),
            bound: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Whether `release` has been called.
    pub fn is_released(&self) -> bool {
        self.state.load(Ordering::Acquire) & RELEASED != 0
    }

    /// Keeps the handle open until the returned reference is dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState::Closed` once the handle has been released.
    pub fn acquire(&self) -> Result<HandleRef<'_, D>> {
        let previous = self.state.fetch_add(REFERENCE, Ordering::AcqRel);
        if previous & RELEASED != 0 {
            self.unreference();
            return Err(InvalidState::Closed.into());
        }
        Ok(HandleRef { handle: self })
    }

    /// Routes completions for this handle to the completion descriptors.
    pub fn bind(&self) -> Result<()> {
        let _guard = self.acquire()?;
        self.driver.bind(self.raw).map_err(DivertError::native)?;
        self.bound.store(true, Ordering::Release);
        debug!("Bound handle {:#x} to the completion mechanism", self.raw);
        Ok(())
    }

    /// Releases the completion binding. Safe to call more than once.
    pub fn unbind(&self) {
        if self.bound.swap(false, Ordering::AcqRel) {
            self.driver.unbind(self.raw);
            debug!("Released completion binding of handle {:#x}", self.raw);
        }
    }

    /// Marks the handle released. It closes as soon as no native call uses it.
    pub fn release(&self) {
        let previous = self.state.fetch_or(RELEASED, Ordering::AcqRel);
        if previous & RELEASED == 0 {
            self.try_close();
        }
    }

    fn unreference(&self) {
        let previous = self.state.fetch_sub(REFERENCE, Ordering::AcqRel);
        if previous & RELEASED != 0 {
            self.try_close();
        }
    }

    /// Closes the handle if it is released, unreferenced and not yet closed.
    fn try_close(&self) {
        if self
            .state
            .compare_exchange(RELEASED, RELEASED | CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if !self.owned {
            debug!("Leaving external handle {:#x} open", self.raw);
            return;
        }
        match self.driver.close(self.raw) {
            Ok(()) => info!("Closed handle {:#x}", self.raw),
            Err(code) => error!("Failed to close handle {:#x}: error {}", self.raw, code),
        }
    }
}

impl<D: Driver> HandleRef<'_, D> {
    pub fn raw(&self) -> RawHandle {
        self.handle.raw
    }

    pub fn driver(&self) -> &D {
        &self.handle.driver
    }
}

impl<D: Driver> Drop for HandleRef<'_, D> {
    fn drop(&mut self) {
        self.handle.unreference();
    }
}

impl<D: Driver> Drop for DivertHandle<D> {
    fn drop(&mut self) {
        self.unbind();
        self.release();
    }
}
