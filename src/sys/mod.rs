//! Native seam.
//!
//! Everything above this module talks to the driver through the [`Driver`]
//! trait. The Windows implementation lives in [`windows`]; tests use an
//! in-process mock that completes I/O from its own worker threads.

#[cfg(windows)]
pub mod windows;

#[cfg(test)]
pub(crate) mod mock;

use crate::network::core::address::Address;
use crate::network::types::{ChecksumFlags, Layer, OpenFlags};
use std::ffi::{CStr, CString};

/// Raw driver handle value.
pub type RawHandle = isize;

pub const ERROR_SUCCESS: u32 = 0;
pub const ERROR_INVALID_HANDLE: u32 = 6;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INSUFFICIENT_BUFFER: u32 = 122;
pub const ERROR_NO_DATA: u32 = 232;
pub const ERROR_OPERATION_ABORTED: u32 = 995;
pub const ERROR_IO_PENDING: u32 = 997;

/// Platform overlapped header. Only its address matters to this crate.
#[cfg(windows)]
pub type RawOverlapped = ::windows::Win32::System::IO::OVERLAPPED;

#[cfg(not(windows))]
#[repr(C)]
#[derive(Debug, Default)]
pub struct RawOverlapped {
    internal: usize,
    internal_high: usize,
    offset: u64,
    event: isize,
}

/// Called exactly once when a pending operation finishes.
///
/// Arguments are the opaque state pointer, the status code and the number of
/// bytes transferred.
pub type CompletionRoutine = unsafe fn(state: *const (), status: u32, bytes: u32);

/// Completion descriptor handed to the driver with every asynchronous call.
///
/// The platform header comes first so a pointer to the header is also a
/// pointer to the descriptor.
#[repr(C)]
pub struct NativeOverlapped {
    raw: RawOverlapped,
    routine: Option<CompletionRoutine>,
    state: *const (),
}

impl NativeOverlapped {
    pub fn new(routine: CompletionRoutine, state: *const ()) -> Self {
        Self {
            // SAFETY: the platform header is plain old data
            raw: unsafe { std::mem::zeroed() },
            routine: Some(routine),
            state,
        }
    }

    /// Clears the platform header and installs a new routine and state.
    pub fn prepare(&mut self, routine: CompletionRoutine, state: *const ()) {
        *self = Self::new(routine, state);
    }

    pub fn state(&self) -> *const () {
        self.state
    }

    /// Runs the completion routine installed in `overlapped`.
    ///
    /// # Safety
    ///
    /// `overlapped` must point to a live descriptor whose operation was
    /// reported as [`Submission::Pending`], and this must be called at most
    /// once per such submission.
    pub unsafe fn complete(overlapped: *mut NativeOverlapped, status: u32, bytes: u32) {
        let (routine, state) = ((*overlapped).routine, (*overlapped).state);
        if let Some(routine) = routine {
            routine(state, status, bytes);
        }
    }
}

/// Immediate outcome of an asynchronous native call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Finished inline. The completion routine will not run.
    Completed(u32),
    /// Finishes later. The completion routine runs exactly once.
    Pending,
    /// Failed inline. The completion routine will not run.
    Failed(u32),
}

/// Compile-time failure reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRejection {
    pub message: String,
    pub position: usize,
}

/// A filter in the driver's compact object form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompiledFilter(CString);

impl CompiledFilter {
    pub fn new(object: CString) -> Self {
        Self(object)
    }

    pub fn as_c_str(&self) -> &CStr {
        &self.0
    }
}

/// Entry points of the packet interception driver.
///
/// Methods returning `Result<_, u32>` report failures as raw status codes.
pub trait Driver: Send + Sync + 'static {
    /// Opens a handle for a textual or compiled filter.
    fn open(
        &self,
        filter: &CStr,
        layer: Layer,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<RawHandle, u32>;

    /// Routes completions for `handle` to [`NativeOverlapped::complete`].
    fn bind(&self, handle: RawHandle) -> Result<(), u32>;

    /// Stops routing completions for `handle`.
    ///
    /// Operations already in flight still complete through
    /// [`NativeOverlapped::complete`] after this returns.
    fn unbind(&self, handle: RawHandle);

    /// Starts receiving packets into `buffer` and their metadata into `addresses`.
    ///
    /// # Safety
    ///
    /// All pointers must stay valid until the call returns something other
    /// than [`Submission::Pending`] or the completion routine has run.
    /// `addresses_len` holds the address buffer size in bytes on entry and
    /// the number of bytes written on completion.
    unsafe fn receive(
        &self,
        handle: RawHandle,
        buffer: *mut u8,
        len: u32,
        addresses: *mut Address,
        addresses_len: *mut u32,
        overlapped: *mut NativeOverlapped,
    ) -> Submission;

    /// Starts injecting the packets in `buffer`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Driver::receive`]. `addresses_len` is in bytes.
    unsafe fn send(
        &self,
        handle: RawHandle,
        buffer: *const u8,
        len: u32,
        addresses: *const Address,
        addresses_len: u32,
        overlapped: *mut NativeOverlapped,
    ) -> Submission;

    /// Issues a raw device-control request.
    ///
    /// # Safety
    ///
    /// `output` may be null. Otherwise it and `overlapped` must stay valid
    /// until the request finishes.
    unsafe fn control(
        &self,
        handle: RawHandle,
        code: u32,
        request: &[u8; 16],
        output: *mut u64,
        overlapped: *mut NativeOverlapped,
    ) -> Submission;

    /// Interrupts the operation using `overlapped`. A no-op if it already finished.
    fn cancel(&self, handle: RawHandle, overlapped: *mut NativeOverlapped);

    /// Closes the handle, aborting everything still pending on it.
    fn close(&self, handle: RawHandle) -> Result<(), u32>;

    fn compile_filter(&self, filter: &CStr, layer: Layer) -> Result<CompiledFilter, FilterRejection>;

    /// Evaluates a textual or compiled filter against one packet.
    fn evaluate_filter(&self, filter: &CStr, packet: &[u8], address: &Address) -> Result<bool, u32>;

    /// Renders a compiled filter back to text.
    fn format_filter(&self, filter: &CompiledFilter, layer: Layer) -> Result<String, u32>;

    /// Recomputes the checksums `flags` does not exclude, in place. When
    /// `address` is given its checksum-valid bits are updated to match.
    ///
    /// Returns `false` if the packet could not be parsed.
    fn calculate_checksums(
        &self,
        packet: &mut [u8],
        address: Option<&mut Address>,
        flags: ChecksumFlags,
    ) -> bool;

    /// Decrements the IPv4 TTL or IPv6 hop limit and patches the header
    /// checksum. Returns `false` if the packet is unparseable or the value
    /// would reach zero.
    fn decrement_ttl(&self, packet: &mut [u8]) -> bool;
}
