//! WinDivert backend.
//!
//! Completions are routed through the system thread pool with
//! `BindIoCompletionCallback`. Handles are switched to skip completion
//! packets for calls that finish inline, so every submission produces
//! exactly one result: either the immediate return or one callback.

use super::{
    CompiledFilter, Driver, FilterRejection, NativeOverlapped, RawHandle, Submission,
    ERROR_INVALID_PARAMETER, ERROR_IO_PENDING, ERROR_SUCCESS,
};
use crate::network::core::address::Address;
use crate::network::types::{ChecksumFlags, Layer, OpenFlags};
use log::{debug, trace, warn};
use std::ffi::{c_char, c_void, CStr, CString};
use windivert_sys::{
    WinDivertClose, WinDivertHelperCalcChecksums, WinDivertHelperCompileFilter,
    WinDivertHelperDecrementTTL, WinDivertHelperEvalFilter, WinDivertHelperFormatFilter,
    WinDivertLayer, WinDivertOpen, WinDivertRecvEx, WinDivertSendEx,
};
use windows::Win32::Foundation::{GetLastError, HANDLE};
use windows::Win32::Storage::FileSystem::SetFileCompletionNotificationModes;
use windows::Win32::System::Threading::BindIoCompletionCallback;
use windows::Win32::System::IO::{CancelIoEx, DeviceIoControl, OVERLAPPED};

const INVALID_HANDLE_VALUE: RawHandle = -1;
const FILE_SKIP_COMPLETION_PORT_ON_SUCCESS: u8 = 1;
/// Size of the compiled object buffer, matching the driver's own limit.
const FILTER_OBJECT_MAX: usize = 8192;
const FORMAT_BUFFER_MAX: usize = 16384;

unsafe extern "system" fn on_io_complete(status: u32, bytes: u32, overlapped: *mut OVERLAPPED) {
    NativeOverlapped::complete(overlapped.cast(), status, bytes);
}

fn last_error() -> u32 {
    // SAFETY: reads thread-local state only.
    unsafe { GetLastError() }.0
}

fn win32_code(error: windows::core::Error) -> u32 {
    (error.code().0 & 0xFFFF) as u32
}

fn handle(raw: RawHandle) -> HANDLE {
    HANDLE(raw as *mut c_void)
}

/// Reinterprets a value as the binding's newtype of the same layout.
///
/// The sys crate wraps handles and flag words in its own transparent types.
fn native<T: Copy, U>(value: T) -> U {
    const { assert!(std::mem::size_of::<T>() == std::mem::size_of::<U>()) };
    // SAFETY: both types are plain words of the same size.
    unsafe { std::mem::transmute_copy(&value) }
}

fn native_layer(layer: Layer) -> WinDivertLayer {
    match layer {
        Layer::Network => WinDivertLayer::Network,
        Layer::Forward => WinDivertLayer::Forward,
        Layer::Flow => WinDivertLayer::Flow,
        Layer::Socket => WinDivertLayer::Socket,
        Layer::Reflect => WinDivertLayer::Reflect,
    }
}

/// Maps a boolean native return to a submission, reading inline byte counts
/// from the descriptor header.
unsafe fn submission(success: bool, overlapped: *mut NativeOverlapped) -> Submission {
    if success {
        return Submission::Completed((*overlapped).raw.InternalHigh as u32);
    }
    match last_error() {
        ERROR_IO_PENDING => Submission::Pending,
        code => Submission::Failed(code),
    }
}

/// The installed WinDivert driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct WinDivert;

impl Driver for WinDivert {
    fn open(
        &self,
        filter: &CStr,
        layer: Layer,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<RawHandle, u32> {
        // SAFETY: the filter is NUL-terminated and outlives the call.
        let raw = unsafe {
            WinDivertOpen(
                filter.as_ptr(),
                native_layer(layer),
                priority,
                native(flags.bits()),
            )
        }
        .0 as RawHandle;
        if raw == INVALID_HANDLE_VALUE || raw == 0 {
            return Err(last_error());
        }
        Ok(raw)
    }

    fn bind(&self, raw: RawHandle) -> Result<(), u32> {
        // SAFETY: `raw` is an open driver handle.
        unsafe {
            BindIoCompletionCallback(handle(raw), Some(on_io_complete), 0).map_err(win32_code)?;
            SetFileCompletionNotificationModes(handle(raw), FILE_SKIP_COMPLETION_PORT_ON_SUCCESS)
                .map_err(win32_code)?;
        }
        debug!("Bound handle {:#x} to the completion thread pool", raw);
        Ok(())
    }

    /// The thread pool binding lives until the handle closes, so completions
    /// for operations still in flight keep arriving after this call.
    fn unbind(&self, raw: RawHandle) {
        trace!("Handle {:#x} stays bound until it closes", raw);
    }

    unsafe fn receive(
        &self,
        raw: RawHandle,
        buffer: *mut u8,
        len: u32,
        addresses: *mut Address,
        addresses_len: *mut u32,
        overlapped: *mut NativeOverlapped,
    ) -> Submission {
        let success = WinDivertRecvEx(
            native(raw),
            buffer.cast(),
            len,
            std::ptr::null_mut(),
            0,
            addresses.cast(),
            addresses_len,
            overlapped.cast(),
        )
        .as_bool();
        submission(success, overlapped)
    }

    unsafe fn send(
        &self,
        raw: RawHandle,
        buffer: *const u8,
        len: u32,
        addresses: *const Address,
        addresses_len: u32,
        overlapped: *mut NativeOverlapped,
    ) -> Submission {
        let success = WinDivertSendEx(
            native(raw),
            buffer.cast(),
            len,
            std::ptr::null_mut(),
            0,
            addresses.cast(),
            addresses_len,
            overlapped.cast(),
        )
        .as_bool();
        submission(success, overlapped)
    }

    unsafe fn control(
        &self,
        raw: RawHandle,
        code: u32,
        request: &[u8; 16],
        output: *mut u64,
        overlapped: *mut NativeOverlapped,
    ) -> Submission {
        let (output_ptr, output_len) = if output.is_null() {
            (None, 0)
        } else {
            (Some(output.cast::<c_void>()), std::mem::size_of::<u64>() as u32)
        };
        let result = DeviceIoControl(
            handle(raw),
            code,
            Some(request.as_ptr().cast()),
            request.len() as u32,
            output_ptr,
            output_len,
            None,
            Some(overlapped.cast()),
        );
        match result {
            Ok(()) => Submission::Completed((*overlapped).raw.InternalHigh as u32),
            Err(error) => match win32_code(error) {
                ERROR_IO_PENDING => Submission::Pending,
                code => Submission::Failed(code),
            },
        }
    }

    fn cancel(&self, raw: RawHandle, overlapped: *mut NativeOverlapped) {
        // SAFETY: the descriptor is only compared by address.
        if let Err(error) = unsafe { CancelIoEx(handle(raw), Some(overlapped.cast_const().cast())) } {
            // Not found means the operation already finished.
            trace!("CancelIoEx on {:#x}: {}", raw, error);
        }
    }

    fn close(&self, raw: RawHandle) -> Result<(), u32> {
        // SAFETY: the caller closes each handle once.
        if !unsafe { WinDivertClose(native(raw)) }.as_bool() {
            let code = last_error();
            warn!("Closing handle {:#x} failed with error {}", raw, code);
            return Err(code);
        }
        Ok(())
    }

    fn compile_filter(&self, filter: &CStr, layer: Layer) -> Result<CompiledFilter, FilterRejection> {
        let mut object = vec![0u8; FILTER_OBJECT_MAX];
        let mut error: *const c_char = std::ptr::null();
        let mut position = 0u32;
        // SAFETY: every buffer outlives the call and sizes match.
        let success = unsafe {
            WinDivertHelperCompileFilter(
                filter.as_ptr(),
                native_layer(layer),
                object.as_mut_ptr().cast(),
                object.len() as u32,
                &mut error,
                &mut position,
            )
        }
        .as_bool();
        if !success {
            let message = if error.is_null() {
                String::from("Filter expression rejected")
            } else {
                // SAFETY: the driver returns a static NUL-terminated message.
                unsafe { CStr::from_ptr(error) }.to_string_lossy().into_owned()
            };
            return Err(FilterRejection {
                message,
                position: position as usize,
            });
        }
        let end = object.iter().position(|&b| b == 0).unwrap_or(object.len());
        object.truncate(end);
        CString::new(object)
            .map(CompiledFilter::new)
            .map_err(|_| FilterRejection {
                message: String::from("Compiled filter is malformed"),
                position: 0,
            })
    }

    fn evaluate_filter(&self, filter: &CStr, packet: &[u8], address: &Address) -> Result<bool, u32> {
        // SAFETY: all inputs are borrowed for the duration of the call.
        let matched = unsafe {
            WinDivertHelperEvalFilter(
                filter.as_ptr(),
                packet.as_ptr().cast(),
                packet.len() as u32,
                (address as *const Address).cast(),
            )
        }
        .as_bool();
        if matched {
            return Ok(true);
        }
        match last_error() {
            ERROR_SUCCESS => Ok(false),
            code => Err(code),
        }
    }

    fn format_filter(&self, filter: &CompiledFilter, layer: Layer) -> Result<String, u32> {
        let mut buffer = vec![0u8; FORMAT_BUFFER_MAX];
        // SAFETY: the buffer outlives the call and its size is passed along.
        let success = unsafe {
            WinDivertHelperFormatFilter(
                filter.as_c_str().as_ptr(),
                native_layer(layer),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
            )
        }
        .as_bool();
        if !success {
            return Err(match last_error() {
                ERROR_SUCCESS => ERROR_INVALID_PARAMETER,
                code => code,
            });
        }
        let text = CStr::from_bytes_until_nul(&buffer).map_err(|_| ERROR_INVALID_PARAMETER)?;
        Ok(text.to_string_lossy().into_owned())
    }

    fn calculate_checksums(
        &self,
        packet: &mut [u8],
        address: Option<&mut Address>,
        flags: ChecksumFlags,
    ) -> bool {
        let address = address.map_or(std::ptr::null_mut(), |address| {
            (address as *mut Address).cast()
        });
        // SAFETY: the packet and address are borrowed for the duration of the call.
        unsafe {
            WinDivertHelperCalcChecksums(
                packet.as_mut_ptr().cast(),
                packet.len() as u32,
                address,
                native(flags.bits()),
            )
        }
        .as_bool()
    }

    fn decrement_ttl(&self, packet: &mut [u8]) -> bool {
        // SAFETY: the packet is borrowed for the duration of the call.
        unsafe { WinDivertHelperDecrementTTL(packet.as_mut_ptr().cast(), packet.len() as u32) }
            .as_bool()
    }
}
