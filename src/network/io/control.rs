//! Device-control round trips for handle parameters and shutdown.
//!
//! A handle bound to the completion mechanism cannot use the driver's own
//! synchronous parameter calls, so every request here carries its own
//! descriptor and the calling thread blocks until it completes.

use crate::error::{DivertError, Result};
use crate::network::core::handle::DivertHandle;
use crate::network::types::{Param, Shutdown};
use crate::sys::{Driver, NativeOverlapped, Submission, ERROR_OPERATION_ABORTED, ERROR_SUCCESS};
use log::trace;
use std::sync::mpsc::{sync_channel, SyncSender};

const FILE_DEVICE_NETWORK: u32 = 0x12;
const METHOD_IN_DIRECT: u32 = 1;
const METHOD_OUT_DIRECT: u32 = 2;
const FILE_READ_DATA: u32 = 1;
const FILE_WRITE_DATA: u32 = 2;

const fn ctl_code(function: u32, method: u32, access: u32) -> u32 {
    (FILE_DEVICE_NETWORK << 16) | (access << 14) | (function << 2) | method
}

pub const IOCTL_SET_PARAM: u32 = ctl_code(0x925, METHOD_IN_DIRECT, FILE_READ_DATA | FILE_WRITE_DATA);
pub const IOCTL_GET_PARAM: u32 = ctl_code(0x926, METHOD_OUT_DIRECT, FILE_READ_DATA);
pub const IOCTL_SHUTDOWN: u32 = ctl_code(0x927, METHOD_IN_DIRECT, FILE_READ_DATA | FILE_WRITE_DATA);

/// One device-control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    GetParam(Param),
    SetParam(Param, u64),
    Shutdown(Shutdown),
}

impl ControlRequest {
    pub fn code(&self) -> u32 {
        match self {
            Self::GetParam(_) => IOCTL_GET_PARAM,
            Self::SetParam(..) => IOCTL_SET_PARAM,
            Self::Shutdown(_) => IOCTL_SHUTDOWN,
        }
    }

    /// Encodes the request in the driver's 16-byte layout.
    pub fn encode(&self) -> [u8; 16] {
        let mut request = [0u8; 16];
        match *self {
            Self::GetParam(param) => request[0..4].copy_from_slice(&(param as u32).to_le_bytes()),
            Self::SetParam(param, value) => {
                request[0..8].copy_from_slice(&value.to_le_bytes());
                request[8..12].copy_from_slice(&(param as u32).to_le_bytes());
            }
            Self::Shutdown(how) => request[0..4].copy_from_slice(&(how as u32).to_le_bytes()),
        }
        request
    }

    /// Decodes a request, the inverse of [`encode`](Self::encode).
    pub fn decode(code: u32, request: &[u8; 16]) -> Option<Self> {
        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&request[range]);
            u32::from_le_bytes(bytes)
        };
        match code {
            IOCTL_GET_PARAM => Param::from_raw(word(0..4)).map(Self::GetParam),
            IOCTL_SET_PARAM => {
                let mut value = [0u8; 8];
                value.copy_from_slice(&request[0..8]);
                Param::from_raw(word(8..12)).map(|param| Self::SetParam(param, u64::from_le_bytes(value)))
            }
            IOCTL_SHUTDOWN => match word(0..4) {
                1 => Some(Self::Shutdown(Shutdown::Receive)),
                2 => Some(Self::Shutdown(Shutdown::Send)),
                3 => Some(Self::Shutdown(Shutdown::Both)),
                _ => None,
            },
            _ => None,
        }
    }

    fn has_output(&self) -> bool {
        !matches!(self, Self::Shutdown(_))
    }
}

unsafe fn signal(state: *const (), status: u32, _bytes: u32) {
    let sender = Box::from_raw(state.cast::<SyncSender<u32>>().cast_mut());
    let _ = sender.send(status);
}

/// Runs `request` on `handle` and waits for it to finish.
///
/// Returns the 64-bit output word, or 0 for requests without one.
pub fn round_trip<D: Driver>(handle: &DivertHandle<D>, request: ControlRequest) -> Result<u64> {
    let guard = handle.acquire()?;
    let (sender, receiver) = sync_channel::<u32>(1);
    let mut output = 0u64;
    let state = Box::into_raw(Box::new(sender));
    let mut overlapped = NativeOverlapped::new(signal, state.cast_const().cast());
    let encoded = request.encode();
    let output_ptr = if request.has_output() {
        &mut output as *mut u64
    } else {
        std::ptr::null_mut()
    };

    trace!("Device control {:?}", request);
    // SAFETY: everything the driver may touch lives on this frame, and the
    // frame outlives the request because we block on its completion below.
    let submission = unsafe {
        guard
            .driver()
            .control(guard.raw(), request.code(), &encoded, output_ptr, &mut overlapped)
    };
    let status = match submission {
        // The routine owns the sender and runs exactly once, so the
        // channel cannot disconnect before it reports.
        Submission::Pending => receiver.recv().unwrap_or(ERROR_OPERATION_ABORTED),
        finished => {
            // SAFETY: the routine will not run; reclaim the sender given to it.
            drop(unsafe { Box::from_raw(state) });
            match finished {
                Submission::Failed(code) => code,
                _ => ERROR_SUCCESS,
            }
        }
    };
    drop(guard);

    if status == ERROR_SUCCESS {
        Ok(output)
    } else {
        Err(DivertError::native(status))
    }
}
