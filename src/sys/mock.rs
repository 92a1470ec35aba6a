//! In-process driver used by the tests.
//!
//! Pending operations are parked until a test delivers data, completes them
//! or cancels them. Completions for parked operations always run on a
//! freshly spawned thread, like completions from a real driver worker.

use super::{
    CompiledFilter, Driver, FilterRejection, NativeOverlapped, RawHandle, Submission,
    ERROR_INSUFFICIENT_BUFFER, ERROR_NO_DATA, ERROR_OPERATION_ABORTED, ERROR_SUCCESS,
};
use crate::network::core::address::{Address, ADDRESS_SIZE};
use crate::network::io::control::ControlRequest;
use crate::network::types::{ChecksumFlags, Layer, OpenFlags, Param, Shutdown};
use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Message the mock compiler reports for rejected tokens.
pub const BAD_TOKEN: &str = "Filter expression contains a bad token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open {
        filter: String,
        layer: Layer,
        priority: i16,
        flags: OpenFlags,
    },
    Bind(RawHandle),
    Unbind(RawHandle),
    Receive,
    Send,
    Control(ControlRequest),
    Cancel,
    Close(RawHandle),
    Compile(String),
    Evaluate,
    Format,
    Checksums(ChecksumFlags),
    DecrementTtl,
}

/// Scripted answer for the next receive or send.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Finish inline. Receives copy the packet and addresses into the caller's buffers.
    Inline(Vec<u8>, Vec<Address>),
    /// Fail inline with a status code.
    Fail(u32),
    /// Park the operation until the test finishes it.
    Pend,
    /// Report pending, but complete from a worker before the call returns.
    Raced(Vec<u8>, Vec<Address>),
}

impl Reply {
    pub fn packet(packet: Vec<u8>, addresses: Vec<Address>) -> Self {
        Self::Inline(packet, addresses)
    }

    /// An inline send that takes every byte.
    pub fn accepted() -> Self {
        Self::Inline(Vec::new(), Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Receive,
    Send,
}

struct Parked {
    kind: Kind,
    overlapped: *mut NativeOverlapped,
    buffer: *mut u8,
    len: u32,
    addresses: *mut Address,
    addresses_capacity: u32,
    addresses_len: *mut u32,
}

// SAFETY: the pointers stay valid until the operation completes, which
// happens exactly once after the parked entry is removed.
unsafe impl Send for Parked {}

impl Parked {
    /// Copies a packet into the caller's buffers and returns the completion status and byte count.
    unsafe fn fill(&self, packet: &[u8], addresses: &[Address]) -> (u32, u32) {
        let copied = packet.len().min(self.len as usize);
        std::ptr::copy_nonoverlapping(packet.as_ptr(), self.buffer, copied);
        let capacity = self.addresses_capacity as usize / ADDRESS_SIZE;
        let count = addresses.len().min(capacity);
        std::ptr::copy_nonoverlapping(addresses.as_ptr(), self.addresses, count);
        if !self.addresses_len.is_null() {
            *self.addresses_len = (count * ADDRESS_SIZE) as u32;
        }
        let status = if copied < packet.len() {
            ERROR_INSUFFICIENT_BUFFER
        } else {
            ERROR_SUCCESS
        };
        (status, copied as u32)
    }

    fn finish(self, status: u32, bytes: u32) {
        let overlapped = SendPtr(self.overlapped);
        thread::spawn(move || {
            let overlapped = overlapped;
            // SAFETY: the descriptor was reported pending and is completed once.
            unsafe { NativeOverlapped::complete(overlapped.0, status, bytes) };
        });
    }
}

struct SendPtr(*mut NativeOverlapped);

// SAFETY: only dereferenced by the single completion thread.
unsafe impl Send for SendPtr {}

struct State {
    calls: Vec<Call>,
    script: VecDeque<Reply>,
    parked: VecDeque<Parked>,
    params: HashMap<u32, u64>,
    next_handle: RawHandle,
    open_error: Option<u32>,
    control_pending: bool,
    evaluation: Result<bool, u32>,
}

#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<State>>,
}

impl MockDriver {
    pub fn new() -> Self {
        let params = HashMap::from([
            (Param::QueueLength as u32, 4096),
            (Param::QueueTime as u32, 2000),
            (Param::QueueSize as u32, 4 * 1024 * 1024),
            (Param::VersionMajor as u32, 2),
            (Param::VersionMinor as u32, 2),
        ]);
        Self {
            state: Arc::new(Mutex::new(State {
                calls: Vec::new(),
                script: VecDeque::new(),
                parked: VecDeque::new(),
                params,
                next_handle: 0x100,
                open_error: None,
                control_pending: false,
                evaluation: Ok(true),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Queues the answer for the next receive or send.
    pub fn script(&self, reply: Reply) {
        self.lock().script.push_back(reply);
    }

    pub fn fail_open(&self, code: u32) {
        self.lock().open_error = Some(code);
    }

    /// Makes device-control requests complete from a worker thread.
    pub fn set_control_pending(&self, pending: bool) {
        self.lock().control_pending = pending;
    }

    pub fn set_evaluation(&self, evaluation: Result<bool, u32>) {
        self.lock().evaluation = evaluation;
    }

    pub fn parked(&self) -> usize {
        self.lock().parked.len()
    }

    /// Completes the oldest parked receive with a packet. Returns `false` if none is parked.
    pub fn deliver(&self, packet: &[u8], addresses: &[Address]) -> bool {
        let parked = {
            let mut state = self.lock();
            let Some(index) = state.parked.iter().position(|p| p.kind == Kind::Receive) else {
                return false;
            };
            state.parked.remove(index)
        };
        let Some(parked) = parked else {
            return false;
        };
        // SAFETY: the parked buffers stay valid until completion.
        let (status, bytes) = unsafe { parked.fill(packet, addresses) };
        parked.finish(status, bytes);
        true
    }

    /// Completes the oldest parked operation with `status`.
    pub fn complete_next(&self, status: u32) -> bool {
        let Some(parked) = self.lock().parked.pop_front() else {
            return false;
        };
        let bytes = match (parked.kind, status) {
            (Kind::Send, ERROR_SUCCESS) => parked.len,
            _ => 0,
        };
        parked.finish(status, bytes);
        true
    }

    fn next_reply(&self, kind: Kind) -> Reply {
        self.lock().script.pop_front().unwrap_or(match kind {
            Kind::Receive => Reply::Pend,
            Kind::Send => Reply::accepted(),
        })
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    fn submit(&self, parked: Parked) -> Submission {
        match self.next_reply(parked.kind) {
            Reply::Inline(packet, addresses) => match parked.kind {
                Kind::Receive => {
                    // SAFETY: the caller keeps the buffers alive for the call.
                    let (status, bytes) = unsafe { parked.fill(&packet, &addresses) };
                    if status == ERROR_SUCCESS {
                        Submission::Completed(bytes)
                    } else {
                        Submission::Failed(status)
                    }
                }
                Kind::Send => Submission::Completed(parked.len),
            },
            Reply::Fail(code) => Submission::Failed(code),
            Reply::Pend => {
                self.lock().parked.push_back(parked);
                Submission::Pending
            }
            Reply::Raced(packet, addresses) => {
                let (status, bytes) = match parked.kind {
                    // SAFETY: the caller keeps the buffers alive for the call.
                    Kind::Receive => unsafe { parked.fill(&packet, &addresses) },
                    Kind::Send => (ERROR_SUCCESS, parked.len),
                };
                let overlapped = SendPtr(parked.overlapped);
                let worker = thread::spawn(move || {
                    let overlapped = overlapped;
                    // SAFETY: the descriptor is reported pending and completed once.
                    unsafe { NativeOverlapped::complete(overlapped.0, status, bytes) };
                });
                let _ = worker.join();
                Submission::Pending
            }
        }
    }

    fn abort_where(&self, predicate: impl Fn(&Parked) -> bool, status: u32) {
        let aborted = {
            let mut state = self.lock();
            let (aborted, kept): (VecDeque<Parked>, VecDeque<Parked>) =
                state.parked.drain(..).partition(|p| predicate(p));
            state.parked = kept;
            aborted
        };
        for parked in aborted {
            parked.finish(status, 0);
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn open(
        &self,
        filter: &CStr,
        layer: Layer,
        priority: i16,
        flags: OpenFlags,
    ) -> Result<RawHandle, u32> {
        let mut state = self.lock();
        state.calls.push(Call::Open {
            filter: filter.to_string_lossy().into_owned(),
            layer,
            priority,
            flags,
        });
        if let Some(code) = state.open_error {
            return Err(code);
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        Ok(handle)
    }

    fn bind(&self, handle: RawHandle) -> Result<(), u32> {
        self.record(Call::Bind(handle));
        Ok(())
    }

    fn unbind(&self, handle: RawHandle) {
        self.record(Call::Unbind(handle));
    }

    unsafe fn receive(
        &self,
        _handle: RawHandle,
        buffer: *mut u8,
        len: u32,
        addresses: *mut Address,
        addresses_len: *mut u32,
        overlapped: *mut NativeOverlapped,
    ) -> Submission {
        self.record(Call::Receive);
        self.submit(Parked {
            kind: Kind::Receive,
            overlapped,
            buffer,
            len,
            addresses,
            addresses_capacity: *addresses_len,
            addresses_len,
        })
    }

    unsafe fn send(
        &self,
        _handle: RawHandle,
        buffer: *const u8,
        len: u32,
        addresses: *const Address,
        addresses_len: u32,
        overlapped: *mut NativeOverlapped,
    ) -> Submission {
        self.record(Call::Send);
        self.submit(Parked {
            kind: Kind::Send,
            overlapped,
            buffer: buffer.cast_mut(),
            len,
            addresses: addresses.cast_mut(),
            addresses_capacity: addresses_len,
            addresses_len: std::ptr::null_mut(),
        })
    }

    unsafe fn control(
        &self,
        _handle: RawHandle,
        code: u32,
        request: &[u8; 16],
        output: *mut u64,
        overlapped: *mut NativeOverlapped,
    ) -> Submission {
        let Some(request) = ControlRequest::decode(code, request) else {
            return Submission::Failed(super::ERROR_INVALID_PARAMETER);
        };
        let (value, pending) = {
            let mut state = self.lock();
            state.calls.push(Call::Control(request));
            let value = match request {
                ControlRequest::GetParam(param) => {
                    state.params.get(&(param as u32)).copied().unwrap_or(0)
                }
                ControlRequest::SetParam(param, value) => {
                    state.params.insert(param as u32, value);
                    0
                }
                ControlRequest::Shutdown(_) => 0,
            };
            (value, state.control_pending)
        };
        if let ControlRequest::Shutdown(Shutdown::Receive | Shutdown::Both) = request {
            self.abort_where(|p| p.kind == Kind::Receive, ERROR_NO_DATA);
        }
        if !output.is_null() {
            *output = value;
        }
        if pending {
            let overlapped = SendPtr(overlapped);
            thread::spawn(move || {
                let overlapped = overlapped;
                NativeOverlapped::complete(overlapped.0, ERROR_SUCCESS, 8);
            });
            Submission::Pending
        } else {
            Submission::Completed(8)
        }
    }

    fn cancel(&self, _handle: RawHandle, overlapped: *mut NativeOverlapped) {
        self.record(Call::Cancel);
        self.abort_where(|p| p.overlapped == overlapped, ERROR_OPERATION_ABORTED);
    }

    fn close(&self, handle: RawHandle) -> Result<(), u32> {
        self.record(Call::Close(handle));
        self.abort_where(|_| true, ERROR_OPERATION_ABORTED);
        Ok(())
    }

    fn compile_filter(&self, filter: &CStr, _layer: Layer) -> Result<CompiledFilter, FilterRejection> {
        let text = filter.to_string_lossy().into_owned();
        self.record(Call::Compile(text.clone()));
        if let Some(position) = text.find("invalid") {
            return Err(FilterRejection {
                message: BAD_TOKEN.to_string(),
                position,
            });
        }
        CString::new(format!("@{text}"))
            .map(CompiledFilter::new)
            .map_err(|_| FilterRejection {
                message: BAD_TOKEN.to_string(),
                position: 0,
            })
    }

    fn evaluate_filter(&self, _filter: &CStr, _packet: &[u8], _address: &Address) -> Result<bool, u32> {
        self.record(Call::Evaluate);
        self.lock().evaluation
    }

    fn format_filter(&self, filter: &CompiledFilter, _layer: Layer) -> Result<String, u32> {
        self.record(Call::Format);
        let text = filter.as_c_str().to_string_lossy();
        text.strip_prefix('@')
            .map(str::to_string)
            .ok_or(super::ERROR_INVALID_PARAMETER)
    }

    /// Only checks that the packet starts with an IP header and marks the
    /// requested checksums valid.
    fn calculate_checksums(
        &self,
        packet: &mut [u8],
        address: Option<&mut Address>,
        flags: ChecksumFlags,
    ) -> bool {
        self.record(Call::Checksums(flags));
        if ip_version(packet).is_none() {
            return false;
        }
        if let Some(address) = address {
            address.set_ip_checksum_valid(!flags.contains(ChecksumFlags::NO_IP));
            address.set_tcp_checksum_valid(!flags.contains(ChecksumFlags::NO_TCP));
            address.set_udp_checksum_valid(!flags.contains(ChecksumFlags::NO_UDP));
        }
        true
    }

    /// Decrements the TTL or hop limit byte without touching the checksum.
    fn decrement_ttl(&self, packet: &mut [u8]) -> bool {
        self.record(Call::DecrementTtl);
        let offset = match ip_version(packet) {
            Some(4) => 8,
            Some(_) => 7,
            None => return false,
        };
        match packet[offset] {
            0 | 1 => false,
            ttl => {
                packet[offset] = ttl - 1;
                true
            }
        }
    }
}

fn ip_version(packet: &[u8]) -> Option<u8> {
    match (packet.first().map(|byte| byte >> 4), packet.len()) {
        (Some(4), len) if len >= 20 => Some(4),
        (Some(6), len) if len >= 40 => Some(6),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    unsafe fn report_status(state: *const (), status: u32, _bytes: u32) {
        let sender = &*state.cast::<mpsc::Sender<u32>>();
        let _ = sender.send(status);
    }

    #[test]
    fn test_cancel_keeps_other_parked_operations() {
        let driver = MockDriver::new();
        let (sender, receiver) = mpsc::channel::<u32>();
        let state = (&sender as *const mpsc::Sender<u32>).cast::<()>();
        let mut first = Box::new(NativeOverlapped::new(report_status, state));
        let mut second = Box::new(NativeOverlapped::new(report_status, state));
        let mut buffer = [0u8; 64];
        let mut addresses = [Address::default(); 1];
        let mut first_len = ADDRESS_SIZE as u32;
        let mut second_len = ADDRESS_SIZE as u32;

        // SAFETY: every buffer outlives both completions, which are awaited below.
        unsafe {
            let submitted = driver.receive(
                1,
                buffer.as_mut_ptr(),
                32,
                addresses.as_mut_ptr(),
                &mut first_len,
                &mut *first,
            );
            assert_eq!(submitted, Submission::Pending);
            let submitted = driver.receive(
                1,
                buffer.as_mut_ptr().add(32),
                32,
                addresses.as_mut_ptr(),
                &mut second_len,
                &mut *second,
            );
            assert_eq!(submitted, Submission::Pending);
        }

        driver.cancel(1, &mut *first);
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            ERROR_OPERATION_ABORTED
        );
        assert_eq!(driver.parked(), 1);

        driver.close(1).unwrap();
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            ERROR_OPERATION_ABORTED
        );
        assert_eq!(driver.parked(), 0);
    }

    #[test]
    fn test_ttl_model() {
        let driver = MockDriver::new();
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[8] = 2;
        assert!(driver.decrement_ttl(&mut packet));
        assert_eq!(packet[8], 1);
        assert!(!driver.decrement_ttl(&mut packet));
        assert!(!driver.decrement_ttl(&mut [0x45; 4]));
    }
}
