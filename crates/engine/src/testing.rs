//! In-memory mock collaborators for exercising the engine without hardware
//!
//! Provides scriptable implementations of every collaborator seam: a bus
//! that records submissions and completes them on demand, a memory provider
//! that accounts for live windows, and enumerator/registrar doubles for the
//! notifier. Used by the integration suites across this crate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::bus::{
    BusTransport, CompletionCallback, MemoryProvider, PipeId, SegmentCompletion,
    SegmentDescriptor, SubmitToken,
};
use crate::error::{NotifyError, TransferError};
use crate::notifier::{BroadcastRegistrar, BroadcastToken, DeviceDescription, DeviceEnumerator};

/// One submission the mock bus accepted.
struct AcceptedSegment {
    descriptor: SegmentDescriptor,
    token: SubmitToken,
    // Window held until completion, mirroring a transport that owns the
    // buffer description while the segment is on the wire.
    window: Option<MockWindow>,
    complete: Option<CompletionCallback>,
    cancel_requested: bool,
}

struct MockBusState {
    accepted: Vec<AcceptedSegment>,
    attempts: usize,
    reject_at: Option<usize>,
    next_token: u64,
}

/// Scriptable in-memory [`BusTransport`].
///
/// Submissions are recorded in order; tests drive completions explicitly
/// with [`MockBus::complete`]. With [`MockBus::with_synchronous_cancel`] the
/// cancel call itself invokes the completion callback (with a cancelled
/// status) before returning, which is exactly the re-entrancy the engine's
/// cancel path must tolerate.
pub struct MockBus {
    state: Mutex<MockBusState>,
    max_packet_size: u32,
    synchronous_cancel: bool,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Self::build(None, false)
    }

    /// Reject the submission with ordinal `attempt` (0-based, counted across
    /// the bus's lifetime) with `TransportRejected`.
    pub fn rejecting_at(attempt: usize) -> Arc<Self> {
        Self::build(Some(attempt), false)
    }

    /// Complete segments synchronously from inside `cancel`.
    pub fn with_synchronous_cancel() -> Arc<Self> {
        Self::build(None, true)
    }

    fn build(reject_at: Option<usize>, synchronous_cancel: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockBusState {
                accepted: Vec::new(),
                attempts: 0,
                reject_at,
                next_token: 1,
            }),
            max_packet_size: 8,
            synchronous_cancel,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockBusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptors of every accepted submission, in submission order.
    pub fn accepted(&self) -> Vec<SegmentDescriptor> {
        self.lock()
            .accepted
            .iter()
            .map(|s| s.descriptor.clone())
            .collect()
    }

    /// Number of accepted segments whose completion has not fired yet.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .accepted
            .iter()
            .filter(|s| s.complete.is_some())
            .count()
    }

    /// Tokens of segments a cancel was requested for.
    pub fn cancelled(&self) -> Vec<SubmitToken> {
        self.lock()
            .accepted
            .iter()
            .filter(|s| s.cancel_requested)
            .map(|s| s.token.clone())
            .collect()
    }

    /// Fire the completion of accepted segment `index` (submission order).
    /// Panics if that segment already completed.
    pub fn complete(&self, index: usize, completion: SegmentCompletion) {
        let callback = {
            let mut state = self.lock();
            let segment = &mut state.accepted[index];
            segment.window.take();
            segment
                .complete
                .take()
                .expect("segment completed more than once")
        };
        // Invoke with the bus lock released, like a real completion context.
        callback(completion);
    }
}

impl BusTransport for MockBus {
    type Window = MockWindow;

    fn max_packet_size(&self, _pipe: PipeId) -> u32 {
        self.max_packet_size
    }

    fn submit(
        &self,
        segment: SegmentDescriptor,
        window: Self::Window,
        complete: CompletionCallback,
    ) -> Result<SubmitToken, TransferError> {
        let mut state = self.lock();
        let attempt = state.attempts;
        state.attempts += 1;
        if state.reject_at == Some(attempt) {
            return Err(TransferError::TransportRejected(format!(
                "scripted rejection of submission {}",
                attempt
            )));
        }
        let token = SubmitToken(state.next_token);
        state.next_token += 1;
        state.accepted.push(AcceptedSegment {
            descriptor: segment,
            token: token.clone(),
            window: Some(window),
            complete: Some(complete),
            cancel_requested: false,
        });
        Ok(token)
    }

    fn cancel(&self, token: &SubmitToken) -> bool {
        let callback = {
            let mut state = self.lock();
            let Some(segment) = state.accepted.iter_mut().find(|s| &s.token == token) else {
                return false;
            };
            if segment.complete.is_none() {
                // Already completed; nothing to cancel.
                return false;
            }
            segment.cancel_requested = true;
            if self.synchronous_cancel {
                segment.window.take();
                segment.complete.take()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback(SegmentCompletion::cancelled());
        }
        true
    }
}

/// Reference-counted sub-window over a [`Bytes`] region, with live-handle
/// accounting so tests can assert every window is released on every path.
pub struct MockWindow {
    bytes: Bytes,
    live: Arc<AtomicUsize>,
}

impl MockWindow {
    /// The bytes this window covers.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl Clone for MockWindow {
    fn clone(&self) -> Self {
        self.live.fetch_add(1, Ordering::SeqCst);
        Self {
            bytes: self.bytes.clone(),
            live: Arc::clone(&self.live),
        }
    }
}

impl Drop for MockWindow {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`MemoryProvider`] over [`Bytes`] regions.
pub struct MockMemory {
    live: Arc<AtomicUsize>,
    described: AtomicUsize,
    fail_at: Option<usize>,
}

impl MockMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Arc::new(AtomicUsize::new(0)),
            described: AtomicUsize::new(0),
            fail_at: None,
        })
    }

    /// Fail the describe call with ordinal `attempt` (0-based) with
    /// `ResourceExhausted`.
    pub fn failing_at(attempt: usize) -> Arc<Self> {
        Arc::new(Self {
            live: Arc::new(AtomicUsize::new(0)),
            described: AtomicUsize::new(0),
            fail_at: Some(attempt),
        })
    }

    /// Number of window handles (including clones) currently alive.
    pub fn live_windows(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total describe calls seen.
    pub fn described(&self) -> usize {
        self.described.load(Ordering::SeqCst)
    }
}

impl MemoryProvider for MockMemory {
    type Region = Bytes;
    type Window = MockWindow;

    fn describe(
        &self,
        region: &Self::Region,
        offset: u64,
        length: u64,
    ) -> Result<Self::Window, TransferError> {
        let attempt = self.described.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(attempt) {
            return Err(TransferError::ResourceExhausted(format!(
                "scripted allocation failure at describe {}",
                attempt
            )));
        }
        let end = offset
            .checked_add(length)
            .filter(|end| *end as usize <= region.len())
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "window [{}, {}+{}) outside region of {} bytes",
                    offset,
                    offset,
                    length,
                    region.len()
                ))
            })?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockWindow {
            bytes: region.slice(offset as usize..end as usize),
            live: Arc::clone(&self.live),
        })
    }
}

/// Mutable in-memory device set backing a [`DeviceEnumerator`].
pub struct MockEnumerator {
    devices: Mutex<Vec<DeviceDescription>>,
}

impl MockEnumerator {
    pub fn new(devices: Vec<DeviceDescription>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
        })
    }

    pub fn add(&self, device: DeviceDescription) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(device);
    }

    pub fn remove(&self, symbolic_link: &str) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|d| !d.symbolic_link.eq_ignore_ascii_case(symbolic_link));
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn enumerate(&self) -> Vec<DeviceDescription> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Recording [`BroadcastRegistrar`].
pub struct MockRegistrar {
    active: Mutex<Vec<(BroadcastToken, String)>>,
    next_token: AtomicU64,
}

impl MockRegistrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// GUIDs with a currently active registration, in registration order.
    pub fn active_guids(&self) -> Vec<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, guid)| guid.clone())
            .collect()
    }
}

impl BroadcastRegistrar for MockRegistrar {
    fn register(&self, interface_guid: &str) -> Result<BroadcastToken, NotifyError> {
        let token = BroadcastToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((token.clone(), interface_guid.to_string()));
        Ok(token)
    }

    fn unregister(&self, token: BroadcastToken) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(t, _)| *t != token);
    }
}

/// Build a device description with a consistent link/instance/GUID shape.
pub fn sample_device(ordinal: u32, interface_guid: &str) -> DeviceDescription {
    DeviceDescription {
        symbolic_link: format!("\\\\?\\usb#vid_1234&pid_{:04x}#sn{:06}", ordinal, ordinal),
        instance_id: format!("USB\\VID_1234&PID_{:04X}\\SN{:06}", ordinal, ordinal),
        interface_guid: interface_guid.to_string(),
    }
}
