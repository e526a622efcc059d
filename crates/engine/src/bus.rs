//! Collaborator seams: bus transport and buffer provider
//!
//! The engine never talks to hardware or owns user memory directly. It
//! submits [`SegmentDescriptor`]s through a [`BusTransport`] and describes
//! sub-windows of the caller's buffer through a [`MemoryProvider`]; both are
//! implemented outside this crate (see [`crate::testing`] for the in-memory
//! versions the test suites use).

use crate::error::TransferError;

/// Direction of a transfer relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host (a read).
    In,
    /// Host to device (a write).
    Out,
}

impl Direction {
    pub fn is_read(self) -> bool {
        self == Direction::In
    }
}

/// Transport speed class; selects the segmentation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedClass {
    /// Bounded packet count per segment (255).
    Full,
    /// Packet count a multiple of 8, up to 1024 per segment, data spread
    /// evenly across packets.
    High,
}

/// Pipe (endpoint) address on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(pub u8);

/// Identifier of one user-level transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Transport-assigned handle for one submitted segment, used to cancel it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitToken(pub u64);

/// One packet slot inside a segment descriptor.
///
/// Offsets are relative to the segment's buffer window. Read descriptors
/// carry zero lengths (the transport fills in what actually arrived); write
/// descriptors state each packet's payload length explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub offset: u32,
    pub length: u32,
}

/// Everything the transport needs to put one segment on the wire.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    pub request: RequestId,
    /// Index of this segment within its request.
    pub segment: u32,
    pub pipe: PipeId,
    pub direction: Direction,
    /// Byte offset of this segment inside the original request buffer.
    pub offset: u64,
    /// Byte length covered by the packet table.
    pub length: u64,
    pub packets: Vec<PacketDescriptor>,
}

/// Completion report for one submitted segment.
///
/// `status` is the submission's own completion status; `bus_status` is the
/// underlying endpoint status. A segment contributes its bytes to the
/// request total only when both are success.
#[derive(Debug, Clone)]
pub struct SegmentCompletion {
    pub status: Result<(), TransferError>,
    pub bus_status: Result<(), TransferError>,
    pub bytes_transferred: u64,
}

impl SegmentCompletion {
    pub fn success(bytes_transferred: u64) -> Self {
        Self {
            status: Ok(()),
            bus_status: Ok(()),
            bytes_transferred,
        }
    }

    pub fn failed(error: TransferError) -> Self {
        Self {
            status: Err(error.clone()),
            bus_status: Err(error),
            bytes_transferred: 0,
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(TransferError::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_ok() && self.bus_status.is_ok()
    }
}

/// Callback the transport invokes exactly once per accepted segment, on any
/// thread, at any later time — including synchronously from inside
/// [`BusTransport::cancel`].
pub type CompletionCallback = Box<dyn FnOnce(SegmentCompletion) + Send + 'static>;

/// The bus transfer layer.
pub trait BusTransport: Send + Sync + 'static {
    /// Buffer sub-window handle accepted alongside a segment. Windows are
    /// reference-counted: the sub-window is released when the last clone
    /// drops.
    type Window: Clone + Send + 'static;

    /// Maximum packet size of a pipe.
    fn max_packet_size(&self, pipe: PipeId) -> u32;

    /// Queue one segment. A synchronous `Err` means the segment was never
    /// accepted and `complete` will not be invoked. After `Ok`, `complete`
    /// fires exactly once.
    fn submit(
        &self,
        segment: SegmentDescriptor,
        window: Self::Window,
        complete: CompletionCallback,
    ) -> Result<SubmitToken, TransferError>;

    /// Best-effort cancel of a submitted segment. `false` means the cancel
    /// could not be delivered; the segment still completes normally.
    fn cancel(&self, token: &SubmitToken) -> bool;
}

/// The buffer/memory provider.
pub trait MemoryProvider: Send + Sync + 'static {
    /// Externally owned memory region backing one request.
    type Region: Send + Sync + 'static;
    /// Reference-counted handle describing a sub-window of a region.
    type Window: Clone + Send + 'static;

    /// Describe `[offset, offset + length)` of `region`. Failure is
    /// [`TransferError::ResourceExhausted`].
    fn describe(
        &self,
        region: &Self::Region,
        offset: u64,
        length: u64,
    ) -> Result<Self::Window, TransferError>;
}
