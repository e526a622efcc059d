//! Transfer engine: issuance, aggregation, cancellation
//!
//! A user read/write becomes one [`TransferRequest`] and N sub-transfers,
//! one per segment of the packetizer's plan. Every sub-transfer is built and
//! placed in the request's collection *before* the first submission, so the
//! outstanding count can only reach zero once every issuance attempt has
//! resolved — that makes "last completion finalizes" safe even while the
//! submit loop is still running.
//!
//! Failure handling follows the transport's realities: an allocation
//! failure aborts the remaining issuance but segments already on the wire
//! are left to complete normally; a synchronous submission rejection stops
//! further submission and tears down only what was never sent. The caller
//! sees a failure status only when zero bytes ever moved.

mod request;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::bus::{
    BusTransport, CompletionCallback, Direction, MemoryProvider, PacketDescriptor, PipeId,
    RequestId, SegmentDescriptor, SpeedClass,
};
use crate::error::TransferError;
use crate::packetizer::{self, SegmentPlan};
use request::{SubTransfer, TransferRequest};

pub use request::TransferOutcome;

/// Parameters of one user-level read or write.
pub struct TransferSpec<R> {
    pub direction: Direction,
    pub pipe: PipeId,
    pub speed: SpeedClass,
    /// Externally owned buffer the transfer reads from or writes into. The
    /// engine never copies it; sub-transfers hold windows into it.
    pub buffer: R,
    /// Total bytes to move. Must not exceed the buffer region.
    pub length: u64,
}

/// Handle to an in-flight request. Await [`RequestHandle::wait`] for the
/// terminal outcome; drop it to stop caring (the transfer itself runs on).
pub struct RequestHandle<B: BusTransport> {
    shared: Arc<TransferRequest<B::Window>>,
    transport: Arc<B>,
    done: oneshot::Receiver<TransferOutcome>,
}

impl<B: BusTransport> RequestHandle<B> {
    pub fn id(&self) -> RequestId {
        self.shared.id()
    }

    /// Best-effort, asynchronous cancel. Sub-transfers the transport cannot
    /// stop complete normally and still contribute their bytes.
    pub fn cancel(&self) {
        cancel_request(self.transport.as_ref(), &self.shared);
    }

    /// Wait for the terminal `(status, bytes_transferred)` outcome.
    pub async fn wait(self) -> TransferOutcome {
        let RequestHandle { done, .. } = self;
        match done.await {
            Ok(outcome) => outcome,
            // The sender lives in the request state until finalization; a
            // closed channel means the engine side was torn down wholesale.
            Err(_) => TransferOutcome {
                status: Err(TransferError::TransportFailed(
                    "completion channel closed".to_string(),
                )),
                bytes_transferred: 0,
            },
        }
    }
}

impl<B: BusTransport> std::fmt::Debug for RequestHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// The transfer-management engine. One per device function; cheap to share
/// behind an `Arc`.
pub struct TransferEngine<B, M>
where
    B: BusTransport,
    M: MemoryProvider<Window = B::Window>,
{
    transport: Arc<B>,
    memory: Arc<M>,
    next_request: AtomicU64,
}

impl<B, M> TransferEngine<B, M>
where
    B: BusTransport,
    M: MemoryProvider<Window = B::Window>,
{
    pub fn new(transport: Arc<B>, memory: Arc<M>) -> Self {
        Self {
            transport,
            memory,
            next_request: AtomicU64::new(1),
        }
    }

    /// Begin a transfer, querying the transport for the pipe's max packet
    /// size.
    pub fn begin_transfer_on_pipe(
        &self,
        spec: TransferSpec<M::Region>,
    ) -> Result<RequestHandle<B>, TransferError> {
        let max_packet_size = self.transport.max_packet_size(spec.pipe);
        self.begin_transfer(spec, max_packet_size)
    }

    /// Begin a transfer with an explicit pipe max packet size.
    ///
    /// Only planning-time rejections return `Err`. Once the first
    /// sub-transfer exists, every failure resolves through the returned
    /// handle instead, so segments already on the wire can still deliver
    /// data.
    pub fn begin_transfer(
        &self,
        spec: TransferSpec<M::Region>,
        max_packet_size: u32,
    ) -> Result<RequestHandle<B>, TransferError> {
        let plan = packetizer::plan_transfer(spec.speed, spec.length, max_packet_size)?;
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        info!(
            "{} request {} begins: {} bytes, packet size {}, {} segment(s)",
            if spec.direction.is_read() { "Read" } else { "Write" },
            id.0,
            spec.length,
            max_packet_size,
            plan.segments.len()
        );

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(TransferRequest::new(id, spec.direction, spec.length, tx));
        let handle = RequestHandle {
            shared: Arc::clone(&shared),
            transport: Arc::clone(&self.transport),
            done: rx,
        };

        // Build every sub-transfer into the collection before the first
        // submission, so the outstanding count can only reach zero once
        // every issuance attempt has resolved.
        let mut pending = Vec::with_capacity(plan.segments.len());
        for (segment, seg_plan) in plan.segments.iter().enumerate() {
            let segment = segment as u32;
            match self.build_sub(&spec, id, segment, seg_plan) {
                Ok((sub, descriptor, window)) => {
                    shared.install_sub(segment, sub);
                    pending.push((segment, descriptor, window));
                }
                Err(err) => {
                    error!(
                        "Allocation for segment {} of request {} failed, aborting issuance: {}",
                        segment, id.0, err
                    );
                    let built: Vec<u32> = (0..segment).collect();
                    shared.teardown(&built);
                    shared.finalize_from_issuer(err);
                    return Ok(handle);
                }
            }
        }

        // From here on a cancel can take the request; the phase machine
        // arbitrates the race between cancellation and the last completion.
        shared.mark_cancelable();

        let mut pending = pending.into_iter();
        while let Some((segment, descriptor, window)) = pending.next() {
            let complete = completion_callback(&shared, segment);
            match self.transport.submit(descriptor, window, complete) {
                Ok(token) => shared.record_token(segment, token),
                Err(err) => {
                    warn!(
                        "Transport rejected segment {} of request {}: {}; \
                         already-submitted segments continue",
                        segment, id.0, err
                    );
                    // Tear down the rejected segment and everything not yet
                    // sent. Whatever is already on the wire keeps going and
                    // drives finalization through the completion path.
                    let mut unsent = vec![segment];
                    unsent.extend(pending.map(|(s, _, _)| s));
                    let remaining = shared.teardown(&unsent);
                    if remaining == 0 {
                        shared.finalize_from_issuer(err);
                    }
                    return Ok(handle);
                }
            }
        }

        debug!("All segments of request {} submitted", id.0);
        Ok(handle)
    }

    /// Cancel an in-flight request through its handle. Equivalent to
    /// [`RequestHandle::cancel`].
    pub fn cancel_transfer(&self, handle: &RequestHandle<B>) {
        handle.cancel();
    }

    /// Allocate one sub-transfer: a window into the request buffer and the
    /// wire descriptor with its packet table.
    fn build_sub(
        &self,
        spec: &TransferSpec<M::Region>,
        id: RequestId,
        segment: u32,
        plan: &SegmentPlan,
    ) -> Result<(SubTransfer<B::Window>, SegmentDescriptor, B::Window), TransferError> {
        let window = self.memory.describe(&spec.buffer, plan.offset, plan.length)?;

        let packets: Vec<PacketDescriptor> = plan
            .packets
            .iter()
            .map(|slot| PacketDescriptor {
                offset: slot.offset,
                // Reads leave per-packet lengths to the transport; writes
                // state them explicitly.
                length: match spec.direction {
                    Direction::In => 0,
                    Direction::Out => slot.length,
                },
            })
            .collect();

        debug!(
            "Built segment {} of request {}: offset {}, {} bytes, {} packets",
            segment,
            id.0,
            plan.offset,
            plan.length,
            packets.len()
        );

        let descriptor = SegmentDescriptor {
            request: id,
            segment,
            pipe: spec.pipe,
            direction: spec.direction,
            offset: plan.offset,
            length: plan.length,
            packets,
        };
        let sub = SubTransfer {
            offset: plan.offset,
            length: plan.length,
            packet_count: plan.packets.len() as u32,
            window: Some(window.clone()),
            token: None,
        };
        Ok((sub, descriptor, window))
    }
}

fn completion_callback<W: Clone + Send + 'static>(
    shared: &Arc<TransferRequest<W>>,
    segment: u32,
) -> CompletionCallback {
    let shared = Arc::clone(shared);
    Box::new(move |completion| shared.complete_segment(segment, completion))
}

/// Snapshot the outstanding segments under the request lock, then ask the
/// transport to cancel each one with the lock released — the transport may
/// re-enter the completion path synchronously, and the completion path takes
/// the same lock.
fn cancel_request<B: BusTransport>(transport: &B, shared: &Arc<TransferRequest<B::Window>>) {
    let Some(snapshot) = shared.begin_cancel() else {
        debug!(
            "Cancel of request {} ignored; request is not cancelable",
            shared.id().0
        );
        return;
    };
    info!(
        "Cancelling {} request {} ({} bytes total, {} segment(s) outstanding)",
        if shared.direction().is_read() { "read" } else { "write" },
        shared.id().0,
        shared.total_length(),
        snapshot.len()
    );
    for (segment, token) in snapshot {
        match token {
            Some(token) => {
                if !transport.cancel(&token) {
                    debug!(
                        "Transport declined cancel of segment {} of request {}; \
                         it completes normally",
                        segment,
                        shared.id().0
                    );
                }
            }
            None => debug!(
                "Segment {} of request {} not yet submitted; skipping cancel",
                segment,
                shared.id().0
            ),
        }
    }
}
