//! Per-request aggregation state and the completion protocol
//!
//! One mutex per request guards the outstanding sub-transfer collection, the
//! accumulated byte counter, and the lifecycle phase. The "last one out
//! finalizes" rule is enforced by observing the outstanding count in the
//! same critical section that removed the sub-transfer, never by a separate
//! check-then-act. Exactly-once completion is structural: whichever context
//! wins the transition into `Finalizing` takes the single completion sender.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::{Direction, RequestId, SegmentCompletion, SubmitToken};
use crate::error::TransferError;

/// Terminal result of a transfer request.
///
/// Partial progress is never discarded: whenever any bytes moved, `status`
/// is success and `bytes_transferred` says how many, even if the last
/// completing sub-transfer failed or the request was cancelled midway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: Result<(), TransferError>,
    pub bytes_transferred: u64,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }
}

/// Lifecycle phase of a request. Transitions happen only under the request
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Sub-transfers are being built; not yet cancelable.
    Issuing,
    /// Cancelable; submissions and completions are in flight.
    Pending,
    /// A cancel pass owns the request's cancellation; completions still
    /// drain normally and the last one merges back into finalization.
    CancelRequested,
    /// One context has claimed finalization.
    Finalizing,
    /// The outcome has been delivered.
    Completed,
}

/// One outstanding hardware-bounded segment.
pub(crate) struct SubTransfer<W> {
    pub(crate) offset: u64,
    pub(crate) length: u64,
    pub(crate) packet_count: u32,
    /// Sub-window of the request buffer; released (dropped) when the
    /// segment completes or is torn down.
    pub(crate) window: Option<W>,
    /// Set once the transport accepts the segment.
    pub(crate) token: Option<SubmitToken>,
}

pub(crate) struct RequestInner<W> {
    phase: Phase,
    /// Outstanding sub-transfers keyed by segment index. The outstanding
    /// count is this map's length at every point the lock is held.
    subs: BTreeMap<u32, SubTransfer<W>>,
    /// Bytes accumulated from successfully completed segments.
    transferred: u64,
    done: Option<oneshot::Sender<TransferOutcome>>,
}

/// Shared state of one user transfer request.
pub(crate) struct TransferRequest<W> {
    id: RequestId,
    direction: Direction,
    total_length: u64,
    inner: Mutex<RequestInner<W>>,
}

impl<W: Send + 'static> TransferRequest<W> {
    pub(crate) fn new(
        id: RequestId,
        direction: Direction,
        total_length: u64,
        done: oneshot::Sender<TransferOutcome>,
    ) -> Self {
        Self {
            id,
            direction,
            total_length,
            inner: Mutex::new(RequestInner {
                phase: Phase::Issuing,
                subs: BTreeMap::new(),
                transferred: 0,
                done: Some(done),
            }),
        }
    }

    pub(crate) fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn total_length(&self) -> u64 {
        self.total_length
    }

    fn lock(&self) -> MutexGuard<'_, RequestInner<W>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a built sub-transfer to the collection. Only the issuing context
    /// calls this, and only before any segment has been submitted.
    pub(crate) fn install_sub(&self, segment: u32, sub: SubTransfer<W>) {
        self.lock().subs.insert(segment, sub);
    }

    /// Record the transport token for a submitted segment. The segment may
    /// already have completed, in which case there is nothing to record.
    pub(crate) fn record_token(&self, segment: u32, token: SubmitToken) {
        if let Some(sub) = self.lock().subs.get_mut(&segment) {
            sub.token = Some(token);
        }
    }

    /// Issuing -> Pending. From here on a cancel can take the request.
    pub(crate) fn mark_cancelable(&self) {
        let mut inner = self.lock();
        debug_assert_eq!(inner.phase, Phase::Issuing);
        inner.phase = Phase::Pending;
    }

    /// Remove and release the given segments (issuance-failure path: the
    /// rejected segment and everything not yet submitted). Segments already
    /// gone are skipped, so an empty or repeated teardown is a no-op.
    /// Returns how many sub-transfers remain outstanding.
    pub(crate) fn teardown(&self, segments: &[u32]) -> usize {
        let mut inner = self.lock();
        for segment in segments {
            if let Some(mut sub) = inner.subs.remove(segment) {
                drop(sub.window.take());
                debug!(
                    "Tore down unsent segment {} of request {} (offset {}, {} bytes, {} packets)",
                    segment, self.id.0, sub.offset, sub.length, sub.packet_count
                );
            }
        }
        inner.subs.len()
    }

    /// Finalize from the issuing context after a failed issuance left the
    /// collection empty. A completion that got there first wins; in that
    /// case this does nothing.
    pub(crate) fn finalize_from_issuer(&self, error: TransferError) {
        let taken = {
            let mut inner = self.lock();
            if !inner.subs.is_empty() {
                // Segments already on the wire finalize through the normal
                // completion path.
                return;
            }
            match inner.phase {
                Phase::Issuing | Phase::Pending | Phase::CancelRequested => {
                    inner.phase = Phase::Finalizing;
                    let outcome = if inner.transferred > 0 {
                        TransferOutcome {
                            status: Ok(()),
                            bytes_transferred: inner.transferred,
                        }
                    } else {
                        TransferOutcome {
                            status: Err(error),
                            bytes_transferred: 0,
                        }
                    };
                    inner.done.take().map(|tx| (tx, outcome))
                }
                Phase::Finalizing | Phase::Completed => None,
            }
        };
        if let Some((tx, outcome)) = taken {
            self.finish(tx, outcome);
        }
    }

    /// Handle one segment completion. Runs on whatever context the transport
    /// invokes the callback from; any number of these may race with each
    /// other and with a cancel pass.
    pub(crate) fn complete_segment(&self, segment: u32, completion: SegmentCompletion) {
        let taken = {
            let mut inner = self.lock();
            let Some(mut sub) = inner.subs.remove(&segment) else {
                warn!(
                    "Completion for unknown segment {} of request {}",
                    segment, self.id.0
                );
                return;
            };
            // Release the buffer sub-window first; the packet table goes
            // with the sub-transfer itself at the end of this call.
            drop(sub.window.take());

            if completion.is_success() {
                inner.transferred += completion.bytes_transferred;
                debug!(
                    "Segment {} of request {} completed: {} bytes (total {})",
                    segment, self.id.0, completion.bytes_transferred, inner.transferred
                );
            } else {
                debug!(
                    "Segment {} of request {} failed: {:?} / {:?}",
                    segment, self.id.0, completion.status, completion.bus_status
                );
            }

            if inner.subs.is_empty() {
                // Last one out finalizes. Taking the phase here doubles as
                // un-marking cancelable: a cancel pass that already moved to
                // CancelRequested merges back in through the same gate.
                match inner.phase {
                    Phase::Pending | Phase::CancelRequested => {
                        inner.phase = Phase::Finalizing;
                        let outcome = Self::outcome_of(inner.transferred, &completion);
                        inner.done.take().map(|tx| (tx, outcome))
                    }
                    // The issuing context still owns the request; it will
                    // observe the empty collection on its own path.
                    Phase::Issuing => None,
                    Phase::Finalizing | Phase::Completed => None,
                }
            } else {
                None
            }
        };
        if let Some((tx, outcome)) = taken {
            self.finish(tx, outcome);
        }
    }

    /// Pending -> CancelRequested, snapshotting the outstanding segments'
    /// tokens. Returns `None` when the request is not cancelable (still
    /// issuing, already cancelling, or already finalized).
    pub(crate) fn begin_cancel(&self) -> Option<Vec<(u32, Option<SubmitToken>)>> {
        let mut inner = self.lock();
        if inner.phase != Phase::Pending {
            return None;
        }
        inner.phase = Phase::CancelRequested;
        Some(
            inner
                .subs
                .iter()
                .map(|(segment, sub)| (*segment, sub.token.clone()))
                .collect(),
        )
    }

    /// The terminal outcome: success with the accumulated byte count when
    /// anything moved, otherwise the status of the completion that triggered
    /// finalization.
    fn outcome_of(transferred: u64, last: &SegmentCompletion) -> TransferOutcome {
        if transferred > 0 {
            return TransferOutcome {
                status: Ok(()),
                bytes_transferred: transferred,
            };
        }
        let status = match (&last.status, &last.bus_status) {
            (Err(e), _) => Err(e.clone()),
            (_, Err(e)) => Err(e.clone()),
            // Every segment moved zero bytes but none reported failure.
            _ => Ok(()),
        };
        TransferOutcome {
            status,
            bytes_transferred: 0,
        }
    }

    fn finish(&self, tx: oneshot::Sender<TransferOutcome>, outcome: TransferOutcome) {
        debug!(
            "Request {} finalized: success={} bytes={}",
            self.id.0,
            outcome.is_success(),
            outcome.bytes_transferred
        );
        // The caller may have dropped the handle; the outcome is terminal
        // either way.
        let _ = tx.send(outcome);
        self.lock().phase = Phase::Completed;
    }
}
