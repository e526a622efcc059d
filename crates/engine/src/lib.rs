//! Transfer-management core for a USB host-side function driver
//!
//! A user-level read or write is split into hardware-bounded sub-transfers
//! (isochronous-style transport imposes hard packet-count and packet-size
//! limits per submission), each sub-transfer completes asynchronously on an
//! arbitrary context, and the results are merged back into a single outcome —
//! including cancellation racing against completion, partial failure, and
//! reclamation of every allocated resource on every exit path.
//!
//! The second component is the device-list change notifier: a service that
//! keeps a shared device inventory in sync with the system, coalesces bursts
//! of hot-plug signals behind per-class debounce timers, and fans out
//! added/removed callbacks to registered watchers.
//!
//! The bus transport, buffer provider, device enumerator, and broadcast
//! registrar are collaborator traits; [`testing`] provides in-memory mocks
//! for all of them.

pub mod bus;
pub mod config;
pub mod error;
pub mod notifier;
pub mod packetizer;
pub mod testing;
pub mod transfer;

pub use bus::{BusTransport, Direction, MemoryProvider, PipeId, RequestId, SpeedClass};
pub use config::{Config, NotifierSettings};
pub use error::{NotifyError, TransferError};
pub use notifier::{
    ChangeSignal, DeviceChange, DeviceDescription, HotplugNotifier, PatternFilter, WatcherFlags,
    WatcherId,
};
pub use transfer::{RequestHandle, TransferEngine, TransferOutcome, TransferSpec};
