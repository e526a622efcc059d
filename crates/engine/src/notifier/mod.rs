//! Device-list change notifier
//!
//! Maintains a shared device inventory, coalesces bursts of system change
//! signals behind per-class debounce timers, and fans out added/removed
//! callbacks to registered watchers. All inventory mutation and all watcher
//! dispatch happen on one dedicated task draining a serialized queue; the
//! inventory lock exists for outside snapshots and is never held across a
//! callback invocation — compute under the lock, act outside it.

pub mod inventory;
pub mod watch;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::config::NotifierSettings;
use crate::error::NotifyError;

pub use inventory::{DeviceDescription, DeviceInventory, DeviceRecord, SyncFlag};
pub use watch::{DeviceChange, PatternFilter, WatchCallback, WatcherFlags, WatcherId};

use watch::Watcher;

/// Live system device set; the inventory re-syncs against this on arrival
/// and nodes-changed fires.
pub trait DeviceEnumerator: Send + Sync + 'static {
    fn enumerate(&self) -> Vec<DeviceDescription>;
}

/// External broadcast registration, one per distinct device-interface GUID
/// referenced by a watcher's matching devices.
pub trait BroadcastRegistrar: Send + Sync + 'static {
    fn register(&self, interface_guid: &str) -> Result<BroadcastToken, NotifyError>;
    fn unregister(&self, token: BroadcastToken);
}

/// Token for one external broadcast registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastToken(pub u64);

/// Asynchronous change signal from the system event source.
#[derive(Debug, Clone)]
pub enum ChangeSignal {
    /// A device interface arrived.
    Arrival {
        interface_guid: String,
        path: String,
    },
    /// A device interface left. An empty path cannot be matched against the
    /// inventory and degrades to an arrival-class re-sync.
    Removal { path: String },
    /// The device tree changed shape in some unspecified way.
    NodesChanged,
}

enum Command {
    Signal(ChangeSignal),
    Register {
        filter: PatternFilter,
        flags: WatcherFlags,
        callback: WatchCallback,
        reply: oneshot::Sender<WatcherId>,
    },
    Unregister {
        id: WatcherId,
        reply: oneshot::Sender<bool>,
    },
    UnregisterAll {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Clonable sender the system event source pushes change signals through.
#[derive(Clone)]
pub struct SignalSender {
    tx: async_channel::Sender<Command>,
}

impl SignalSender {
    /// Queue a change signal. A full queue drops the signal (the pending
    /// backlog already forces a re-sync); a closed queue means the service
    /// stopped.
    pub fn send(&self, signal: ChangeSignal) -> Result<(), NotifyError> {
        match self.tx.try_send(Command::Signal(signal)) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => {
                warn!("Notifier queue full; change signal coalesced by backlog");
                Ok(())
            }
            Err(async_channel::TrySendError::Closed(_)) => Err(NotifyError::ServiceStopped),
        }
    }
}

/// Handle to the running notifier service. Construct with
/// [`HotplugNotifier::start`] (requires a tokio runtime); stop with
/// [`HotplugNotifier::shutdown`] or by dropping every handle and sender.
pub struct HotplugNotifier {
    tx: async_channel::Sender<Command>,
    inventory: Arc<Mutex<DeviceInventory>>,
    task: tokio::task::JoinHandle<()>,
}

impl HotplugNotifier {
    /// Start the dispatch task with an initial inventory sync.
    pub fn start<E, R>(settings: NotifierSettings, enumerator: Arc<E>, registrar: Arc<R>) -> Self
    where
        E: DeviceEnumerator,
        R: BroadcastRegistrar,
    {
        let (tx, rx) = async_channel::bounded(settings.channel_capacity);
        let inventory = Arc::new(Mutex::new(DeviceInventory::default()));
        let service = NotifierService {
            rx,
            settings,
            enumerator,
            registrar,
            inventory: Arc::clone(&inventory),
            watchers: Vec::new(),
            broadcasts: Vec::new(),
            next_watcher: 1,
            arrival_due: None,
            removal_due: None,
            nodes_due: None,
        };
        let task = tokio::spawn(service.run());
        info!("Hotplug notifier started");
        Self {
            tx,
            inventory,
            task,
        }
    }

    /// Clonable signal sender for the system event source.
    pub fn signals(&self) -> SignalSender {
        SignalSender {
            tx: self.tx.clone(),
        }
    }

    /// Snapshot of the current inventory records.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.inventory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records()
            .to_vec()
    }

    /// Register a watcher. The callback runs on the dispatch task for every
    /// matching change; it may push change signals but must not await other
    /// notifier calls (they are served by the same task).
    pub async fn register_watcher(
        &self,
        filter: PatternFilter,
        flags: WatcherFlags,
        callback: impl Fn(&DeviceRecord, DeviceChange) + Send + 'static,
    ) -> Result<WatcherId, NotifyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                filter,
                flags,
                callback: Box::new(callback),
                reply,
            })
            .await
            .map_err(|_| NotifyError::ServiceStopped)?;
        rx.await.map_err(|_| NotifyError::ServiceStopped)
    }

    pub async fn unregister(&self, id: WatcherId) -> Result<(), NotifyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Unregister { id, reply })
            .await
            .map_err(|_| NotifyError::ServiceStopped)?;
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(NotifyError::UnknownWatcher(id.0)),
            Err(_) => Err(NotifyError::ServiceStopped),
        }
    }

    /// Drop every watcher and release every broadcast registration. The
    /// service keeps running and accepts new registrations.
    pub async fn unregister_all(&self) -> Result<(), NotifyError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::UnregisterAll { reply })
            .await
            .map_err(|_| NotifyError::ServiceStopped)?;
        rx.await.map_err(|_| NotifyError::ServiceStopped)
    }

    /// Stop the dispatch task; final teardown releases every broadcast
    /// registration.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("Notifier task join failed: {}", e);
        }
    }
}

struct NotifierService<E, R> {
    rx: async_channel::Receiver<Command>,
    settings: NotifierSettings,
    enumerator: Arc<E>,
    registrar: Arc<R>,
    inventory: Arc<Mutex<DeviceInventory>>,
    watchers: Vec<Watcher>,
    broadcasts: Vec<(String, BroadcastToken)>,
    next_watcher: u64,
    arrival_due: Option<Instant>,
    removal_due: Option<Instant>,
    nodes_due: Option<Instant>,
}

impl<E, R> NotifierService<E, R>
where
    E: DeviceEnumerator,
    R: BroadcastRegistrar,
{
    async fn run(mut self) {
        // Populate the inventory up front so early registrations can replay
        // the initial set; nobody is watching yet, so flags are cleared
        // without a dispatch pass.
        let live = self.enumerator.enumerate();
        {
            let mut inventory = self.lock_inventory();
            inventory.sync(&live);
            inventory.clear_sync_flags();
        }

        // Receiving through a clone keeps the select future off `self`, so
        // the arm handlers can borrow it mutably.
        let rx = self.rx.clone();

        loop {
            // A disabled select branch still evaluates its expression, so
            // unarmed timers get a placeholder deadline.
            let far = Instant::now() + Duration::from_secs(3600);
            let arrival_at = self.arrival_due.unwrap_or(far);
            let removal_at = self.removal_due.unwrap_or(far);
            let nodes_at = self.nodes_due.unwrap_or(far);

            tokio::select! {
                command = rx.recv() => match command {
                    Ok(Command::Signal(signal)) => self.apply_signal(signal),
                    Ok(Command::Register { filter, flags, callback, reply }) => {
                        let id = self.register(filter, flags, callback);
                        let _ = reply.send(id);
                    }
                    Ok(Command::Unregister { id, reply }) => {
                        let before = self.watchers.len();
                        self.watchers.retain(|w| w.id != id);
                        let found = self.watchers.len() != before;
                        if found {
                            info!("Watcher {} unregistered", id.0);
                        }
                        let _ = reply.send(found);
                    }
                    Ok(Command::UnregisterAll { reply }) => {
                        info!("Unregistering all {} watcher(s)", self.watchers.len());
                        self.watchers.clear();
                        self.release_broadcasts();
                        let _ = reply.send(());
                    }
                    Ok(Command::Shutdown) | Err(_) => break,
                },
                _ = sleep_until(arrival_at), if self.arrival_due.is_some() => {
                    self.arrival_due = None;
                    self.fire_arrival();
                }
                _ = sleep_until(removal_at), if self.removal_due.is_some() => {
                    self.removal_due = None;
                    self.fire_removal();
                }
                _ = sleep_until(nodes_at), if self.nodes_due.is_some() => {
                    self.nodes_due = None;
                    self.fire_nodes_changed();
                }
            }
        }

        self.watchers.clear();
        self.release_broadcasts();
        info!("Hotplug notifier stopped");
    }

    fn lock_inventory(&self) -> MutexGuard<'_, DeviceInventory> {
        self.inventory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_signal(&mut self, signal: ChangeSignal) {
        match signal {
            ChangeSignal::Arrival {
                interface_guid,
                path,
            } => {
                debug!("Arrival signalled: {} ({})", path, interface_guid);
                // Each signal restarts the window; a burst collapses into
                // one re-sync after the last arrival settles.
                self.arrival_due = Some(Instant::now() + self.settings.arrival_debounce());
            }
            ChangeSignal::Removal { path } => {
                if path.is_empty() {
                    warn!("Removal signal with empty path; scheduling re-sync instead");
                    self.arrival_due = Some(Instant::now() + self.settings.arrival_debounce());
                    return;
                }
                let marked = self.lock_inventory().mark_removed(&path);
                debug!("Removal signalled: {} (matched: {})", path, marked);
                self.removal_due = Some(Instant::now() + self.settings.removal_debounce());
            }
            ChangeSignal::NodesChanged => {
                // Coalesce: only the first signal of a burst arms the timer.
                if self.nodes_due.is_none() {
                    debug!("Device nodes changed; re-sync pending");
                    self.nodes_due = Some(Instant::now() + self.settings.nodes_changed_debounce());
                }
            }
        }
    }

    fn fire_arrival(&mut self) {
        let live = self.enumerator.enumerate();
        self.lock_inventory().sync(&live);
        self.notify_watchers(None);
    }

    fn fire_removal(&mut self) {
        // The removal signal already marked the record; dispatch without a
        // re-sync so the removed record is still present to report.
        self.notify_watchers(None);
    }

    fn fire_nodes_changed(&mut self) {
        let live = self.enumerator.enumerate();
        self.lock_inventory().sync(&live);
        self.notify_watchers(None);
        // Interfaces may have appeared that no broadcast covers yet.
        self.ensure_broadcasts(None);
    }

    fn register(&mut self, filter: PatternFilter, flags: WatcherFlags, callback: WatchCallback) -> WatcherId {
        let id = WatcherId(self.next_watcher);
        self.next_watcher += 1;
        info!(
            "Watcher {} registered (initial set: {}, pass duplicates: {})",
            id.0, flags.notify_initial_set, flags.pass_duplicate_instance
        );
        self.watchers.push(Watcher {
            id,
            filter,
            flags,
            callback,
        });
        self.ensure_broadcasts(Some(id));
        if flags.notify_initial_set {
            self.notify_watchers(Some(id));
        }
        id
    }

    /// Dispatch pass. With `only` set this is an initial-set replay: every
    /// connected record counts as freshly added and only that watcher is
    /// notified. Records and the flag state are snapshotted under the
    /// inventory lock; callbacks run with the lock released. Flags are
    /// cleared afterwards in a second pass.
    fn notify_watchers(&self, only: Option<WatcherId>) {
        let records: Vec<DeviceRecord> = self.lock_inventory().records().to_vec();

        // Instances already claimed in this pass: a device instance is
        // reported once per pass no matter how many watchers match it,
        // unless a watcher asked for duplicates.
        let mut seen: Vec<String> = Vec::new();

        for record in &records {
            let flag = if only.is_some() {
                if !record.connected {
                    continue;
                }
                SyncFlag::Added
            } else if record.sync_flag == SyncFlag::Unchanged {
                continue;
            } else {
                record.sync_flag
            };

            let change = match flag {
                SyncFlag::Added => DeviceChange::Added,
                SyncFlag::Removed => DeviceChange::Removed,
                SyncFlag::Unchanged => continue,
            };

            for watcher in &self.watchers {
                if let Some(id) = only
                    && watcher.id != id
                {
                    continue;
                }
                if !watcher.filter.matches(record) {
                    continue;
                }
                let dupe = seen
                    .iter()
                    .any(|i| i.eq_ignore_ascii_case(&record.instance_id));
                if dupe && !watcher.flags.pass_duplicate_instance {
                    continue;
                }
                if !dupe {
                    seen.push(record.instance_id.clone());
                }
                trace!(
                    "Watcher {} notified: {} {:?}",
                    watcher.id.0, record.instance_id, change
                );
                (watcher.callback)(record, change);
            }
        }

        self.lock_inventory().clear_sync_flags();
    }

    /// Make sure a broadcast registration exists for every interface GUID of
    /// inventory records matching a watcher (all watchers, or just one when
    /// `only` is set). Registration failures are logged and retried on the
    /// next nodes-changed pass.
    fn ensure_broadcasts(&mut self, only: Option<WatcherId>) {
        let records: Vec<DeviceRecord> = self.lock_inventory().records().to_vec();
        for watcher in &self.watchers {
            if let Some(id) = only
                && watcher.id != id
            {
                continue;
            }
            for record in &records {
                if !watcher.filter.matches(record) {
                    continue;
                }
                let guid = &record.interface_guid;
                if self
                    .broadcasts
                    .iter()
                    .any(|(g, _)| g.eq_ignore_ascii_case(guid))
                {
                    continue;
                }
                match self.registrar.register(guid) {
                    Ok(token) => {
                        debug!("Broadcast registration added for {}", guid);
                        self.broadcasts.push((guid.clone(), token));
                    }
                    Err(e) => warn!("Broadcast registration failed for {}: {}", guid, e),
                }
            }
        }
    }

    fn release_broadcasts(&mut self) {
        for (guid, token) in self.broadcasts.drain(..) {
            debug!("Broadcast registration released for {}", guid);
            self.registrar.unregister(token);
        }
    }
}
