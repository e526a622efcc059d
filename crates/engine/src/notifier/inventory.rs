//! Device inventory and diff computation
//!
//! Records persist across disconnect so a removal can still be matched and
//! reported, and a later arrival of the same interface flips the record back
//! to `Added` instead of inventing a new one. Diff flags are written during
//! a sync pass (under the inventory lock) and cleared in a second pass only
//! after every watcher has been notified.

use tracing::debug;

use common::glob_match;

/// Identity of one system device interface as reported by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub symbolic_link: String,
    pub instance_id: String,
    pub interface_guid: String,
}

/// Diff state computed by the most recent sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncFlag {
    #[default]
    Unchanged,
    Added,
    Removed,
}

/// One tracked device interface.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub symbolic_link: String,
    pub instance_id: String,
    pub interface_guid: String,
    pub connected: bool,
    pub sync_flag: SyncFlag,
}

/// Ordered collection of device records. Mutated only under its owner's
/// lock; the dispatcher reads a snapshot after the lock is released.
#[derive(Debug, Default)]
pub struct DeviceInventory {
    records: Vec<DeviceRecord>,
}

impl DeviceInventory {
    pub fn records(&self) -> &[DeviceRecord] {
        &self.records
    }

    /// Re-sync against the live device set, marking each record's diff flag.
    pub fn sync(&mut self, live: &[DeviceDescription]) {
        for record in &mut self.records {
            let present = live
                .iter()
                .any(|d| d.symbolic_link.eq_ignore_ascii_case(&record.symbolic_link));
            record.sync_flag = match (record.connected, present) {
                (true, true) => SyncFlag::Unchanged,
                (true, false) => {
                    record.connected = false;
                    SyncFlag::Removed
                }
                (false, true) => {
                    record.connected = true;
                    SyncFlag::Added
                }
                (false, false) => SyncFlag::Unchanged,
            };
        }

        for desc in live {
            let known = self
                .records
                .iter()
                .any(|r| r.symbolic_link.eq_ignore_ascii_case(&desc.symbolic_link));
            if !known {
                self.records.push(DeviceRecord {
                    symbolic_link: desc.symbolic_link.clone(),
                    instance_id: desc.instance_id.clone(),
                    interface_guid: desc.interface_guid.clone(),
                    connected: true,
                    sync_flag: SyncFlag::Added,
                });
            }
        }

        let added = self.count(SyncFlag::Added);
        let removed = self.count(SyncFlag::Removed);
        debug!(
            "Inventory sync pass: {} record(s), {} added, {} removed",
            self.records.len(),
            added,
            removed
        );
    }

    /// Mark the first connected record whose symbolic link matches the
    /// removal path. The record's link is the pattern; in practice this is
    /// an exact, case-folded comparison. Returns whether anything matched.
    pub fn mark_removed(&mut self, path: &str) -> bool {
        for record in &mut self.records {
            if !record.connected {
                continue;
            }
            if glob_match(&record.symbolic_link, path) {
                record.sync_flag = SyncFlag::Removed;
                record.connected = false;
                return true;
            }
        }
        false
    }

    /// Clear diff flags after a dispatch pass.
    pub fn clear_sync_flags(&mut self) {
        for record in &mut self.records {
            record.sync_flag = SyncFlag::Unchanged;
        }
    }

    fn count(&self, flag: SyncFlag) -> usize {
        self.records.iter().filter(|r| r.sync_flag == flag).count()
    }
}
