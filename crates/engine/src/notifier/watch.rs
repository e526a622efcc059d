//! Watcher registrations and pattern filters

use common::glob_match;

use super::inventory::DeviceRecord;

/// What happened to a device in the most recent pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChange {
    Added,
    Removed,
}

/// Identifier of a registered watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId(pub u64);

/// Optional glob filters over device identity. Every provided filter must
/// match; an empty filter set matches everything.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    pub instance_id: Option<String>,
    pub interface_guid: Option<String>,
    pub symbolic_link: Option<String>,
}

impl PatternFilter {
    /// A filter that matches every device.
    pub fn any() -> Self {
        Self::default()
    }

    /// Match only devices exposing the given interface GUID.
    pub fn for_interface(guid: impl Into<String>) -> Self {
        Self {
            interface_guid: Some(guid.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        if let Some(pattern) = &self.instance_id
            && !glob_match(pattern, &record.instance_id)
        {
            return false;
        }
        if let Some(pattern) = &self.interface_guid
            && !glob_match(pattern, &record.interface_guid)
        {
            return false;
        }
        if let Some(pattern) = &self.symbolic_link
            && !glob_match(pattern, &record.symbolic_link)
        {
            return false;
        }
        true
    }
}

/// Behavior flags for a watcher registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatcherFlags {
    /// Replay the currently connected matching set as `Added` right after
    /// registration.
    pub notify_initial_set: bool,
    /// Receive a device instance even when an earlier watcher in the same
    /// pass already claimed it.
    pub pass_duplicate_instance: bool,
}

/// Callback invoked on the dispatch task for each matching change.
pub type WatchCallback = Box<dyn Fn(&DeviceRecord, DeviceChange) + Send + 'static>;

pub(crate) struct Watcher {
    pub(crate) id: WatcherId,
    pub(crate) filter: PatternFilter,
    pub(crate) flags: WatcherFlags,
    pub(crate) callback: WatchCallback,
}
