//! Device-list change notifier integration tests
//!
//! Exercises the dispatch task against mock enumerator/registrar doubles:
//! initial-set replay, debounced arrival/removal/nodes-changed handling,
//! duplicate-instance suppression, and broadcast registration lifecycle.
//!
//! Run with: `cargo test -p engine --test notifier_tests`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use engine::config::NotifierSettings;
use engine::error::NotifyError;
use engine::notifier::{
    ChangeSignal, DeviceChange, DeviceDescription, HotplugNotifier, PatternFilter, WatchCallback,
    WatcherFlags, WatcherId,
};
use engine::testing::{MockEnumerator, MockRegistrar, sample_device};

const GUID_A: &str = "{f18a0e88-c30c-11d0-8815-00a0c906bed8}";
const GUID_B: &str = "{a5dcbf10-6530-11d2-901f-00c04fb951ed}";

type Events = Arc<Mutex<Vec<(String, DeviceChange)>>>;

fn collector() -> (Events, WatchCallback) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: WatchCallback = Box::new(move |record, change| {
        sink.lock()
            .unwrap()
            .push((record.instance_id.clone(), change));
    });
    (events, callback)
}

fn fast_settings() -> NotifierSettings {
    NotifierSettings {
        arrival_debounce_ms: 20,
        removal_debounce_ms: 1,
        nodes_changed_debounce_ms: 30,
        channel_capacity: 64,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_initial_set_replay_counts_matches_once() {
    let enumerator = MockEnumerator::new(vec![
        sample_device(1, GUID_A),
        sample_device(2, GUID_A),
        sample_device(3, GUID_B),
    ]);
    let registrar = MockRegistrar::new();
    let notifier = HotplugNotifier::start(fast_settings(), enumerator, Arc::clone(&registrar));

    let (events, callback) = collector();
    notifier
        .register_watcher(
            PatternFilter::for_interface(GUID_A),
            WatcherFlags {
                notify_initial_set: true,
                ..WatcherFlags::default()
            },
            callback,
        )
        .await
        .unwrap();

    let seen = events.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|(_, change)| *change == DeviceChange::Added));
    assert_ne!(seen[0].0, seen[1].0);

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_initial_set_not_replayed_without_flag() {
    let enumerator = MockEnumerator::new(vec![sample_device(1, GUID_A)]);
    let registrar = MockRegistrar::new();
    let notifier = HotplugNotifier::start(fast_settings(), enumerator, registrar);

    let (events, callback) = collector();
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), callback)
        .await
        .unwrap();

    assert!(events.lock().unwrap().is_empty());
    notifier.shutdown().await;
}

#[tokio::test]
async fn test_devices_snapshot_after_initial_sync() {
    let enumerator = MockEnumerator::new(vec![
        sample_device(1, GUID_A),
        sample_device(2, GUID_B),
    ]);
    let registrar = MockRegistrar::new();
    let notifier = HotplugNotifier::start(fast_settings(), enumerator, registrar);

    // Awaiting a registration guarantees the task has run its initial sync.
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), |_, _| {})
        .await
        .unwrap();

    let devices = notifier.devices();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().all(|d| d.connected));

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_arrival_burst_collapses_into_one_sync() {
    let enumerator = MockEnumerator::new(vec![sample_device(1, GUID_A)]);
    let registrar = MockRegistrar::new();
    let notifier =
        HotplugNotifier::start(fast_settings(), Arc::clone(&enumerator), registrar);

    let (events, callback) = collector();
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), callback)
        .await
        .unwrap();

    let arrived = sample_device(2, GUID_A);
    enumerator.add(arrived.clone());
    let signals = notifier.signals();
    for _ in 0..3 {
        signals
            .send(ChangeSignal::Arrival {
                interface_guid: GUID_A.to_string(),
                path: arrived.symbolic_link.clone(),
            })
            .unwrap();
    }

    settle().await;
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], (arrived.instance_id.clone(), DeviceChange::Added));

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_removal_signal_dispatches_marked_record() {
    let gone = sample_device(2, GUID_A);
    let enumerator = MockEnumerator::new(vec![sample_device(1, GUID_A), gone.clone()]);
    let registrar = MockRegistrar::new();
    let notifier =
        HotplugNotifier::start(fast_settings(), Arc::clone(&enumerator), registrar);

    let (events, callback) = collector();
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), callback)
        .await
        .unwrap();

    enumerator.remove(&gone.symbolic_link);
    notifier
        .signals()
        .send(ChangeSignal::Removal {
            path: gone.symbolic_link.clone(),
        })
        .unwrap();

    settle().await;
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec![(gone.instance_id.clone(), DeviceChange::Removed)]);

    // The record survives disconnect for later re-arrival.
    assert!(notifier.devices().iter().any(|d| !d.connected));

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_empty_removal_path_degrades_to_resync() {
    let gone = sample_device(1, GUID_A);
    let enumerator = MockEnumerator::new(vec![gone.clone()]);
    let registrar = MockRegistrar::new();
    let notifier =
        HotplugNotifier::start(fast_settings(), Arc::clone(&enumerator), registrar);

    let (events, callback) = collector();
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), callback)
        .await
        .unwrap();

    enumerator.remove(&gone.symbolic_link);
    notifier
        .signals()
        .send(ChangeSignal::Removal {
            path: String::new(),
        })
        .unwrap();

    settle().await;
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec![(gone.instance_id.clone(), DeviceChange::Removed)]);

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_instance_suppressed_unless_requested() {
    // Two interfaces of the same device instance.
    let iface1 = DeviceDescription {
        symbolic_link: "\\\\?\\usb#vid_1234&pid_0001#sn1#iface0".to_string(),
        instance_id: "USB\\VID_1234&PID_0001\\SN1".to_string(),
        interface_guid: GUID_A.to_string(),
    };
    let iface2 = DeviceDescription {
        symbolic_link: "\\\\?\\usb#vid_1234&pid_0001#sn1#iface1".to_string(),
        instance_id: "USB\\VID_1234&PID_0001\\SN1".to_string(),
        interface_guid: GUID_A.to_string(),
    };

    let enumerator = MockEnumerator::new(Vec::new());
    let registrar = MockRegistrar::new();
    let notifier =
        HotplugNotifier::start(fast_settings(), Arc::clone(&enumerator), registrar);

    let (plain_events, plain_callback) = collector();
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), plain_callback)
        .await
        .unwrap();

    let (dupe_events, dupe_callback) = collector();
    notifier
        .register_watcher(
            PatternFilter::any(),
            WatcherFlags {
                pass_duplicate_instance: true,
                ..WatcherFlags::default()
            },
            dupe_callback,
        )
        .await
        .unwrap();

    enumerator.add(iface1);
    enumerator.add(iface2);
    notifier
        .signals()
        .send(ChangeSignal::Arrival {
            interface_guid: GUID_A.to_string(),
            path: "ignored".to_string(),
        })
        .unwrap();

    settle().await;
    // The instance is reported once per pass; only the watcher that asked
    // for duplicates sees both interfaces.
    assert_eq!(plain_events.lock().unwrap().len(), 1);
    assert_eq!(dupe_events.lock().unwrap().len(), 2);

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_watcher_filters_limit_dispatch() {
    let enumerator = MockEnumerator::new(Vec::new());
    let registrar = MockRegistrar::new();
    let notifier =
        HotplugNotifier::start(fast_settings(), Arc::clone(&enumerator), registrar);

    let (events, callback) = collector();
    notifier
        .register_watcher(
            PatternFilter::for_interface(GUID_B),
            WatcherFlags::default(),
            callback,
        )
        .await
        .unwrap();

    enumerator.add(sample_device(1, GUID_A));
    let wanted = sample_device(2, GUID_B);
    enumerator.add(wanted.clone());
    notifier.signals().send(ChangeSignal::NodesChanged).unwrap();

    settle().await;
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec![(wanted.instance_id.clone(), DeviceChange::Added)]);

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_nodes_changed_registers_new_broadcast_guids() {
    let enumerator = MockEnumerator::new(vec![sample_device(1, GUID_A)]);
    let registrar = MockRegistrar::new();
    let notifier = HotplugNotifier::start(
        fast_settings(),
        Arc::clone(&enumerator),
        Arc::clone(&registrar),
    );

    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), |_, _| {})
        .await
        .unwrap();
    assert_eq!(registrar.active_guids(), vec![GUID_A.to_string()]);

    // A second watcher over the same GUID does not duplicate the
    // registration.
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), |_, _| {})
        .await
        .unwrap();
    assert_eq!(registrar.active_guids().len(), 1);

    enumerator.add(sample_device(2, GUID_B));
    notifier.signals().send(ChangeSignal::NodesChanged).unwrap();
    settle().await;

    let guids = registrar.active_guids();
    assert_eq!(guids.len(), 2);
    assert!(guids.contains(&GUID_B.to_string()));

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_unregister_stops_callbacks() {
    let enumerator = MockEnumerator::new(Vec::new());
    let registrar = MockRegistrar::new();
    let notifier =
        HotplugNotifier::start(fast_settings(), Arc::clone(&enumerator), registrar);

    let (events, callback) = collector();
    let id = notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), callback)
        .await
        .unwrap();
    notifier.unregister(id).await.unwrap();

    enumerator.add(sample_device(1, GUID_A));
    notifier.signals().send(ChangeSignal::NodesChanged).unwrap();
    settle().await;

    assert!(events.lock().unwrap().is_empty());

    let err = notifier.unregister(WatcherId(999)).await.unwrap_err();
    assert!(matches!(err, NotifyError::UnknownWatcher(999)));

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_unregister_all_releases_broadcasts_but_keeps_service() {
    let enumerator = MockEnumerator::new(vec![sample_device(1, GUID_A)]);
    let registrar = MockRegistrar::new();
    let notifier = HotplugNotifier::start(
        fast_settings(),
        Arc::clone(&enumerator),
        Arc::clone(&registrar),
    );

    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), |_, _| {})
        .await
        .unwrap();
    assert_eq!(registrar.active_guids().len(), 1);

    notifier.unregister_all().await.unwrap();
    assert!(registrar.active_guids().is_empty());

    // Still running: a fresh registration re-registers its broadcast.
    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), |_, _| {})
        .await
        .unwrap();
    assert_eq!(registrar.active_guids().len(), 1);

    notifier.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_releases_broadcasts() {
    let enumerator = MockEnumerator::new(vec![sample_device(1, GUID_A)]);
    let registrar = MockRegistrar::new();
    let notifier = HotplugNotifier::start(
        fast_settings(),
        enumerator,
        Arc::clone(&registrar),
    );

    notifier
        .register_watcher(PatternFilter::any(), WatcherFlags::default(), |_, _| {})
        .await
        .unwrap();
    assert_eq!(registrar.active_guids().len(), 1);

    notifier.shutdown().await;
    assert!(registrar.active_guids().is_empty());
}
