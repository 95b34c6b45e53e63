use ble_adapter::{
    AttributeTarget, BleStack, ChangeIntent as PersistedChangeIntent, HistoricalStore, MemoryHistoricalStore, MemoryPersistedState, Op,
    PersistedDeviceState, SimulatedBleStack, StackEvent, WriteType,
};
use ble_common::{GattError, RawAddress, Uuid};
use blecentral::events::ReadWriteKind;
use blecentral::{Config, CoreEvent, DeviceState, Dispatcher, EventListener, Manager};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn addr(n: u8) -> RawAddress {
    RawAddress::from_bytes(&[0, 0, 0, 0, 0, n]).unwrap()
}

fn target(char_uuid: Uuid) -> AttributeTarget {
    AttributeTarget { service_uuid: None, char_uuid, descriptor_uuid: None }
}

#[derive(Default, Clone)]
struct RecordingListener {
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl RecordingListener {
    fn snapshot(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &CoreEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn harness() -> (Manager, UnboundedReceiver<StackEvent>, Arc<SimulatedBleStack>, RecordingListener) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let stack = Arc::new(SimulatedBleStack::new(tx));
    let listener = RecordingListener::default();
    let mut dispatcher = Dispatcher::inline();
    dispatcher.stack_mut().set(Arc::new(listener.clone()));

    let manager = Manager::new(
        Config::default(),
        stack.clone() as Arc<dyn BleStack>,
        Arc::new(MemoryPersistedState::new()),
        Arc::new(MemoryHistoricalStore::new()),
        dispatcher,
    );
    (manager, rx, stack, listener)
}

/// Drains whatever `StackEvent`s have already arrived on the channel,
/// feeding each through `handle_stack_event`, then advances one tick.
async fn pump(manager: &mut Manager, rx: &mut UnboundedReceiver<StackEvent>) {
    while let Ok(event) = rx.try_recv() {
        manager.handle_stack_event(event, tokio::time::Instant::now().into_std());
    }
    manager.on_tick(tokio::time::Instant::now().into_std());
}

async fn advance_and_pump(manager: &mut Manager, rx: &mut UnboundedReceiver<StackEvent>, by: Duration) {
    tokio::time::advance(by).await;
    pump(manager, rx).await;
}

// S1: happy-path connect drives a device from nothing to INITIALIZED.
#[tokio::test(start_paused = true)]
async fn happy_connect_reaches_initialized() {
    let (mut manager, mut rx, _stack, _listener) = harness();
    let a = addr(1);

    manager.connect(a);
    pump(&mut manager, &mut rx).await;
    for _ in 0..5 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }

    let device = manager.device(a).expect("device tracked after connect");
    assert!(device.is_initialized(), "expected device to reach INITIALIZED, state = {:?}", device.state);
}

// S2: a CRITICAL-priority disconnect preempts a lower-priority task that
// hasn't started executing yet.
#[tokio::test(start_paused = true)]
async fn critical_disconnect_preempts_queued_read() {
    let (mut manager, mut rx, stack, listener) = harness();
    let a = addr(2);

    manager.connect(a);
    pump(&mut manager, &mut rx).await;
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;

    assert!(manager.device(a).unwrap().is_connected());

    let uuid = Uuid::from_string("2a00").unwrap();
    manager.read_characteristic(a, target(uuid));
    let disconnect_id = manager.disconnect(a);

    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    let _ = stack;
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;

    assert!(disconnect_id > 0);
    let events = listener.snapshot();
    assert!(
        events.iter().any(|e| matches!(e, CoreEvent::ReadWrite(rw)
            if rw.kind == ReadWriteKind::Read && rw.status == GattError::CancelledFromDisconnect)),
        "the preempted read should terminate with an event, not silently"
    );
}

// S3: a dropped connect response times out and the scheduler retries once
// immediately with the opposite `auto_connect` flag before backing off.
#[tokio::test(start_paused = true)]
async fn timed_out_connect_retries_with_flipped_auto_connect() {
    let (mut manager, mut rx, stack, _listener) = harness();
    let a = addr(3);

    stack.drop_next_op(a, Op::Connect);
    manager.connect(a);
    pump(&mut manager, &mut rx).await;

    // Exceed the Connect task's 12s timeout so `sweep_timeouts` fires.
    advance_and_pump(&mut manager, &mut rx, Duration::from_secs(13)).await;

    let device = manager.device(a).unwrap();
    assert!(device.reconnect.retried_this_attempt || device.state.connecting_overall(), "expected immediate retry after timeout");
}

// S4: OTA runs every write in order and clears PERFORMING_OTA on completion.
#[tokio::test(start_paused = true)]
async fn ota_runs_writes_in_order_and_clears_flag() {
    let (mut manager, mut rx, _stack, _listener) = harness();
    let a = addr(4);

    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }
    assert!(manager.device(a).unwrap().is_initialized());

    let uuid = Uuid::from_string("2a01").unwrap();
    let writes = vec![vec![1u8], vec![2u8], vec![3u8]];
    manager.start_ota(a, writes, target(uuid)).expect("ota starts once initialized");
    assert!(manager.device(a).unwrap().state.contains(DeviceState::PERFORMING_OTA));

    for _ in 0..6 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }

    assert!(!manager.device(a).unwrap().state.contains(DeviceState::PERFORMING_OTA), "ota flag should clear once every write lands");
}

// S5: a notify-enable that never produces a notification falls back to a
// forced read once `notify_force_read_timeout` elapses.
#[tokio::test(start_paused = true)]
async fn stale_notification_falls_back_to_forced_read() {
    let (mut manager, mut rx, _stack, listener) = harness();
    let a = addr(5);

    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }
    assert!(manager.device(a).unwrap().is_initialized());

    let uuid = Uuid::from_string("2a02").unwrap();
    manager.set_notify(a, target(uuid), true);
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    assert!(manager.device(a).unwrap().force_read_deadline.contains_key(&uuid));

    // Let the force-read timeout elapse without ever injecting a
    // NotificationReceived event.
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(600)).await;
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;

    assert!(!manager.device(a).unwrap().force_read_deadline.contains_key(&uuid), "deadline should be consumed once the forced read fires");

    let events = listener.snapshot();
    assert!(events.iter().any(|e| matches!(e, CoreEvent::Notification(n) if n.char_uuid == uuid)), "forced read should surface as a notification");
    assert!(
        events.iter().any(|e| matches!(e, CoreEvent::ReadWrite(rw) if rw.kind == ReadWriteKind::PseudoNotification)),
        "forced read should emit a PseudoNotification, not a bare Read"
    );
}

// S6: turning BLE off mid-connect tears every connected device down to
// BLE_DISCONNECTED without crashing the scheduler.
#[tokio::test(start_paused = true)]
async fn ble_off_disconnects_every_connected_device() {
    let (mut manager, mut rx, _stack, listener) = harness();
    let a = addr(6);

    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }
    assert!(manager.device(a).unwrap().is_connected());

    let uuid = Uuid::from_string("2a03").unwrap();
    manager.write_characteristic(a, target(uuid), vec![7u8], WriteType::WithResponse);

    manager.handle_stack_event(StackEvent::AdapterStateChanged { ble_on: false }, tokio::time::Instant::now().into_std());

    let device = manager.device(a).unwrap();
    assert_eq!(device.state, DeviceState::BLE_DISCONNECTED);

    let events = listener.snapshot();
    assert!(
        events.iter().any(|e| matches!(e, CoreEvent::ReadWrite(rw) if rw.status == GattError::CancelledFromBleTurningOff)),
        "in-flight task should be cancelled with CancelledFromBleTurningOff rather than left to time out"
    );
}

// Invariant: bonding an already-bonded device resolves immediately without
// touching the native stack (idempotence).
#[tokio::test(start_paused = true)]
async fn bond_on_already_bonded_device_is_redundant() {
    let (mut manager, mut rx, stack, _listener) = harness();
    let a = addr(7);

    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }

    manager.handle_stack_event(
        StackEvent::BondStateChanged { addr: a, status: GattError::Success, bonded: true },
        tokio::time::Instant::now().into_std(),
    );
    assert!(manager.device(a).unwrap().state.contains(DeviceState::BONDED));

    let before = rx.try_recv().is_err();
    manager.bond(a);
    pump(&mut manager, &mut rx).await;
    assert!(before, "no stray events should have been pending before the redundant bond call");
    let _ = stack;
}

// Historical store: a successful characteristic read is appended.
#[tokio::test(start_paused = true)]
async fn successful_read_is_recorded_in_historical_store() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let stack = Arc::new(SimulatedBleStack::new(tx));
    let historical = Arc::new(MemoryHistoricalStore::new());
    let mut manager = Manager::new(
        Config::default(),
        stack as Arc<dyn BleStack>,
        Arc::new(MemoryPersistedState::new()),
        historical.clone() as Arc<dyn HistoricalStore>,
        Dispatcher::inline(),
    );
    let a = addr(8);
    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }
    assert!(manager.device(a).unwrap().is_initialized());

    let uuid = Uuid::from_string("2a03").unwrap();
    manager.read_characteristic(a, target(uuid));
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;

    let mut cursor = historical.cursor(a, uuid);
    assert!(cursor.move_next(), "expected one recorded read");
    assert_eq!(cursor.value().unwrap().value, vec![0xAB]);
}

// Persisted state: an explicit disconnect records intentional-disconnect
// when `manage_last_disconnect_on_disk` is enabled.
#[tokio::test(start_paused = true)]
async fn explicit_disconnect_persists_intentional_when_configured() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let stack = Arc::new(SimulatedBleStack::new(tx));
    let persisted = Arc::new(MemoryPersistedState::new());
    let mut config = Config::default();
    config.manage_last_disconnect_on_disk = true;
    let mut manager = Manager::new(
        config,
        stack as Arc<dyn BleStack>,
        persisted.clone() as Arc<dyn PersistedDeviceState>,
        Arc::new(MemoryHistoricalStore::new()),
        Dispatcher::inline(),
    );
    let a = addr(9);
    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }

    manager.disconnect(a);
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;

    assert_eq!(persisted.get(a).last_disconnect_intent, Some(PersistedChangeIntent::Intentional));
}

// Write type is forwarded unchanged through the scheduler to the stack.
#[tokio::test(start_paused = true)]
async fn write_without_response_reports_success() {
    let (mut manager, mut rx, _stack, listener) = harness();
    let a = addr(10);
    manager.connect(a);
    for _ in 0..3 {
        advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;
    }

    let uuid = Uuid::from_string("2a04").unwrap();
    manager.write_characteristic(a, target(uuid), vec![9, 9], WriteType::WithoutResponse);
    advance_and_pump(&mut manager, &mut rx, Duration::from_millis(50)).await;

    let events = listener.snapshot();
    assert!(events.iter().any(|e| matches!(e, CoreEvent::ReadWrite(rw) if rw.status == GattError::Success)));
}
