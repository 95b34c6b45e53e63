use crate::config::Config;
use crate::crash_resolver::CrashResolver;
use crate::device::{Device, DeviceState};
use crate::events::{
    BondEvent, ChangeIntent, ConnectFailEvent, CoreEvent, DiscoveryEvent, DiscoveryLifecycle, NotificationEvent,
    ReadWriteEvent, ReadWriteKind, StateChangeEvent,
};
use crate::listener::Dispatcher;
use crate::queue::TaskQueue;
use crate::reconnect::{self, ReconnectDecision};
use crate::task::{Task, TaskId, TaskKind, TaskState};
use crate::transaction::{Transaction, TransactionKind};
use ble_adapter::{AttributeTarget, BleStack, ChangeIntent as PersistedChangeIntent, HistoricalStore, PersistedDeviceState, StackEvent, WriteType};
use ble_common::{GattError, RawAddress};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// The coordinator: owns the task queue, every known device, the adapter,
/// and global configuration. All mutation happens through `&mut self`
/// methods called from the single update worker (see `run` in this crate's
/// top-level docs) — there is no internal locking, by design.
pub struct Manager {
    pub config: Config,
    stack: Arc<dyn BleStack>,
    devices: HashMap<RawAddress, Device>,
    queue: TaskQueue,
    ble_on: bool,
    dispatcher: Dispatcher,
    transactions: HashMap<RawAddress, Transaction>,
    transaction_task: HashMap<RawAddress, TaskId>,
    configured_auth: HashMap<RawAddress, Vec<TaskKind>>,
    configured_init: HashMap<RawAddress, Vec<TaskKind>>,
    crash_resolver: CrashResolver,
    crash_resolver_task: Option<TaskId>,
    persisted: Arc<dyn PersistedDeviceState>,
    historical: Arc<dyn HistoricalStore>,
    forced_reads: HashSet<TaskId>,
}

impl Manager {
    pub fn new(
        config: Config,
        stack: Arc<dyn BleStack>,
        persisted: Arc<dyn PersistedDeviceState>,
        historical: Arc<dyn HistoricalStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        Manager {
            config,
            stack,
            devices: HashMap::new(),
            queue: TaskQueue::new(),
            ble_on: true,
            dispatcher,
            transactions: HashMap::new(),
            transaction_task: HashMap::new(),
            configured_auth: HashMap::new(),
            configured_init: HashMap::new(),
            crash_resolver: CrashResolver::new(),
            crash_resolver_task: None,
            persisted,
            historical,
            forced_reads: HashSet::new(),
        }
    }

    pub fn device(&self, addr: RawAddress) -> Option<&Device> {
        self.devices.get(&addr)
    }

    fn device_mut(&mut self, addr: RawAddress) -> &mut Device {
        let read_w = self.config.n_for_average_running_read_time;
        let write_w = self.config.n_for_average_running_write_time;
        self.devices.entry(addr).or_insert_with(|| Device::new(addr, read_w, write_w))
    }

    fn dispatch(&self, event: CoreEvent) {
        self.dispatcher.dispatch(event);
    }

    // ---- application-facing API -----------------------------------------

    pub fn connect(&mut self, addr: RawAddress) -> TaskId {
        self.connect_with_transactions(addr, None, None)
    }

    pub fn connect_with_transactions(
        &mut self,
        addr: RawAddress,
        auth_steps: Option<Vec<TaskKind>>,
        init_steps: Option<Vec<TaskKind>>,
    ) -> TaskId {
        if let Some(steps) = auth_steps {
            self.configured_auth.insert(addr, steps);
        }
        if let Some(steps) = init_steps {
            self.configured_init.insert(addr, steps);
        }
        self.device_mut(addr);
        let result = self.queue.enqueue(TaskKind::Connect { auto_connect: false }, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    pub fn disconnect(&mut self, addr: RawAddress) -> TaskId {
        let result = self.queue.enqueue(TaskKind::Disconnect, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    pub fn read_characteristic(&mut self, addr: RawAddress, target: AttributeTarget) -> TaskId {
        let result = self.queue.enqueue(TaskKind::Read { target }, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    pub fn write_characteristic(&mut self, addr: RawAddress, target: AttributeTarget, value: Vec<u8>, write_type: WriteType) -> TaskId {
        let result = self.queue.enqueue(TaskKind::Write { target, value, write_type }, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    pub fn set_notify(&mut self, addr: RawAddress, target: AttributeTarget, enabled: bool) -> TaskId {
        let result = self.queue.enqueue(TaskKind::SetNotify { target, enable: enabled }, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    pub fn read_rssi(&mut self, addr: RawAddress) -> TaskId {
        let result = self.queue.enqueue(TaskKind::ReadRssi, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    /// Idempotent: if the device is already BONDED, resolves `redundant()`
    /// immediately without a native call.
    pub fn bond(&mut self, addr: RawAddress) -> TaskId {
        if self.device_mut(addr).state.contains(DeviceState::BONDED) {
            let result = self.queue.enqueue(TaskKind::Bond, Some(addr));
            let id = result.new_task;
            self.queue.finish(id, TaskState::Redundant);
            return id;
        }
        let result = self.queue.enqueue(TaskKind::Bond, Some(addr));
        self.apply_enqueue_result(result, addr)
    }

    pub fn start_ota(&mut self, addr: RawAddress, writes: Vec<Vec<u8>>, target: AttributeTarget) -> Result<(), GattError> {
        if !self.device_mut(addr).is_initialized() {
            return Err(GattError::NotConnected);
        }
        let steps: Vec<TaskKind> =
            writes.into_iter().map(|v| TaskKind::Write { target, value: v, write_type: WriteType::WithResponse }).collect();
        let mut txn = Transaction::new(TransactionKind::Ota, steps);
        let first = txn.start();
        self.transactions.insert(addr, txn);
        let d = self.device_mut(addr);
        d.state.insert(DeviceState::PERFORMING_OTA);
        if let Some(kind) = first {
            let result = self.queue.enqueue(kind, Some(addr));
            self.transaction_task.insert(addr, result.new_task);
        }
        Ok(())
    }

    /// One-shot CRITICAL-priority request to flush the native stack. Bails
    /// out with `Busy` if a flush is already running.
    pub fn force_crash_resolver_flush(&mut self) -> Result<TaskId, GattError> {
        if let Err(e) = self.crash_resolver.try_start() {
            log::debug!("crash resolver flush requested while one is already running");
            return Err(e);
        }
        let result = self.queue.enqueue(TaskKind::CrashResolver, None);
        let id = self.apply_enqueue_result(result, RawAddress::empty());
        self.crash_resolver_task = Some(id);
        Ok(id)
    }

    fn apply_enqueue_result(&mut self, result: crate::queue::EnqueueResult, addr: RawAddress) -> TaskId {
        // Whichever of `TurnBleOff`/`Disconnect` just got enqueued is the
        // only thing that ever cancels another task (see
        // `Task::is_cancellable_by`), so its kind tells us which status the
        // cancelled tasks actually failed with.
        let cancel_status = match self.queue.get(result.new_task).map(|t| &t.kind) {
            Some(TaskKind::TurnBleOff) => GattError::CancelledFromBleTurningOff,
            _ => GattError::CancelledFromDisconnect,
        };
        for task in result.cancelled {
            let task_addr = task.device.unwrap_or(addr);
            self.emit_read_write(&task, task_addr, cancel_status, vec![]);
        }
        if let Some(preempted) = result.preempt {
            if let Some(task) = self.queue.finish(preempted, TaskState::Interrupted) {
                let task_addr = task.device.unwrap_or(addr);
                self.emit_read_write(&task, task_addr, cancel_status, vec![]);
            }
        }
        result.new_task
    }

    // ---- update loop ------------------------------------------------------

    /// Advances the scheduler by one tick: resolves expired deadlines,
    /// fires any due reconnect attempts, then starts the next runnable
    /// task if the executor is free.
    pub fn on_tick(&mut self, now: Instant) {
        let timed_out = self.queue.sweep_timeouts(now);
        for id in timed_out {
            self.on_task_timed_out(id, now);
        }

        self.fire_due_reconnects(now);
        self.sweep_stale_notifications(now);

        let devices = &self.devices;
        if let Some(id) = self.queue.pop_next_runnable(now, self.ble_on, |addr| devices.get(&addr).map(Device::is_connected).unwrap_or(false)) {
            self.execute_task(id);
        }
    }

    fn fire_due_reconnects(&mut self, now: Instant) {
        // `devices` iterates in unspecified HashMap order; sort so that
        // which device gets the scheduler's attention first doesn't depend
        // on hash bucket placement.
        let due: Vec<RawAddress> = self
            .devices
            .iter()
            .filter(|(_, d)| {
                d.state.intersects(DeviceState::RECONNECTING_SHORT_TERM | DeviceState::RECONNECTING_LONG_TERM)
                    && d.reconnect.next_permitted_attempt.map(|t| now >= t).unwrap_or(false)
            })
            .map(|(addr, _)| *addr)
            .sorted_by_key(|addr| addr.to_string())
            .collect();

        for addr in due {
            let already_queued = self
                .queue
                .executing_id()
                .and_then(|id| self.queue.get(id))
                .map(|t| t.device == Some(addr) && matches!(t.kind, TaskKind::Connect { .. }))
                .unwrap_or(false);
            if already_queued {
                continue;
            }
            let result = self.queue.enqueue(TaskKind::Connect { auto_connect: true }, Some(addr));
            self.apply_enqueue_result(result, addr);
        }
    }

    fn execute_task(&mut self, id: TaskId) {
        let (kind, device) = match self.queue.get(id) {
            Some(t) => (t.kind.clone(), t.device),
            None => return,
        };

        match &kind {
            TaskKind::TurnBleOn => {
                self.ble_on = true;
                self.finish_simple(id, TaskState::Succeeded);
            }
            TaskKind::TurnBleOff => {
                self.ble_on = false;
                self.finish_simple(id, TaskState::Succeeded);
                self.on_ble_turned_off(Instant::now());
            }
            TaskKind::Scan => {
                self.stack.start_scan(ble_adapter::ScanParams { active: true });
                self.finish_simple(id, TaskState::Succeeded);
            }
            TaskKind::Connect { auto_connect } => {
                if let Some(addr) = device {
                    let d = self.device_mut(addr);
                    d.state.insert(DeviceState::BLE_CONNECTING);
                    self.stack.connect(addr, *auto_connect);
                }
            }
            TaskKind::Disconnect => {
                if let Some(addr) = device {
                    if let Some(handle) = self.device_mut(addr).handle {
                        self.stack.disconnect(handle);
                    } else {
                        self.finish_simple(id, TaskState::Succeeded);
                        self.on_device_disconnected(addr, GattError::Success, true, Instant::now());
                    }
                }
            }
            TaskKind::DiscoverServices => {
                if let (Some(addr), Some(handle)) = (device, device.and_then(|a| self.devices.get(&a).and_then(|d| d.handle))) {
                    self.device_mut(addr).state.insert(DeviceState::DISCOVERING_SERVICES);
                    self.stack.discover_services(handle);
                }
            }
            TaskKind::Bond => {
                if let Some(addr) = device {
                    self.device_mut(addr).state.insert(DeviceState::BONDING);
                    self.stack.create_bond(addr);
                }
            }
            TaskKind::Unbond => {
                if let Some(addr) = device {
                    self.stack.remove_bond(addr);
                }
            }
            TaskKind::Read { target } => self.with_handle(device, id, |stack, handle| stack.read_characteristic(handle, *target)),
            TaskKind::Write { target, value, write_type } => {
                self.with_handle(device, id, |stack, handle| stack.write_characteristic(handle, *target, value.clone(), *write_type))
            }
            TaskKind::ReadDescriptor { target } => self.with_handle(device, id, |stack, handle| stack.read_descriptor(handle, *target)),
            TaskKind::WriteDescriptor { target, value } => {
                self.with_handle(device, id, |stack, handle| stack.write_descriptor(handle, *target, value.clone()))
            }
            TaskKind::SetNotify { target, enable } => {
                self.with_handle(device, id, |stack, handle| stack.set_notify(handle, *target, *enable))
            }
            TaskKind::ReadRssi => self.with_handle(device, id, |stack, handle| stack.read_rssi(handle)),
            TaskKind::SetMtu { mtu } => self.with_handle(device, id, |stack, handle| stack.request_mtu(handle, *mtu)),
            TaskKind::SetConnectionPriority { priority } => {
                self.with_handle(device, id, |stack, handle| stack.request_connection_priority(handle, *priority))
            }
            TaskKind::SetPhy { tx, rx } => self.with_handle(device, id, |stack, handle| stack.set_phy(handle, *tx, *rx)),
            TaskKind::ReadPhy => self.with_handle(device, id, |stack, handle| stack.read_phy(handle)),
            TaskKind::ReliableWriteBegin => self.with_handle(device, id, |stack, handle| stack.begin_reliable_write(handle)),
            TaskKind::ReliableWriteExecute => self.with_handle(device, id, |stack, handle| stack.execute_reliable_write(handle)),
            TaskKind::ReliableWriteAbort => self.with_handle(device, id, |stack, handle| stack.abort_reliable_write(handle)),
            TaskKind::CrashResolver => self.stack.force_crash_resolver_flush(),
        }
    }

    fn with_handle(&mut self, device: Option<RawAddress>, id: TaskId, f: impl FnOnce(&Arc<dyn BleStack>, ble_adapter::GattHandle)) {
        let handle = device.and_then(|a| self.devices.get(&a).and_then(|d| d.handle));
        match handle {
            Some(h) => f(&self.stack, h),
            None => self.finish_simple(id, TaskState::Failed),
        }
    }

    fn finish_simple(&mut self, id: TaskId, state: TaskState) {
        self.queue.finish(id, state);
    }

    fn on_task_timed_out(&mut self, id: TaskId, now: Instant) {
        let task = match self.queue.get(id) {
            Some(t) => t.clone(),
            None => return,
        };
        match (&task.kind, task.device) {
            (TaskKind::Connect { auto_connect }, Some(addr)) => {
                self.on_connect_outcome(addr, GattError::TimedOut, *auto_connect, now);
            }
            (_, Some(addr)) => {
                self.emit_read_write(&task, addr, GattError::TimedOut, vec![]);
            }
            _ => {}
        }
    }

    // ---- native event handling ---------------------------------------------

    pub fn handle_stack_event(&mut self, event: StackEvent, now: Instant) {
        match event {
            StackEvent::DeviceFound { addr, rssi, adv_data } => self.on_device_found(addr, rssi, adv_data, now),
            StackEvent::Connected { addr, handle } => self.on_connected(addr, handle, now),
            StackEvent::ConnectFailed { addr, status } => {
                let auto_connect = self.queue.executing_id().and_then(|id| self.queue.get(id)).map(|t| {
                    matches!(t.kind, TaskKind::Connect { auto_connect: true })
                }).unwrap_or(false);
                if let Some(id) = self.queue.executing_id() {
                    self.queue.finish(id, TaskState::Failed);
                }
                self.on_connect_outcome(addr, status, auto_connect, now);
            }
            StackEvent::Disconnected { addr, status } => {
                let explicit = self
                    .queue
                    .executing_id()
                    .and_then(|id| self.queue.get(id))
                    .map(|t| t.device == Some(addr) && matches!(t.kind, TaskKind::Disconnect))
                    .unwrap_or(false);
                if explicit {
                    if let Some(id) = self.queue.executing_id() {
                        self.queue.finish(id, TaskState::Succeeded);
                    }
                }
                self.on_device_disconnected(addr, status, explicit, now);
            }
            StackEvent::ServicesDiscovered { addr, status } => self.on_services_discovered(addr, status, now),
            StackEvent::CharacteristicRead { addr, target, status, value } => {
                self.resolve_matching_task(addr, ReadWriteKind::Read, status, value, target, now)
            }
            StackEvent::CharacteristicWritten { addr, target, status } => {
                self.resolve_matching_task(addr, ReadWriteKind::Write, status, vec![], target, now)
            }
            StackEvent::DescriptorRead { addr, target, status, value } => {
                self.resolve_matching_task(addr, ReadWriteKind::Read, status, value, target, now)
            }
            StackEvent::DescriptorWritten { addr, target, status } => {
                self.resolve_matching_task(addr, ReadWriteKind::Write, status, vec![], target, now)
            }
            StackEvent::NotificationStateChanged { addr, target, status, enabled } => {
                self.on_notify_state_changed(addr, target, status, enabled, now)
            }
            StackEvent::NotificationReceived { addr, target, value } => self.on_notification_received(addr, target, value),
            StackEvent::RssiRead { addr, status, rssi } => {
                if status.is_success() {
                    self.device_mut(addr).rssi = Some(rssi);
                }
                self.resolve_matching_task(addr, ReadWriteKind::Rssi, status, vec![rssi as u8], empty_target(), now);
            }
            StackEvent::MtuChanged { addr, status, mtu } => {
                if status.is_success() {
                    self.device_mut(addr).mtu = mtu;
                }
                self.resolve_matching_task(addr, ReadWriteKind::Mtu, status, vec![], empty_target(), now);
            }
            StackEvent::ConnectionPriorityChanged { addr, status } => {
                self.resolve_matching_task(addr, ReadWriteKind::ConnectionPriority, status, vec![], empty_target(), now)
            }
            StackEvent::PhyChanged { addr, status, .. } => {
                self.resolve_matching_task(addr, ReadWriteKind::PhyOptions, status, vec![], empty_target(), now)
            }
            StackEvent::ReliableWriteCompleted { addr, status } => {
                let step = self
                    .queue
                    .executing_id()
                    .and_then(|id| self.queue.get(id))
                    .map(|t| t.kind.clone());
                let kind = match step {
                    Some(TaskKind::ReliableWriteBegin) => ReadWriteKind::ReliableWriteBegin,
                    Some(TaskKind::ReliableWriteAbort) => ReadWriteKind::ReliableWriteAbort,
                    _ => ReadWriteKind::ReliableWriteExecute,
                };
                let current = self.devices.get(&addr).map(|d| d.reliable_write).unwrap_or(crate::device::ReliableWriteState::None);
                let new_state = match (&step, status.is_success()) {
                    (Some(TaskKind::ReliableWriteBegin), true) => crate::device::ReliableWriteState::Open,
                    (Some(TaskKind::ReliableWriteAbort), _) | (Some(TaskKind::ReliableWriteExecute), true) => {
                        crate::device::ReliableWriteState::None
                    }
                    _ => current,
                };
                self.device_mut(addr).reliable_write = new_state;
                self.resolve_matching_task(addr, kind, status, vec![], empty_target(), now)
            }
            StackEvent::BondStateChanged { addr, status, bonded } => self.on_bond_state_changed(addr, status, bonded, now),
            StackEvent::AdapterStateChanged { ble_on } => {
                self.ble_on = ble_on;
                if !ble_on {
                    self.on_ble_turned_off(now);
                }
            }
            StackEvent::CrashResolverFlushed { status } => {
                self.crash_resolver.finish();
                if let Some(id) = self.crash_resolver_task.take() {
                    let state = if status.is_success() { TaskState::Succeeded } else { TaskState::Failed };
                    self.queue.finish(id, state);
                }
            }
        }
    }

    fn on_device_found(&mut self, addr: RawAddress, rssi: i8, adv_data: Vec<u8>, now: Instant) {
        let record = ble_common::ScanRecord::parse(&adv_data);
        let d = self.device_mut(addr);
        let lifecycle = if d.state.contains(DeviceState::UNDISCOVERED) || d.last_seen.is_none() {
            DiscoveryLifecycle::Discovered
        } else {
            DiscoveryLifecycle::Rediscovered
        };
        d.state.remove(DeviceState::UNDISCOVERED);
        d.state.insert(DeviceState::DISCOVERED);
        d.last_seen = Some(now);
        d.rssi = Some(rssi);
        d.last_scan_record = Some(record);
        self.dispatch(CoreEvent::Discovery(DiscoveryEvent { addr, lifecycle }));
    }

    fn on_connected(&mut self, addr: RawAddress, handle: ble_adapter::GattHandle, now: Instant) {
        let prev = {
            let d = self.device_mut(addr);
            let prev = d.state.bits();
            d.handle = Some(handle);
            d.state.remove(DeviceState::BLE_CONNECTING | DeviceState::RECONNECTING_SHORT_TERM | DeviceState::RECONNECTING_LONG_TERM);
            d.state.insert(DeviceState::BLE_CONNECTED);
            d.reconnect.reset();
            prev
        };
        if let Some(id) = self.queue.executing_id() {
            if self.queue.get(id).map(|t| t.device == Some(addr) && matches!(t.kind, TaskKind::Connect { .. })).unwrap_or(false) {
                self.queue.finish(id, TaskState::Succeeded);
            }
        }
        self.notify_state_change(addr, prev, ChangeIntent::Intentional);
        let result = self.queue.enqueue(TaskKind::DiscoverServices, Some(addr));
        self.apply_enqueue_result(result, addr);
    }

    fn on_connect_outcome(&mut self, addr: RawAddress, status: GattError, auto_connect_used: bool, now: Instant) {
        let highest = self.devices.get(&addr).map(|d| d.state.bits()).unwrap_or(0);
        let event = ConnectFailEvent {
            addr,
            status,
            highest_state_reached: highest,
            bond_failure_reason: None,
            auto_connect_used,
            txn_failure_reason: None,
        };
        let config = self.config.clone();
        let d = self.device_mut(addr);
        let decision = reconnect::on_connect_fail(&mut d.reconnect, &config, &event, now);

        match decision {
            ReconnectDecision::RetryNow { auto_connect } => {
                let result = self.queue.enqueue(TaskKind::Connect { auto_connect }, Some(addr));
                self.apply_enqueue_result(result, addr);
            }
            ReconnectDecision::RetryAfter { delay } => {
                let prev = {
                    let d = self.device_mut(addr);
                    let prev = d.state.bits();
                    d.state.remove(DeviceState::BLE_CONNECTING);
                    if d.reconnect.in_long_term {
                        d.state.remove(DeviceState::RECONNECTING_SHORT_TERM);
                        d.state.insert(DeviceState::RECONNECTING_LONG_TERM);
                    } else {
                        d.state.insert(DeviceState::RECONNECTING_SHORT_TERM);
                    }
                    d.reconnect.next_permitted_attempt = Some(now + delay);
                    prev
                };
                self.notify_state_change(addr, prev, ChangeIntent::Unintentional);
            }
            ReconnectDecision::GiveUp => {
                log::warn!("giving up reconnecting to {} after repeated failures (last status {:?})", addr, status);
                let prev = {
                    let d = self.device_mut(addr);
                    let prev = d.state.bits();
                    d.state = DeviceState::BLE_DISCONNECTED;
                    d.handle = None;
                    d.reconnect.reset();
                    prev
                };
                self.notify_state_change(addr, prev, ChangeIntent::Unintentional);
                self.dispatch(CoreEvent::ConnectFail(event));
            }
        }
    }

    fn on_device_disconnected(&mut self, addr: RawAddress, status: GattError, explicit: bool, now: Instant) {
        let was_initialized_or_connecting = self
            .devices
            .get(&addr)
            .map(|d| d.is_initialized() || d.state.connecting_overall() || d.is_connected())
            .unwrap_or(false);

        if explicit {
            let prev = {
                let d = self.device_mut(addr);
                let prev = d.state.bits();
                d.state = DeviceState::BLE_DISCONNECTED;
                d.handle = None;
                d.reconnect.reset();
                prev
            };
            if self.config.manage_last_disconnect_on_disk {
                self.persisted.set_last_disconnect_intent(addr, PersistedChangeIntent::Intentional);
            }
            self.notify_state_change(addr, prev, ChangeIntent::Intentional);
            return;
        }

        if was_initialized_or_connecting {
            if self.config.manage_last_disconnect_on_disk {
                self.persisted.set_last_disconnect_intent(addr, PersistedChangeIntent::Unintentional);
            }
            self.on_connect_outcome(addr, if status.is_success() { GattError::RogueDisconnect } else { status }, false, now);
        }
    }

    fn on_services_discovered(&mut self, addr: RawAddress, status: GattError, now: Instant) {
        if !status.is_success() {
            self.on_connect_outcome(addr, status, false, now);
            return;
        }
        let prev = {
            let d = self.device_mut(addr);
            let prev = d.state.bits();
            d.state.remove(DeviceState::DISCOVERING_SERVICES);
            d.state.insert(DeviceState::SERVICES_DISCOVERED);
            prev
        };
        self.notify_state_change(addr, prev, ChangeIntent::Intentional);

        if let Some(steps) = self.configured_auth.remove(&addr) {
            self.begin_transaction(addr, TransactionKind::Auth, steps);
        } else if let Some(steps) = self.configured_init.remove(&addr) {
            self.begin_transaction(addr, TransactionKind::Init, steps);
        } else {
            self.mark_initialized(addr, now);
        }
    }

    fn begin_transaction(&mut self, addr: RawAddress, kind: TransactionKind, steps: Vec<TaskKind>) {
        let bit = match kind {
            TransactionKind::Auth => DeviceState::AUTHENTICATING,
            TransactionKind::Init => DeviceState::INITIALIZING,
            TransactionKind::Ota => DeviceState::PERFORMING_OTA,
            TransactionKind::UserCustom => DeviceState::empty(),
        };
        let mut txn = Transaction::new(kind, steps);
        let first = txn.start();
        self.transactions.insert(addr, txn);
        self.device_mut(addr).state.insert(bit);
        if let Some(step) = first {
            let result = self.queue.enqueue(step, Some(addr));
            self.transaction_task.insert(addr, result.new_task);
        }
    }

    fn mark_initialized(&mut self, addr: RawAddress, _now: Instant) {
        let prev = {
            let d = self.device_mut(addr);
            let prev = d.state.bits();
            d.state.insert(DeviceState::INITIALIZED);
            prev
        };
        self.notify_state_change(addr, prev, ChangeIntent::Intentional);
    }

    fn resolve_matching_task(&mut self, addr: RawAddress, kind: ReadWriteKind, status: GattError, value: Vec<u8>, target: AttributeTarget, now: Instant) {
        let exec_id = match self.queue.executing_id() {
            Some(id) if self.queue.get(id).map(|t| t.device == Some(addr)).unwrap_or(false) => id,
            _ => return,
        };
        let task = self.queue.get(exec_id).cloned().unwrap();
        let state = if status.is_success() { TaskState::Succeeded } else { TaskState::Failed };
        self.queue.finish(exec_id, state);

        // A forced read fired by `sweep_stale_notifications` stands in for a
        // notification the peripheral never pushed; surface it as one
        // rather than as an app-visible `Read`.
        let is_forced_read = self.forced_reads.remove(&exec_id);
        let effective_kind = if is_forced_read { ReadWriteKind::PseudoNotification } else { kind };

        if status.is_success() {
            if let Some(txn_id) = self.transaction_task.get(&addr).copied() {
                if txn_id == exec_id {
                    self.advance_transaction(addr, now);
                    return;
                }
            }
            if matches!(kind, ReadWriteKind::Read | ReadWriteKind::Write) {
                let elapsed = task.started_at.map(|s| now.duration_since(s)).unwrap_or_default();
                let d = self.device_mut(addr);
                d.latest_values.insert(target.char_uuid, value.clone());
                match kind {
                    ReadWriteKind::Read => d.read_time_avg.push(elapsed),
                    ReadWriteKind::Write => d.write_time_avg.push(elapsed),
                    _ => {}
                }
                let timestamp_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                self.historical.append(ble_adapter::HistoricalRecord { addr, char_uuid: target.char_uuid, value: value.clone(), timestamp_ms });
            }
            if is_forced_read {
                self.dispatch(CoreEvent::Notification(NotificationEvent { addr, char_uuid: target.char_uuid, data: value.clone() }));
            }
        } else if let Some(txn_id) = self.transaction_task.get(&addr).copied() {
            if txn_id == exec_id {
                self.fail_transaction(addr, status);
                return;
            }
        }

        self.emit_read_write_kind(addr, effective_kind, status, value, target);
    }

    fn advance_transaction(&mut self, addr: RawAddress, now: Instant) {
        let next = match self.transactions.get_mut(&addr) {
            Some(txn) => txn.advance(),
            None => return,
        };
        match next {
            Some(step) => {
                let result = self.queue.enqueue(step, Some(addr));
                self.transaction_task.insert(addr, result.new_task);
            }
            None => {
                let kind = self.transactions.get(&addr).map(|t| t.kind);
                self.transactions.remove(&addr);
                self.transaction_task.remove(&addr);
                match kind {
                    Some(TransactionKind::Auth) => {
                        let prev = {
                            let d = self.device_mut(addr);
                            let prev = d.state.bits();
                            d.state.remove(DeviceState::AUTHENTICATING);
                            d.state.insert(DeviceState::AUTHENTICATED);
                            prev
                        };
                        self.notify_state_change(addr, prev, ChangeIntent::Intentional);
                        if let Some(steps) = self.configured_init.remove(&addr) {
                            self.begin_transaction(addr, TransactionKind::Init, steps);
                        } else {
                            self.mark_initialized(addr, now);
                        }
                    }
                    Some(TransactionKind::Init) => {
                        self.device_mut(addr).state.remove(DeviceState::INITIALIZING);
                        self.mark_initialized(addr, now);
                    }
                    Some(TransactionKind::Ota) => {
                        let prev = {
                            let d = self.device_mut(addr);
                            let prev = d.state.bits();
                            d.state.remove(DeviceState::PERFORMING_OTA);
                            prev
                        };
                        self.notify_state_change(addr, prev, ChangeIntent::Intentional);
                    }
                    _ => {}
                }
            }
        }
    }

    fn fail_transaction(&mut self, addr: RawAddress, status: GattError) {
        let kind = self.transactions.get(&addr).map(|t| t.kind);
        if let Some(txn) = self.transactions.get_mut(&addr) {
            txn.fail(status);
        }
        self.transactions.remove(&addr);
        self.transaction_task.remove(&addr);
        let reason = match kind {
            Some(TransactionKind::Auth) => GattError::AuthenticationFailed,
            Some(TransactionKind::Init) => GattError::InitializationFailed,
            _ => status,
        };
        let bit = match kind {
            Some(TransactionKind::Auth) => DeviceState::AUTHENTICATING,
            Some(TransactionKind::Init) => DeviceState::INITIALIZING,
            Some(TransactionKind::Ota) => DeviceState::PERFORMING_OTA,
            _ => DeviceState::empty(),
        };
        self.device_mut(addr).state.remove(bit);
        let highest = self.devices.get(&addr).map(|d| d.state.bits()).unwrap_or(0);
        self.dispatch(CoreEvent::ConnectFail(ConnectFailEvent {
            addr,
            status: reason,
            highest_state_reached: highest,
            bond_failure_reason: None,
            auto_connect_used: false,
            txn_failure_reason: Some(reason),
        }));
    }

    fn emit_read_write(&self, task: &Task, addr: RawAddress, status: GattError, value: Vec<u8>) {
        let (kind, target) = match &task.kind {
            TaskKind::Read { target } => (ReadWriteKind::Read, *target),
            TaskKind::Write { target, .. } => (ReadWriteKind::Write, *target),
            TaskKind::SetNotify { target, enable: true } => (ReadWriteKind::EnablingNotification, *target),
            TaskKind::SetNotify { target, enable: false } => (ReadWriteKind::DisablingNotification, *target),
            TaskKind::ReadRssi => (ReadWriteKind::Rssi, empty_target()),
            _ => (ReadWriteKind::Read, empty_target()),
        };
        self.emit_read_write_kind(addr, kind, status, value, target);
    }

    fn emit_read_write_kind(&self, addr: RawAddress, kind: ReadWriteKind, status: GattError, value: Vec<u8>, target: AttributeTarget) {
        self.dispatch(CoreEvent::ReadWrite(ReadWriteEvent {
            addr,
            service_uuid: target.service_uuid,
            char_uuid: if target.char_uuid == ble_common::Uuid::empty() { None } else { Some(target.char_uuid) },
            descriptor_uuid: target.descriptor_uuid,
            kind,
            status,
            data: value,
            rssi: None,
            mtu: None,
            time_total: std::time::Duration::default(),
            time_ota: std::time::Duration::default(),
        }));
    }

    fn on_notify_state_changed(&mut self, addr: RawAddress, target: AttributeTarget, status: GattError, enabled: bool, now: Instant) {
        let d = self.device_mut(addr);
        if status.is_success() {
            d.notify_state.insert(target.char_uuid, if enabled { crate::device::NotifyState::Enabled } else { crate::device::NotifyState::Disabled });
            if !enabled {
                d.force_read_deadline.remove(&target.char_uuid);
            }
        }
        let exec_matches = self
            .queue
            .executing_id()
            .and_then(|id| self.queue.get(id))
            .map(|t| t.device == Some(addr) && matches!(t.kind, TaskKind::SetNotify { .. }))
            .unwrap_or(false);
        if exec_matches {
            let id = self.queue.executing_id().unwrap();
            let state = if status.is_success() { TaskState::Succeeded } else { TaskState::Failed };
            self.queue.finish(id, state);
        }
        let kind = if enabled { ReadWriteKind::EnablingNotification } else { ReadWriteKind::DisablingNotification };
        self.emit_read_write_kind(addr, kind, status, vec![], target);

        if enabled && status.is_success() {
            self.schedule_force_read_if_needed(addr, target, now);
        }
    }

    fn schedule_force_read_if_needed(&mut self, addr: RawAddress, target: AttributeTarget, now: Instant) {
        let deadline = now + self.config.notify_force_read_timeout;
        self.device_mut(addr).force_read_deadline.insert(target.char_uuid, deadline);
    }

    /// Issues a plain read for any characteristic whose notification was
    /// enabled but hasn't actually pushed a value within the configured
    /// timeout. Covers peripherals that ack the CCCD write but never notify.
    fn sweep_stale_notifications(&mut self, now: Instant) {
        let due: Vec<(RawAddress, ble_common::Uuid)> = self
            .devices
            .iter()
            .flat_map(|(addr, d)| {
                d.force_read_deadline
                    .iter()
                    .filter(|(_, deadline)| now >= **deadline)
                    .map(move |(uuid, _)| (*addr, *uuid))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (addr, uuid) in due {
            let d = self.device_mut(addr);
            d.force_read_deadline.remove(&uuid);
            let still_enabled = matches!(d.notify_state.get(&uuid), Some(crate::device::NotifyState::Enabled));
            if still_enabled && d.is_connected() {
                let target = AttributeTarget { service_uuid: None, char_uuid: uuid, descriptor_uuid: None };
                let result = self.queue.enqueue(TaskKind::Read { target }, Some(addr));
                self.forced_reads.insert(result.new_task);
                self.apply_enqueue_result(result, addr);
            }
        }
    }

    fn on_notification_received(&mut self, addr: RawAddress, target: AttributeTarget, value: Vec<u8>) {
        let d = self.device_mut(addr);
        d.latest_values.insert(target.char_uuid, value.clone());
        d.force_read_deadline.remove(&target.char_uuid);
        self.dispatch(CoreEvent::Notification(NotificationEvent { addr, char_uuid: target.char_uuid, data: value.clone() }));
        self.emit_read_write_kind(addr, ReadWriteKind::Notification, GattError::Success, value, target);
    }

    fn on_bond_state_changed(&mut self, addr: RawAddress, status: GattError, bonded: bool, _now: Instant) {
        let d = self.device_mut(addr);
        d.state.remove(DeviceState::BONDING);
        if bonded {
            d.state.insert(DeviceState::BONDED);
            d.state.remove(DeviceState::UNBONDED);
        } else {
            d.state.insert(DeviceState::UNBONDED);
            d.state.remove(DeviceState::BONDED);
        }
        let exec_matches = self
            .queue
            .executing_id()
            .and_then(|id| self.queue.get(id))
            .map(|t| t.device == Some(addr) && matches!(t.kind, TaskKind::Bond | TaskKind::Unbond))
            .unwrap_or(false);
        if exec_matches {
            let id = self.queue.executing_id().unwrap();
            let state = if status.is_success() { TaskState::Succeeded } else { TaskState::Failed };
            self.queue.finish(id, state);
        }
        self.dispatch(CoreEvent::Bond(BondEvent { addr, status, bonded }));
    }

    fn on_ble_turned_off(&mut self, now: Instant) {
        let _ = now;
        let addrs: Vec<RawAddress> = self.devices.keys().copied().collect();
        for addr in addrs {
            // The native stack is gone; an EXECUTING or QUEUED task has no
            // call left to finish or time out, so give up on it immediately
            // rather than let it run out its own deadline.
            let cancelled = self.queue.cancel_for_device(addr, TaskState::SoftlyCancelled);
            for task in cancelled {
                self.emit_read_write(&task, addr, GattError::CancelledFromBleTurningOff, vec![]);
            }

            let was_connected = self.devices.get(&addr).map(Device::is_connected).unwrap_or(false);
            if was_connected {
                let prev = {
                    let d = self.device_mut(addr);
                    let prev = d.state.bits();
                    d.state = DeviceState::BLE_DISCONNECTED;
                    d.handle = None;
                    prev
                };
                self.notify_state_change(addr, prev, ChangeIntent::Unintentional);
            }
        }
    }

    fn notify_state_change(&self, addr: RawAddress, prev_mask: u32, intent: ChangeIntent) {
        let new_mask = self.devices.get(&addr).map(|d| d.state.bits()).unwrap_or(0);
        if new_mask == prev_mask {
            return;
        }
        self.dispatch(CoreEvent::StateChange(StateChangeEvent { addr, prev_mask, new_mask, intent }));
    }
}

fn empty_target() -> AttributeTarget {
    AttributeTarget { service_uuid: None, char_uuid: ble_common::Uuid::empty(), descriptor_uuid: None }
}
