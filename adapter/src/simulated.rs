use crate::stack::{AttributeTarget, BleStack, GattHandle, Phy, ScanParams, StackEvent, WriteType};
use ble_common::{GattError, RawAddress};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, Mutex as AsyncMutex};

/// Wraps a channel sender so callers can fire-and-forget events from any
/// number of concurrently spawned delay tasks while still preserving the
/// order in which each caller *queued* its event, mirroring the way the
/// topshim dispatcher preserves native-callback ordering ahead of the
/// channel send.
#[derive(Clone)]
struct OrderedPoster {
    tx: UnboundedSender<StackEvent>,
    pending: Arc<StdMutex<VecDeque<StackEvent>>>,
    drain_lock: Arc<AsyncMutex<()>>,
}

impl OrderedPoster {
    fn new(tx: UnboundedSender<StackEvent>) -> Self {
        Self { tx, pending: Arc::new(StdMutex::new(VecDeque::new())), drain_lock: Arc::new(AsyncMutex::new(())) }
    }

    fn post_after(&self, delay: Duration, event: StackEvent) {
        self.pending.lock().unwrap().push_back(event);
        let pending = self.pending.clone();
        let drain_lock = self.drain_lock.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _guard = drain_lock.lock().await;
            if let Some(ev) = pending.lock().unwrap().pop_front() {
                let _ = tx.send(ev);
            }
        });
    }
}

/// Identifies one native operation outcome, for the drop/fail test hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Connect,
    DiscoverServices,
    Read,
    Write,
    Notify,
    Rssi,
    Mtu,
    Bond,
}

/// A `BleStack` with no radio behind it: every call schedules a delayed,
/// successful `StackEvent` on the tokio runtime, correlated by the handle
/// assigned at `connect()`. Used by the scheduler's own tests and by the
/// demonstration daemon in place of a real adapter.
///
/// Test hooks (`fail_next`, `drop_next`) let a test force one specific
/// upcoming outcome for one address without touching the scheduler.
pub struct SimulatedBleStack {
    poster: OrderedPoster,
    next_handle: AtomicU32,
    handle_to_addr: StdMutex<HashMap<u32, RawAddress>>,
    fail_next: StdMutex<HashMap<(RawAddress, Op), GattError>>,
    drop_next: StdMutex<HashSet<(RawAddress, Op)>>,
    response_delay: Duration,
}

impl SimulatedBleStack {
    pub fn new(tx: UnboundedSender<StackEvent>) -> Self {
        Self {
            poster: OrderedPoster::new(tx),
            next_handle: AtomicU32::new(1),
            handle_to_addr: StdMutex::new(HashMap::new()),
            fail_next: StdMutex::new(HashMap::new()),
            drop_next: StdMutex::new(HashSet::new()),
            response_delay: Duration::from_millis(20),
        }
    }

    pub fn with_response_delay(tx: UnboundedSender<StackEvent>, delay: Duration) -> Self {
        let mut s = Self::new(tx);
        s.response_delay = delay;
        s
    }

    /// The next occurrence of `op` for `addr` will report `status` instead
    /// of success.
    pub fn fail_next_op(&self, addr: RawAddress, op: Op, status: GattError) {
        self.fail_next.lock().unwrap().insert((addr, op), status);
    }

    /// The next occurrence of `op` for `addr` produces no callback at all,
    /// simulating a stuck native stack for timeout tests.
    pub fn drop_next_op(&self, addr: RawAddress, op: Op) {
        self.drop_next.lock().unwrap().insert((addr, op));
    }

    fn addr_for(&self, handle: GattHandle) -> Option<RawAddress> {
        self.handle_to_addr.lock().unwrap().get(&handle.0).copied()
    }

    fn take_outcome(&self, addr: RawAddress, op: Op) -> Outcome {
        if self.drop_next.lock().unwrap().remove(&(addr, op)) {
            log::debug!("simulated stack dropping {:?} for {}", op, addr);
            return Outcome::Dropped;
        }
        if let Some(status) = self.fail_next.lock().unwrap().remove(&(addr, op)) {
            log::debug!("simulated stack failing {:?} for {} with {:?}", op, addr, status);
            return Outcome::Failed(status);
        }
        Outcome::Success
    }
}

enum Outcome {
    Success,
    Failed(GattError),
    Dropped,
}

impl BleStack for SimulatedBleStack {
    fn start_scan(&self, _params: ScanParams) {}

    fn stop_scan(&self) {}

    fn connect(&self, addr: RawAddress, _auto_connect: bool) {
        match self.take_outcome(addr, Op::Connect) {
            Outcome::Dropped => {}
            Outcome::Failed(status) => {
                self.poster.post_after(self.response_delay, StackEvent::ConnectFailed { addr, status });
            }
            Outcome::Success => {
                let handle = GattHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
                self.handle_to_addr.lock().unwrap().insert(handle.0, addr);
                self.poster.post_after(self.response_delay, StackEvent::Connected { addr, handle });
            }
        }
    }

    fn disconnect(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::Disconnected { addr, status: GattError::Success });
        }
    }

    fn discover_services(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            match self.take_outcome(addr, Op::DiscoverServices) {
                Outcome::Dropped => {}
                Outcome::Failed(status) => {
                    self.poster.post_after(self.response_delay, StackEvent::ServicesDiscovered { addr, status });
                }
                Outcome::Success => {
                    self.poster.post_after(self.response_delay, StackEvent::ServicesDiscovered { addr, status: GattError::Success });
                }
            }
        }
    }

    fn read_characteristic(&self, handle: GattHandle, target: AttributeTarget) {
        if let Some(addr) = self.addr_for(handle) {
            match self.take_outcome(addr, Op::Read) {
                Outcome::Dropped => {}
                Outcome::Failed(status) => {
                    self.poster.post_after(self.response_delay, StackEvent::CharacteristicRead { addr, target, status, value: vec![] });
                }
                Outcome::Success => {
                    self.poster.post_after(
                        self.response_delay,
                        StackEvent::CharacteristicRead { addr, target, status: GattError::Success, value: vec![0xAB] },
                    );
                }
            }
        }
    }

    fn write_characteristic(&self, handle: GattHandle, target: AttributeTarget, _value: Vec<u8>, _write_type: WriteType) {
        if let Some(addr) = self.addr_for(handle) {
            match self.take_outcome(addr, Op::Write) {
                Outcome::Dropped => {}
                Outcome::Failed(status) => {
                    self.poster.post_after(self.response_delay, StackEvent::CharacteristicWritten { addr, target, status });
                }
                Outcome::Success => {
                    self.poster.post_after(
                        self.response_delay,
                        StackEvent::CharacteristicWritten { addr, target, status: GattError::Success },
                    );
                }
            }
        }
    }

    fn read_descriptor(&self, handle: GattHandle, target: AttributeTarget) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::DescriptorRead { addr, target, status: GattError::Success, value: vec![] });
        }
    }

    fn write_descriptor(&self, handle: GattHandle, target: AttributeTarget, _value: Vec<u8>) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::DescriptorWritten { addr, target, status: GattError::Success });
        }
    }

    fn set_notify(&self, handle: GattHandle, target: AttributeTarget, enabled: bool) {
        if let Some(addr) = self.addr_for(handle) {
            match self.take_outcome(addr, Op::Notify) {
                Outcome::Dropped => {}
                Outcome::Failed(status) => {
                    self.poster.post_after(self.response_delay, StackEvent::NotificationStateChanged { addr, target, status, enabled });
                }
                Outcome::Success => {
                    self.poster.post_after(
                        self.response_delay,
                        StackEvent::NotificationStateChanged { addr, target, status: GattError::Success, enabled },
                    );
                }
            }
        }
    }

    fn read_rssi(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::RssiRead { addr, status: GattError::Success, rssi: -55 });
        }
    }

    fn request_mtu(&self, handle: GattHandle, mtu: u16) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::MtuChanged { addr, status: GattError::Success, mtu });
        }
    }

    fn request_connection_priority(&self, handle: GattHandle, _priority: u32) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::ConnectionPriorityChanged { addr, status: GattError::Success });
        }
    }

    fn set_phy(&self, handle: GattHandle, tx_phy: Phy, rx_phy: Phy) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::PhyChanged { addr, status: GattError::Success, tx_phy, rx_phy });
        }
    }

    fn read_phy(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(
                self.response_delay,
                StackEvent::PhyChanged { addr, status: GattError::Success, tx_phy: Phy::Phy1M, rx_phy: Phy::Phy1M },
            );
        }
    }

    fn begin_reliable_write(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::ReliableWriteCompleted { addr, status: GattError::Success });
        }
    }

    fn execute_reliable_write(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::ReliableWriteCompleted { addr, status: GattError::Success });
        }
    }

    fn abort_reliable_write(&self, handle: GattHandle) {
        if let Some(addr) = self.addr_for(handle) {
            self.poster.post_after(self.response_delay, StackEvent::ReliableWriteCompleted { addr, status: GattError::Success });
        }
    }

    fn create_bond(&self, addr: RawAddress) {
        match self.take_outcome(addr, Op::Bond) {
            Outcome::Dropped => {}
            Outcome::Failed(status) => {
                self.poster.post_after(self.response_delay, StackEvent::BondStateChanged { addr, status, bonded: false });
            }
            Outcome::Success => {
                self.poster.post_after(self.response_delay, StackEvent::BondStateChanged { addr, status: GattError::Success, bonded: true });
            }
        }
    }

    fn remove_bond(&self, addr: RawAddress) {
        self.poster.post_after(self.response_delay, StackEvent::BondStateChanged { addr, status: GattError::Success, bonded: false });
    }

    fn force_crash_resolver_flush(&self) {
        self.poster.post_after(self.response_delay, StackEvent::CrashResolverFlushed { status: GattError::Success });
    }
}
