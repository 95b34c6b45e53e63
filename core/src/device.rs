use ble_adapter::GattHandle;
use ble_common::{GattError, RawAddress, ScanRecord, Uuid};
use bitflags::bitflags;
use std::collections::HashMap;
use std::time::{Duration, Instant};

bitflags! {
    /// Ordered bitmask over every state a device may be in. Several bits
    /// may be set at once (e.g. BLE_CONNECTED and DISCOVERING_SERVICES);
    /// composite states like `CONNECTING_OVERALL` are derived, not stored.
    #[derive(Default)]
    pub struct DeviceState: u32 {
        const UNDISCOVERED         = 1 << 0;
        const ADVERTISING          = 1 << 1;
        const DISCOVERED           = 1 << 2;
        const BLE_CONNECTING       = 1 << 3;
        const BLE_CONNECTED        = 1 << 4;
        const DISCOVERING_SERVICES = 1 << 5;
        const SERVICES_DISCOVERED  = 1 << 6;
        const BONDING              = 1 << 7;
        const BONDED               = 1 << 8;
        const UNBONDED             = 1 << 9;
        const AUTHENTICATING       = 1 << 10;
        const AUTHENTICATED        = 1 << 11;
        const INITIALIZING         = 1 << 12;
        const INITIALIZED          = 1 << 13;
        const PERFORMING_OTA       = 1 << 14;
        const RECONNECTING_SHORT_TERM = 1 << 15;
        const RECONNECTING_LONG_TERM  = 1 << 16;
        const BLE_DISCONNECTED     = 1 << 17;
    }
}

impl DeviceState {
    /// `CONNECTING_OVERALL` is derived: true whenever any constituent bit
    /// of an in-progress connect attempt is set.
    pub fn connecting_overall(&self) -> bool {
        self.intersects(
            DeviceState::BLE_CONNECTING
                | DeviceState::DISCOVERING_SERVICES
                | DeviceState::AUTHENTICATING
                | DeviceState::INITIALIZING
                | DeviceState::RECONNECTING_SHORT_TERM,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableWriteState {
    None,
    Open,
    Committing,
    Aborting,
}

/// A bounded running average, matching the `n_for_average_running_*_time`
/// configuration knobs.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    window: usize,
    samples: Vec<Duration>,
}

impl RunningAverage {
    pub fn new(window: usize) -> Self {
        RunningAverage { window: window.max(1), samples: Vec::new() }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.window {
            self.samples.remove(0);
        }
        self.samples.push(sample);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// Per-device bookkeeping the reconnect controller consults and mutates.
#[derive(Debug, Clone, Default)]
pub struct ReconnectBookkeeping {
    pub attempt_count: u32,
    pub last_failure: Option<GattError>,
    pub next_permitted_attempt: Option<Instant>,
    pub window_start: Option<Instant>,
    pub in_long_term: bool,
    pub retried_this_attempt: bool,
}

impl ReconnectBookkeeping {
    pub fn reset(&mut self) {
        *self = ReconnectBookkeeping::default();
    }
}

/// A single remote device and everything the scheduler knows about it.
pub struct Device {
    pub addr: RawAddress,
    pub state: DeviceState,
    pub handle: Option<GattHandle>,

    pub last_seen: Option<Instant>,
    pub last_scan_record: Option<ScanRecord>,

    pub rssi: Option<i8>,
    pub read_time_avg: RunningAverage,
    pub write_time_avg: RunningAverage,

    pub mtu: u16,
    pub connection_priority: u32,

    pub notify_state: HashMap<Uuid, NotifyState>,
    pub reliable_write: ReliableWriteState,

    /// Deadline for the force-read fallback: set when a notification is
    /// enabled, cleared the moment one actually arrives. If `on_tick` finds
    /// one still pending past its deadline, it issues a plain read instead
    /// of waiting on a peripheral that may never push.
    pub force_read_deadline: HashMap<Uuid, Instant>,

    pub reconnect: ReconnectBookkeeping,

    pub latest_values: HashMap<Uuid, Vec<u8>>,
}

impl Device {
    pub fn new(addr: RawAddress, read_avg_window: usize, write_avg_window: usize) -> Self {
        Device {
            addr,
            state: DeviceState::UNDISCOVERED,
            handle: None,
            last_seen: None,
            last_scan_record: None,
            rssi: None,
            read_time_avg: RunningAverage::new(read_avg_window),
            write_time_avg: RunningAverage::new(write_avg_window),
            mtu: 23,
            connection_priority: 0,
            notify_state: HashMap::new(),
            reliable_write: ReliableWriteState::None,
            force_read_deadline: HashMap::new(),
            reconnect: ReconnectBookkeeping::default(),
            latest_values: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.contains(DeviceState::BLE_CONNECTED)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.contains(DeviceState::INITIALIZED)
    }

    /// Effective GATT write payload: MTU minus the 3-byte ATT header.
    pub fn write_payload_capacity(&self) -> u16 {
        self.mtu.saturating_sub(3)
    }

    pub fn set_state(&mut self, new: DeviceState) -> DeviceState {
        std::mem::replace(&mut self.state, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> RawAddress {
        RawAddress::from_bytes(&[1, 2, 3, 4, 5, 6]).unwrap()
    }

    #[test]
    fn connecting_overall_is_derived_from_constituent_bits() {
        let mut d = Device::new(addr(), 10, 10);
        assert!(!d.state.connecting_overall());
        d.state = DeviceState::BLE_CONNECTING;
        assert!(d.state.connecting_overall());
        d.state = DeviceState::INITIALIZED;
        assert!(!d.state.connecting_overall());
    }

    #[test]
    fn write_payload_is_mtu_minus_header() {
        let mut d = Device::new(addr(), 10, 10);
        d.mtu = 185;
        assert_eq!(d.write_payload_capacity(), 182);
    }

    #[test]
    fn running_average_respects_window() {
        let mut avg = RunningAverage::new(2);
        avg.push(Duration::from_millis(10));
        avg.push(Duration::from_millis(20));
        avg.push(Duration::from_millis(30));
        assert_eq!(avg.average(), Some(Duration::from_millis(25)));
    }
}
