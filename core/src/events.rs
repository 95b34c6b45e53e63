use ble_common::{GattError, RawAddress, Uuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryLifecycle {
    Discovered,
    Rediscovered,
    Undiscovered,
}

#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub addr: RawAddress,
    pub lifecycle: DiscoveryLifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeIntent {
    Intentional,
    Unintentional,
}

#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub addr: RawAddress,
    pub prev_mask: u32,
    pub new_mask: u32,
    pub intent: ChangeIntent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWriteKind {
    Read,
    Write,
    Notification,
    Indication,
    PseudoNotification,
    EnablingNotification,
    DisablingNotification,
    Rssi,
    Mtu,
    ConnectionPriority,
    PhyOptions,
    ReliableWriteBegin,
    ReliableWriteExecute,
    ReliableWriteAbort,
}

#[derive(Debug, Clone)]
pub struct ReadWriteEvent {
    pub addr: RawAddress,
    pub service_uuid: Option<Uuid>,
    pub char_uuid: Option<Uuid>,
    pub descriptor_uuid: Option<Uuid>,
    pub kind: ReadWriteKind,
    pub status: GattError,
    pub data: Vec<u8>,
    pub rssi: Option<i8>,
    pub mtu: Option<u16>,
    pub time_total: std::time::Duration,
    pub time_ota: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct ConnectFailEvent {
    pub addr: RawAddress,
    pub status: GattError,
    pub highest_state_reached: u32,
    pub bond_failure_reason: Option<GattError>,
    pub auto_connect_used: bool,
    pub txn_failure_reason: Option<GattError>,
}

#[derive(Debug, Clone)]
pub struct BondEvent {
    pub addr: RawAddress,
    pub status: GattError,
    pub bonded: bool,
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub addr: RawAddress,
    pub char_uuid: Uuid,
    pub data: Vec<u8>,
}

/// Every kind of event a listener may receive. Dispatch only ever sends one
/// variant at a time, never a batch.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Discovery(DiscoveryEvent),
    StateChange(StateChangeEvent),
    ReadWrite(ReadWriteEvent),
    ConnectFail(ConnectFailEvent),
    Bond(BondEvent),
    Notification(NotificationEvent),
}
