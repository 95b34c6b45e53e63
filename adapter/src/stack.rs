use ble_common::{GattError, RawAddress, Uuid};

/// Opaque handle to a native GATT connection, returned by `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
    Signed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phy {
    Phy1M,
    Phy2M,
    PhyCoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub active: bool,
}

/// A fingerprint identifying a single GATT attribute on a device, since a
/// UUID alone may not be unique within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeTarget {
    pub service_uuid: Option<Uuid>,
    pub char_uuid: Uuid,
    pub descriptor_uuid: Option<Uuid>,
}

/// Events the native stack reports back to the core. These are posted onto
/// the update worker's mailbox; the adapter never calls back into the core
/// inline from an arbitrary OS thread.
#[derive(Debug, Clone)]
pub enum StackEvent {
    DeviceFound { addr: RawAddress, rssi: i8, adv_data: Vec<u8> },
    Connected { addr: RawAddress, handle: GattHandle },
    ConnectFailed { addr: RawAddress, status: GattError },
    Disconnected { addr: RawAddress, status: GattError },
    ServicesDiscovered { addr: RawAddress, status: GattError },
    CharacteristicRead { addr: RawAddress, target: AttributeTarget, status: GattError, value: Vec<u8> },
    CharacteristicWritten { addr: RawAddress, target: AttributeTarget, status: GattError },
    DescriptorRead { addr: RawAddress, target: AttributeTarget, status: GattError, value: Vec<u8> },
    DescriptorWritten { addr: RawAddress, target: AttributeTarget, status: GattError },
    NotificationStateChanged { addr: RawAddress, target: AttributeTarget, status: GattError, enabled: bool },
    NotificationReceived { addr: RawAddress, target: AttributeTarget, value: Vec<u8> },
    RssiRead { addr: RawAddress, status: GattError, rssi: i8 },
    MtuChanged { addr: RawAddress, status: GattError, mtu: u16 },
    ConnectionPriorityChanged { addr: RawAddress, status: GattError },
    PhyChanged { addr: RawAddress, status: GattError, tx_phy: Phy, rx_phy: Phy },
    ReliableWriteCompleted { addr: RawAddress, status: GattError },
    BondStateChanged { addr: RawAddress, status: GattError, bonded: bool },
    AdapterStateChanged { ble_on: bool },
    CrashResolverFlushed { status: GattError },
}

/// The only coupling to the outside world: a narrow capability trait over
/// the native BLE transport. All calls are fire-and-forget; completion is
/// reported asynchronously via `StackEvent`s delivered to the channel
/// returned from `event_sender()`.
pub trait BleStack: Send {
    fn start_scan(&self, params: ScanParams);
    fn stop_scan(&self);

    fn connect(&self, addr: RawAddress, auto_connect: bool);
    fn disconnect(&self, handle: GattHandle);

    fn discover_services(&self, handle: GattHandle);

    fn read_characteristic(&self, handle: GattHandle, target: AttributeTarget);
    fn write_characteristic(&self, handle: GattHandle, target: AttributeTarget, value: Vec<u8>, write_type: WriteType);
    fn read_descriptor(&self, handle: GattHandle, target: AttributeTarget);
    fn write_descriptor(&self, handle: GattHandle, target: AttributeTarget, value: Vec<u8>);
    fn set_notify(&self, handle: GattHandle, target: AttributeTarget, enabled: bool);

    fn read_rssi(&self, handle: GattHandle);
    fn request_mtu(&self, handle: GattHandle, mtu: u16);
    fn request_connection_priority(&self, handle: GattHandle, priority: u32);
    fn set_phy(&self, handle: GattHandle, tx_phy: Phy, rx_phy: Phy);
    fn read_phy(&self, handle: GattHandle);

    fn begin_reliable_write(&self, handle: GattHandle);
    fn execute_reliable_write(&self, handle: GattHandle);
    fn abort_reliable_write(&self, handle: GattHandle);

    fn create_bond(&self, addr: RawAddress);
    fn remove_bond(&self, addr: RawAddress);

    fn force_crash_resolver_flush(&self);
}
