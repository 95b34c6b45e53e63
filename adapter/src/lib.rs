//! The narrow boundary between the scheduler core and a native BLE
//! transport: a capability trait (`BleStack`), the event type it reports
//! through, and two ambient capability traits (`HistoricalStore`,
//! `PersistedDeviceState`) plus in-memory reference implementations of all
//! three, sufficient for tests and the demonstration daemon.

pub mod historical_store;
pub mod simulated;
pub mod stack;

pub use historical_store::{
    ChangeIntent, Cursor, HistoricalRecord, HistoricalStore, MemoryHistoricalStore, MemoryPersistedState,
    PersistedDeviceState, PersistedEntry,
};
pub use simulated::{Op, SimulatedBleStack};
pub use stack::{AttributeTarget, BleStack, GattHandle, Phy, ScanParams, StackEvent, WriteType};
