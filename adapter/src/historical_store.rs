use ble_common::{RawAddress, Uuid};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalRecord {
    pub addr: RawAddress,
    pub char_uuid: Uuid,
    pub value: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Iterates a (possibly large) historical record set without materialising
/// it as one `Vec`, so a UI can page through years of logged characteristic
/// values.
pub trait Cursor {
    fn move_next(&mut self) -> bool;
    fn value(&self) -> Option<&HistoricalRecord>;
    fn close(&mut self);
}

/// Capability trait for durable storage of per-characteristic value history.
/// A real implementation would back this with sqlite or similar; the core
/// only ever talks to this narrow interface.
pub trait HistoricalStore: Send + Sync {
    fn append(&self, record: HistoricalRecord);
    fn bulk_add(&self, records: &mut dyn Iterator<Item = HistoricalRecord>);
    fn cursor(&self, addr: RawAddress, char_uuid: Uuid) -> Box<dyn Cursor + '_>;
}

#[derive(Default)]
pub struct MemoryHistoricalStore {
    records: Mutex<Vec<HistoricalRecord>>,
}

impl MemoryHistoricalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoricalStore for MemoryHistoricalStore {
    fn append(&self, record: HistoricalRecord) {
        self.records.lock().unwrap().push(record);
    }

    fn bulk_add(&self, records: &mut dyn Iterator<Item = HistoricalRecord>) {
        let mut guard = self.records.lock().unwrap();
        guard.extend(records);
    }

    fn cursor(&self, addr: RawAddress, char_uuid: Uuid) -> Box<dyn Cursor + '_> {
        let matching: Vec<HistoricalRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.addr == addr && r.char_uuid == char_uuid)
            .cloned()
            .collect();
        Box::new(MemoryCursor { items: matching, pos: None })
    }
}

struct MemoryCursor {
    items: Vec<HistoricalRecord>,
    pos: Option<usize>,
}

impl Cursor for MemoryCursor {
    fn move_next(&mut self) -> bool {
        let next = match self.pos {
            None => 0,
            Some(p) => p + 1,
        };
        if next >= self.items.len() {
            return false;
        }
        self.pos = Some(next);
        true
    }

    fn value(&self) -> Option<&HistoricalRecord> {
        self.pos.and_then(|p| self.items.get(p))
    }

    fn close(&mut self) {
        self.items.clear();
        self.pos = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeIntent {
    Intentional,
    Unintentional,
    Null,
}

#[derive(Debug, Clone, Default)]
pub struct PersistedEntry {
    pub last_disconnect_intent: Option<ChangeIntent>,
    pub override_name: Option<String>,
    pub historical_data_table_name: Option<String>,
}

/// Capability trait for the small amount of per-device state the core
/// expects to survive process restarts.
pub trait PersistedDeviceState: Send + Sync {
    fn get(&self, addr: RawAddress) -> PersistedEntry;
    fn set_last_disconnect_intent(&self, addr: RawAddress, intent: ChangeIntent);
    fn set_override_name(&self, addr: RawAddress, name: String);
}

#[derive(Default)]
pub struct MemoryPersistedState {
    entries: Mutex<HashMap<RawAddress, PersistedEntry>>,
}

impl MemoryPersistedState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistedDeviceState for MemoryPersistedState {
    fn get(&self, addr: RawAddress) -> PersistedEntry {
        self.entries.lock().unwrap().get(&addr).cloned().unwrap_or_default()
    }

    fn set_last_disconnect_intent(&self, addr: RawAddress, intent: ChangeIntent) {
        self.entries.lock().unwrap().entry(addr).or_default().last_disconnect_intent = Some(intent);
    }

    fn set_override_name(&self, addr: RawAddress, name: String) {
        self.entries.lock().unwrap().entry(addr).or_default().override_name = Some(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> RawAddress {
        RawAddress::from_bytes(&[0, 0, 0, 0, 0, n]).unwrap()
    }

    #[test]
    fn cursor_iterates_matching_records_only() {
        let store = MemoryHistoricalStore::new();
        let uuid = Uuid::from_string("1800").unwrap();
        let other_uuid = Uuid::from_string("1801").unwrap();
        store.append(HistoricalRecord { addr: addr(1), char_uuid: uuid, value: vec![1], timestamp_ms: 1 });
        store.append(HistoricalRecord { addr: addr(1), char_uuid: other_uuid, value: vec![2], timestamp_ms: 2 });
        store.append(HistoricalRecord { addr: addr(1), char_uuid: uuid, value: vec![3], timestamp_ms: 3 });

        let mut cursor = store.cursor(addr(1), uuid);
        let mut seen = vec![];
        while cursor.move_next() {
            seen.push(cursor.value().unwrap().value.clone());
        }
        assert_eq!(seen, vec![vec![1], vec![3]]);
    }

    #[test]
    fn persisted_state_round_trips_disconnect_intent() {
        let state = MemoryPersistedState::new();
        state.set_last_disconnect_intent(addr(2), ChangeIntent::Intentional);
        assert_eq!(state.get(addr(2)).last_disconnect_intent, Some(ChangeIntent::Intentional));
    }
}
