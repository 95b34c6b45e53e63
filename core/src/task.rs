use ble_adapter::{AttributeTarget, Phy, WriteType};
use ble_common::RawAddress;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Trivial,
    Low,
    Medium,
    High,
    ForExplicitBondingOnly,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Armed,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    SoftlyCancelled,
    NoOp,
    Redundant,
    Interrupted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Queued | TaskState::Armed | TaskState::Executing)
    }
}

/// What a task actually asks the native stack to do. Kept data-only so a
/// `Task` never holds a strong reference back into the device table or the
/// adapter; the manager interprets the kind when it's time to execute.
#[derive(Debug, Clone)]
pub enum TaskKind {
    TurnBleOn,
    TurnBleOff,
    Scan,
    Connect { auto_connect: bool },
    Disconnect,
    DiscoverServices,
    Bond,
    Unbond,
    Read { target: AttributeTarget },
    Write { target: AttributeTarget, value: Vec<u8>, write_type: WriteType },
    ReadDescriptor { target: AttributeTarget },
    WriteDescriptor { target: AttributeTarget, value: Vec<u8> },
    SetNotify { target: AttributeTarget, enable: bool },
    ReadRssi,
    SetMtu { mtu: u16 },
    SetConnectionPriority { priority: u32 },
    SetPhy { tx: Phy, rx: Phy },
    ReadPhy,
    ReliableWriteBegin,
    ReliableWriteExecute,
    ReliableWriteAbort,
    CrashResolver,
}

pub type TaskId = u64;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub device: Option<RawAddress>,
    pub state: TaskState,
    pub retry_budget: u32,
    pub seq: u64,
    pub deadline: Option<Instant>,
    pub started_at: Option<Instant>,
}

impl Task {
    pub fn new(id: TaskId, seq: u64, kind: TaskKind, device: Option<RawAddress>) -> Self {
        let priority = Self::default_priority(&kind);
        Task {
            id,
            priority,
            device,
            state: TaskState::Queued,
            retry_budget: Self::default_retry_budget(&kind),
            seq,
            deadline: None,
            started_at: None,
            kind,
        }
    }

    fn default_priority(kind: &TaskKind) -> Priority {
        match kind {
            TaskKind::CrashResolver => Priority::Critical,
            TaskKind::Disconnect | TaskKind::TurnBleOff => Priority::Critical,
            TaskKind::Bond => Priority::ForExplicitBondingOnly,
            TaskKind::Connect { .. } | TaskKind::DiscoverServices => Priority::High,
            TaskKind::Read { .. } | TaskKind::Write { .. } | TaskKind::SetNotify { .. } => Priority::Medium,
            TaskKind::ReadRssi => Priority::Low,
            TaskKind::Scan => Priority::Low,
            TaskKind::TurnBleOn => Priority::High,
            _ => Priority::Medium,
        }
    }

    fn default_retry_budget(kind: &TaskKind) -> u32 {
        match kind {
            TaskKind::Connect { .. } => 1,
            TaskKind::Read { .. } | TaskKind::Write { .. } => 1,
            _ => 0,
        }
    }

    pub fn get_timeout(&self) -> Duration {
        match &self.kind {
            TaskKind::Connect { .. } => Duration::from_secs(12),
            TaskKind::DiscoverServices => Duration::from_secs(10),
            TaskKind::Bond | TaskKind::Unbond => Duration::from_secs(20),
            TaskKind::Read { .. } | TaskKind::ReadDescriptor { .. } => Duration::from_secs(5),
            TaskKind::Write { .. } | TaskKind::WriteDescriptor { .. } => Duration::from_secs(5),
            TaskKind::SetNotify { .. } => Duration::from_secs(5),
            TaskKind::ReadRssi => Duration::from_secs(3),
            TaskKind::SetMtu { .. } | TaskKind::SetConnectionPriority { .. } | TaskKind::SetPhy { .. } | TaskKind::ReadPhy => {
                Duration::from_secs(5)
            }
            TaskKind::ReliableWriteBegin | TaskKind::ReliableWriteExecute | TaskKind::ReliableWriteAbort => {
                Duration::from_secs(10)
            }
            TaskKind::CrashResolver => Duration::from_secs(5),
            TaskKind::Disconnect | TaskKind::TurnBleOn | TaskKind::TurnBleOff | TaskKind::Scan => Duration::from_secs(10),
        }
    }

    pub fn requires_ble_on(&self) -> bool {
        !matches!(self.kind, TaskKind::TurnBleOn)
    }

    pub fn requires_connection(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::DiscoverServices
                | TaskKind::Read { .. }
                | TaskKind::Write { .. }
                | TaskKind::ReadDescriptor { .. }
                | TaskKind::WriteDescriptor { .. }
                | TaskKind::SetNotify { .. }
                | TaskKind::ReadRssi
                | TaskKind::SetMtu { .. }
                | TaskKind::SetConnectionPriority { .. }
                | TaskKind::SetPhy { .. }
                | TaskKind::ReadPhy
                | TaskKind::ReliableWriteBegin
                | TaskKind::ReliableWriteExecute
                | TaskKind::ReliableWriteAbort
        )
    }

    /// Whether `self`, while queued, should be cancelled because `incoming`
    /// was just submitted for the same device. Mirrors the house rule that
    /// an explicit intent supersedes a stale implicit one.
    pub fn is_cancellable_by(&self, incoming: &Task) -> bool {
        if self.device != incoming.device {
            return false;
        }
        match (&self.kind, &incoming.kind) {
            (TaskKind::Disconnect, TaskKind::Connect { .. }) => true,
            (TaskKind::Connect { .. }, TaskKind::Disconnect) => true,
            (TaskKind::Read { .. }, TaskKind::Disconnect) => true,
            (TaskKind::Write { .. }, TaskKind::Disconnect) => true,
            (TaskKind::SetNotify { .. }, TaskKind::Disconnect) => true,
            (TaskKind::ReadRssi, TaskKind::Disconnect) => true,
            (_, TaskKind::TurnBleOff) if !matches!(self.kind, TaskKind::CrashResolver) => true,
            _ => false,
        }
    }

    /// Whether `self`, while EXECUTING, should be interrupted in favour of
    /// `incoming`.
    pub fn is_interruptible_by(&self, incoming: &Task) -> bool {
        if incoming.priority <= self.priority {
            return false;
        }
        !matches!(self.kind, TaskKind::CrashResolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> RawAddress {
        RawAddress::from_bytes(&[0, 0, 0, 0, 0, 1]).unwrap()
    }

    #[test]
    fn priority_orders_critical_above_medium() {
        assert!(Priority::Critical > Priority::Medium);
        assert!(Priority::ForExplicitBondingOnly > Priority::High);
    }

    #[test]
    fn connect_cancels_queued_disconnect_for_same_device() {
        let disconnect = Task::new(1, 1, TaskKind::Disconnect, Some(addr()));
        let connect = Task::new(2, 2, TaskKind::Connect { auto_connect: false }, Some(addr()));
        assert!(disconnect.is_cancellable_by(&connect));
    }

    #[test]
    fn disconnect_is_not_cancellable_by_lower_priority_read() {
        let disconnect = Task::new(1, 1, TaskKind::Disconnect, Some(addr()));
        let read = Task::new(
            2,
            2,
            TaskKind::Read { target: AttributeTarget { service_uuid: None, char_uuid: ble_common::Uuid::empty(), descriptor_uuid: None } },
            Some(addr()),
        );
        assert!(!disconnect.is_cancellable_by(&read));
    }

    #[test]
    fn high_priority_disconnect_interrupts_executing_read() {
        let read = Task::new(
            1,
            1,
            TaskKind::Read { target: AttributeTarget { service_uuid: None, char_uuid: ble_common::Uuid::empty(), descriptor_uuid: None } },
            Some(addr()),
        );
        let disconnect = Task::new(2, 2, TaskKind::Disconnect, Some(addr()));
        assert!(read.is_interruptible_by(&disconnect));
    }

    #[test]
    fn crash_resolver_is_never_interrupted() {
        let resolver = Task::new(1, 1, TaskKind::CrashResolver, None);
        let disconnect = Task::new(2, 2, TaskKind::Disconnect, Some(addr()));
        assert!(!resolver.is_interruptible_by(&disconnect));
    }
}
