use crate::task::TaskKind;
use ble_common::GattError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Auth,
    Init,
    Ota,
    UserCustom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A transaction groups one or more tasks that must all succeed, in order,
/// before the device's corresponding state bit (AUTHENTICATING, INITIALIZING,
/// PERFORMING_OTA) can clear. Steps run with elevated priority and resist
/// cancellation by ordinary user operations (enforced by the manager when it
/// submits them, not by the transaction itself).
#[derive(Debug, Clone)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub state: TransactionState,
    steps: Vec<TaskKind>,
    cursor: usize,
    pub failure_reason: Option<GattError>,
}

impl Transaction {
    pub fn new(kind: TransactionKind, steps: Vec<TaskKind>) -> Self {
        Transaction { kind, state: TransactionState::Pending, steps, cursor: 0, failure_reason: None }
    }

    pub fn start(&mut self) -> Option<TaskKind> {
        self.state = TransactionState::Running;
        self.steps.get(self.cursor).cloned()
    }

    /// Advances past the just-completed step. Returns the next step to
    /// submit, or `None` once every step has succeeded (the transaction is
    /// then `Succeeded`).
    pub fn advance(&mut self) -> Option<TaskKind> {
        self.cursor += 1;
        match self.steps.get(self.cursor) {
            Some(next) => Some(next.clone()),
            None => {
                self.state = TransactionState::Succeeded;
                None
            }
        }
    }

    pub fn fail(&mut self, reason: GattError) {
        self.state = TransactionState::Failed;
        self.failure_reason = Some(reason);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TransactionState::Succeeded | TransactionState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ble_adapter::AttributeTarget;
    use ble_common::Uuid;

    fn target() -> AttributeTarget {
        AttributeTarget { service_uuid: None, char_uuid: Uuid::empty(), descriptor_uuid: None }
    }

    #[test]
    fn advances_through_steps_in_order_then_succeeds() {
        let mut txn = Transaction::new(
            TransactionKind::Init,
            vec![
                TaskKind::Write { target: target(), value: vec![1], write_type: ble_adapter::WriteType::WithResponse },
                TaskKind::Read { target: target() },
            ],
        );
        let first = txn.start().unwrap();
        assert!(matches!(first, TaskKind::Write { .. }));
        let second = txn.advance().unwrap();
        assert!(matches!(second, TaskKind::Read { .. }));
        assert!(txn.advance().is_none());
        assert_eq!(txn.state, TransactionState::Succeeded);
    }

    #[test]
    fn fail_marks_transaction_terminal_with_reason() {
        let mut txn = Transaction::new(TransactionKind::Auth, vec![TaskKind::Read { target: target() }]);
        txn.start();
        txn.fail(GattError::AuthenticationFailed);
        assert!(txn.is_terminal());
        assert_eq!(txn.failure_reason, Some(GattError::AuthenticationFailed));
    }
}
