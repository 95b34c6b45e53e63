use crate::task::{Task, TaskId, TaskKind, TaskState};
use ble_common::RawAddress;
use std::time::Instant;

/// Outcome of an `enqueue` call: the new task's id plus any tasks that were
/// cancelled as a side effect (e.g. a `Connect` cancelling a queued
/// `Disconnect` for the same device), and the id of a currently EXECUTING
/// task that must be interrupted to make room for the new one.
pub struct EnqueueResult {
    pub new_task: TaskId,
    pub cancelled: Vec<Task>,
    pub preempt: Option<TaskId>,
}

/// The single global priority+FIFO queue. At most one task is EXECUTING at
/// a time; everything else is QUEUED until it reaches the head and its
/// preconditions hold.
#[derive(Default)]
pub struct TaskQueue {
    tasks: Vec<Task>,
    executing: Option<TaskId>,
    next_id: TaskId,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue { tasks: Vec::new(), executing: None, next_id: 1, next_seq: 1 }
    }

    pub fn executing_id(&self) -> Option<TaskId> {
        self.executing
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn enqueue(&mut self, kind: TaskKind, device: Option<RawAddress>) -> EnqueueResult {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        let incoming = Task::new(id, seq, kind, device);

        let mut cancelled = Vec::new();
        for t in self.tasks.iter_mut() {
            if t.id == incoming.id || t.state.is_terminal() {
                continue;
            }
            if Some(t.id) == self.executing {
                continue;
            }
            if t.is_cancellable_by(&incoming) {
                let new_state = if t.device == incoming.device { TaskState::SoftlyCancelled } else { TaskState::Cancelled };
                t.state = new_state;
                cancelled.push(t.clone());
            }
        }
        self.tasks.retain(|t| !t.state.is_terminal() || t.id == incoming.id);

        let preempt = if let Some(exec_id) = self.executing {
            let should = self
                .get(exec_id)
                .map(|exec| incoming.priority > exec.priority && exec.is_interruptible_by(&incoming))
                .unwrap_or(false);
            if should {
                Some(exec_id)
            } else {
                None
            }
        } else {
            None
        };

        self.tasks.push(incoming);
        EnqueueResult { new_task: id, cancelled, preempt }
    }

    /// Terminates every non-terminal task (EXECUTING or QUEUED) belonging to
    /// `addr` with `state`, e.g. when the adapter turns off and every
    /// in-flight operation for a device has to give up its native call
    /// immediately rather than run out its own timeout. Returns the
    /// terminated tasks so the caller can build events from them.
    pub fn cancel_for_device(&mut self, addr: RawAddress, state: TaskState) -> Vec<Task> {
        debug_assert!(state.is_terminal());
        let mut cancelled = Vec::new();
        for t in self.tasks.iter_mut() {
            if t.device != Some(addr) || t.state.is_terminal() {
                continue;
            }
            t.state = state;
            cancelled.push(t.clone());
        }
        if let Some(exec_id) = self.executing {
            if cancelled.iter().any(|t| t.id == exec_id) {
                self.executing = None;
            }
        }
        self.tasks.retain(|t| !t.state.is_terminal());
        cancelled
    }

    /// Finds the highest-priority, earliest-enqueued QUEUED task whose
    /// preconditions are satisfied and arms it as EXECUTING. Tasks whose
    /// preconditions aren't satisfied are skipped, not removed.
    pub fn pop_next_runnable<F>(&mut self, now: Instant, ble_on: bool, is_connected: F) -> Option<TaskId>
    where
        F: Fn(RawAddress) -> bool,
    {
        if self.executing.is_some() {
            return None;
        }

        let mut best: Option<usize> = None;
        for (idx, t) in self.tasks.iter().enumerate() {
            if t.state != TaskState::Queued {
                continue;
            }
            if t.requires_ble_on() && !ble_on {
                continue;
            }
            if t.requires_connection() {
                match t.device {
                    Some(addr) if is_connected(addr) => {}
                    _ => continue,
                }
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let bt = &self.tasks[b];
                    (t.priority, std::cmp::Reverse(t.seq)) > (bt.priority, std::cmp::Reverse(bt.seq))
                }
            };
            if better {
                best = Some(idx);
            }
        }

        let idx = best?;
        let task = &mut self.tasks[idx];
        task.state = TaskState::Executing;
        task.started_at = Some(now);
        task.deadline = Some(now + task.get_timeout());
        self.executing = Some(task.id);
        Some(task.id)
    }

    /// Sweeps QUEUED and EXECUTING tasks for an expired deadline.
    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<TaskId> {
        let mut timed_out = Vec::new();
        for t in self.tasks.iter_mut() {
            if matches!(t.state, TaskState::Queued | TaskState::Executing) {
                if let Some(deadline) = t.deadline {
                    if now >= deadline {
                        t.state = TaskState::TimedOut;
                        timed_out.push(t.id);
                    }
                }
            }
        }
        for id in &timed_out {
            if self.executing == Some(*id) {
                self.executing = None;
            }
        }
        timed_out
    }

    /// Resolves a task to a terminal state, freeing the execution slot if
    /// it held it. Returns the task so the caller can build an event from
    /// it before it's dropped.
    pub fn finish(&mut self, id: TaskId, state: TaskState) -> Option<Task> {
        debug_assert!(state.is_terminal());
        if self.executing == Some(id) {
            self.executing = None;
        }
        if let Some(t) = self.get_mut(id) {
            t.state = state;
        }
        let task = self.get(id).cloned();
        self.tasks.retain(|t| t.id != id);
        task
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    fn addr(n: u8) -> RawAddress {
        RawAddress::from_bytes(&[0, 0, 0, 0, 0, n]).unwrap()
    }

    #[test]
    fn single_executor_invariant_holds() {
        let mut q = TaskQueue::new();
        q.enqueue(TaskKind::Scan, None);
        q.enqueue(TaskKind::TurnBleOn, None);
        let now = Instant::now();
        let first = q.pop_next_runnable(now, true, |_| false);
        assert!(first.is_some());
        let second = q.pop_next_runnable(now, true, |_| false);
        assert!(second.is_none(), "at most one task may be EXECUTING");
    }

    #[test]
    fn higher_priority_task_runs_before_lower_with_same_prerequisites() {
        let mut q = TaskQueue::new();
        let low = q.enqueue(TaskKind::Scan, None).new_task;
        assert_eq!(q.get(low).unwrap().priority, Priority::Low);
        let _high = q.enqueue(TaskKind::TurnBleOn, None).new_task;
        let now = Instant::now();
        let picked = q.pop_next_runnable(now, true, |_| false).unwrap();
        assert_eq!(q.get(picked).unwrap().priority, Priority::High);
    }

    #[test]
    fn requires_connection_blocks_until_device_connected() {
        let mut q = TaskQueue::new();
        let target = ble_adapter::AttributeTarget { service_uuid: None, char_uuid: ble_common::Uuid::empty(), descriptor_uuid: None };
        q.enqueue(TaskKind::Read { target }, Some(addr(1)));
        let now = Instant::now();
        assert!(q.pop_next_runnable(now, true, |_| false).is_none());
        assert!(q.pop_next_runnable(now, true, |a| a == addr(1)).is_some());
    }

    #[test]
    fn connect_cancels_queued_disconnect() {
        let mut q = TaskQueue::new();
        q.enqueue(TaskKind::Disconnect, Some(addr(1)));
        let result = q.enqueue(TaskKind::Connect { auto_connect: false }, Some(addr(1)));
        assert_eq!(result.cancelled.len(), 1);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn timeout_frees_execution_slot() {
        let mut q = TaskQueue::new();
        q.enqueue(TaskKind::Scan, None);
        let now = Instant::now();
        let id = q.pop_next_runnable(now, true, |_| false).unwrap();
        let later = now + std::time::Duration::from_secs(999);
        let timed_out = q.sweep_timeouts(later);
        assert_eq!(timed_out, vec![id]);
        assert!(q.executing_id().is_none());
    }
}
