use crate::events::CoreEvent;
use std::sync::Arc;

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CoreEvent);
}

/// A LIFO stack of listeners for one event slot. `push` adds a new head;
/// `pop` removes it; `set` clears and installs a single listener. Dispatch
/// only ever reaches the current head, so a screen can push its own
/// listener temporarily without the listener underneath losing its place.
#[derive(Default)]
pub struct ListenerStack {
    stack: Vec<Arc<dyn EventListener>>,
}

impl ListenerStack {
    pub fn new() -> Self {
        ListenerStack { stack: Vec::new() }
    }

    pub fn push(&mut self, listener: Arc<dyn EventListener>) {
        self.stack.push(listener);
    }

    pub fn pop(&mut self) -> Option<Arc<dyn EventListener>> {
        self.stack.pop()
    }

    pub fn set(&mut self, listener: Arc<dyn EventListener>) {
        self.stack.clear();
        self.stack.push(listener);
    }

    pub fn head(&self) -> Option<&Arc<dyn EventListener>> {
        self.stack.last()
    }

    pub fn dispatch(&self, event: &CoreEvent) {
        if let Some(head) = self.head() {
            head.on_event(event);
        }
    }
}

/// Where a dispatched event is actually delivered. `Inline` runs the
/// listener synchronously on the update worker (used for OTA, where
/// throughput matters more than staying off the app's thread); `PostToApp`
/// hands the event to a channel the application drains on its own runloop.
pub enum Dispatcher {
    Inline(ListenerStack),
    PostToApp { stack: ListenerStack, tx: tokio::sync::mpsc::UnboundedSender<CoreEvent> },
}

impl Dispatcher {
    pub fn inline() -> Self {
        Dispatcher::Inline(ListenerStack::new())
    }

    pub fn post_to_app(tx: tokio::sync::mpsc::UnboundedSender<CoreEvent>) -> Self {
        Dispatcher::PostToApp { stack: ListenerStack::new(), tx }
    }

    pub fn stack_mut(&mut self) -> &mut ListenerStack {
        match self {
            Dispatcher::Inline(s) => s,
            Dispatcher::PostToApp { stack, .. } => stack,
        }
    }

    pub fn dispatch(&self, event: CoreEvent) {
        match self {
            Dispatcher::Inline(stack) => stack.dispatch(&event),
            Dispatcher::PostToApp { stack, tx } => {
                stack.dispatch(&event);
                let _ = tx.send(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);
    impl EventListener for Counter {
        fn on_event(&self, _event: &CoreEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dummy_event() -> CoreEvent {
        CoreEvent::Discovery(crate::events::DiscoveryEvent {
            addr: ble_common::RawAddress::empty(),
            lifecycle: crate::events::DiscoveryLifecycle::Discovered,
        })
    }

    #[test]
    fn only_the_top_listener_receives_events() {
        let mut stack = ListenerStack::new();
        let bottom = Arc::new(AtomicUsize::new(0));
        let top = Arc::new(AtomicUsize::new(0));
        stack.push(Arc::new(Counter(bottom.clone())));
        stack.push(Arc::new(Counter(top.clone())));

        stack.dispatch(&dummy_event());

        assert_eq!(top.load(Ordering::SeqCst), 1);
        assert_eq!(bottom.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pop_restores_the_previous_listener() {
        let mut stack = ListenerStack::new();
        let bottom = Arc::new(AtomicUsize::new(0));
        stack.push(Arc::new(Counter(bottom.clone())));
        stack.push(Arc::new(Counter(Arc::new(AtomicUsize::new(0)))));

        stack.pop();
        stack.dispatch(&dummy_event());

        assert_eq!(bottom.load(Ordering::SeqCst), 1);
    }
}
