//! The scheduler: a single global task queue, per-device state machines, a
//! reconnect controller, and the transaction composer used for auth/init/OTA
//! sequences. `Manager` ties all of it to a `BleStack` implementation; `run`
//! drives it from native events and a periodic tick.

pub mod clock;
pub mod config;
pub mod crash_resolver;
pub mod device;
pub mod events;
pub mod listener;
pub mod manager;
pub mod queue;
pub mod reconnect;
pub mod task;
pub mod transaction;

pub use clock::Ticker;
pub use config::Config;
pub use device::{Device, DeviceState};
pub use events::CoreEvent;
pub use listener::{Dispatcher, EventListener, ListenerStack};
pub use manager::Manager;
pub use task::{Priority, Task, TaskId, TaskKind, TaskState};

use ble_adapter::StackEvent;
use tokio::sync::mpsc::UnboundedReceiver;

/// Runs the update worker until `events` closes: on every tick it advances
/// the scheduler, and every native `StackEvent` that arrives in between is
/// applied as soon as it's received. This is the only place a `Manager` is
/// ever driven from outside its own methods.
pub async fn run(manager: &mut Manager, mut events: UnboundedReceiver<StackEvent>) {
    let mut ticker = Ticker::new(manager.config.auto_update_rate);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                manager.on_tick(tokio::time::Instant::now().into_std());
            }
            event = events.recv() => {
                match event {
                    Some(event) => manager.handle_stack_event(event, tokio::time::Instant::now().into_std()),
                    None => break,
                }
            }
        }
    }
}
