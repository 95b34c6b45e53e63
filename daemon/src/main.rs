use ble_adapter::{MemoryHistoricalStore, MemoryPersistedState, SimulatedBleStack};
use blecentral::{Config, Dispatcher, EventListener, Manager};
use clap::{App, Arg};
use configparser::ini::Ini;
use std::sync::Arc;

/// Prints every dispatched `CoreEvent` to the log at info level. Stands in
/// for a real application listener until one is wired over IPC.
struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &blecentral::CoreEvent) {
        log::info!("event: {:?}", event);
    }
}

fn load_config(path: Option<&str>) -> Config {
    let path = match path {
        Some(p) => p,
        None => return Config::default(),
    };

    let mut ini = Ini::new();
    match ini.load(path) {
        Ok(_) => {}
        Err(e) => {
            log::warn!("failed to load config {}: {}, using defaults", path, e);
            return Config::default();
        }
    }

    // `Ini` keeps values grouped by section; our config file has none, so
    // everything lands in configparser's implicit "default" section. Flatten
    // it back into the `key=value` shape `Config::load_from_str` expects.
    let mut flattened = String::new();
    for (_section, entries) in ini.get_map_ref() {
        for (key, value) in entries {
            if let Some(value) = value {
                flattened.push_str(key);
                flattened.push('=');
                flattened.push_str(value);
                flattened.push('\n');
            }
        }
    }
    Config::load_from_str(&flattened)
}

fn main() {
    env_logger::init();
    log_panics::init();

    let matches = App::new("blecentrald")
        .about("Reference BLE central daemon driving a simulated stack")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .takes_value(true)
                .help("Path to an ini-style config file overriding scheduler defaults"),
        )
        .arg(
            Arg::with_name("response-delay-ms")
                .long("response-delay-ms")
                .takes_value(true)
                .help("Simulated stack response latency in milliseconds"),
        )
        .get_matches();

    let config = load_config(matches.value_of("config"));
    let response_delay_ms: u64 = matches
        .value_of("response-delay-ms")
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("blecentrald")
        .build()
        .expect("failed to build tokio runtime");

    runtime.block_on(async move {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let stack: Arc<dyn ble_adapter::BleStack> =
            Arc::new(SimulatedBleStack::with_response_delay(tx, std::time::Duration::from_millis(response_delay_ms)));
        let persisted = Arc::new(MemoryPersistedState::new());
        let historical = Arc::new(MemoryHistoricalStore::new());

        let mut dispatcher = Dispatcher::inline();
        dispatcher.stack_mut().set(Arc::new(LoggingListener));

        let mut manager = Manager::new(config, stack, persisted, historical, dispatcher);

        log::info!("blecentrald started");
        blecentral::run(&mut manager, rx).await;
        log::info!("blecentrald shutting down, event channel closed");
    });
}
