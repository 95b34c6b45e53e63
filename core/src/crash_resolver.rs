use ble_common::GattError;

/// Tracks whether a crash-resolver flush is currently in flight. Resolved
/// open question: a second request while one is already running bails out
/// immediately with `Busy` rather than queuing behind it or restarting it —
/// the native flush already covers any state that arrived after the first
/// request was issued, so coalescing would just waste a CRITICAL-priority
/// slot.
#[derive(Debug, Default)]
pub struct CrashResolver {
    running: bool,
}

impl CrashResolver {
    pub fn new() -> Self {
        CrashResolver { running: false }
    }

    /// Call before submitting the CrashResolver task. Returns `Err(Busy)`
    /// without side effects if a flush is already in flight.
    pub fn try_start(&mut self) -> Result<(), GattError> {
        if self.running {
            return Err(GattError::Busy);
        }
        self.running = true;
        Ok(())
    }

    pub fn finish(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_while_running_bails_out_with_busy() {
        let mut resolver = CrashResolver::new();
        assert!(resolver.try_start().is_ok());
        assert_eq!(resolver.try_start(), Err(GattError::Busy));
        resolver.finish();
        assert!(resolver.try_start().is_ok());
    }
}
