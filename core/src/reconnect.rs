use crate::config::Config;
use crate::device::ReconnectBookkeeping;
use crate::events::ConnectFailEvent;
use ble_common::GattError;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryNow { auto_connect: bool },
    RetryAfter { delay: Duration },
    GiveUp,
}

/// Stateless decision function over a device's `ReconnectBookkeeping`. A
/// single connect "attempt" spans BLE_CONNECTING through INITIALIZING;
/// sub-step failures within the short-term and long-term windows are
/// retried silently. Exactly one `GiveUp` is ever returned per window,
/// which is the only point the caller should surface a `ConnectFailEvent`
/// to the application (invariant: one visible failure per long-term
/// window, regardless of how many sub-attempts it took).
pub fn on_connect_fail(
    bk: &mut ReconnectBookkeeping,
    config: &Config,
    event: &ConnectFailEvent,
    now: Instant,
) -> ReconnectDecision {
    if event.status == GattError::TimedOut && !bk.retried_this_attempt {
        bk.retried_this_attempt = true;
        return ReconnectDecision::RetryNow { auto_connect: !event.auto_connect_used };
    }
    bk.retried_this_attempt = false;
    bk.attempt_count += 1;
    bk.last_failure = Some(event.status);

    let window_start = *bk.window_start.get_or_insert(now);

    if !bk.in_long_term {
        if now.duration_since(window_start) < config.reconnect_filter_short_term_timeout {
            let delay = short_term_delay(bk.attempt_count);
            bk.next_permitted_attempt = Some(now + delay);
            return ReconnectDecision::RetryAfter { delay };
        }
        bk.in_long_term = true;
        bk.window_start = Some(now);
    }

    let long_term_start = bk.window_start.expect("long-term window always has a start once entered");
    if now.duration_since(long_term_start) >= config.reconnect_filter_long_term_timeout {
        return ReconnectDecision::GiveUp;
    }

    let delay = long_term_delay(bk.attempt_count);
    bk.next_permitted_attempt = Some(now + delay);
    ReconnectDecision::RetryAfter { delay }
}

fn short_term_delay(attempt: u32) -> Duration {
    Duration::from_millis(200 * attempt.min(5) as u64)
}

fn long_term_delay(attempt: u32) -> Duration {
    Duration::from_secs(attempt.min(30) as u64)
}
