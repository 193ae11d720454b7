//! Clock sources for the rest of the kernel.
//!
//! The library layer must not link against architecture code, so both clocks
//! are registered function pointers: the monotonic clock feeds wait-queue
//! deadlines, the realtime clock stamps IPC objects. Until a source is
//! registered both clocks read zero, which means deadlines never expire and
//! timestamps behave as they do before the RTC is brought up.

#![no_std]

use spin::Once;

static MONOTONIC: Once<fn() -> u64> = Once::new();
static REALTIME: Once<fn() -> u64> = Once::new();

/// Registers the monotonic clock, in milliseconds. Later registrations are
/// ignored.
pub fn register_clock(source: fn() -> u64) {
    MONOTONIC.call_once(|| source);
}

/// Registers the realtime clock, in seconds since the epoch. Later
/// registrations are ignored.
pub fn register_realtime(source: fn() -> u64) {
    REALTIME.call_once(|| source);
}

/// Milliseconds from the monotonic clock, 0 if none is registered.
pub fn now_ms() -> u64 {
    MONOTONIC.get().map(|f| f()).unwrap_or(0)
}

/// Seconds from the realtime clock, 0 if none is registered.
pub fn realtime_seconds() -> u64 {
    REALTIME.get().map(|f| f()).unwrap_or(0)
}
