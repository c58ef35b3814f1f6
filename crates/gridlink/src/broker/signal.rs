// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! POSIX signal watch for clean shutdown.
//!
//! SIGINT and SIGTERM store the signal number into a process-wide atomic;
//! the broker loop polls [`take`] between poll iterations and converts a
//! pending signal into a cooperative stop.

use std::sync::atomic::{AtomicI32, Ordering};

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn store_signal(signum: libc::c_int) {
    PENDING_SIGNAL.store(signum, Ordering::Relaxed);
}

/// Install handlers for SIGINT and SIGTERM.
///
/// Idempotent; later calls re-install the same handlers.
pub fn install() {
    // SAFETY: store_signal is async-signal-safe (single relaxed atomic
    // store, no allocation, no locking), and the handler pointer outlives
    // the process.
    unsafe {
        libc::signal(libc::SIGINT, store_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, store_signal as libc::sighandler_t);
    }
    log::debug!("[signal] watching SIGINT, SIGTERM");
}

/// Take the pending signal, if one arrived since the last call.
pub fn take() -> Option<i32> {
    match PENDING_SIGNAL.swap(0, Ordering::Relaxed) {
        0 => None,
        signum => Some(signum),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_drains_pending_signal() {
        PENDING_SIGNAL.store(libc::SIGTERM, Ordering::Relaxed);
        assert_eq!(take(), Some(libc::SIGTERM));
        assert_eq!(take(), None);
    }
}
