//! SIGINT handling for cancellation.
//!
//! Interrupts are counted, not just flagged.  The first ^C requests a
//! graceful stop: the executor starts no new commands and in-flight
//! children get the usual terminate-then-kill treatment, so the run
//! still ends with an accurate summary.  A second ^C means the user is
//! done waiting and the process exits immediately.

use std::sync::atomic::{AtomicU32, Ordering};

static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

#[cfg(unix)]
extern "C" fn on_sigint(_sig: libc::c_int) {
    if INTERRUPTS.fetch_add(1, Ordering::Relaxed) > 0 {
        // Only async-signal-safe calls are allowed here; _exit is.
        // 130 is the conventional status for death by SIGINT.
        unsafe { libc::_exit(130) };
    }
}

#[cfg(unix)]
pub fn register_sigint() {
    // Safety: installing a handler that only touches an atomic.
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub fn register_sigint() {
    // Ctrl-C on Windows kills the process group outright, which is the
    // second-interrupt behavior; graceful cancellation still works
    // through CancelHandle.
}

/// Whether a graceful stop has been requested.  Checked by the
/// executor between commands alongside each run's own `CancelHandle`.
pub fn was_interrupted() -> bool {
    INTERRUPTS.load(Ordering::Relaxed) > 0
}
