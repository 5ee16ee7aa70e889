use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

/// Global shutdown flag (atomic bool)
///
/// Set to true when shutdown is requested via signal.
/// Running transfers check it between chunks and cancel themselves.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global flag to track which signal triggered shutdown
///
/// Values: 0 = none, 1 = SIGINT, 2 = SIGTERM
pub static SIGNAL_TYPE: AtomicU8 = AtomicU8::new(0);

/// Checks if graceful shutdown has been requested
///
/// # Returns
/// `true` if shutdown was requested via signal
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Signals all sessions to stop at the next chunk boundary
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Request shutdown with signal type for later logging
///
/// Only sets atomic flags; logging happens in the main thread.
///
/// # Arguments
/// * `signal_type` - 1 for SIGINT, 2 for SIGTERM
pub fn request_shutdown_with_signal(signal_type: u8) {
    SIGNAL_TYPE.store(signal_type, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Get the signal type that triggered shutdown
///
/// # Returns
/// * `None` if no signal received
/// * `Some(1)` for SIGINT (Ctrl+C)
/// * `Some(2)` for SIGTERM
pub fn get_signal_type() -> Option<u8> {
    let signal_type = SIGNAL_TYPE.load(Ordering::SeqCst);
    if signal_type == 0 {
        None
    } else {
        Some(signal_type)
    }
}

/// Human-readable name of the signal that requested shutdown
pub fn signal_name(signal_type: u8) -> &'static str {
    match signal_type {
        1 => "SIGINT",
        2 => "SIGTERM",
        _ => "unknown signal",
    }
}

/// Spawns the thread that turns SIGINT/SIGTERM into a shutdown request
pub fn install_signal_handlers() -> io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGINT => request_shutdown_with_signal(1),
                SIGTERM => request_shutdown_with_signal(2),
                _ => request_shutdown(),
            }
        }
    });
    Ok(())
}

/// Reset the shutdown flag (for testing purposes only)
#[cfg(test)]
pub fn reset_shutdown_for_tests() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    SIGNAL_TYPE.store(0, Ordering::SeqCst);
}
