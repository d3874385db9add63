//! Interrupt handling via an atomic flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Global interrupt flag, set by the SIGINT/SIGTERM handler and polled
/// by the harvester at coarse boundaries.
pub fn interrupt_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

pub fn is_interrupted() -> bool {
    interrupt_flag().load(Ordering::Relaxed)
}

/// First signal requests an orderly stop at the next coarse boundary;
/// a second signal force-exits.
pub fn install_handler() {
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if interrupt_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("failed to register SIGINT handler");
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if interrupt_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("failed to register SIGTERM handler");
    }
}
