//! Unix signal handling (SIGINT).
//!
//! Jobs run in their own process groups, so a Ctrl-C at the terminal only
//! reaches us.  The handler just raises a flag; the engine notices it on its
//! next tick and kills running jobs with the configured signals.  A second
//! SIGINT gets the default action.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn sigint_action(handler: libc::sighandler_t) {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

extern "C" fn sigint_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
    sigint_action(libc::SIG_DFL);
}

pub fn register_sigint() {
    sigint_action(sigint_handler as extern "C" fn(libc::c_int) as libc::sighandler_t);
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
