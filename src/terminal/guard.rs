use std::os::fd::RawFd;
use std::sync::{Mutex, Once};

/// Terminals currently in raw mode, with the attributes to put back.
static RAW_TERMINALS: Mutex<Vec<(RawFd, libc::termios)>> = Mutex::new(Vec::new());
static PANIC_HOOK: Once = Once::new();

/// Remember that `fd` is in raw mode so a panic can restore it.
pub(crate) fn track(fd: RawFd, original: libc::termios) {
    install_panic_hook();
    if let Ok(mut terminals) = RAW_TERMINALS.lock() {
        terminals.retain(|(tracked, _)| *tracked != fd);
        terminals.push((fd, original));
    }
}

pub(crate) fn untrack(fd: RawFd) {
    if let Ok(mut terminals) = RAW_TERMINALS.lock() {
        terminals.retain(|(tracked, _)| *tracked != fd);
    }
}

fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            restore_all();
            default_hook(info);
        }));
    });
}

fn restore_all() {
    if let Ok(mut terminals) = RAW_TERMINALS.lock() {
        for (fd, original) in terminals.drain(..) {
            unsafe {
                libc::tcsetattr(fd, libc::TCSANOW, &original);
            }
        }
    }
}
