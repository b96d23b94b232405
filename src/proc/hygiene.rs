//! Pre-exec hygiene for forked children: signal-handler reset and file
//! descriptor closure.
//!
//! These run in the narrow window between `fork` and `exec`, so they
//! stick to direct system calls.

use nix::sys::signal::{sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};

/// Restores default dispositions for all catchable signals and clears
/// the signal mask. The forked child must not inherit the
/// orchestrator's handlers.
pub fn reset_signal_handlers_and_mask() {
    for signal in Signal::iterator() {
        if signal == Signal::SIGKILL || signal == Signal::SIGSTOP {
            continue;
        }
        // SAFETY: installing SIG_DFL is async-signal-safe and has no
        // handler state to race with.
        unsafe {
            let _ = nix::sys::signal::signal(signal, SigHandler::SigDfl);
        }
    }
    let empty = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&empty), None);
}

/// Closes every file descriptor above `min_fd`. Prefers the
/// close_range syscall (Linux 5.9+), falling back to a /proc sweep.
pub fn close_all_fds_above(min_fd: i32) {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                (min_fd + 1) as libc::c_uint,
                libc::c_uint::MAX,
                0 as libc::c_int,
            )
        };
        if rc == 0 {
            return;
        }
    }
    close_fds_via_proc(min_fd);
}

fn close_fds_via_proc(min_fd: i32) {
    let entries = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries,
        Err(_) => {
            // No /proc: sweep a generous fixed range instead.
            for fd in (min_fd + 1)..1024 {
                unsafe {
                    libc::close(fd);
                }
            }
            return;
        }
    };

    let mut fds = Vec::new();
    for entry in entries.flatten() {
        if let Some(fd) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            if fd > min_fd {
                fds.push(fd);
            }
        }
    }
    // Closing after the readdir loop avoids closing the directory fd
    // out from under the iterator.
    for fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_signal_handlers_is_idempotent() {
        reset_signal_handlers_and_mask();
        reset_signal_handlers_and_mask();
    }
}
