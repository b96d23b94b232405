//! Scoped ownership of forked children.
//!
//! Every fork path takes a [`ChildGuard`] immediately after learning
//! the child's PID. If the surrounding operation unwinds before the
//! guard is released, the child is killed and reaped so no orphan or
//! zombie survives an error path.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// SIGKILLs `pid` and reaps it, retrying waitpid on EINTR. Safe to call
/// on an already-dead or already-reaped process.
pub fn kill_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    loop {
        match waitpid(pid, None) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
        }
    }
}

/// Waits up to `timeout` for `pid` to exit, polling with WNOHANG at
/// 10 ms intervals. Returns true when the process has exited (or is
/// not ours to wait for), false on timeout.
pub fn wait_for_exit(pid: Pid, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return true,
            Err(Errno::EINTR) => {}
            // ECHILD: already reaped elsewhere, or never our child.
            Err(_) => return true,
        }
        if std::time::Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Whether a process with this PID exists from the caller's point of
/// view. Zombies count as nonexistent: some init systems fail to reap
/// adopted children, which would otherwise make dead processes look
/// alive.
pub fn os_process_exists(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => !is_zombie(pid),
        Err(errno) => errno != Errno::ESRCH,
    }
}

fn is_zombie(pid: Pid) -> bool {
    let file = match File::open(format!("/proc/{}/status", pid)) {
        Ok(file) => file,
        Err(_) => return false,
    };
    for line in BufReader::new(file).lines().map_while(|l| l.ok()) {
        if line.starts_with("State:") {
            return line.contains("Z (zombie)");
        }
    }
    false
}

/// Kills and reaps the guarded child on drop unless released.
#[derive(Debug)]
pub struct ChildGuard {
    pid: Pid,
    armed: bool,
}

impl ChildGuard {
    pub fn new(pid: Pid) -> Self {
        ChildGuard { pid, armed: true }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Disarms the guard: the child survives this scope.
    pub fn release(mut self) -> Pid {
        self.armed = false;
        self.pid
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("Killing and reaping abandoned child {}", self.pid);
            kill_and_reap(self.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn spawn_sleeper() -> std::process::Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("cannot spawn sleep")
    }

    #[test]
    fn guard_kills_child_on_drop() {
        let child = spawn_sleeper();
        let pid = Pid::from_raw(child.id() as i32);
        drop(ChildGuard::new(pid));
        assert!(!os_process_exists(pid));
    }

    #[test]
    fn released_guard_leaves_child_alone() {
        let mut child = spawn_sleeper();
        let pid = Pid::from_raw(child.id() as i32);
        let guard = ChildGuard::new(pid);
        assert_eq!(guard.release(), pid);
        assert!(os_process_exists(pid));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn wait_for_exit_times_out_on_live_process() {
        let mut child = spawn_sleeper();
        let pid = Pid::from_raw(child.id() as i32);
        assert!(!wait_for_exit(pid, Duration::from_millis(50)));
        child.kill().unwrap();
        assert!(wait_for_exit(pid, Duration::from_secs(5)));
    }

    #[test]
    fn nonexistent_process_does_not_exist() {
        // PID near the typical pid_max; extremely unlikely to be live.
        assert!(!os_process_exists(Pid::from_raw(4_190_000)));
    }

    #[test]
    fn kill_and_reap_tolerates_dead_processes() {
        let mut child = spawn_sleeper();
        let pid = Pid::from_raw(child.id() as i32);
        child.kill().unwrap();
        child.wait().unwrap();
        // Already reaped; must not hang or panic.
        kill_and_reap(pid);
    }
}
