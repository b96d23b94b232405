//! Background watcher that drains a child's combined output pipe and
//! forwards it to the log, line by line. Runs for the lifetime of the
//! preloader; ends when the pipe reaches EOF.

use std::fs::File;
use std::io::{BufRead, BufReader};

pub struct PipeWatcher;

impl PipeWatcher {
    /// Spawns the watcher thread. The thread owns the file and exits
    /// when the peer closes it.
    pub fn start(file: File, name: &'static str, pid: i32) {
        let builder =
            std::thread::Builder::new().name(format!("Pipe watcher: PID {pid} {name}"));
        let spawned = builder.spawn(move || {
            let reader = BufReader::new(file);
            for line in reader.lines() {
                match line {
                    Ok(line) => log::info!("[App {pid} {name}] {line}"),
                    Err(e) => {
                        log::debug!("Pipe watcher for PID {pid} stopped: {e}");
                        break;
                    }
                }
            }
        });
        if let Err(e) = spawned {
            log::warn!("Cannot start pipe watcher for PID {pid}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn watcher_drains_pipe_until_eof() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        let read_file = File::from(read_fd);
        let mut write_file = File::from(write_fd);

        PipeWatcher::start(read_file, "output", 1234);
        write_file.write_all(b"line one\nline two\n").unwrap();
        drop(write_file);
        // The thread exits on EOF; nothing to assert beyond not
        // panicking, the lines land in the log.
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}
