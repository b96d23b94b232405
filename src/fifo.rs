//! Opening FIFOs under a deadline.
//!
//! Opening a FIFO for reading blocks until the peer opens the write
//! end, which is exactly the rendezvous the handshake wants, but it
//! must not block past the session deadline. The open is therefore
//! off-loaded to a worker thread; the caller waits on a channel with
//! a timeout, and on expiry unblocks the worker by briefly opening
//! the FIFO itself in O_RDWR|O_NONBLOCK mode (which always succeeds
//! on a FIFO and completes the worker's pending open).

use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::SpawnError;
use crate::timing::{monotonic_usec, Deadline};

/// Opens `path` for reading, blocking at most for the deadline's
/// remaining budget. The elapsed time is charged to the deadline on
/// every exit path.
pub fn open_fifo_with_timeout(
    path: &Path,
    deadline: &mut Deadline,
) -> Result<File, SpawnError> {
    let start = monotonic_usec();
    let remaining = deadline.remaining();

    let (tx, rx) = crossbeam_channel::bounded::<std::io::Result<File>>(1);
    let worker_path: PathBuf = path.to_path_buf();
    let worker = std::thread::Builder::new()
        .name(format!("FIFO opener: {}", worker_path.display()))
        .spawn(move || {
            let result = File::open(&worker_path);
            let _ = tx.send(result);
        })
        .map_err(SpawnError::Io)?;

    match rx.recv_timeout(remaining) {
        Ok(result) => {
            deadline.consume_since(start);
            let _ = worker.join();
            result.map_err(|e| {
                SpawnError::os(
                    format!("Cannot open FIFO {}", path.display()),
                    nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                )
            })
        }
        Err(_) => {
            // Complete the worker's pending open so the thread can be
            // joined instead of leaked.
            let unblock = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path);
            let _ = worker.join();
            drop(unblock);
            deadline.exhaust();
            Err(SpawnError::Timeout(format!(
                "Timeout opening FIFO {}",
                path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn make_fifo(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        nix::unistd::mkfifo(&path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        path
    }

    #[test]
    fn open_succeeds_when_writer_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(dir.path(), "pipe");

        let writer_path = path.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .open(&writer_path)
                .unwrap();
            f.write_all(b"hello\n").unwrap();
        });

        let mut deadline = Deadline::new(5_000_000);
        let file = open_fifo_with_timeout(&path, &mut deadline).unwrap();
        writer.join().unwrap();

        let mut contents = String::new();
        use std::io::Read;
        let mut file = file;
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello\n");
        assert!(deadline.remaining_usec() < 5_000_000);
    }

    #[test]
    fn open_times_out_without_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_fifo(dir.path(), "pipe");

        let mut deadline = Deadline::new(100_000);
        let err = open_fifo_with_timeout(&path, &mut deadline).unwrap_err();
        assert!(matches!(err, SpawnError::Timeout(_)));
        assert!(deadline.expired());
    }

    #[test]
    fn missing_fifo_reports_os_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist");
        let mut deadline = Deadline::new(1_000_000);
        let err = open_fifo_with_timeout(&path, &mut deadline).unwrap_err();
        assert!(matches!(err, SpawnError::Os { .. }));
    }
}
