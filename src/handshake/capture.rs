//! Background capture of a subprocess's combined stdout/stderr.
//!
//! Whatever the child prints during the handshake is kept so a failed
//! spawn can attach it to the error report. The reader thread polls
//! with a short timeout so `stop` can reclaim it without tearing the
//! underlying descriptor out from under a blocked read.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

pub struct BackgroundIoCapturer {
    buffer: Arc<Mutex<Vec<u8>>>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundIoCapturer {
    pub fn start(file: File, pid: i32) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));

        let thread_buffer = Arc::clone(&buffer);
        let thread_stop = Arc::clone(&stop_flag);
        let builder =
            std::thread::Builder::new().name(format!("Output capturer: PID {pid}"));
        let handle = builder
            .spawn(move || {
                let mut file = file;
                let mut chunk = [0u8; 1024];
                loop {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
                    match poll(&mut fds, PollTimeout::from(100u16)) {
                        Ok(0) => continue,
                        Ok(_) => {}
                        Err(nix::errno::Errno::EINTR) => continue,
                        Err(_) => break,
                    }
                    match file.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut buf = thread_buffer.lock().unwrap();
                            buf.extend_from_slice(&chunk[..n]);
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            })
            .ok();

        BackgroundIoCapturer {
            buffer,
            stop_flag,
            handle,
        }
    }

    /// A snapshot of everything captured so far.
    pub fn data(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Stops the capturer and returns the captured output. Sleeps
    /// briefly first so a just-exited child's final writes land.
    pub fn stop(mut self) -> String {
        std::thread::sleep(Duration::from_millis(50));
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.data()
    }
}

impl Drop for BackgroundIoCapturer {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
