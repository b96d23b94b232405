//! The smart spawner: spawns application processes by forking them off
//! a long-lived preloader helper.
//!
//! The preloader loads the application once; each subsequent spawn is
//! a cheap fork inside it, requested over the preloader's command
//! socket. The spawner keeps the preloader alive across spawns,
//! restarts it once when it crashes mid-command, and distrusts the
//! PIDs it reports until their uid checks out.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::unistd::{fork, ForkResult, Pid};

use crate::config::{AppOptions, Config};
use crate::error::{escape_html, ErrorCategory, SpawnError, SpawnException};
use crate::fifo::open_fifo_with_timeout;
use crate::handshake::{BackgroundIoCapturer, HandshakePerform, HandshakePrepare, HandshakeSession};
use crate::journey::{Journey, JourneyStep, JourneyStepState, JourneyType};
use crate::lve::LveScope;
use crate::proc::guard::{kill_and_reap, os_process_exists, wait_for_exit, ChildGuard};
use crate::proc::hygiene;
use crate::proc::metrics::{MetricsError, ProcessMetricsCollector};
use crate::spawner::pipe_watcher::PipeWatcher;
use crate::spawner::{SpawnResult, Spawner};
use crate::timing::wall_clock_usec;

/// Maximum accepted length of one fork-command response line,
/// including the terminating newline.
const MAX_RESPONSE_SIZE: usize = 10240;

/// How long a preloader gets to exit voluntarily after its stdin is
/// closed, before it is SIGKILLed.
const PRELOADER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// The running preloader, as a single aggregate so that "pid known",
/// "command socket known" and "stdin open" can only exist together.
struct PreloaderHandle {
    pid: Pid,
    socket_address: String,
    /// Closing this asks the preloader to shut down.
    stdin: File,
    /// Snapshot of `envdump/annotations/` taken at preloader startup;
    /// attached to every exception this spawner constructs.
    annotations: BTreeMap<String, String>,
}

struct Fields {
    handle: Option<PreloaderHandle>,
    last_used_usec: u64,
}

pub struct SmartSpawner {
    options: AppOptions,
    /// Serializes preloader lifecycle and spawn calls.
    syncher: Mutex<()>,
    /// Guards the quickly-accessed fields; never held across blocking
    /// I/O. Lock order: `syncher` first, then `fields`.
    fields: Mutex<Fields>,
}

/// A child produced by the preloader, still owned by its kill guard.
struct ForkedChild {
    guard: ChildGuard,
    stdin: Option<File>,
    stdout_and_err: Option<File>,
}

/// Outcome classification for one fork-command attempt.
enum ForkCommandError {
    /// The preloader itself is gone (connection or system error).
    /// Eligible for the one-shot restart-and-retry.
    Crashed(SpawnError),
    /// A definitive failure that retrying would not fix.
    Fatal(Box<SpawnException>),
}

enum StartError {
    Spawn(SpawnError),
    Exception(Box<SpawnException>),
}

impl From<SpawnError> for StartError {
    fn from(err: SpawnError) -> Self {
        StartError::Spawn(err)
    }
}

impl From<nix::errno::Errno> for StartError {
    fn from(err: nix::errno::Errno) -> Self {
        StartError::Spawn(err.into())
    }
}

enum SocketAddressKind {
    Unix(PathBuf),
    Tcp(String),
}

fn parse_socket_address(address: &str) -> Result<SocketAddressKind, SpawnError> {
    if let Some(path) = address.strip_prefix("unix:") {
        Ok(SocketAddressKind::Unix(PathBuf::from(path)))
    } else if let Some(hostport) = address.strip_prefix("tcp://") {
        Ok(SocketAddressKind::Tcp(hostport.to_string()))
    } else {
        Err(SpawnError::Config(format!(
            "unsupported socket address '{address}'"
        )))
    }
}

enum PreloaderConnection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl PreloaderConnection {
    fn connect(address: &str, timeout: Duration) -> Result<Self, SpawnError> {
        match parse_socket_address(address)? {
            SocketAddressKind::Unix(path) => {
                let stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                Ok(PreloaderConnection::Unix(stream))
            }
            SocketAddressKind::Tcp(hostport) => {
                use std::net::ToSocketAddrs;
                let addr = hostport
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        SpawnError::Config(format!("cannot resolve '{hostport}'"))
                    })?;
                let stream = TcpStream::connect_timeout(&addr, timeout)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                Ok(PreloaderConnection::Tcp(stream))
            }
        }
    }
}

impl Read for PreloaderConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            PreloaderConnection::Unix(s) => s.read(buf),
            PreloaderConnection::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for PreloaderConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            PreloaderConnection::Unix(s) => s.write(buf),
            PreloaderConnection::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            PreloaderConnection::Unix(s) => s.flush(),
            PreloaderConnection::Tcp(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
enum ReadLineError {
    TooLong,
    Io(std::io::Error),
}

/// Reads one newline-terminated response, bounded at
/// [`MAX_RESPONSE_SIZE`] bytes including the newline.
fn read_bounded_line(conn: &mut impl Read) -> Result<String, ReadLineError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if let Some(idx) = buffer.iter().position(|&b| b == b'\n') {
            if idx + 1 > MAX_RESPONSE_SIZE {
                return Err(ReadLineError::TooLong);
            }
            buffer.truncate(idx);
            return Ok(String::from_utf8_lossy(&buffer).into_owned());
        }
        if buffer.len() > MAX_RESPONSE_SIZE {
            return Err(ReadLineError::TooLong);
        }
        match conn.read(&mut chunk) {
            Ok(0) => {
                return Err(ReadLineError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before a full response arrived",
                )))
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadLineError::Io(e)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SmartSpawner {
    pub fn new(options: &AppOptions) -> Result<Self, SpawnError> {
        if options.preloader_command.len() < 2 {
            return Err(SpawnError::Config(
                "preloader_command must have at least 2 elements".into(),
            ));
        }
        Ok(SmartSpawner {
            options: options.clone(),
            syncher: Mutex::new(()),
            fields: Mutex::new(Fields {
                handle: None,
                last_used_usec: wall_clock_usec(),
            }),
        })
    }

    /// PID of the running preloader, or -1 when there is none.
    pub fn preloader_pid(&self) -> i32 {
        lock(&self.fields)
            .handle
            .as_ref()
            .map(|h| h.pid.as_raw())
            .unwrap_or(-1)
    }

    fn preloader_started(&self) -> bool {
        lock(&self.fields).handle.is_some()
    }

    fn touch_last_used(&self) {
        lock(&self.fields).last_used_usec = wall_clock_usec();
    }

    fn annotations_snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.fields)
            .handle
            .as_ref()
            .map(|h| h.annotations.clone())
            .unwrap_or_default()
    }

    fn add_preloader_annotations(&self, e: &mut SpawnException) {
        for (name, value) in self.annotations_snapshot() {
            e.set_annotation(name, value, false);
        }
    }

    fn app_config(&self, options: &AppOptions) -> Result<Config, SpawnError> {
        let mut config = Config::from_options(options)?;
        config.spawn_method = "smart".to_string();
        Ok(config)
    }

    /// Config for the preloader process itself: same app parameters,
    /// but the command to run is the preloader command.
    fn preloader_config(&self) -> Result<Config, SpawnError> {
        let mut config = self.app_config(&self.options)?;
        config.start_command = self.options.preloader_command.join(" ");
        Ok(config)
    }

    // ----- Preloader lifecycle -----

    fn start_preloader(&self) -> Result<(), Box<SpawnException>> {
        debug_assert!(!self.preloader_started());
        log::debug!("Spawning new preloader: app_root={}", self.options.app_root);

        let config = match self.preloader_config() {
            Ok(config) => config,
            Err(err) => {
                let mut journey = Journey::new(JourneyType::SpawnThroughPreloader, true);
                let _ = journey.set_step_errored(JourneyStep::SpawnerPreparation, true);
                return Err(Box::new(
                    SpawnException::from_error(&err, &journey).finalize(),
                ));
            }
        };
        let mut session = match HandshakeSession::new(config, JourneyType::StartPreloader) {
            Ok(session) => session,
            Err(err) => {
                let mut journey = Journey::new(JourneyType::StartPreloader, true);
                let _ = journey.set_step_errored(JourneyStep::SpawnerPreparation, true);
                return Err(Box::new(
                    SpawnException::from_error(&err, &journey).finalize(),
                ));
            }
        };
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerPreparation, false);

        match self.internal_start_preloader(&mut session) {
            Ok(()) => Ok(()),
            Err(StartError::Exception(e)) => Err(e),
            Err(StartError::Spawn(err)) => {
                let _ = session
                    .journey
                    .set_step_errored(JourneyStep::SpawnerPreparation, true);
                Err(Box::new(
                    SpawnException::from_error(&err, &session.journey).finalize(),
                ))
            }
        }
    }

    fn internal_start_preloader(
        &self,
        session: &mut HandshakeSession,
    ) -> Result<(), StartError> {
        HandshakePrepare::new(session).execute()?;

        let (stdin_read, stdin_write) = nix::unistd::pipe()?;
        let (stdout_read, stdout_write) = nix::unistd::pipe()?;

        let mut lve_scope = match LveScope::enter(session.uid, session.config.lve_min_uid) {
            Ok(scope) => scope,
            Err(err) => {
                log::warn!("Cannot enter LVE container for uid {}: {}", session.uid, err);
                LveScope::inactive()
            }
        };

        let agent_path = session.config.resolve_agent_path()?;
        let work_dir_path = session.work_dir.path().to_path_buf();

        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerPreparation, false);
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerForkSubprocess, false);
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SubprocessBeforeFirstExec, false);

        // SAFETY: the child branch only performs async-signal-safe
        // work (signal reset, dup2, close, exec) before exec'ing the
        // setupper agent.
        let fork_result = unsafe { fork() };
        match fork_result {
            Ok(ForkResult::Child) => {
                hygiene::reset_signal_handlers_and_mask();
                let _ = nix::unistd::dup2(stdin_read.as_raw_fd(), 0);
                let _ = nix::unistd::dup2(stdout_write.as_raw_fd(), 1);
                let _ = nix::unistd::dup2(stdout_write.as_raw_fd(), 2);
                hygiene::close_all_fds_above(2);

                let exec_result = exec_spawn_env_setupper(&agent_path, &work_dir_path);
                // Only reached when exec failed.
                eprintln!(
                    "Cannot execute \"{}\": {}",
                    agent_path.display(),
                    exec_result.unwrap_err()
                );
                unsafe { libc::_exit(1) }
            }
            Err(errno) => {
                let _ = session
                    .journey
                    .set_step_errored(JourneyStep::SpawnerForkSubprocess, false);
                let mut e =
                    SpawnException::new(ErrorCategory::OperatingSystemError, &session.journey);
                let message = format!(
                    "Cannot fork a new process: {} (errno={})",
                    errno.desc(),
                    errno as i32
                );
                e.set_summary(message.clone());
                e.set_advanced_problem_details(message);
                Err(StartError::Exception(Box::new(e.finalize())))
            }
            Ok(ForkResult::Parent { child }) => {
                let _ = session
                    .journey
                    .set_step_performed(JourneyStep::SpawnerForkSubprocess, false);
                lve_scope.exit();
                drop(stdin_read);
                drop(stdout_write);
                log::debug!(
                    "Preloader process forked for app_root={}: PID {}",
                    self.options.app_root,
                    child
                );

                let guard = ChildGuard::new(child);
                let preloader_stdin = File::from(stdin_write);
                let preloader_output = File::from(stdout_read);

                let perform_stdin = preloader_stdin.try_clone().map_err(SpawnError::Io)?;
                let perform_output = preloader_output.try_clone().map_err(SpawnError::Io)?;
                HandshakePerform::new(session, child, Some(perform_stdin), Some(perform_output))
                    .execute()
                    .map_err(|e| StartError::Exception(Box::new(e)))?;

                let socket_address = session
                    .result
                    .sockets
                    .iter()
                    .find(|s| s.is_preloader_command_socket())
                    .map(|s| s.address.clone())
                    .ok_or_else(|| {
                        SpawnError::Protocol(
                            "the preloader did not report a command socket".into(),
                        )
                    })?;
                let annotations = session.work_dir.load_annotations();

                {
                    let mut fields = lock(&self.fields);
                    fields.handle = Some(PreloaderHandle {
                        pid: child,
                        socket_address: socket_address.clone(),
                        stdin: preloader_stdin,
                        annotations,
                    });
                }

                PipeWatcher::start(preloader_output, "output", child.as_raw());
                guard.release();
                let _ = session
                    .journey
                    .set_step_performed(JourneyStep::SpawnerHandshakePerform, false);
                log::info!(
                    "Preloader for {} started on PID {}, listening on {}",
                    self.options.app_root,
                    child,
                    socket_address
                );
                Ok(())
            }
        }
    }

    fn stop_preloader(&self) -> Result<(), SpawnError> {
        let handle = lock(&self.fields).handle.take();
        let handle = match handle {
            Some(handle) => handle,
            None => return Ok(()),
        };

        // Closing stdin asks the preloader to exit on its own.
        drop(handle.stdin);
        if !wait_for_exit(handle.pid, PRELOADER_EXIT_TIMEOUT) {
            log::debug!("Preloader did not exit in time, killing it...");
            kill_and_reap(handle.pid);
        }

        // Unlink the command socket only after the process has exited;
        // removing it earlier races with the preloader's own shutdown.
        if let Ok(SocketAddressKind::Unix(path)) = parse_socket_address(&handle.socket_address)
        {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    // ----- Fork command protocol -----

    /// Issues the fork command, restarting the preloader and retrying
    /// exactly once if it crashed. A second crash is surfaced; more
    /// retries would only mask a systemic failure.
    fn invoke_fork_command(
        &self,
        session: &mut HandshakeSession,
    ) -> Result<ForkedChild, Box<SpawnException>> {
        let crash1 = match self.try_fork_command(session) {
            Ok(child) => return Ok(child),
            Err(ForkCommandError::Fatal(e)) => return Err(e),
            Err(ForkCommandError::Crashed(err)) => err,
        };

        log::warn!(
            "An error occurred while spawning an application process: {crash1}"
        );
        log::warn!(
            "The application preloader seems to have crashed, restarting it and trying again..."
        );

        // Force: a crash during the read leaves the earlier protocol
        // steps Performed, and those must reset too.
        let _ = session
            .journey
            .set_step_not_started(JourneyStep::SpawnerConnectToPreloader, true);
        let _ = session
            .journey
            .set_step_not_started(JourneyStep::SpawnerSendCommandToPreloader, true);
        let _ = session
            .journey
            .set_step_not_started(JourneyStep::SpawnerReadResponseFromPreloader, true);

        if let Err(stop_err) = self.stop_preloader() {
            return Err(self.stop_failure_exception(session, &stop_err));
        }

        self.start_preloader()?;

        match self.try_fork_command(session) {
            Ok(child) => Ok(child),
            Err(ForkCommandError::Fatal(e)) => Err(e),
            Err(ForkCommandError::Crashed(_crash2)) => {
                if let Err(stop_err) = self.stop_preloader() {
                    return Err(self.stop_failure_exception(session, &stop_err));
                }

                // The surfaced journey must not show half-done
                // protocol steps.
                for step in [
                    JourneyStep::SpawnerConnectToPreloader,
                    JourneyStep::SpawnerSendCommandToPreloader,
                    JourneyStep::SpawnerReadResponseFromPreloader,
                ] {
                    if matches!(
                        session.journey.get_step_info(step).map(|i| i.state),
                        Ok(JourneyStepState::InProgress)
                    ) {
                        let _ = session.journey.set_step_errored(step, false);
                    }
                }
                let _ = session
                    .journey
                    .set_step_errored(JourneyStep::SpawnerPreparation, true);

                let mut e =
                    SpawnException::new(ErrorCategory::from_spawn_error(&crash1), &session.journey);
                self.add_preloader_annotations(&mut e);
                e.set_summary(format!("An application preloader crashed: {crash1}"));
                e.set_problem_description_html(format!(
                    "<p>The application server tried to start the web application \
                     by communicating with a helper process that we call a \
                     \"preloader\". However, this helper process crashed \
                     unexpectedly:</p><pre>{}</pre>",
                    escape_html(&crash1.to_string())
                ));
                Err(Box::new(e.finalize()))
            }
        }
    }

    fn stop_failure_exception(
        &self,
        session: &mut HandshakeSession,
        stop_err: &SpawnError,
    ) -> Box<SpawnException> {
        let _ = session
            .journey
            .set_step_errored(JourneyStep::SpawnerPreparation, true);
        let mut e = SpawnException::from_error(stop_err, &session.journey);
        self.add_preloader_annotations(&mut e);
        e.set_summary(format!("Error stopping a crashed preloader: {stop_err}"));
        e.set_problem_description_html(format!(
            "<p>The application server tried to start the web application by \
             communicating with a helper process that we call a \"preloader\". \
             However, this helper process crashed unexpectedly. The server \
             then tried to restart it, but encountered the following error \
             while trying to stop the preloader:</p><pre>{}</pre>",
            escape_html(&stop_err.to_string())
        ));
        Box::new(e.finalize())
    }

    fn try_fork_command(
        &self,
        session: &mut HandshakeSession,
    ) -> Result<ForkedChild, ForkCommandError> {
        let socket_address = lock(&self.fields)
            .handle
            .as_ref()
            .map(|h| h.socket_address.clone())
            .ok_or_else(|| {
                ForkCommandError::Crashed(SpawnError::Internal(
                    "the preloader is not running".into(),
                ))
            })?;

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerConnectToPreloader, false);
        if session.deadline.expired() {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawnerConnectToPreloader, false);
            let timeout = SpawnError::Timeout(
                "A timeout occurred while connecting to the preloader".into(),
            );
            let mut e = SpawnException::from_error(&timeout, &session.journey);
            self.add_preloader_annotations(&mut e);
            return Err(ForkCommandError::Fatal(Box::new(e.finalize())));
        }
        let mut conn =
            PreloaderConnection::connect(&socket_address, session.deadline.remaining())
                .map_err(ForkCommandError::Crashed)?;

        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerConnectToPreloader, false);
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerSendCommandToPreloader, false);
        self.send_fork_command(session, &mut conn)?;

        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerSendCommandToPreloader, false);
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerReadResponseFromPreloader, false);
        let line = self.read_fork_command_response(session, &mut conn)?;

        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerReadResponseFromPreloader, false);
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerParseResponseFromPreloader, false);
        let doc = self.parse_fork_command_response(session, &line)?;

        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerParseResponseFromPreloader, false);
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerProcessResponseFromPreloader, false);
        let result = self.handle_fork_command_response(session, &doc);
        if result.is_ok() {
            let _ = session
                .journey
                .set_step_performed(JourneyStep::SpawnerProcessResponseFromPreloader, false);
        }
        result
    }

    fn classify_io_error(
        &self,
        session: &mut HandshakeSession,
        err: std::io::Error,
        step: JourneyStep,
    ) -> ForkCommandError {
        if matches!(
            err.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            let _ = session.journey.set_step_errored(step, true);
            let timeout = SpawnError::Timeout(format!(
                "A timeout occurred while communicating with the preloader: {err}"
            ));
            let mut e = SpawnException::from_error(&timeout, &session.journey);
            self.add_preloader_annotations(&mut e);
            ForkCommandError::Fatal(Box::new(e.finalize()))
        } else {
            ForkCommandError::Crashed(SpawnError::Io(err))
        }
    }

    fn send_fork_command(
        &self,
        session: &mut HandshakeSession,
        conn: &mut PreloaderConnection,
    ) -> Result<(), ForkCommandError> {
        let doc = serde_json::json!({
            "command": "spawn",
            "work_dir": session.work_dir.path(),
        });
        let mut line = doc.to_string();
        line.push('\n');
        conn.write_all(line.as_bytes()).map_err(|e| {
            self.classify_io_error(session, e, JourneyStep::SpawnerSendCommandToPreloader)
        })
    }

    fn read_fork_command_response(
        &self,
        session: &mut HandshakeSession,
        conn: &mut PreloaderConnection,
    ) -> Result<String, ForkCommandError> {
        match read_bounded_line(conn) {
            Ok(line) => Ok(line),
            Err(ReadLineError::TooLong) => {
                let _ = session
                    .journey
                    .set_step_errored(JourneyStep::SpawnerReadResponseFromPreloader, false);
                let mut e = SpawnException::new(ErrorCategory::InternalError, &session.journey);
                self.add_preloader_annotations(&mut e);
                e.set_summary(
                    "The preloader process sent a response that exceeds the maximum size limit.",
                );
                e.set_problem_description_html(
                    "<p>The application server tried to start the web application by \
                     communicating with a helper process that we call a \"preloader\". \
                     However, this helper process sent a response that exceeded the \
                     internally-defined maximum size limit.</p>",
                );
                e.set_solution_description_html(
                    "<p class=\"sole-solution\">This is probably a bug in the preloader \
                     process. Please report it to the application's developers.</p>",
                );
                Err(ForkCommandError::Fatal(Box::new(e.finalize())))
            }
            Err(ReadLineError::Io(err)) => Err(self.classify_io_error(
                session,
                err,
                JourneyStep::SpawnerReadResponseFromPreloader,
            )),
        }
    }

    fn parse_fork_command_response(
        &self,
        session: &mut HandshakeSession,
        line: &str,
    ) -> Result<serde_json::Value, ForkCommandError> {
        let parse_failure = |session: &mut HandshakeSession, summary: String, body: &str| {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawnerParseResponseFromPreloader, false);
            let mut e = SpawnException::new(ErrorCategory::InternalError, &session.journey);
            self.add_preloader_annotations(&mut e);
            e.set_summary(summary);
            e.set_problem_description_html(format!(
                "<p>The application server tried to start the web application by \
                 communicating with a helper process that we call a \"preloader\". \
                 However, this helper process sent a response that does not match \
                 the expected structure.</p><p>The response is as follows:</p>\
                 <pre>{}</pre>",
                escape_html(body)
            ));
            e.set_solution_description_html(
                "<p class=\"sole-solution\">This is probably a bug in the preloader \
                 process. Please report it to the application's developers.</p>",
            );
            ForkCommandError::Fatal(Box::new(e.finalize()))
        };

        let doc: serde_json::Value = match serde_json::from_str(line) {
            Ok(doc) => doc,
            Err(_) => {
                return Err(parse_failure(
                    session,
                    format!("The preloader process sent an unparseable response: {line}"),
                    line,
                ))
            }
        };
        if !Self::validate_fork_command_response(&doc) {
            return Err(parse_failure(
                session,
                format!(
                    "The preloader process sent a response that does not match the \
                     expected structure: {doc}"
                ),
                &doc.to_string(),
            ));
        }
        Ok(doc)
    }

    fn validate_fork_command_response(doc: &serde_json::Value) -> bool {
        let obj = match doc.as_object() {
            Some(obj) => obj,
            None => return false,
        };
        match obj.get("result").and_then(|v| v.as_str()) {
            Some("ok") => obj.get("pid").map(|v| v.is_i64()).unwrap_or(false),
            Some("error") => obj.get("message").map(|v| v.is_string()).unwrap_or(false),
            _ => false,
        }
    }

    fn handle_fork_command_response(
        &self,
        session: &mut HandshakeSession,
        doc: &serde_json::Value,
    ) -> Result<ForkedChild, ForkCommandError> {
        if doc["result"] == "ok" {
            self.handle_fork_command_response_success(session, doc)
        } else {
            self.handle_fork_command_response_error(session, doc)
        }
    }

    fn handle_fork_command_response_success(
        &self,
        session: &mut HandshakeSession,
        doc: &serde_json::Value,
    ) -> Result<ForkedChild, ForkCommandError> {
        let spawned_pid = Pid::from_raw(doc["pid"].as_i64().unwrap_or(-1) as i32);
        let guard = ChildGuard::new(spawned_pid);

        let mut stdin = None;
        let mut stdout_and_err = None;
        let mut capturer = None;

        let stdin_path = session.work_dir.stdin_fifo_path();
        if stdin_path.exists() {
            let file = open_fifo_with_timeout(&stdin_path, &mut session.deadline)
                .map_err(|e| self.process_response_failure(session, &e, None))?;
            stdin = Some(file);
        }
        let output_path = session.work_dir.stdout_and_err_fifo_path();
        if output_path.exists() {
            let file = open_fifo_with_timeout(&output_path, &mut session.deadline)
                .map_err(|e| self.process_response_failure(session, &e, None))?;
            if let Ok(clone) = file.try_clone() {
                capturer = Some(BackgroundIoCapturer::start(clone, spawned_pid.as_raw()));
            }
            stdout_and_err = Some(file);
        }

        // The preloader could in principle report the PID of an
        // arbitrary existing process. Require the child's uid to match
        // the one this spawn resolved before trusting it.
        let spawned_uid = self.query_process_uid(session, spawned_pid, capturer.as_ref())?;
        if spawned_uid != session.uid {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawnerProcessResponseFromPreloader, false);
            let mut e = SpawnException::new(ErrorCategory::InternalError, &session.journey);
            self.add_preloader_annotations(&mut e);
            e.set_summary(format!(
                "The process that the preloader said it spawned, PID {spawned_pid}, \
                 has UID {spawned_uid}, but the expected UID is {}",
                session.uid
            ));
            if let Some(capturer) = capturer {
                e.set_stdout_and_err_data(capturer.stop());
            }
            e.set_problem_description_html(format!(
                "<p>The application server tried to start the web application by \
                 communicating with a helper process that we call a \"preloader\". \
                 However, the web application process that the preloader started \
                 belongs to the wrong user. The UID of the web application process \
                 should be {}, but is actually {spawned_uid}.</p>",
                session.uid
            ));
            e.set_solution_description_html(
                "<p class=\"sole-solution\">This is probably a bug in the preloader \
                 process. Please report it to the application's developers.</p>",
            );
            // Dropping the guard kills and reaps the suspect child.
            return Err(ForkCommandError::Fatal(Box::new(e.finalize())));
        }

        drop(capturer);
        Ok(ForkedChild {
            guard,
            stdin,
            stdout_and_err,
        })
    }

    fn process_response_failure(
        &self,
        session: &mut HandshakeSession,
        err: &SpawnError,
        stdio: Option<String>,
    ) -> ForkCommandError {
        let _ = session
            .journey
            .set_step_errored(JourneyStep::SpawnerProcessResponseFromPreloader, true);
        let mut e = SpawnException::from_error(err, &session.journey);
        self.add_preloader_annotations(&mut e);
        if let Some(stdio) = stdio {
            e.set_stdout_and_err_data(stdio);
        }
        ForkCommandError::Fatal(Box::new(e.finalize()))
    }

    fn query_process_uid(
        &self,
        session: &mut HandshakeSession,
        pid: Pid,
        capturer: Option<&BackgroundIoCapturer>,
    ) -> Result<u32, ForkCommandError> {
        let ps_failure = |session: &mut HandshakeSession,
                          category: ErrorCategory,
                          summary: String,
                          stdio: Option<String>| {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawnerProcessResponseFromPreloader, false);
            let mut e = SpawnException::new(category, &session.journey);
            self.add_preloader_annotations(&mut e);
            e.set_summary(summary);
            if let Some(stdio) = stdio {
                e.set_stdout_and_err_data(stdio);
            }
            e.set_solution_description_html(ps_error_solution_html());
            ForkCommandError::Fatal(Box::new(e.finalize()))
        };

        let uid = match ProcessMetricsCollector::new().uid_of(pid.as_raw()) {
            Ok(uid) => uid,
            Err(MetricsError::Parse(msg)) => {
                return Err(ps_failure(
                    session,
                    ErrorCategory::InternalError,
                    format!(
                        "Unable to query the UID of spawned application process {pid}: \
                         error parsing 'ps' output: {msg}"
                    ),
                    None,
                ))
            }
            Err(MetricsError::System(msg)) => {
                return Err(ps_failure(
                    session,
                    ErrorCategory::OperatingSystemError,
                    format!(
                        "Unable to query the UID of spawned application process {pid}; \
                         error capturing 'ps' output: {msg}"
                    ),
                    None,
                ))
            }
        };

        match uid {
            Some(uid) => Ok(uid),
            None => {
                if os_process_exists(pid) {
                    Err(ps_failure(
                        session,
                        ErrorCategory::InternalError,
                        format!(
                            "Unable to query the UID of spawned application process \
                             {pid}: 'ps' did not report information about this process"
                        ),
                        None,
                    ))
                } else {
                    Err(ps_failure(
                        session,
                        ErrorCategory::InternalError,
                        "The application process spawned from the preloader seems to \
                         have exited prematurely"
                            .to_string(),
                        capturer.map(|c| c.data()),
                    ))
                }
            }
        }
    }

    fn handle_fork_command_response_error(
        &self,
        session: &mut HandshakeSession,
        doc: &serde_json::Value,
    ) -> Result<ForkedChild, ForkCommandError> {
        let message = doc["message"].as_str().unwrap_or_default();
        let _ = session
            .journey
            .set_step_errored(JourneyStep::SpawnerProcessResponseFromPreloader, false);
        let mut e = SpawnException::new(ErrorCategory::InternalError, &session.journey);
        self.add_preloader_annotations(&mut e);
        e.set_summary(format!(
            "An error occurred while starting the web application: {message}"
        ));
        e.set_problem_description_html(format!(
            "<p>The application server tried to start the web application by \
             communicating with a helper process that we call a \"preloader\". \
             However, this helper process reported an error:</p><pre>{}</pre>",
            escape_html(message)
        ));
        e.set_solution_description_html(
            "<p class=\"sole-solution\">Please try troubleshooting the problem by \
             studying the <strong>error message</strong> and the \
             <strong>diagnostics</strong> reports.</p>",
        );
        Err(ForkCommandError::Fatal(Box::new(e.finalize())))
    }

    // ----- Spawning -----

    fn do_spawn(
        &self,
        session: &mut HandshakeSession,
    ) -> Result<SpawnResult, Box<SpawnException>> {
        let wrap = |session: &HandshakeSession, err: SpawnError| {
            let mut e = SpawnException::from_error(&err, &session.journey);
            self.add_preloader_annotations(&mut e);
            Box::new(e.finalize())
        };

        if let Err(err) = HandshakePrepare::new(session).execute() {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawnerPreparation, false);
            return Err(wrap(session, err));
        }
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerPreparation, false);

        let forked = self.invoke_fork_command(session)?;
        let ForkedChild {
            guard,
            stdin,
            stdout_and_err,
        } = forked;
        log::debug!(
            "Process forked for app_root={}: PID {}",
            session.config.app_root,
            guard.pid()
        );

        HandshakePerform::new(session, guard.pid(), stdin, stdout_and_err)
            .execute()
            .map_err(|mut e| {
                self.add_preloader_annotations(&mut e);
                Box::new(e)
            })?;

        let pid = guard.release();
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerHandshakePerform, false);
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawnerFinish, true);
        log::debug!(
            "Process spawning done: app_root={}, pid={}",
            session.config.app_root,
            pid
        );

        let mut result = std::mem::take(&mut session.result);
        result.pid = pid.as_raw();
        Ok(result)
    }
}

impl Spawner for SmartSpawner {
    fn spawn(&self, options: &AppOptions) -> Result<SpawnResult, Box<SpawnException>> {
        log::debug!("Spawning new process: app_root={}", options.app_root);
        self.touch_last_used();
        let _sync = lock(&self.syncher);

        if !self.preloader_started() {
            self.start_preloader()?;
        }

        let config = match self.app_config(options) {
            Ok(config) => config,
            Err(err) => {
                let mut journey = Journey::new(JourneyType::SpawnThroughPreloader, true);
                let _ = journey.set_step_errored(JourneyStep::SpawnerPreparation, true);
                let mut e = SpawnException::from_error(&err, &journey);
                self.add_preloader_annotations(&mut e);
                return Err(Box::new(e.finalize()));
            }
        };
        let mut session = match HandshakeSession::new(config, JourneyType::SpawnThroughPreloader)
        {
            Ok(session) => session,
            Err(err) => {
                let mut journey = Journey::new(JourneyType::SpawnThroughPreloader, true);
                let _ = journey.set_step_errored(JourneyStep::SpawnerPreparation, true);
                let mut e = SpawnException::from_error(&err, &journey);
                self.add_preloader_annotations(&mut e);
                return Err(Box::new(e.finalize()));
            }
        };
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerPreparation, false);

        self.do_spawn(&mut session)
    }

    fn cleanup(&self) {
        self.touch_last_used();
        let _sync = lock(&self.syncher);
        if let Err(e) = self.stop_preloader() {
            log::warn!("Error stopping preloader during cleanup: {e}");
        }
    }

    fn last_used_usec(&self) -> u64 {
        lock(&self.fields).last_used_usec
    }
}

impl Drop for SmartSpawner {
    fn drop(&mut self) {
        let _sync = lock(&self.syncher);
        if let Err(e) = self.stop_preloader() {
            log::warn!("Error stopping preloader during spawner teardown: {e}");
        }
    }
}

fn exec_spawn_env_setupper(
    agent_path: &std::path::Path,
    work_dir: &std::path::Path,
) -> Result<std::convert::Infallible, String> {
    let path = CString::new(agent_path.as_os_str().as_encoded_bytes())
        .map_err(|_| "agent path contains a NUL byte".to_string())?;
    let work_dir = CString::new(work_dir.as_os_str().as_encoded_bytes())
        .map_err(|_| "work dir path contains a NUL byte".to_string())?;
    let argv = [
        path.as_c_str(),
        c"spawn-env-setupper",
        work_dir.as_c_str(),
        c"--before",
    ];
    match nix::unistd::execvp(&path, &argv) {
        Ok(infallible) => match infallible {},
        Err(errno) => Err(errno.desc().to_string()),
    }
}

fn ps_error_solution_html() -> String {
    let path = std::env::var("PATH").unwrap_or_default();
    let path = if path.is_empty() {
        "(empty)".to_string()
    } else {
        path
    };
    format!(
        "<div class=\"multiple-solutions\">\
         <h3>Check whether the \"ps\" tool is installed and accessible</h3>\
         <p>Maybe \"ps\" is not installed, cannot be found through PATH, or \
         filesystem permissions disallow executing it. The current PATH \
         is:</p><pre>{}</pre>\
         <h3>Check whether the server is low on resources</h3>\
         <p>A server low on CPU, memory, swap or file descriptors can cause \
         the \"ps\" tool to fail.</p>\
         <h3>Check whether /proc is mounted</h3>\
         <p>On many operating systems \"ps\" only works if /proc is mounted.</p>\
         </div>",
        escape_html(&path)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workdir::WorkDirView;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;
    use std::process::{Child, Command};

    fn test_options() -> AppOptions {
        AppOptions {
            app_root: "/var/www/app".into(),
            app_type: "rack".into(),
            start_command: "ruby start.rb".into(),
            preloader_command: vec!["ruby".into(), "preloader.rb".into()],
            start_timeout_msec: 10_000,
            agent_path: Some("/bin/false".into()),
            ..AppOptions::default()
        }
    }

    fn spawn_short_lived_child() -> Child {
        Command::new("true").spawn().expect("cannot spawn true")
    }

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("cannot spawn sleep")
    }

    /// Installs a fake preloader handle pointing at `socket_address`.
    fn inject_handle(spawner: &SmartSpawner, pid: Pid, socket_address: String) {
        let (_read, write) = nix::unistd::pipe().unwrap();
        lock(&spawner.fields).handle = Some(PreloaderHandle {
            pid,
            socket_address,
            stdin: File::from(write),
            annotations: BTreeMap::from([("origin".to_string(), "test".to_string())]),
        });
    }

    /// Runs a fake preloader on a Unix socket, serving fork commands
    /// until the listener is dropped. The responder receives the
    /// decoded work dir and the connection for replying.
    fn fake_preloader_server<F>(mut responder: F) -> (tempfile::TempDir, String)
    where
        F: FnMut(String, &mut UnixStream) + Send + 'static,
    {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("preloader.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let mut line = String::new();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                reader.read_line(&mut line).unwrap();
                let doc: serde_json::Value = serde_json::from_str(&line).unwrap();
                assert_eq!(doc["command"], "spawn");
                let work_dir = doc["work_dir"].as_str().unwrap().to_string();
                responder(work_dir, &mut stream);
            }
        });
        let address = format!("unix:{}", sock_path.display());
        (dir, address)
    }

    fn write_app_response(work_dir: &str) {
        let view = WorkDirView::new(work_dir);
        view.write_file(
            &view.properties_json_path(),
            r#"{"sockets":[{"address":"unix:/tmp/app.sock","protocol":"http",
                "concurrency":0,"accept_http_requests":true}]}"#,
        )
        .unwrap();
        view.write_file(&view.finish_path(), "1").unwrap();
    }

    #[test]
    fn handle_fields_are_all_or_nothing() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        assert_eq!(spawner.preloader_pid(), -1);
        assert!(!spawner.preloader_started());
        assert!(spawner.annotations_snapshot().is_empty());

        let child = spawn_short_lived_child();
        inject_handle(
            &spawner,
            Pid::from_raw(child.id() as i32),
            "unix:/tmp/fake.sock".into(),
        );
        assert_eq!(spawner.preloader_pid(), child.id() as i32);
        assert!(spawner.preloader_started());
        assert_eq!(spawner.annotations_snapshot()["origin"], "test");

        spawner.stop_preloader().unwrap();
        assert_eq!(spawner.preloader_pid(), -1);
        assert!(!spawner.preloader_started());
        assert!(spawner.annotations_snapshot().is_empty());
    }

    #[test]
    fn cleanup_twice_is_a_noop_and_updates_last_used() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let before = spawner.last_used_usec();
        std::thread::sleep(Duration::from_millis(5));
        spawner.cleanup();
        let after = spawner.last_used_usec();
        assert!(after > before);
        spawner.cleanup();
    }

    #[test]
    fn new_requires_a_preloader_command() {
        let mut options = test_options();
        options.preloader_command = vec!["ruby".into()];
        assert!(SmartSpawner::new(&options).is_err());
    }

    #[test]
    fn stop_unlinks_unix_command_socket_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("cmd.sock");
        std::fs::write(&sock_path, "").unwrap();

        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let child = spawn_short_lived_child();
        inject_handle(
            &spawner,
            Pid::from_raw(child.id() as i32),
            format!("unix:{}", sock_path.display()),
        );
        spawner.stop_preloader().unwrap();
        assert!(!sock_path.exists());
    }

    #[test]
    fn spawn_through_fake_preloader_succeeds() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let app_child = spawn_sleeper();
        let app_pid = app_child.id() as i32;

        let (_dir, address) = fake_preloader_server(move |work_dir, stream| {
            write_app_response(&work_dir);
            let reply = format!("{{\"result\":\"ok\",\"pid\":{app_pid}}}\n");
            stream.write_all(reply.as_bytes()).unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let before = spawner.last_used_usec();
        std::thread::sleep(Duration::from_millis(5));
        let result = spawner.spawn(&test_options()).unwrap();
        assert_eq!(result.pid, app_pid);
        assert_eq!(result.sockets.len(), 1);
        assert_eq!(result.sockets[0].address, "unix:/tmp/app.sock");
        assert_eq!(result.sockets[0].protocol, "http");
        assert!(spawner.last_used_usec() > before);
        // The spawned process is alive and now owned by the caller.
        assert!(os_process_exists(Pid::from_raw(app_pid)));
        kill_and_reap(Pid::from_raw(app_pid));
    }

    #[test]
    fn oversized_response_is_a_protocol_error() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let (_dir, address) = fake_preloader_server(|_work_dir, stream| {
            let mut reply = vec![b'x'; 11_000];
            reply.push(b'\n');
            stream.write_all(&reply).unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let err = spawner.spawn(&test_options()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InternalError);
        assert!(err.summary().contains("maximum size"));
        assert_eq!(
            err.journey()
                .get_step_info(JourneyStep::SpawnerReadResponseFromPreloader)
                .unwrap()
                .state,
            JourneyStepState::Errored
        );
        // Preloader annotations ride along on the exception.
        assert_eq!(err.annotations()["origin"], "test");
    }

    #[test]
    fn response_at_exactly_the_size_limit_is_accepted() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let (_dir, address) = fake_preloader_server(|_work_dir, stream| {
            // A well-formed error response padded to exactly 10240
            // bytes including the trailing newline.
            let prefix = "{\"result\":\"error\",\"message\":\"";
            let suffix = "\"}\n";
            let padding = MAX_RESPONSE_SIZE - prefix.len() - suffix.len();
            let reply = format!("{prefix}{}{suffix}", "a".repeat(padding));
            assert_eq!(reply.len(), MAX_RESPONSE_SIZE);
            stream.write_all(reply.as_bytes()).unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let err = spawner.spawn(&test_options()).unwrap_err();
        // The line was read and parsed; the failure is the reported
        // error, not the size limit.
        assert!(!err.summary().contains("maximum size"));
        assert!(err
            .summary()
            .starts_with("An error occurred while starting the web application:"));
        assert_eq!(
            err.journey()
                .get_step_info(JourneyStep::SpawnerReadResponseFromPreloader)
                .unwrap()
                .state,
            JourneyStepState::Performed
        );
    }

    #[test]
    fn preloader_error_response_surfaces_its_message() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let (_dir, address) = fake_preloader_server(|_work_dir, stream| {
            stream
                .write_all(b"{\"result\":\"error\",\"message\":\"app is broken\"}\n")
                .unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let err = spawner.spawn(&test_options()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InternalError);
        assert!(err.summary().contains("app is broken"));
        assert_eq!(
            err.journey()
                .get_step_info(JourneyStep::SpawnerProcessResponseFromPreloader)
                .unwrap()
                .state,
            JourneyStepState::Errored
        );
    }

    #[test]
    fn malformed_ok_response_fails_parsing() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let (_dir, address) = fake_preloader_server(|_work_dir, stream| {
            // "ok" without a pid does not match the schema.
            stream.write_all(b"{\"result\":\"ok\"}\n").unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let err = spawner.spawn(&test_options()).unwrap_err();
        assert!(err.summary().contains("does not match the expected structure"));
        assert_eq!(
            err.journey()
                .get_step_info(JourneyStep::SpawnerParseResponseFromPreloader)
                .unwrap()
                .state,
            JourneyStepState::Errored
        );
    }

    #[test]
    fn uid_mismatch_kills_the_reported_child() {
        let mut options = test_options();
        // An expected uid that cannot match the actual child's uid.
        options.user = Some("59342".into());
        let spawner = SmartSpawner::new(&options).unwrap();

        let app_child = spawn_sleeper();
        let app_pid = app_child.id() as i32;
        let (_dir, address) = fake_preloader_server(move |work_dir, stream| {
            write_app_response(&work_dir);
            let reply = format!("{{\"result\":\"ok\",\"pid\":{app_pid}}}\n");
            stream.write_all(reply.as_bytes()).unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let err = spawner.spawn(&options).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InternalError);
        assert!(err.summary().contains("UID"));
        assert!(err.summary().contains("59342"));
        assert!(err
            .summary()
            .contains(&nix::unistd::geteuid().as_raw().to_string()));
        // The suspect child must have been killed and reaped.
        assert!(!os_process_exists(Pid::from_raw(app_pid)));
    }

    #[test]
    fn vanished_child_reports_premature_exit() {
        let spawner = SmartSpawner::new(&test_options()).unwrap();
        let (_dir, address) = fake_preloader_server(|work_dir, stream| {
            write_app_response(&work_dir);
            stream
                .write_all(b"{\"result\":\"ok\",\"pid\":4190000}\n")
                .unwrap();
        });
        let preloader_child = spawn_short_lived_child();
        inject_handle(&spawner, Pid::from_raw(preloader_child.id() as i32), address);

        let err = spawner.spawn(&test_options()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InternalError);
        assert!(err.summary().contains("exited prematurely"));
    }

    /// Script that acts as a working preloader when exec'd by
    /// start_preloader: it reports a command socket and stays alive.
    fn write_fake_preloader_agent(dir: &std::path::Path, socket_address: &str) -> PathBuf {
        let script_path = dir.join("fake-agent.sh");
        let script = format!(
            "#!/bin/sh\n\
             wd=\"$2\"\n\
             cat > \"$wd/response/properties.json\" <<EOF\n\
             {{\"sockets\":[{{\"address\":\"{socket_address}\",\"protocol\":\"preloader\",\
             \"concurrency\":1,\"accept_http_requests\":false}}]}}\n\
             EOF\n\
             touch \"$wd/response/finish\"\n\
             head -c 1 > /dev/null\n"
        );
        std::fs::write(&script_path, script).unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        script_path
    }

    #[test]
    fn preloader_crash_recovers_after_one_restart() {
        let app_child = spawn_sleeper();
        let app_pid = app_child.id() as i32;

        // The preloader the retry will talk to, reached through the
        // restarted (scripted) preloader's reported socket.
        let (_dir2, address2) = fake_preloader_server(move |work_dir, stream| {
            write_app_response(&work_dir);
            let reply = format!("{{\"result\":\"ok\",\"pid\":{app_pid}}}\n");
            stream.write_all(reply.as_bytes()).unwrap();
        });
        let agent_dir = tempfile::tempdir().unwrap();
        let agent = write_fake_preloader_agent(agent_dir.path(), &address2);

        let mut options = test_options();
        options.agent_path = Some(agent);
        let spawner = SmartSpawner::new(&options).unwrap();

        // The first preloader crashes: it accepts the connection and
        // closes it without replying.
        let (_dir1, address1) = fake_preloader_server(|_work_dir, stream| {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        });
        let crashed_preloader = spawn_short_lived_child();
        inject_handle(
            &spawner,
            Pid::from_raw(crashed_preloader.id() as i32),
            address1,
        );

        let result = spawner.spawn(&options).unwrap();
        assert_eq!(result.pid, app_pid);
        assert_eq!(result.sockets.len(), 1);
        // The restarted preloader is now the active one.
        assert_ne!(spawner.preloader_pid(), crashed_preloader.id() as i32);
        assert_ne!(spawner.preloader_pid(), -1);
        kill_and_reap(Pid::from_raw(app_pid));
        spawner.cleanup();
    }

    /// Like `fake_preloader_server`, but listening on TCP. Used where
    /// the command socket must survive a preloader stop (stopping
    /// unlinks Unix socket paths).
    fn fake_preloader_tcp_server<F>(mut responder: F) -> String
    where
        F: FnMut(String, &mut std::net::TcpStream) + Send + 'static,
    {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("tcp://{}", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let mut line = String::new();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                reader.read_line(&mut line).unwrap();
                let doc: serde_json::Value = serde_json::from_str(&line).unwrap();
                let work_dir = doc["work_dir"].as_str().unwrap().to_string();
                responder(work_dir, &mut stream);
            }
        });
        address
    }

    #[test]
    fn spawn_starts_preloader_lazily_and_works_after_cleanup() {
        // A fake preloader that spawns a real child per fork command.
        let address = fake_preloader_tcp_server(|work_dir, stream| {
            write_app_response(&work_dir);
            let child = Command::new("sleep").arg("30").spawn().unwrap();
            let reply = format!("{{\"result\":\"ok\",\"pid\":{}}}\n", child.id());
            stream.write_all(reply.as_bytes()).unwrap();
        });
        let agent_dir = tempfile::tempdir().unwrap();
        let agent = write_fake_preloader_agent(agent_dir.path(), &address);

        let mut options = test_options();
        options.agent_path = Some(agent);
        let spawner = SmartSpawner::new(&options).unwrap();
        assert_eq!(spawner.preloader_pid(), -1);

        // First spawn starts the preloader on demand.
        let result = spawner.spawn(&options).unwrap();
        let first_preloader = spawner.preloader_pid();
        assert_ne!(first_preloader, -1);
        kill_and_reap(Pid::from_raw(result.pid));

        // Cleanup stops it; the next spawn starts a fresh one.
        spawner.cleanup();
        assert_eq!(spawner.preloader_pid(), -1);

        let result = spawner.spawn(&options).unwrap();
        assert_ne!(spawner.preloader_pid(), -1);
        assert_ne!(spawner.preloader_pid(), first_preloader);
        kill_and_reap(Pid::from_raw(result.pid));
        spawner.cleanup();
    }

    #[test]
    fn preloader_crashing_twice_surfaces_the_crash() {
        // Restarted preloader points at another crashing socket.
        let (_dir2, address2) = fake_preloader_server(|_work_dir, stream| {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        });
        let agent_dir = tempfile::tempdir().unwrap();
        let agent = write_fake_preloader_agent(agent_dir.path(), &address2);

        let mut options = test_options();
        options.agent_path = Some(agent);
        let spawner = SmartSpawner::new(&options).unwrap();

        let (_dir1, address1) = fake_preloader_server(|_work_dir, stream| {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        });
        let crashed_preloader = spawn_short_lived_child();
        inject_handle(
            &spawner,
            Pid::from_raw(crashed_preloader.id() as i32),
            address1,
        );

        let err = spawner.spawn(&options).unwrap_err();
        assert!(err
            .summary()
            .starts_with("An application preloader crashed:"));
        assert_eq!(
            err.journey()
                .get_step_info(JourneyStep::SpawnerPreparation)
                .unwrap()
                .state,
            JourneyStepState::Errored
        );
        // Orchestrator protocol steps must not be left half-done.
        for step in [
            JourneyStep::SpawnerConnectToPreloader,
            JourneyStep::SpawnerSendCommandToPreloader,
            JourneyStep::SpawnerReadResponseFromPreloader,
        ] {
            let state = err.journey().get_step_info(step).unwrap().state;
            assert_ne!(state, JourneyStepState::InProgress, "{}", step.name());
        }
        spawner.cleanup();
    }

    #[test]
    fn read_bounded_line_boundaries() {
        let data = vec![b'x'; MAX_RESPONSE_SIZE - 1];
        let mut input = data.clone();
        input.push(b'\n');
        let line = read_bounded_line(&mut &input[..]).unwrap();
        assert_eq!(line.len(), MAX_RESPONSE_SIZE - 1);

        let mut input = vec![b'x'; MAX_RESPONSE_SIZE];
        input.push(b'\n');
        assert!(matches!(
            read_bounded_line(&mut &input[..]),
            Err(ReadLineError::TooLong)
        ));

        let input = b"no newline at all";
        assert!(matches!(
            read_bounded_line(&mut &input[..]),
            Err(ReadLineError::Io(_))
        ));
    }

    #[test]
    fn fork_command_response_validation() {
        let ok = serde_json::json!({"result": "ok", "pid": 123});
        assert!(SmartSpawner::validate_fork_command_response(&ok));
        let error = serde_json::json!({"result": "error", "message": "nope"});
        assert!(SmartSpawner::validate_fork_command_response(&error));

        for invalid in [
            serde_json::json!(["not", "an", "object"]),
            serde_json::json!({"result": "ok"}),
            serde_json::json!({"result": "ok", "pid": "123"}),
            serde_json::json!({"result": "error"}),
            serde_json::json!({"result": "error", "message": 42}),
            serde_json::json!({"result": "maybe"}),
            serde_json::json!({"pid": 123}),
        ] {
            assert!(
                !SmartSpawner::validate_fork_command_response(&invalid),
                "{invalid}"
            );
        }
    }

    #[test]
    fn socket_address_parsing() {
        assert!(matches!(
            parse_socket_address("unix:/tmp/x.sock"),
            Ok(SocketAddressKind::Unix(_))
        ));
        assert!(matches!(
            parse_socket_address("tcp://127.0.0.1:4000"),
            Ok(SocketAddressKind::Tcp(_))
        ));
        assert!(parse_socket_address("bogus").is_err());
    }
}
