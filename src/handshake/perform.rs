//! The performing half of the handshake: waiting for the subprocess to
//! signal readiness through the work directory, harvesting its
//! reported properties, and assembling a full failure report when it
//! dies or times out instead.

use std::fs::File;
use std::time::Duration;

use nix::unistd::Pid;
use serde::Deserialize;

use crate::error::{ErrorCategory, SpawnError, SpawnException};
use crate::fifo::open_fifo_with_timeout;
use crate::handshake::capture::BackgroundIoCapturer;
use crate::handshake::session::HandshakeSession;
use crate::journey::{JourneyStep, JourneyStepState};
use crate::proc::guard::os_process_exists;
use crate::timing::monotonic_usec;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Deserialize)]
struct Properties {
    sockets: Vec<crate::spawner::Socket>,
}

enum Outcome {
    Finished,
    ChildDied,
}

pub struct HandshakePerform<'a> {
    session: &'a mut HandshakeSession,
    pid: Pid,
    stdin: Option<File>,
    stdout_and_err: Option<File>,
}

impl<'a> HandshakePerform<'a> {
    pub fn new(
        session: &'a mut HandshakeSession,
        pid: Pid,
        stdin: Option<File>,
        stdout_and_err: Option<File>,
    ) -> Self {
        HandshakePerform {
            session,
            pid,
            stdin,
            stdout_and_err,
        }
    }

    pub fn execute(mut self) -> Result<(), SpawnException> {
        self.session
            .journey
            .set_step_in_progress(JourneyStep::SpawnerHandshakePerform, true)
            .map_err(|e| self.wrap_error(&e))?;

        self.open_response_fifos()?;

        let capturer = self
            .stdout_and_err
            .as_ref()
            .and_then(|f| f.try_clone().ok())
            .map(|f| BackgroundIoCapturer::start(f, self.pid.as_raw()));

        let outcome = self.wait_for_finish(&capturer)?;
        self.load_journey_from_response_dir();

        let error_reported = self.session.work_dir.error_path("category").exists();
        match outcome {
            Outcome::Finished if !error_reported => self.process_properties(),
            _ => Err(self.assemble_child_error(capturer, matches!(outcome, Outcome::Finished))),
        }
    }

    /// Opens the optional response FIFOs if the subprocess created
    /// them and the caller did not already hand us channels.
    fn open_response_fifos(&mut self) -> Result<(), SpawnException> {
        if self.stdin.is_none() {
            let path = self.session.work_dir.stdin_fifo_path();
            if path.exists() {
                let file = open_fifo_with_timeout(&path, &mut self.session.deadline)
                    .map_err(|e| self.wrap_error(&e))?;
                self.stdin = Some(file);
            }
        }
        if self.stdout_and_err.is_none() {
            let path = self.session.work_dir.stdout_and_err_fifo_path();
            if path.exists() {
                let file = open_fifo_with_timeout(&path, &mut self.session.deadline)
                    .map_err(|e| self.wrap_error(&e))?;
                self.stdout_and_err = Some(file);
            }
        }
        Ok(())
    }

    fn wait_for_finish(
        &mut self,
        capturer: &Option<BackgroundIoCapturer>,
    ) -> Result<Outcome, SpawnException> {
        loop {
            let iteration_start = monotonic_usec();

            if self.session.work_dir.finish_path().exists() {
                return Ok(Outcome::Finished);
            }
            if !os_process_exists(self.pid) {
                // Give the just-died child's final file writes a
                // moment to become visible.
                std::thread::sleep(Duration::from_millis(50));
                if self.session.work_dir.finish_path().exists() {
                    return Ok(Outcome::Finished);
                }
                return Ok(Outcome::ChildDied);
            }
            if self.session.deadline.expired() {
                return Err(self.timeout_exception(capturer));
            }

            std::thread::sleep(POLL_INTERVAL);
            self.session.deadline.consume_since(iteration_start);
        }
    }

    fn timeout_exception(&mut self, capturer: &Option<BackgroundIoCapturer>) -> SpawnException {
        let _ = self
            .session
            .journey
            .set_step_errored(JourneyStep::SpawnerHandshakePerform, true);
        let mut e = SpawnException::new(ErrorCategory::TimeoutError, &self.session.journey);
        e.set_summary(
            "A timeout occurred while waiting for the application to report \
             that it has started",
        );
        e.set_problem_description_html(format!(
            "<p>The application process (PID {}) did not finish starting up \
             within the allowed time of {} msec.</p>",
            self.pid, self.session.config.start_timeout_msec
        ));
        e.set_solution_description_html(
            "<p class=\"sole-solution\">Please check whether the application \
             needs more time to start, and raise the start timeout if so.</p>",
        );
        if let Some(capturer) = capturer {
            e.set_stdout_and_err_data(capturer.data());
        }
        e.finalize()
    }

    /// Mirrors the subprocess-reported step records in
    /// `response/steps/` into the session journey.
    fn load_journey_from_response_dir(&mut self) {
        for step in JourneyStep::ALL {
            let step = *step;
            if !self.session.journey.has_step(step) {
                continue;
            }
            let dir = self.session.work_dir.step_dir(step);
            let state = match std::fs::read_to_string(dir.join("state")) {
                Ok(raw) => JourneyStepState::from_name(&raw),
                Err(_) => continue,
            };
            let result = match state {
                JourneyStepState::NotStarted => {
                    self.session.journey.set_step_not_started(step, true)
                }
                JourneyStepState::InProgress => {
                    self.session.journey.set_step_in_progress(step, true)
                }
                JourneyStepState::Performed => {
                    self.session.journey.set_step_performed(step, true)
                }
                JourneyStepState::Errored => self.session.journey.set_step_errored(step, true),
                JourneyStepState::Unknown => continue,
            };
            if let Err(e) = result {
                log::warn!("Cannot apply reported state for {}: {}", step.name(), e);
                continue;
            }
            // Durations are reported in whole seconds.
            if let Ok(raw) = std::fs::read_to_string(dir.join("duration")) {
                if let Ok(seconds) = raw.trim().parse::<u64>() {
                    let _ = self
                        .session
                        .journey
                        .set_step_execution_duration(step, seconds * 1_000_000);
                }
            }
        }
    }

    fn process_properties(mut self) -> Result<(), SpawnException> {
        let path = self.session.work_dir.properties_json_path();
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            let err = SpawnError::Internal(format!(
                "The application process did not report any startup properties: {e}"
            ));
            self.wrap_error(&err)
        })?;
        let properties: Properties = serde_json::from_str(&raw).map_err(|e| {
            let err = SpawnError::Internal(format!(
                "The application process reported a startup properties document \
                 that does not match the expected structure: {e}"
            ));
            self.wrap_error(&err)
        })?;

        self.session.result.sockets = properties.sockets;
        self.session.result.pid = self.pid.as_raw();
        self.session.result.stdin_fd = self.stdin.take();
        self.session.result.stdout_and_err_fd = self.stdout_and_err.take();
        Ok(())
    }

    /// Builds the failure report from `response/error/` after the
    /// child reported an error or died without finishing.
    fn assemble_child_error(
        &mut self,
        capturer: Option<BackgroundIoCapturer>,
        finished: bool,
    ) -> SpawnException {
        if self.session.journey.first_failed_step() == JourneyStep::Unknown {
            let _ = self
                .session
                .journey
                .set_step_errored(JourneyStep::SpawnerHandshakePerform, true);
        }

        let read = |name: &str| -> Option<String> {
            std::fs::read_to_string(self.session.work_dir.error_path(name)).ok()
        };

        let category = read("category")
            .map(|raw| ErrorCategory::from_name(&raw))
            .unwrap_or(ErrorCategory::InternalError);
        let mut e = SpawnException::new(category, &self.session.journey);

        match read("summary") {
            Some(summary) => {
                e.set_summary(summary);
            }
            None if finished => {
                e.set_summary(
                    "The application process reported an error during startup",
                );
            }
            None => {
                e.set_summary("The application process exited prematurely during startup");
            }
        }
        if let Some(details) = read("advanced_problem_details") {
            e.set_advanced_problem_details(details);
        }
        if let Some(html) = read("problem_description.html") {
            e.set_problem_description_html(html);
        }
        if let Some(html) = read("solution_description.html") {
            e.set_solution_description_html(html);
        }
        if let Some(capturer) = capturer {
            e.set_stdout_and_err_data(capturer.stop());
        }
        e.finalize()
    }

    fn wrap_error(&mut self, err: &SpawnError) -> SpawnException {
        let step = JourneyStep::SpawnerHandshakePerform;
        if matches!(
            self.session.journey.get_step_info(step).map(|i| i.state),
            Ok(JourneyStepState::InProgress)
        ) {
            let _ = self.session.journey.set_step_errored(step, false);
        }
        SpawnException::from_error(err, &self.session.journey).finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppOptions, Config};
    use crate::journey::JourneyType;
    use nix::unistd::getpid;

    fn make_session(timeout_msec: u64) -> HandshakeSession {
        let options = AppOptions {
            app_root: "/var/www/app".into(),
            app_type: "rack".into(),
            start_command: "ruby start.rb".into(),
            start_timeout_msec: timeout_msec,
            ..AppOptions::default()
        };
        let config = Config::from_options(&options).unwrap();
        HandshakeSession::new(config, JourneyType::SpawnThroughPreloader).unwrap()
    }

    fn write_response(session: &HandshakeSession, properties: &str) {
        session
            .work_dir
            .write_file(&session.work_dir.properties_json_path(), properties)
            .unwrap();
        session
            .work_dir
            .write_file(&session.work_dir.finish_path(), "1")
            .unwrap();
    }

    #[test]
    fn happy_path_parses_reported_sockets() {
        let mut session = make_session(5_000);
        write_response(
            &session,
            r#"{"sockets":[{"address":"unix:/tmp/app.sock","protocol":"http",
                "concurrency":0,"accept_http_requests":true}]}"#,
        );

        HandshakePerform::new(&mut session, getpid(), None, None)
            .execute()
            .unwrap();
        assert_eq!(session.result.sockets.len(), 1);
        assert_eq!(session.result.sockets[0].address, "unix:/tmp/app.sock");
        assert!(session.result.sockets[0].accept_http_requests);
        assert_eq!(session.result.pid, getpid().as_raw());
    }

    #[test]
    fn finish_without_properties_is_an_internal_error() {
        let mut session = make_session(5_000);
        session
            .work_dir
            .write_file(&session.work_dir.finish_path(), "1")
            .unwrap();

        let err = HandshakePerform::new(&mut session, getpid(), None, None)
            .execute()
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InternalError);
        assert!(err.summary().contains("startup properties"));
    }

    #[test]
    fn deadline_expiry_is_a_timeout_with_handshake_errored() {
        let mut session = make_session(0);
        // Our own PID stays alive and never writes a finish file.
        let err = HandshakePerform::new(&mut session, getpid(), None, None)
            .execute()
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::TimeoutError);
        assert_eq!(
            err.journey()
                .get_step_info(JourneyStep::SpawnerHandshakePerform)
                .unwrap()
                .state,
            JourneyStepState::Errored
        );
    }

    #[test]
    fn dead_child_with_error_files_surfaces_the_report() {
        let mut session = make_session(5_000);
        let wd = &session.work_dir;
        wd.write_file(&wd.error_path("category"), "OPERATING_SYSTEM_ERROR")
            .unwrap();
        wd.write_file(&wd.error_path("summary"), "setuid(501) failed")
            .unwrap();
        wd.write_file(
            &wd.error_path("problem_description.html"),
            "<p>could not switch user</p>",
        )
        .unwrap();
        let step_dir = wd.step_dir(JourneyStep::SubprocessPrepareAfterForkingFromPreloader);
        wd.write_file(&step_dir.join("state"), "STEP_ERRORED").unwrap();
        wd.write_file(&step_dir.join("duration"), "2").unwrap();

        // A PID that no longer exists.
        let dead = Pid::from_raw(4_190_000);
        let err = HandshakePerform::new(&mut session, dead, None, None)
            .execute()
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::OperatingSystemError);
        assert_eq!(err.summary(), "setuid(501) failed");
        assert_eq!(
            err.problem_description_html().unwrap(),
            "<p>could not switch user</p>"
        );
        let info = err
            .journey()
            .get_step_info(JourneyStep::SubprocessPrepareAfterForkingFromPreloader)
            .unwrap();
        assert_eq!(info.state, JourneyStepState::Errored);
        assert_eq!(info.usec_duration(), 2_000_000);
        assert_eq!(
            err.journey().first_failed_step(),
            JourneyStep::SubprocessPrepareAfterForkingFromPreloader
        );
    }

    #[test]
    fn dead_child_without_error_files_reports_premature_exit() {
        let mut session = make_session(5_000);
        let dead = Pid::from_raw(4_190_000);
        let err = HandshakePerform::new(&mut session, dead, None, None)
            .execute()
            .unwrap_err();
        assert!(err.summary().contains("exited prematurely"));
        assert_eq!(
            err.journey().first_failed_step(),
            JourneyStep::SpawnerHandshakePerform
        );
    }

    #[test]
    fn subprocess_steps_are_mirrored_into_the_journey() {
        let mut session = make_session(5_000);
        let wd = &session.work_dir;
        let step = JourneyStep::SubprocessListen;
        wd.write_file(&wd.step_dir(step).join("state"), "STEP_PERFORMED")
            .unwrap();
        write_response(&session, r#"{"sockets":[]}"#);

        HandshakePerform::new(&mut session, getpid(), None, None)
            .execute()
            .unwrap();
        assert_eq!(
            session.journey.get_step_info(step).unwrap().state,
            JourneyStepState::Performed
        );
    }
}
