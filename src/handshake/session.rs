//! The handshake session: everything one spawn attempt owns.

use nix::unistd::geteuid;

use crate::config::Config;
use crate::error::Result;
use crate::journey::{Journey, JourneyType};
use crate::spawner::SpawnResult;
use crate::timing::Deadline;
use crate::workdir::WorkDir;

/// Scoped state for a single spawn attempt. The work directory lives
/// and dies with the session; the deadline spans every blocking call
/// in it.
pub struct HandshakeSession {
    pub config: Config,
    pub journey: Journey,
    pub work_dir: WorkDir,
    /// The uid the subprocess is expected to run as. Resolved during
    /// handshake preparation; defaults to the caller's effective uid.
    pub uid: u32,
    pub deadline: Deadline,
    pub result: SpawnResult,
}

impl HandshakeSession {
    pub fn new(config: Config, journey_type: JourneyType) -> Result<Self> {
        let journey = Journey::new(journey_type, config.starts_using_wrapper);
        let work_dir = WorkDir::new()?;
        let deadline = Deadline::new(config.start_timeout_msec.saturating_mul(1000));
        Ok(HandshakeSession {
            uid: geteuid().as_raw(),
            config,
            journey,
            work_dir,
            deadline,
            result: SpawnResult::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppOptions;

    fn test_config() -> Config {
        let options = AppOptions {
            app_root: "/var/www/app".into(),
            app_type: "rack".into(),
            start_command: "ruby start.rb".into(),
            start_timeout_msec: 90_000,
            ..AppOptions::default()
        };
        Config::from_options(&options).unwrap()
    }

    #[test]
    fn session_owns_workdir_and_journey() {
        let session = HandshakeSession::new(test_config(), JourneyType::SpawnThroughPreloader)
            .unwrap();
        assert!(session.work_dir.path().is_dir());
        assert_eq!(
            session.journey.journey_type(),
            JourneyType::SpawnThroughPreloader
        );
        assert_eq!(session.uid, geteuid().as_raw());
        assert_eq!(session.deadline.remaining_usec(), 90_000_000);
    }

    #[test]
    fn workdir_is_removed_with_session() {
        let session =
            HandshakeSession::new(test_config(), JourneyType::StartPreloader).unwrap();
        let path = session.work_dir.path().to_path_buf();
        drop(session);
        assert!(!path.exists());
    }
}
