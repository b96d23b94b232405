//! End-to-end handshake tests: a real subprocess runs the actual
//! spawn-env-setupper agent against a real work directory, and the
//! orchestrator side performs the handshake against it.

use std::path::PathBuf;
use std::process::Command;

use nix::unistd::Pid;

use spawnkit::config::{AppOptions, Config};
use spawnkit::error::ErrorCategory;
use spawnkit::handshake::{HandshakePerform, HandshakePrepare, HandshakeSession};
use spawnkit::journey::{JourneyStep, JourneyStepState, JourneyType};

fn agent_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_spawnkit-agent"))
}

fn make_session(options: &AppOptions, journey_type: JourneyType) -> HandshakeSession {
    let config = Config::from_options(options).unwrap();
    HandshakeSession::new(config, journey_type).unwrap()
}

/// The app writes its startup report and exits; the handshake must
/// still observe the finish signal.
const REPORT_AND_EXIT: &str = r#"env > "$PASSENGER_SPAWN_WORK_DIR/final_env"; \
printf '{"sockets":[{"address":"unix:/tmp/app.sock","protocol":"http","concurrency":0,"accept_http_requests":true}]}' \
  > "$PASSENGER_SPAWN_WORK_DIR/response/properties.json"; \
touch "$PASSENGER_SPAWN_WORK_DIR/response/finish""#;

#[test]
fn full_spawn_handshake_through_the_real_setupper() {
    let app_root = tempfile::tempdir().unwrap();
    let options = AppOptions {
        app_root: app_root.path().display().to_string(),
        app_type: "generic".into(),
        start_command: REPORT_AND_EXIT.into(),
        app_env: "staging".into(),
        expected_start_port: Some(4567),
        load_shell_envvars: false,
        agent_path: Some(agent_path()),
        start_timeout_msec: 30_000,
        ..AppOptions::default()
    };

    let mut session = make_session(&options, JourneyType::SpawnDirectly);
    session
        .journey
        .set_step_in_progress(JourneyStep::SpawnerPreparation, false)
        .unwrap();
    HandshakePrepare::new(&mut session).execute().unwrap();

    let child = Command::new(agent_path())
        .arg("spawn-env-setupper")
        .arg(session.work_dir.path())
        .arg("--before")
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    HandshakePerform::new(&mut session, pid, None, None)
        .execute()
        .unwrap();

    // The app's reported socket came through.
    assert_eq!(session.result.sockets.len(), 1);
    assert_eq!(session.result.sockets[0].address, "unix:/tmp/app.sock");

    // Both setupper stages reported their steps through the work dir.
    for step in [
        JourneyStep::SubprocessBeforeFirstExec,
        JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
        JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
    ] {
        assert_eq!(
            session.journey.get_step_info(step).unwrap().state,
            JourneyStepState::Performed,
            "step {}",
            step.name()
        );
    }

    // The final environment contains what the setupper exported.
    let final_env =
        std::fs::read_to_string(session.work_dir.path().join("final_env")).unwrap();
    assert!(final_env.contains("IN_PASSENGER=1"));
    assert!(final_env.contains("RAILS_ENV=staging"));
    assert!(final_env.contains("RACK_ENV=staging"));
    assert!(final_env.contains("PASSENGER_APP_ENV=staging"));
    assert!(final_env.contains("PORT=4567"));
    assert!(final_env.contains(&format!("PWD={}", app_root.path().display())));
    assert!(final_env.contains("PYTHONUNBUFFERED=1"));

    // Environment dumps were produced along the way.
    assert!(session.work_dir.envdump_path("envvars").exists());
    assert!(session.work_dir.envdump_path("user_info").exists());
    assert!(session.work_dir.envdump_path("ulimits").exists());
}

#[test]
fn app_that_never_reports_back_fails_as_premature_exit() {
    let app_root = tempfile::tempdir().unwrap();
    let options = AppOptions {
        app_root: app_root.path().display().to_string(),
        app_type: "generic".into(),
        // Exits without ever writing the finish signal.
        start_command: "exit 42".into(),
        load_shell_envvars: false,
        agent_path: Some(agent_path()),
        start_timeout_msec: 30_000,
        ..AppOptions::default()
    };

    let mut session = make_session(&options, JourneyType::SpawnDirectly);
    HandshakePrepare::new(&mut session).execute().unwrap();

    let child = Command::new(agent_path())
        .arg("spawn-env-setupper")
        .arg(session.work_dir.path())
        .arg("--before")
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    let err = HandshakePerform::new(&mut session, pid, None, None)
        .execute()
        .unwrap_err();
    assert!(err.summary().contains("exited prematurely"));
    // The setupper stages themselves completed; the app simply never
    // reported back.
    assert_eq!(
        session
            .journey
            .get_step_info(JourneyStep::SubprocessSpawnEnvSetupperAfterShell)
            .unwrap()
            .state,
        JourneyStepState::Performed
    );
}

#[test]
fn inaccessible_app_root_parent_is_reported_with_the_exact_directory() {
    if nix::unistd::geteuid().is_root() {
        // Root bypasses directory permission checks; the scenario
        // cannot be reproduced.
        return;
    }

    let base = tempfile::tempdir().unwrap();
    let blocked = base.path().join("blocked");
    let app_root = blocked.join("app");
    std::fs::create_dir_all(&app_root).unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&blocked, std::fs::Permissions::from_mode(0o600)).unwrap();

    let options = AppOptions {
        app_root: app_root.display().to_string(),
        app_type: "generic".into(),
        start_command: "true".into(),
        load_shell_envvars: false,
        agent_path: Some(agent_path()),
        start_timeout_msec: 30_000,
        ..AppOptions::default()
    };
    let mut session = make_session(&options, JourneyType::SpawnDirectly);
    HandshakePrepare::new(&mut session).execute().unwrap();

    let child = Command::new(agent_path())
        .arg("spawn-env-setupper")
        .arg(session.work_dir.path())
        .arg("--before")
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    let err = HandshakePerform::new(&mut session, pid, None, None)
        .execute()
        .unwrap_err();

    // Restore permissions so the tempdir can be cleaned up.
    std::fs::set_permissions(&blocked, std::fs::Permissions::from_mode(0o700)).unwrap();

    assert_eq!(err.category(), ErrorCategory::OperatingSystemError);
    assert!(
        err.summary().contains("inaccessible"),
        "summary was: {}",
        err.summary()
    );
    assert!(err.summary().contains(&blocked.display().to_string()));
    let problem = err.problem_description_html().unwrap();
    assert!(problem.contains(&blocked.display().to_string()));
    assert_eq!(
        err.journey().first_failed_step(),
        JourneyStep::SubprocessSpawnEnvSetupperBeforeShell
    );
}
