//! Handshake preparation: resolving the target uid and populating the
//! work directory with `args.json` for the subprocess.

use nix::unistd::{geteuid, User};

use crate::error::{Result, SpawnError};
use crate::handshake::session::HandshakeSession;

pub struct HandshakePrepare<'a> {
    session: &'a mut HandshakeSession,
}

impl<'a> HandshakePrepare<'a> {
    pub fn new(session: &'a mut HandshakeSession) -> Self {
        HandshakePrepare { session }
    }

    pub fn execute(self) -> Result<()> {
        let session = self.session;
        session.uid = resolve_target_uid(session.config.user.as_deref())?;
        session.result.sockets.clear();

        let agent_path = session.config.resolve_agent_path()?;
        let config = &session.config;
        let mut args = serde_json::json!({
            "app_root": config.app_root,
            "app_type": config.app_type,
            "app_env": config.app_env,
            "base_uri": config.base_uri,
            "start_command": config.start_command,
            "environment_variables": config.environment_variables,
            "load_shell_envvars": config.load_shell_envvars,
            "starts_using_wrapper": config.starts_using_wrapper,
            "passenger_agent_path": agent_path,
            "spawn_method": config.spawn_method,
        });
        let map = args.as_object_mut().expect("args is an object");
        if let Some(startup_file) = &config.startup_file {
            map.insert("startup_file".into(), startup_file.clone().into());
        }
        if let Some(user) = &config.user {
            map.insert("user".into(), user.clone().into());
        }
        if let Some(group) = &config.group {
            map.insert("group".into(), group.clone().into());
        }
        if let Some(wrapper_path) = &config.wrapper_path {
            map.insert("wrapper_path".into(), wrapper_path.clone().into());
        }
        if let Some(node_libdir) = &config.node_libdir {
            map.insert("node_libdir".into(), node_libdir.clone().into());
        }
        if let Some(port) = config.expected_start_port {
            map.insert("expected_start_port".into(), port.into());
        }
        if let Some(ulimit) = config.file_descriptor_ulimit {
            map.insert("file_descriptor_ulimit".into(), ulimit.into());
        }
        if let Some(level) = config.log_level {
            map.insert("log_level".into(), level.into());
        }
        if let Some(min_uid) = config.lve_min_uid {
            map.insert("lve_min_uid".into(), min_uid.into());
        }

        let serialized = serde_json::to_string_pretty(&args)
            .map_err(|e| SpawnError::Internal(format!("cannot serialize args.json: {e}")))?;
        session
            .work_dir
            .write_file(&session.work_dir.args_json_path(), serialized)?;
        Ok(())
    }
}

/// Whether a user or group name is really a numeric id in disguise.
pub fn looks_like_positive_number(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit())
}

/// Resolves the uid the subprocess should end up running as. With no
/// configured user the subprocess keeps our own effective uid. A
/// numeric-looking name falls back to its numeric value when the
/// passwd lookup fails.
pub fn resolve_target_uid(user: Option<&str>) -> Result<u32> {
    let name = match user {
        Some(name) => name,
        None => return Ok(geteuid().as_raw()),
    };
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => numeric_uid_fallback(name, nix::errno::Errno::ENOENT),
        Err(errno) => numeric_uid_fallback(name, errno),
    }
}

fn numeric_uid_fallback(name: &str, errno: nix::errno::Errno) -> Result<u32> {
    if looks_like_positive_number(name) {
        log::warn!(
            "Error looking up system user database entry for user '{name}': {}",
            errno.desc()
        );
        Ok(name.parse().expect("validated as numeric"))
    } else {
        Err(SpawnError::os(
            format!("Cannot lookup up system user database entry for user '{name}'"),
            errno,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppOptions, Config};
    use crate::journey::JourneyType;

    fn session_for(options: &AppOptions) -> HandshakeSession {
        let config = Config::from_options(options).unwrap();
        HandshakeSession::new(config, JourneyType::SpawnThroughPreloader).unwrap()
    }

    fn base_options() -> AppOptions {
        AppOptions {
            app_root: "/var/www/app".into(),
            app_type: "rack".into(),
            start_command: "ruby start.rb".into(),
            agent_path: Some("/opt/agent".into()),
            ..AppOptions::default()
        }
    }

    #[test]
    fn writes_args_json_with_core_fields() {
        let mut options = base_options();
        options.expected_start_port = Some(4000);
        options
            .environment_variables
            .insert("FOO".into(), "bar".into());
        let mut session = session_for(&options);
        HandshakePrepare::new(&mut session).execute().unwrap();

        let raw = std::fs::read_to_string(session.work_dir.args_json_path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["app_root"], "/var/www/app");
        assert_eq!(doc["start_command"], "ruby start.rb");
        assert_eq!(doc["passenger_agent_path"], "/opt/agent");
        assert_eq!(doc["expected_start_port"], 4000);
        assert_eq!(doc["environment_variables"]["FOO"], "bar");
        assert_eq!(doc["base_uri"], "/");
        // No user configured: the key is simply absent.
        assert!(doc.get("user").is_none());
    }

    #[test]
    fn unconfigured_user_resolves_to_own_euid() {
        assert_eq!(resolve_target_uid(None).unwrap(), geteuid().as_raw());
    }

    #[test]
    fn numeric_user_name_falls_back_to_its_value() {
        // Extremely unlikely to exist as an actual user name.
        assert_eq!(resolve_target_uid(Some("59342")).unwrap(), 59342);
    }

    #[test]
    fn unknown_non_numeric_user_fails() {
        let err = resolve_target_uid(Some("no-such-user-spawnkit")).unwrap_err();
        assert!(matches!(err, SpawnError::Os { .. }));
    }

    #[test]
    fn root_resolves_to_uid_zero() {
        assert_eq!(resolve_target_uid(Some("root")).unwrap(), 0);
    }

    #[test]
    fn looks_like_positive_number_cases() {
        assert!(looks_like_positive_number("501"));
        assert!(!looks_like_positive_number(""));
        assert!(!looks_like_positive_number("-1"));
        assert!(!looks_like_positive_number("www-data"));
    }
}
