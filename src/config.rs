//! Spawn configuration: the pool-facing options bag and the frozen
//! per-spawn snapshot taken from it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpawnError};

/// Options describing one application, as maintained by the process
/// pool. Mutable on the pool side; the engine never holds on to it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppOptions {
    /// Application root directory.
    pub app_root: String,
    /// Application type tag (e.g. "rack", "node").
    pub app_type: String,
    /// Command that loads or execs the application.
    pub start_command: String,
    /// Entry-point file, relative to the app root.
    pub startup_file: Option<String>,
    /// Command that starts the application preloader. Must have at
    /// least two elements when using the smart spawner.
    pub preloader_command: Vec<String>,
    /// Deployment environment ("production", "staging", ...).
    pub app_env: String,
    /// Base URI the app is mounted under.
    pub base_uri: String,
    /// System user to run the app as. None means no user switching.
    pub user: Option<String>,
    /// System group to run the app as.
    pub group: Option<String>,
    /// Extra environment variables for the app.
    pub environment_variables: BTreeMap<String, String>,
    /// Whether to load the user's login-shell environment first.
    pub load_shell_envvars: bool,
    /// Whether the start command goes through a language wrapper.
    pub starts_using_wrapper: bool,
    /// Wrapper binary, exec'd directly when configured.
    pub wrapper_path: Option<String>,
    /// Directory prepended to NODE_PATH in the app environment.
    pub node_libdir: Option<String>,
    /// Port the app is expected to listen on, exported as PORT.
    pub expected_start_port: Option<u16>,
    /// File descriptor ulimit applied inside the subprocess.
    pub file_descriptor_ulimit: Option<u64>,
    /// Overall spawn deadline in milliseconds.
    pub start_timeout_msec: u64,
    /// Log level forwarded to the in-child environment setupper.
    pub log_level: Option<i32>,
    /// Minimum uid for LVE containment; None disables LVE entirely.
    pub lve_min_uid: Option<u32>,
    /// Agent binary override. Defaults to the running executable.
    pub agent_path: Option<PathBuf>,
}

impl Default for AppOptions {
    fn default() -> Self {
        AppOptions {
            app_root: String::new(),
            app_type: String::new(),
            start_command: String::new(),
            startup_file: None,
            preloader_command: Vec::new(),
            app_env: "production".to_string(),
            base_uri: "/".to_string(),
            user: None,
            group: None,
            environment_variables: BTreeMap::new(),
            load_shell_envvars: true,
            starts_using_wrapper: false,
            wrapper_path: None,
            node_libdir: None,
            expected_start_port: None,
            file_descriptor_ulimit: None,
            start_timeout_msec: 90_000,
            log_level: None,
            lve_min_uid: None,
            agent_path: None,
        }
    }
}

/// Immutable snapshot of all spawn parameters, extracted from
/// [`AppOptions`] at call entry. Fields mirror the options but can no
/// longer change underneath a running spawn attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub app_root: String,
    pub app_type: String,
    pub start_command: String,
    pub startup_file: Option<String>,
    pub app_env: String,
    pub base_uri: String,
    pub user: Option<String>,
    pub group: Option<String>,
    pub environment_variables: BTreeMap<String, String>,
    pub load_shell_envvars: bool,
    pub starts_using_wrapper: bool,
    pub wrapper_path: Option<String>,
    pub node_libdir: Option<String>,
    pub expected_start_port: Option<u16>,
    pub file_descriptor_ulimit: Option<u64>,
    pub start_timeout_msec: u64,
    pub log_level: Option<i32>,
    pub lve_min_uid: Option<u32>,
    pub agent_path: Option<PathBuf>,
    /// Which spawn strategy produced this config ("smart", "direct").
    pub spawn_method: String,
}

impl Config {
    pub fn from_options(options: &AppOptions) -> Result<Self> {
        if options.app_root.is_empty() {
            return Err(SpawnError::Config("app_root may not be empty".into()));
        }
        if options.start_command.is_empty() {
            return Err(SpawnError::Config("start_command may not be empty".into()));
        }
        if options.base_uri.is_empty() {
            return Err(SpawnError::Config("base_uri may not be empty".into()));
        }
        Ok(Config {
            app_root: options.app_root.clone(),
            app_type: options.app_type.clone(),
            start_command: options.start_command.clone(),
            startup_file: options.startup_file.clone(),
            app_env: options.app_env.clone(),
            base_uri: options.base_uri.clone(),
            user: options.user.clone(),
            group: options.group.clone(),
            environment_variables: options.environment_variables.clone(),
            load_shell_envvars: options.load_shell_envvars,
            starts_using_wrapper: options.starts_using_wrapper,
            wrapper_path: options.wrapper_path.clone(),
            node_libdir: options.node_libdir.clone(),
            expected_start_port: options.expected_start_port,
            file_descriptor_ulimit: options.file_descriptor_ulimit,
            start_timeout_msec: options.start_timeout_msec,
            log_level: options.log_level,
            lve_min_uid: options.lve_min_uid,
            agent_path: options.agent_path.clone(),
            spawn_method: "direct".to_string(),
        })
    }

    /// Resolves the agent binary that hosts the spawn-env setupper.
    pub fn resolve_agent_path(&self) -> Result<PathBuf> {
        match &self.agent_path {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(SpawnError::Io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_options() -> AppOptions {
        AppOptions {
            app_root: "/var/www/app".to_string(),
            app_type: "rack".to_string(),
            start_command: "ruby start.rb".to_string(),
            ..AppOptions::default()
        }
    }

    #[test]
    fn snapshot_copies_all_spawn_parameters() {
        let mut options = valid_options();
        options.user = Some("www-data".to_string());
        options
            .environment_variables
            .insert("FOO".to_string(), "bar".to_string());
        let config = Config::from_options(&options).unwrap();
        assert_eq!(config.app_root, "/var/www/app");
        assert_eq!(config.user.as_deref(), Some("www-data"));
        assert_eq!(config.environment_variables["FOO"], "bar");
        assert_eq!(config.spawn_method, "direct");
    }

    #[test]
    fn empty_app_root_is_rejected() {
        let mut options = valid_options();
        options.app_root.clear();
        assert!(matches!(
            Config::from_options(&options),
            Err(SpawnError::Config(_))
        ));
    }

    #[test]
    fn empty_start_command_is_rejected() {
        let mut options = valid_options();
        options.start_command.clear();
        assert!(Config::from_options(&options).is_err());
    }
}
