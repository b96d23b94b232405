//! The spawn-env setupper: the program that runs inside the forked
//! subprocess to do everything that is unsafe between `fork` and
//! `exec` — user and group lookups, ulimits, LVE containment,
//! privilege dropping, chdir into the app root, environment setup and
//! optional login-shell chaining — before exec'ing the application.
//!
//! It runs in two stages selected by `--before` / `--after`: the
//! before stage runs with the orchestrator's privileges and drops
//! them; the after stage (re-entered via exec, possibly through the
//! user's login shell) finalizes the environment and execs the app.
//!
//! The process is single-threaded by construction; the unguarded
//! `setenv`-style environment mutations below rely on that.

pub mod report;

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::unistd::{geteuid, getgid, getuid, Gid, Group, Uid, User};
use serde::Deserialize;

use crate::error::{escape_html, ErrorCategory};
use crate::journey::{JourneyStep, JourneyStepState};
use crate::lve::LveScope;
use crate::setupper::report::*;
use crate::timing::monotonic_usec_coarse;
use crate::workdir::WorkDirView;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupperMode {
    Before,
    After,
}

/// The orchestrator-written `args.json`.
#[derive(Debug, Deserialize)]
pub struct SetupperArgs {
    pub app_root: String,
    pub app_env: String,
    pub base_uri: String,
    pub start_command: String,
    pub passenger_agent_path: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub load_shell_envvars: bool,
    #[serde(default)]
    pub starts_using_wrapper: bool,
    #[serde(default)]
    pub wrapper_path: Option<String>,
    #[serde(default)]
    pub node_libdir: Option<String>,
    #[serde(default)]
    pub expected_start_port: Option<u16>,
    #[serde(default)]
    pub file_descriptor_ulimit: Option<u64>,
    #[serde(default)]
    pub log_level: Option<i32>,
    #[serde(default)]
    pub lve_min_uid: Option<u32>,
}

struct Context {
    work_dir: WorkDirView,
    mode: SetupperMode,
    step: JourneyStep,
    start_usec: u64,
}

/// A fatal setupper failure, fully described for the error files.
struct FatalError {
    category: ErrorCategory,
    summary: String,
    is_also_advanced_problem_details: bool,
    problem_html: Option<String>,
    solution_html: Option<String>,
    /// Set when the failing step was already recorded (exec failures
    /// record the *next* step themselves).
    step_already_recorded: bool,
}

impl FatalError {
    fn os(summary: String) -> Self {
        FatalError {
            category: ErrorCategory::OperatingSystemError,
            summary,
            is_also_advanced_problem_details: true,
            problem_html: None,
            solution_html: None,
            step_already_recorded: false,
        }
    }

    fn internal(summary: String) -> Self {
        FatalError {
            category: ErrorCategory::InternalError,
            summary,
            is_also_advanced_problem_details: true,
            problem_html: None,
            solution_html: None,
            step_already_recorded: false,
        }
    }
}

fn errno_suffix(errno: nix::errno::Errno) -> String {
    format!("{} (errno={})", errno.desc(), errno as i32)
}

/// Entry point for `spawnkit-agent spawn-env-setupper`. Returns the
/// process exit code on failure; on success the process image is
/// replaced by exec and this never returns.
pub fn run(work_dir_path: &Path, mode: SetupperMode) -> i32 {
    let context = Context {
        work_dir: WorkDirView::new(work_dir_path),
        mode,
        step: match mode {
            SetupperMode::Before => JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
            SetupperMode::After => JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
        },
        start_usec: monotonic_usec_coarse(),
    };

    std::env::set_var("IN_PASSENGER", "1");
    std::env::set_var("PASSENGER_SPAWN_WORK_DIR", work_dir_path);
    record_step_complete(
        &context.work_dir,
        JourneyStep::SubprocessBeforeFirstExec,
        JourneyStepState::Performed,
        context.start_usec,
    );
    record_step_in_progress(&context.work_dir, context.step);

    let fatal = match run_stage(&context) {
        Ok(never) => match never {},
        Err(fatal) => fatal,
    };

    if !fatal.step_already_recorded {
        record_step_complete(
            &context.work_dir,
            context.step,
            JourneyStepState::Errored,
            context.start_usec,
        );
    }
    record_error_category(&context.work_dir, fatal.category);
    record_and_print_error_summary(
        &context.work_dir,
        &fatal.summary,
        fatal.is_also_advanced_problem_details,
    );
    if let Some(html) = &fatal.problem_html {
        record_problem_description_html(&context.work_dir, html);
    }
    if let Some(html) = &fatal.solution_html {
        record_solution_description_html(&context.work_dir, html);
    }
    1
}

fn run_stage(context: &Context) -> Result<std::convert::Infallible, FatalError> {
    let args = read_args(&context.work_dir)?;
    if let Some(level) = args.log_level {
        apply_log_level(level);
    }
    dump_all_environment_info(&context.work_dir);

    let should_switch_user = args.user.is_some() && geteuid().is_root();
    let mut shell = String::new();

    if context.mode == SetupperMode::Before {
        apply_envvars(&default_envvars(&args));
        dump_envvars(&context.work_dir);

        let mut switch_target = None;
        if should_switch_user {
            let target = lookup_user_group(&args)?;
            shell = target
                .user_info
                .as_ref()
                .map(|u| u.shell.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/bin/sh".to_string());
            switch_target = Some(target);
        } else {
            shell = lookup_current_user_shell();
        }

        if set_fd_ulimit(&args) {
            dump_ulimits(&context.work_dir);
        }

        if let Some(target) = switch_target {
            enter_lve_jail(target.uid, args.lve_min_uid)?;
            switch_group(&target)?;
            dump_user_info(&context.work_dir);

            switch_user(&target)?;
            dump_envvars(&context.work_dir);
            dump_user_info(&context.work_dir);
        }
    }

    set_current_working_directory(context, &args)?;
    dump_envvars(&context.work_dir);

    if context.mode == SetupperMode::After {
        apply_envvars(&default_envvars(&args));
        for (key, value) in &args.environment_variables {
            std::env::set_var(key, value);
        }
        dump_envvars(&context.work_dir);
    }

    exec_next_command(context, &args, &shell)
}

fn read_args(work_dir: &WorkDirView) -> Result<SetupperArgs, FatalError> {
    let path = work_dir.args_json_path();
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        FatalError::internal(format!("Cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        FatalError::internal(format!("Cannot parse {}: {e}", path.display()))
    })
}

fn apply_log_level(level: i32) {
    let filter = match level {
        i32::MIN..=0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    log::set_max_level(filter);
}

// ----- Environment dumps -----

fn dump_envvars(work_dir: &WorkDirView) {
    let mut contents = String::new();
    for (key, value) in std::env::vars_os() {
        contents.push_str(&key.to_string_lossy());
        contents.push('=');
        contents.push_str(&value.to_string_lossy());
        contents.push('\n');
    }
    work_dir.write_best_effort(&work_dir.envdump_path("envvars"), contents);
}

fn dump_command_output(work_dir: &WorkDirView, file_name: &str, command: &mut Command) {
    let path = work_dir.envdump_path(file_name);
    let file = match File::create(&path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: cannot create {}: {e}", path.display());
            return;
        }
    };
    let result = command
        .stdout(Stdio::from(file))
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        eprintln!("Warning: cannot run diagnostic command: {e}");
    }
}

fn dump_user_info(work_dir: &WorkDirView) {
    dump_command_output(work_dir, "user_info", &mut Command::new("id"));
}

fn dump_ulimits(work_dir: &WorkDirView) {
    // `ulimit` is a shell builtin, not an executable.
    dump_command_output(
        work_dir,
        "ulimits",
        Command::new("sh").args(["-c", "ulimit -a"]),
    );
}

fn dump_all_environment_info(work_dir: &WorkDirView) {
    dump_envvars(work_dir);
    dump_user_info(work_dir);
    dump_ulimits(work_dir);
}

// ----- Resource limits -----

fn set_fd_ulimit(args: &SetupperArgs) -> bool {
    let limit = match args.file_descriptor_ulimit {
        Some(limit) => limit,
        None => return false,
    };
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    loop {
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if rc == 0 {
            return true;
        }
        let errno = nix::errno::Errno::last();
        if errno == nix::errno::Errno::EINTR {
            continue;
        }
        eprintln!(
            "Error: unable to set file descriptor ulimit to {limit}: {}",
            errno_suffix(errno)
        );
        return false;
    }
}

// ----- User and group switching -----

struct SwitchTarget {
    uid: Uid,
    gid: Gid,
    user_info: Option<User>,
}

fn lookup_user_group(args: &SetupperArgs) -> Result<SwitchTarget, FatalError> {
    let user_name = args.user.as_deref().expect("caller checked user presence");

    let (uid, user_info) = match User::from_name(user_name) {
        Ok(Some(user)) => (user.uid, Some(user)),
        other => {
            let errno = lookup_errno(other.err());
            if looks_like_positive_number(user_name) {
                eprintln!(
                    "Warning: error looking up system user database entry for user \
                     '{user_name}': {}",
                    errno_suffix(errno)
                );
                (Uid::from_raw(user_name.parse().expect("validated as numeric")), None)
            } else {
                return Err(FatalError::os(format!(
                    "Cannot lookup up system user database entry for user \
                     '{user_name}': {}",
                    errno_suffix(errno)
                )));
            }
        }
    };

    let gid = match &args.group {
        Some(group_name) => match Group::from_name(group_name) {
            Ok(Some(group)) => group.gid,
            other => {
                let errno = lookup_errno(other.err());
                if looks_like_positive_number(group_name) {
                    eprintln!(
                        "Warning: error looking up system group database entry for \
                         group '{group_name}': {}",
                        errno_suffix(errno)
                    );
                    Gid::from_raw(group_name.parse().expect("validated as numeric"))
                } else {
                    return Err(FatalError::os(format!(
                        "Cannot lookup up system group database entry for group \
                         '{group_name}': {}",
                        errno_suffix(errno)
                    )));
                }
            }
        },
        None => user_info.as_ref().map(|u| u.gid).unwrap_or_else(getgid),
    };

    Ok(SwitchTarget {
        uid,
        gid,
        user_info,
    })
}

fn lookup_errno(err: Option<nix::errno::Errno>) -> nix::errno::Errno {
    err.unwrap_or(nix::errno::Errno::ENOENT)
}

fn looks_like_positive_number(value: &str) -> bool {
    crate::handshake::prepare::looks_like_positive_number(value)
}

fn enter_lve_jail(uid: Uid, lve_min_uid: Option<u32>) -> Result<(), FatalError> {
    match LveScope::enter(uid.as_raw(), lve_min_uid) {
        Ok(scope) => {
            // The jail must survive the upcoming execs.
            scope.persist();
            Ok(())
        }
        Err(e) => Err(FatalError::internal(format!("enterLve() failed: {e}"))),
    }
}

fn switch_group(target: &SwitchTarget) -> Result<(), FatalError> {
    if let Some(user_info) = &target.user_info {
        let name = CString::new(user_info.name.as_bytes())
            .map_err(|_| FatalError::internal("user name contains a NUL byte".into()))?;

        let mut groups = vec![0 as libc::gid_t; 1024];
        let mut ngroups = groups.len() as libc::c_int;
        let rc = unsafe {
            libc::getgrouplist(
                name.as_ptr(),
                target.gid.as_raw(),
                groups.as_mut_ptr(),
                &mut ngroups,
            )
        };
        if rc == -1 && ngroups as usize > groups.len() {
            // More groups than our buffer; fall back to initgroups.
            let rc = unsafe { libc::initgroups(name.as_ptr(), target.gid.as_raw()) };
            if rc == -1 {
                let errno = nix::errno::Errno::last();
                return Err(FatalError::os(format!(
                    "initgroups({}, {}) failed: {}",
                    user_info.name,
                    target.gid,
                    errno_suffix(errno)
                )));
            }
        } else if rc == -1 {
            let errno = nix::errno::Errno::last();
            return Err(FatalError::os(format!(
                "getgrouplist({}, {}) failed: {}",
                user_info.name,
                target.gid,
                errno_suffix(errno)
            )));
        } else {
            groups.truncate(ngroups as usize);
            let rc = unsafe { libc::setgroups(groups.len(), groups.as_ptr()) };
            if rc == -1 {
                let errno = nix::errno::Errno::last();
                return Err(FatalError::os(format!(
                    "setgroups({}, ...) failed: {}",
                    groups.len(),
                    errno_suffix(errno)
                )));
            }
        }
    }

    nix::unistd::setgid(target.gid).map_err(|errno| {
        FatalError::os(format!(
            "setgid({}) failed: {}",
            target.gid,
            errno_suffix(errno)
        ))
    })
}

fn switch_user(target: &SwitchTarget) -> Result<(), FatalError> {
    nix::unistd::setuid(target.uid).map_err(|errno| {
        FatalError::os(format!(
            "setuid({}) failed: {}",
            target.uid,
            errno_suffix(errno)
        ))
    })?;
    match &target.user_info {
        Some(user_info) => {
            std::env::set_var("USER", &user_info.name);
            std::env::set_var("LOGNAME", &user_info.name);
            std::env::set_var("SHELL", &user_info.shell);
            std::env::set_var("HOME", &user_info.dir);
        }
        None => {
            std::env::remove_var("USER");
            std::env::remove_var("LOGNAME");
            std::env::remove_var("SHELL");
            std::env::remove_var("HOME");
        }
    }
    Ok(())
}

fn lookup_current_user_shell() -> String {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.shell.to_string_lossy().into_owned(),
        _ => {
            eprintln!(
                "Warning: cannot lookup system user database entry for UID {}",
                getuid()
            );
            "/bin/sh".to_string()
        }
    }
}

// ----- Working directory -----

/// All ancestors of `path` from the top down, ending with `path`
/// itself. `path` must be absolute.
fn infer_all_parent_directories(path: &Path) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = path.ancestors().map(Path::to_path_buf).collect();
    result.pop(); // drop "/" itself
    result.reverse();
    result
}

fn process_user_name() -> String {
    match User::from_uid(geteuid()) {
        Ok(Some(user)) => user.name,
        _ => geteuid().to_string(),
    }
}

fn process_group_name() -> String {
    match Group::from_gid(getgid()) {
        Ok(Some(group)) => group.name,
        _ => getgid().to_string(),
    }
}

fn set_current_working_directory(
    context: &Context,
    args: &SetupperArgs,
) -> Result<(), FatalError> {
    let app_root = absolutize(Path::new(&args.app_root));

    for dir in infer_all_parent_directories(&app_root) {
        match nix::sys::stat::stat(&dir) {
            Ok(_) => {}
            Err(nix::errno::Errno::EACCES) => {
                let parent = dir
                    .parent()
                    .unwrap_or_else(|| Path::new("/"))
                    .display()
                    .to_string();
                return Err(FatalError {
                    category: ErrorCategory::OperatingSystemError,
                    summary: format!(
                        "Directory '{parent}' is inaccessible because of a filesystem \
                         permission error."
                    ),
                    is_also_advanced_problem_details: false,
                    problem_html: Some(format!(
                        "<p>The application server tried to start the web application \
                         as user '{user}' and group '{group}'. During this process it \
                         must be able to access its application root directory \
                         '{root}'. However, the parent directory '{parent}' has wrong \
                         permissions, thereby preventing this process from accessing \
                         its application root directory.</p>",
                        user = escape_html(&process_user_name()),
                        group = escape_html(&process_group_name()),
                        root = escape_html(&app_root.display().to_string()),
                        parent = escape_html(&parent),
                    )),
                    solution_html: Some(format!(
                        "<p class=\"sole-solution\">Please fix the permissions of the \
                         directory '{root}' in such a way that the directory is \
                         accessible by user '{user}' and group '{group}'.</p>",
                        root = escape_html(&app_root.display().to_string()),
                        user = escape_html(&process_user_name()),
                        group = escape_html(&process_group_name()),
                    )),
                    step_already_recorded: false,
                });
            }
            Err(errno) => {
                return Err(FatalError::os(format!(
                    "Unable to stat() directory '{}': {}",
                    dir.display(),
                    errno_suffix(errno)
                )));
            }
        }
    }

    if let Err(errno) = nix::unistd::chdir(&app_root) {
        let mut fatal = FatalError::os(format!(
            "Unable to change working directory to '{}': {}",
            app_root.display(),
            errno_suffix(errno)
        ));
        let flavor =
            if errno == nix::errno::Errno::EPERM || errno == nix::errno::Errno::EACCES {
                "filesystem permission error"
            } else {
                "filesystem error"
            };
        fatal.problem_html = Some(format!(
            "<p>The application server tried to start the web application as user \
             {user} and group {group}, with a working directory of {root}. However, \
             it encountered a {flavor} while doing this.</p>",
            user = escape_html(&process_user_name()),
            group = escape_html(&process_group_name()),
            root = escape_html(&app_root.display().to_string()),
        ));
        return Err(fatal);
    }

    // The app root may contain symlinks; getcwd() would resolve them.
    // Shells report the unresolved ("logical") working directory via
    // PWD, so do the same.
    std::env::set_var("PWD", &app_root);
    Ok(())
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

// ----- Environment variables -----

/// The default app environment, as key to value-or-unset pairs,
/// applied in order.
fn default_envvars(args: &SetupperArgs) -> Vec<(String, Option<String>)> {
    let mut vars: Vec<(String, Option<String>)> = Vec::new();
    vars.push(("PYTHONUNBUFFERED".into(), Some("1".into())));
    if let Some(node_libdir) = &args.node_libdir {
        vars.push(("NODE_PATH".into(), Some(node_libdir.clone())));
    }
    for key in ["RAILS_ENV", "RACK_ENV", "WSGI_ENV", "NODE_ENV", "PASSENGER_APP_ENV"] {
        vars.push((key.into(), Some(args.app_env.clone())));
    }
    if let Some(port) = args.expected_start_port {
        vars.push(("PORT".into(), Some(port.to_string())));
    }
    let base_uri_vars = ["RAILS_RELATIVE_URL_ROOT", "RACK_BASE_URI", "PASSENGER_BASE_URI"];
    if args.base_uri != "/" {
        for key in base_uri_vars {
            vars.push((key.into(), Some(args.base_uri.clone())));
        }
    } else {
        for key in base_uri_vars {
            vars.push((key.into(), None));
        }
    }
    vars
}

fn apply_envvars(vars: &[(String, Option<String>)]) {
    for (key, value) in vars {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
}

// ----- Exec chaining -----

fn shell_base_name(shell: &str) -> &str {
    shell.rsplit('/').next().unwrap_or(shell)
}

fn should_load_shell_envvars(args: &SetupperArgs, shell: &str) -> bool {
    args.load_shell_envvars
        && matches!(shell_base_name(shell), "bash" | "zsh" | "ksh")
}

/// The command the current stage chains into, and the journey step it
/// represents.
fn build_next_command(
    context: &Context,
    args: &SetupperArgs,
    shell: &str,
) -> (JourneyStep, Vec<String>) {
    match context.mode {
        SetupperMode::Before => {
            let work_dir = context.work_dir.path().display().to_string();
            if should_load_shell_envvars(args, shell) {
                (
                    JourneyStep::SubprocessOsShell,
                    vec![
                        shell.to_string(),
                        "-lc".into(),
                        "exec \"$@\"".into(),
                        "SpawnEnvSetupperShell".into(),
                        args.passenger_agent_path.clone(),
                        "spawn-env-setupper".into(),
                        work_dir,
                        "--after".into(),
                    ],
                )
            } else {
                (
                    JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
                    vec![
                        args.passenger_agent_path.clone(),
                        "spawn-env-setupper".into(),
                        work_dir,
                        "--after".into(),
                    ],
                )
            }
        }
        SetupperMode::After => {
            if args.starts_using_wrapper {
                let command = match &args.wrapper_path {
                    Some(wrapper) => vec![wrapper.clone()],
                    None => sh_command(&args.start_command),
                };
                (JourneyStep::SubprocessExecWrapper, command)
            } else {
                (
                    JourneyStep::SubprocessAppLoadOrExec,
                    sh_command(&args.start_command),
                )
            }
        }
    }
}

fn sh_command(start_command: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), start_command.to_string()]
}

fn exec_next_command(
    context: &Context,
    args: &SetupperArgs,
    shell: &str,
) -> Result<std::convert::Infallible, FatalError> {
    let (next_step, command) = build_next_command(context, args, shell);

    let mut argv = Vec::with_capacity(command.len());
    for arg in &command {
        argv.push(CString::new(arg.as_str()).map_err(|_| {
            FatalError::internal("command contains a NUL byte".into())
        })?);
    }

    let next_start_usec = monotonic_usec_coarse();
    record_step_complete(
        &context.work_dir,
        context.step,
        JourneyStepState::Performed,
        context.start_usec,
    );
    record_step_in_progress(&context.work_dir, next_step);

    let argv_refs: Vec<&std::ffi::CStr> = argv.iter().map(|c| c.as_c_str()).collect();
    let errno = match nix::unistd::execvp(&argv[0], &argv_refs) {
        Ok(never) => match never {},
        Err(errno) => errno,
    };

    record_step_complete(
        &context.work_dir,
        next_step,
        JourneyStepState::Errored,
        next_start_usec,
    );
    let mut fatal = FatalError::os(format!(
        "Unable to execute command '{}': {}",
        command.join(" "),
        errno_suffix(errno)
    ));
    fatal.step_already_recorded = true;
    Err(fatal)
}
