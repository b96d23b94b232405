//! The per-spawn work directory: an on-disk rendezvous between the
//! orchestrator and the spawned subprocess.
//!
//! Layout:
//!
//! ```text
//! args.json                   orchestrator -> child
//! envdump/envvars             child -> orchestrator (diagnostic)
//! envdump/user_info
//! envdump/ulimits
//! envdump/annotations/<name>
//! response/finish             presence signals handshake done
//! response/properties.json    listening sockets etc.
//! response/steps/<step>/state
//! response/steps/<step>/duration
//! response/error/category
//! response/error/summary
//! response/error/advanced_problem_details
//! response/error/problem_description.html
//! response/error/solution_description.html
//! response/stdin              optional FIFO
//! response/stdout_and_err     optional FIFO
//! ```
//!
//! Writes from the child side are best-effort: a failed diagnostic
//! write is logged, never fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SpawnError};
use crate::journey::JourneyStep;

/// Non-owning view of a work directory. The in-child setupper works
/// through this view; only the orchestrator-side [`WorkDir`] owns the
/// directory's lifetime.
#[derive(Clone, Debug)]
pub struct WorkDirView {
    root: PathBuf,
}

impl WorkDirView {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkDirView { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn args_json_path(&self) -> PathBuf {
        self.root.join("args.json")
    }

    pub fn envdump_dir(&self) -> PathBuf {
        self.root.join("envdump")
    }

    pub fn envdump_path(&self, name: &str) -> PathBuf {
        self.envdump_dir().join(name)
    }

    pub fn annotations_dir(&self) -> PathBuf {
        self.envdump_dir().join("annotations")
    }

    pub fn response_dir(&self) -> PathBuf {
        self.root.join("response")
    }

    pub fn finish_path(&self) -> PathBuf {
        self.response_dir().join("finish")
    }

    pub fn properties_json_path(&self) -> PathBuf {
        self.response_dir().join("properties.json")
    }

    pub fn steps_dir(&self) -> PathBuf {
        self.response_dir().join("steps")
    }

    pub fn step_dir(&self, step: JourneyStep) -> PathBuf {
        self.steps_dir().join(step.lowercase_name())
    }

    pub fn error_dir(&self) -> PathBuf {
        self.response_dir().join("error")
    }

    pub fn error_path(&self, name: &str) -> PathBuf {
        self.error_dir().join(name)
    }

    pub fn stdin_fifo_path(&self) -> PathBuf {
        self.response_dir().join("stdin")
    }

    pub fn stdout_and_err_fifo_path(&self) -> PathBuf {
        self.response_dir().join("stdout_and_err")
    }

    /// Single-shot write (write then close). Errors are surfaced; use
    /// [`WorkDirView::write_best_effort`] for diagnostics.
    pub fn write_file(&self, path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents).map_err(SpawnError::Io)
    }

    /// Best-effort single-shot write: a failure is logged, not fatal.
    pub fn write_best_effort(&self, path: &Path, contents: impl AsRef<[u8]>) {
        if let Err(e) = self.write_file(path, contents) {
            log::warn!("Cannot write {}: {}", path.display(), e);
        }
    }

    pub fn read_file_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(SpawnError::Io)
    }

    /// Loads `envdump/annotations/<name>` entries, trimmed. Missing
    /// directory yields an empty map. Dotfiles are skipped.
    pub fn load_annotations(&self) -> BTreeMap<String, String> {
        let mut result = BTreeMap::new();
        let dir = match fs::read_dir(self.annotations_dir()) {
            Ok(dir) => dir,
            Err(_) => return result,
        };
        for entry in dir.flatten() {
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) if !name.starts_with('.') => name.to_string(),
                _ => continue,
            };
            match fs::read_to_string(entry.path()) {
                Ok(contents) => {
                    result.insert(name, contents.trim().to_string());
                }
                Err(e) => {
                    log::warn!("Cannot read annotation {}: {}", entry.path().display(), e);
                }
            }
        }
        result
    }
}

/// Owning work directory: created under the OS temp dir with a unique
/// name, removed (recursively) when dropped. Everything the spawn
/// attempt leaves behind lives in here and nowhere else.
#[derive(Debug)]
pub struct WorkDir {
    view: WorkDirView,
}

impl WorkDir {
    pub fn new() -> Result<Self> {
        let root = std::env::temp_dir().join(format!("spawnkit-{}", uuid::Uuid::new_v4()));
        let view = WorkDirView::new(&root);

        fs::create_dir(&root)?;
        set_permissions_0700(&root);
        fs::create_dir(view.envdump_dir())?;
        fs::create_dir(view.annotations_dir())?;
        fs::create_dir(view.response_dir())?;
        fs::create_dir(view.steps_dir())?;
        fs::create_dir(view.error_dir())?;

        Ok(WorkDir { view })
    }
}

fn set_permissions_0700(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
        log::warn!("Cannot restrict permissions on {}: {}", path.display(), e);
    }
}

impl std::ops::Deref for WorkDir {
    type Target = WorkDirView;

    fn deref(&self) -> &WorkDirView {
        &self.view
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(self.view.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "Cannot remove spawn work directory {}: {}",
                    self.view.path().display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::JourneyStep;

    #[test]
    fn creates_protocol_layout() {
        let workdir = WorkDir::new().unwrap();
        assert!(workdir.path().is_dir());
        assert!(workdir.envdump_dir().is_dir());
        assert!(workdir.annotations_dir().is_dir());
        assert!(workdir.response_dir().is_dir());
        assert!(workdir.steps_dir().is_dir());
        assert!(workdir.error_dir().is_dir());
    }

    #[test]
    fn removes_directory_on_drop() {
        let workdir = WorkDir::new().unwrap();
        let path = workdir.path().to_path_buf();
        drop(workdir);
        assert!(!path.exists());
    }

    #[test]
    fn step_dirs_use_lowercased_step_names() {
        let workdir = WorkDir::new().unwrap();
        let dir = workdir.step_dir(JourneyStep::SubprocessOsShell);
        assert!(dir.ends_with("response/steps/subprocess_os_shell"));
        let dir = workdir.step_dir(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell);
        assert!(dir.ends_with("response/steps/subprocess_spawn_env_setupper_before_shell"));
    }

    #[test]
    fn annotations_load_trimmed_and_skip_dotfiles() {
        let workdir = WorkDir::new().unwrap();
        let dir = workdir.annotations_dir();
        std::fs::write(dir.join("lve"), "entered\n").unwrap();
        std::fs::write(dir.join("region"), "  eu-1  ").unwrap();
        std::fs::write(dir.join(".hidden"), "nope").unwrap();

        let annotations = workdir.load_annotations();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations["lve"], "entered");
        assert_eq!(annotations["region"], "eu-1");
    }

    #[test]
    fn missing_annotations_dir_yields_empty_map() {
        let view = WorkDirView::new("/nonexistent/spawnkit-test");
        assert!(view.load_annotations().is_empty());
    }
}
