//! Runtime directory layout
//!
//! Every component resolves its directories the same way so that a monitor,
//! a launcher and a detached executor started at different times agree on
//! where the PID Registry and the State Store live.

use std::path::{Path, PathBuf};

pub const DATA_DIR_VAR: &str = "DETACH_DATA_DIR";
pub const PID_DIR_VAR: &str = "DETACH_PID_DIR";
pub const STATE_DIR_VAR: &str = "DETACH_STATE_DIR";
pub const LOG_DIR_VAR: &str = "DETACH_LOG_DIR";

/// Directories used by the PID Registry, the State Store and job logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub data_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl RuntimePaths {
    /// Standard layout below a base directory
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            pid_dir: data_dir.join("pids"),
            state_dir: data_dir.join("state"),
            log_dir: data_dir.join("logs"),
            data_dir,
        }
    }

    /// Resolves the layout from `DETACH_*` environment variables
    ///
    /// Expected environment variables (all optional):
    /// - DETACH_DATA_DIR (default: ~/.detach)
    /// - DETACH_PID_DIR (default: <data>/pids)
    /// - DETACH_STATE_DIR (default: <data>/state)
    /// - DETACH_LOG_DIR (default: <data>/logs)
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`RuntimePaths::from_env`] with an injectable variable lookup
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let data_dir = var(DATA_DIR_VAR).unwrap_or_else(default_data_dir);
        let mut paths = Self::under(data_dir);

        if let Some(dir) = var(PID_DIR_VAR) {
            paths.pid_dir = dir;
        }
        if let Some(dir) = var(STATE_DIR_VAR) {
            paths.state_dir = dir;
        }
        if let Some(dir) = var(LOG_DIR_VAR) {
            paths.log_dir = dir;
        }

        paths
    }

    /// Creates all directories with owner-only permissions
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.pid_dir, &self.state_dir, &self.log_dir] {
            ensure_private_dir(dir)?;
        }
        Ok(())
    }

    /// Variables that make a child process resolve the same layout
    pub fn env_vars(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            (DATA_DIR_VAR, self.data_dir.clone()),
            (PID_DIR_VAR, self.pid_dir.clone()),
            (STATE_DIR_VAR, self.state_dir.clone()),
            (LOG_DIR_VAR, self.log_dir.clone()),
        ]
    }

    pub fn log_file(&self, job_id: &crate::domain::JobId) -> PathBuf {
        self.log_dir.join(format!("{job_id}.log"))
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::under(default_data_dir())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".detach")
}

/// Creates `dir` (and parents) restricted to the owner
pub fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_layout_under_base() {
        let paths = RuntimePaths::under("/var/lib/detach");
        assert_eq!(paths.pid_dir, PathBuf::from("/var/lib/detach/pids"));
        assert_eq!(paths.state_dir, PathBuf::from("/var/lib/detach/state"));
        assert_eq!(paths.log_dir, PathBuf::from("/var/lib/detach/logs"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            (DATA_DIR_VAR, "/data"),
            (PID_DIR_VAR, "/run/detach"),
            (STATE_DIR_VAR, ""),
        ]
        .into_iter()
        .collect();

        let paths = RuntimePaths::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(paths.pid_dir, PathBuf::from("/run/detach"));
        // blank values fall back to the default
        assert_eq!(paths.state_dir, PathBuf::from("/data/state"));
        assert_eq!(paths.log_dir, PathBuf::from("/data/logs"));
    }

    #[test]
    fn test_env_vars_reproduce_layout() {
        let paths = RuntimePaths::under("/a");
        let vars: HashMap<&str, String> = paths
            .env_vars()
            .into_iter()
            .map(|(k, v)| (k, v.to_string_lossy().to_string()))
            .collect();

        assert_eq!(RuntimePaths::from_vars(|k| vars.get(k).cloned()), paths);
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_creates_private_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::under(tmp.path().join("nested"));
        paths.ensure().unwrap();

        let mode = std::fs::metadata(&paths.state_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(paths.pid_dir.is_dir());
        assert!(paths.log_dir.is_dir());
    }
}
