//! On-disk session descriptors.
//!
//! One JSON file per session under the sessions directory. Descriptors
//! are written when a process is spawned, deleted when it is explicitly
//! stopped, and garbage-collected on startup when their PID is dead.
//! There is no index; enumeration is a directory scan.

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// Persisted description of one supervised session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub name: String,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub port: u16,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_env: Vec<String>,
    pub work_dir: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub wt_name: String,
    #[serde(default)]
    pub wt_path: String,
    #[serde(default)]
    pub started_at: i64,
}

fn session_file(sessions_dir: &Path, name: &str) -> PathBuf {
    sessions_dir.join(format!("{name}.json"))
}

/// Writes a descriptor to `<sessions_dir>/<name>.json`, creating the
/// directory if needed.
pub fn save_session(sessions_dir: &Path, info: &SessionDescriptor) -> Result<()> {
    fs::create_dir_all(sessions_dir)?;
    let data = serde_json::to_vec_pretty(info)?;
    fs::write(session_file(sessions_dir, &info.name), data)?;
    Ok(())
}

/// Reads every descriptor in the sessions directory. A missing directory
/// yields an empty list; unreadable or malformed files are skipped and
/// left untouched.
pub fn load_all_sessions(sessions_dir: &Path) -> Result<Vec<SessionDescriptor>> {
    let entries = match fs::read_dir(sessions_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let Ok(data) = fs::read(&path) else {
            continue;
        };
        match serde_json::from_slice::<SessionDescriptor>(&data) {
            Ok(info) => sessions.push(info),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "skipping malformed session file");
            }
        }
    }
    Ok(sessions)
}

/// Deletes the descriptor for `name`. Missing files are fine.
pub fn remove_session(sessions_dir: &Path, name: &str) -> Result<()> {
    match fs::remove_file(session_file(sessions_dir, name)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// True when a process with this PID exists: the null-signal probe,
/// `kill(pid, 0)`.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(name: &str) -> SessionDescriptor {
        SessionDescriptor {
            name: name.to_string(),
            pid: 4242,
            port: 3000,
            command: "pnpm".to_string(),
            args: vec!["run".to_string(), "dev".to_string()],
            extra_env: vec!["PORT=3000".to_string()],
            work_dir: "/tmp/app".to_string(),
            project: "web".to_string(),
            wt_name: "main".to_string(),
            wt_path: "/tmp/app".to_string(),
            started_at: 1_700_000_000,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let info = descriptor("dev-main-web");
        save_session(dir.path(), &info).unwrap();

        let loaded = load_all_sessions(dir.path()).unwrap();
        assert_eq!(loaded, vec![info]);
    }

    #[test]
    fn load_skips_malformed_files() {
        let dir = TempDir::new().unwrap();
        save_session(dir.path(), &descriptor("good")).unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let loaded = load_all_sessions(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "good");
        // The malformed file is left in place.
        assert!(dir.path().join("broken.json").exists());
    }

    #[test]
    fn load_from_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let loaded = load_all_sessions(&dir.path().join("nope")).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        save_session(dir.path(), &descriptor("gone")).unwrap();
        remove_session(dir.path(), "gone").unwrap();
        remove_session(dir.path(), "gone").unwrap();
        assert!(load_all_sessions(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn liveness_probe() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }

    #[test]
    fn extra_env_omitted_when_empty() {
        let dir = TempDir::new().unwrap();
        let mut info = descriptor("bare");
        info.extra_env.clear();
        save_session(dir.path(), &info).unwrap();

        let raw = fs::read_to_string(dir.path().join("bare.json")).unwrap();
        assert!(!raw.contains("extra_env"));
    }
}
