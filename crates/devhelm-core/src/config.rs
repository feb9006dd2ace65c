//! User configuration and the launch-command resolver.
//!
//! Everything lives under `~/.config/devhelm/`: `config.json` with scan
//! directories and per-project port overrides, plus the `sessions/` and
//! `logs/` directories owned by the supervisor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

const APP_DIR: &str = "devhelm";

/// Persistent user configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default)]
    pub scan_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub port_overrides: HashMap<String, u16>,
}

/// `~/.config/devhelm`, or a relative `.devhelm` when the home directory
/// cannot be determined.
pub fn config_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".config").join(APP_DIR),
        None => PathBuf::from(".devhelm"),
    }
}

pub fn sessions_dir() -> PathBuf {
    config_dir().join("sessions")
}

pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

impl LocalConfig {
    /// Loads the config file; a missing or malformed file yields the
    /// defaults.
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read(path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Adds a directory to the scan list, absolutized when possible.
    /// Returns false when it was already present.
    pub fn add_scan_dir(&mut self, dir: &str) -> bool {
        let dir = fs::canonicalize(dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| dir.to_string());
        if self.scan_dirs.iter().any(|d| d == &dir) {
            return false;
        }
        self.scan_dirs.push(dir);
        true
    }

    /// Removes a directory from the scan list. Returns true when removed.
    pub fn remove_scan_dir(&mut self, dir: &str) -> bool {
        let before = self.scan_dirs.len();
        self.scan_dirs.retain(|d| d != dir);
        self.scan_dirs.len() != before
    }

    pub fn port_for(&self, key: &str) -> Option<u16> {
        self.port_overrides.get(key).copied()
    }

    pub fn set_port(&mut self, key: &str, port: u16) {
        self.port_overrides.insert(key.to_string(), port);
    }
}

/// Port-override key for a (worktree, project) pair.
pub fn port_key(wt_name: &str, project: &str) -> String {
    format!("{wt_name}:{project}")
}

/// Session names are opaque unique keys: `dev-<worktree>-<project>`,
/// with path separators and spaces flattened to dashes.
pub fn session_name(wt_name: &str, project: &str) -> String {
    format!(
        "dev-{}-{}",
        sanitize_component(wt_name),
        sanitize_component(project)
    )
}

fn sanitize_component(s: &str) -> String {
    s.chars()
        .map(|c| if matches!(c, '/' | '\\' | ' ') { '-' } else { c })
        .collect()
}

/// Maps a launch request onto `(command, args, extra_env)`.
///
/// Encore apps run under the Encore CLI with an explicit port. Package
/// scripts run through the package manager with `PORT` exported, scoped
/// with `--filter` when a workspace package name is given. The script
/// defaults to `dev`.
pub fn dev_command(
    is_encore: bool,
    port: u16,
    pm_binary: &str,
    pkg_name: Option<&str>,
    script: Option<&str>,
) -> (String, Vec<String>, Vec<String>) {
    let port_str = port.to_string();

    if is_encore {
        return (
            "encore".to_string(),
            vec!["run".to_string(), "--port".to_string(), port_str],
            Vec::new(),
        );
    }

    let script = script.filter(|s| !s.is_empty()).unwrap_or("dev");
    let port_env = vec![format!("PORT={port_str}")];

    match pkg_name.filter(|p| !p.is_empty()) {
        Some(pkg) => (
            pm_binary.to_string(),
            vec![
                "--filter".to_string(),
                pkg.to_string(),
                "run".to_string(),
                script.to_string(),
            ],
            port_env,
        ),
        None => (
            pm_binary.to_string(),
            vec!["run".to_string(), script.to_string()],
            port_env,
        ),
    }
}
