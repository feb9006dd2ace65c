//! Cloudflare Quick Tunnel sidecar.
//!
//! A tunnel is an external `cloudflared` child bound one-to-one to a
//! managed process. cloudflared announces the assigned public URL on
//! stderr; a parser task grabs the first match and keeps draining so the
//! pipe never backs up.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::process::pty::signal_group;
use crate::{Error, Result};

/// SIGTERM grace before a tunnel is SIGKILLed.
const STOP_GRACE: Duration = Duration::from_secs(3);

static TUNNEL_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("static pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Off,
    Starting,
    Active,
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Off => "off",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Active => "active",
            TunnelStatus::Error => "error",
        }
    }
}

/// Handle to one running tunnel child.
pub struct TunnelHandle {
    status: RwLock<TunnelStatus>,
    url: RwLock<String>,
    pid: i32,
    url_rx: Mutex<Option<oneshot::Receiver<String>>>,
    done: CancellationToken,
}

impl TunnelHandle {
    pub fn status(&self) -> TunnelStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The public URL, empty until parsed from stderr.
    pub fn url(&self) -> String {
        self.url.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resolves when the tunnel child has exited.
    pub async fn exited(&self) {
        self.done.cancelled().await;
    }

    /// Waits until the URL has been parsed, the child exits, or the
    /// ceiling elapses.
    pub async fn wait_for_url(&self, ceiling: Duration) -> Result<String> {
        {
            let url = self.url.read().unwrap_or_else(|e| e.into_inner());
            if !url.is_empty() {
                return Ok(url.clone());
            }
        }

        let rx = self
            .url_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(rx) = rx else {
            // URL channel already consumed without a URL arriving.
            return Err(Error::TunnelExited);
        };

        let outcome = tokio::time::timeout(ceiling, async {
            tokio::select! {
                url = rx => url.ok(),
                _ = self.done.cancelled() => None,
            }
        })
        .await;

        match outcome {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(Error::TunnelExited),
            Err(_) => Err(Error::TunnelUrlTimeout),
        }
    }

    fn set_status(&self, status: TunnelStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

/// True when the cloudflared binary is reachable on PATH.
pub fn cloudflared_available() -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join("cloudflared").is_file())
}

/// Launches a quick tunnel for `http://localhost:<port>` in its own
/// process group and starts the stderr parser and exit waiter.
pub fn start(port: u16) -> Result<Arc<TunnelHandle>> {
    let local_url = format!("http://localhost:{port}");
    let host_header = format!("localhost:{port}");

    let mut cmd = Command::new("cloudflared");
    cmd.args(["tunnel", "--url", &local_url, "--http-host-header", &host_header])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn()?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Io(io::Error::other("cloudflared stderr unavailable")))?;
    let pid = child.id().map(|p| p as i32).unwrap_or(0);

    let (url_tx, url_rx) = oneshot::channel();
    let done = CancellationToken::new();

    let handle = Arc::new(TunnelHandle {
        status: RwLock::new(TunnelStatus::Starting),
        url: RwLock::new(String::new()),
        pid,
        url_rx: Mutex::new(Some(url_rx)),
        done: done.clone(),
    });

    let parser_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut url_tx = Some(url_tx);
        while let Ok(Some(line)) = lines.next_line().await {
            if url_tx.is_none() {
                // Keep draining so cloudflared never blocks on a full pipe.
                continue;
            }
            if let Some(m) = TUNNEL_URL.find(&line) {
                let url = m.as_str().to_string();
                info!(url = %url, "tunnel URL acquired");
                *parser_handle
                    .url
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = url.clone();
                parser_handle.set_status(TunnelStatus::Active);
                if let Some(tx) = url_tx.take() {
                    let _ = tx.send(url);
                }
            }
        }
    });

    let waiter_handle = handle.clone();
    tokio::spawn(async move {
        let exit = child.wait().await;
        debug!(status = ?exit, "tunnel process exited");
        if waiter_handle.status() == TunnelStatus::Starting {
            waiter_handle.set_status(TunnelStatus::Error);
        }
        done.cancel();
    });

    Ok(handle)
}

/// Stops a tunnel: SIGTERM to the process group, then SIGKILL after the
/// grace period, then wait for the child to be gone.
pub async fn stop(handle: &TunnelHandle) {
    if handle.pid > 0 && !handle.done.is_cancelled() {
        signal_group(handle.pid, nix::sys::signal::Signal::SIGTERM);
        let graceful = tokio::time::timeout(STOP_GRACE, handle.done.cancelled())
            .await
            .is_ok();
        if !graceful {
            signal_group(handle.pid, nix::sys::signal::Signal::SIGKILL);
            handle.done.cancelled().await;
        }
    }
    handle.set_status(TunnelStatus::Off);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_url_from_cloudflared_banner() {
        let line = "2024-05-01T10:00:00Z INF |  https://witty-lemur-abc123.trycloudflare.com  |";
        let m = TUNNEL_URL.find(line).unwrap();
        assert_eq!(m.as_str(), "https://witty-lemur-abc123.trycloudflare.com");
    }

    #[test]
    fn ignores_non_tunnel_urls() {
        assert!(TUNNEL_URL.find("https://example.com/path").is_none());
        assert!(TUNNEL_URL
            .find("visit https://dash.cloudflare.com for details")
            .is_none());
    }

    #[test]
    fn availability_probe_does_not_panic() {
        let _ = cloudflared_available();
    }

    #[test]
    fn status_labels() {
        assert_eq!(TunnelStatus::Off.as_str(), "off");
        assert_eq!(TunnelStatus::Active.as_str(), "active");
    }
}
