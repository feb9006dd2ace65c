//! Lifecycle of supervised dev processes.
//!
//! The manager owns the name → process map. Each freshly spawned process
//! runs two background tasks: a blocking reader that pumps the PTY master
//! into the log file, the virtual terminal and the log buffer, and a
//! waiter that observes child exit and finishes the teardown sequence.
//! Reattached survivors instead run a single tail task that follows the
//! session log file on disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::Signal;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::logbuf::{LogBuffer, LogSubscription, DEFAULT_MAX_LINES};
use crate::process::pty::{
    signal_group, spawn_with_pty, PtyMaster, DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS,
};
use crate::process::sanitize::sanitize_for_log;
use crate::process::store::{self, SessionDescriptor};
use crate::process::tunnel::{self, TunnelHandle, TunnelStatus};
use crate::process::vterm::VtermScreen;
use crate::{Error, Result};

/// SIGTERM grace before a stop escalates to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Grace period when stopping a reattached process we cannot wait on.
const RECONNECTED_STOP_GRACE: Duration = Duration::from_secs(1);

/// Pause between stop and start during a restart, so the port frees up.
const RESTART_DELAY: Duration = Duration::from_millis(200);

/// Drain window between child exit and reader shutdown.
const EXIT_DRAIN_DELAY: Duration = Duration::from_millis(200);

/// Poll interval of the log-file tail used for reattached sessions.
const TAIL_POLL: Duration = Duration::from_millis(100);

/// Ceiling on waiting for a tunnel URL before giving up.
const TUNNEL_URL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Stopped,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Error => "error",
        }
    }
}

/// A process under supervision.
///
/// Spawned-this-run processes carry a PTY master and a virtual terminal;
/// reattached survivors carry neither and are observable only through
/// their log buffer. `done` fires when the exit waiter has finished;
/// `tail_stop` cancels the reader or tail task.
pub struct ManagedProcess {
    pub info: SessionDescriptor,
    pub log: Arc<LogBuffer>,
    pub vterm: Option<Arc<VtermScreen>>,
    status: StdRwLock<ProcessStatus>,
    pty: StdMutex<Option<PtyMaster>>,
    tunnel: StdMutex<Option<Arc<TunnelHandle>>>,
    spawned: bool,
    done: CancellationToken,
    tail_stop: CancellationToken,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("info", &self.info)
            .field("status", &self.status())
            .finish()
    }
}

impl ManagedProcess {
    pub fn status(&self) -> ProcessStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// True when this supervisor spawned the child and still holds its
    /// PTY; reattached survivors are not interactive.
    pub fn is_interactive(&self) -> bool {
        self.pty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn tunnel(&self) -> Option<Arc<TunnelHandle>> {
        self.tunnel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Snapshot of the scrollback, partial line included.
    pub fn content(&self) -> String {
        self.log.content()
    }

    /// Last `n` completed scrollback lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.log.tail(n)
    }

    pub fn lines(&self) -> Vec<String> {
        self.log.lines()
    }

    /// Live feed of new scrollback lines.
    pub fn subscribe(&self) -> LogSubscription {
        self.log.subscribe()
    }

    fn set_status(&self, status: ProcessStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn write_input(&self, data: &[u8]) -> Result<()> {
        let pty = self.pty.lock().unwrap_or_else(|e| e.into_inner());
        let Some(master) = pty.as_ref() else {
            return Err(Error::NoPty(self.info.name.clone()));
        };
        master.write_all(data)?;
        Ok(())
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        {
            let pty = self.pty.lock().unwrap_or_else(|e| e.into_inner());
            let Some(master) = pty.as_ref() else {
                return Err(Error::NoPty(self.info.name.clone()));
            };
            master.resize(rows, cols)?;
        }
        if let Some(vterm) = &self.vterm {
            vterm.resize(rows, cols);
        }
        Ok(())
    }

    fn take_tunnel(&self) -> Option<Arc<TunnelHandle>> {
        self.tunnel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Supervisor for all dev processes of one dashboard instance.
pub struct ProcessManager {
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    sessions_dir: PathBuf,
    logs_dir: PathBuf,
}

impl ProcessManager {
    pub fn new(sessions_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            sessions_dir: sessions_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    /// Path of the raw PTY capture for a session.
    pub fn log_file_path(&self, name: &str) -> PathBuf {
        self.logs_dir.join(format!("{name}.log"))
    }

    /// Spawns a new process described by `info` and registers it.
    ///
    /// The child gets a fresh PTY and its own process group; its PID and
    /// start time are recorded in the persisted descriptor. Fails without
    /// leaving state behind when the name is taken or the spawn fails.
    ///
    /// The map lock is held only to check for and insert the entry; the
    /// file and PTY work happens outside it.
    pub async fn start(&self, mut info: SessionDescriptor) -> Result<Arc<ManagedProcess>> {
        if self.processes.read().await.contains_key(&info.name) {
            return Err(Error::AlreadyRunning(info.name));
        }

        std::fs::create_dir_all(&self.logs_dir)?;
        let log_path = self.log_file_path(&info.name);
        let log_file = File::create(&log_path)?;

        let mut cmd = Command::new(&info.command);
        cmd.args(&info.args);
        if !info.work_dir.is_empty() {
            cmd.current_dir(&info.work_dir);
        }
        for entry in &info.extra_env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }

        let (mut child, master) =
            match spawn_with_pty(cmd, DEFAULT_PTY_ROWS, DEFAULT_PTY_COLS) {
                Ok(pair) => pair,
                Err(source) => {
                    let _ = std::fs::remove_file(&log_path);
                    return Err(Error::Spawn {
                        name: info.name,
                        source,
                    });
                }
            };

        info.pid = child.id() as i32;
        info.started_at = Utc::now().timestamp();

        let reader = match master.reader() {
            Ok(reader) => reader,
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(&log_path);
                return Err(Error::Spawn {
                    name: info.name,
                    source,
                });
            }
        };

        let log = Arc::new(LogBuffer::new(DEFAULT_MAX_LINES));
        let vterm = Arc::new(VtermScreen::new(DEFAULT_PTY_ROWS, DEFAULT_PTY_COLS));
        let tail_stop = CancellationToken::new();

        let process = Arc::new(ManagedProcess {
            info: info.clone(),
            log: log.clone(),
            vterm: Some(vterm.clone()),
            status: StdRwLock::new(ProcessStatus::Running),
            pty: StdMutex::new(Some(master)),
            tunnel: StdMutex::new(None),
            spawned: true,
            done: CancellationToken::new(),
            tail_stop: tail_stop.clone(),
        });

        {
            let mut processes = self.processes.write().await;
            if processes.contains_key(&info.name) {
                // Lost a race to a concurrent start with the same name.
                // Tear our child down; the winner owns the log path and
                // will persist its own descriptor.
                drop(processes);
                signal_group(info.pid, Signal::SIGKILL);
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::AlreadyRunning(info.name));
            }
            processes.insert(info.name.clone(), process.clone());
        }

        if let Err(err) = store::save_session(&self.sessions_dir, &info) {
            warn!(name = %info.name, error = %err, "failed to persist session descriptor");
        }

        spawn_pty_reader(reader, log_file, vterm, log, tail_stop);
        spawn_exit_waiter(process.clone(), child);

        info!(name = %process.info.name, pid = process.info.pid, "process started");
        Ok(process)
    }

    /// Stops a process: SIGTERM to its group, SIGKILL after the grace
    /// period, then removes it from the map and deletes its descriptor.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let process = self.lookup(name).await?;

        if let Some(tunnel) = process.take_tunnel() {
            tunnel::stop(&tunnel).await;
        }

        if process.status() == ProcessStatus::Running && process.spawned {
            let pid = process.info.pid;
            signal_group(pid, Signal::SIGTERM);

            let graceful = tokio::time::timeout(STOP_GRACE, process.done.cancelled())
                .await
                .is_ok();
            if !graceful {
                warn!(name, pid, "no exit within grace period, killing process group");
                signal_group(pid, Signal::SIGKILL);
                process.done.cancelled().await;
            }
        }

        if !process.spawned {
            process.tail_stop.cancel();
        }

        process.set_status(ProcessStatus::Stopped);
        self.processes.write().await.remove(name);
        store::remove_session(&self.sessions_dir, name)?;
        info!(name, "process stopped");
        Ok(())
    }

    /// Stops a process and starts it again with the same descriptor.
    pub async fn restart(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        let info = self.lookup(name).await?.info.clone();
        self.stop(name).await?;
        tokio::time::sleep(RESTART_DELAY).await;
        self.start(info).await
    }

    /// Startup reconciliation: scans persisted descriptors, discards the
    /// dead ones, and reattaches to every session whose PID is alive by
    /// replaying its log file and tailing it for new output.
    pub async fn reconnect(&self) -> Vec<Arc<ManagedProcess>> {
        let sessions = match store::load_all_sessions(&self.sessions_dir) {
            Ok(sessions) => sessions,
            Err(err) => {
                warn!(error = %err, "failed to scan sessions directory");
                return Vec::new();
            }
        };

        let mut reattached = Vec::new();
        for info in sessions {
            if !store::is_process_alive(info.pid) {
                debug!(name = %info.name, pid = info.pid, "discarding dead session");
                let _ = store::remove_session(&self.sessions_dir, &info.name);
                continue;
            }

            let log = Arc::new(LogBuffer::new(DEFAULT_MAX_LINES));
            let tail_stop = CancellationToken::new();
            let log_path = self.log_file_path(&info.name);

            let mut offset = 0u64;
            if let Ok(data) = std::fs::read(&log_path) {
                if !data.is_empty() {
                    log.write(&sanitize_for_log(&data));
                    log.flush();
                    offset = data.len() as u64;
                }
            }

            spawn_log_tailer(log_path, log.clone(), offset, tail_stop.clone());

            let process = Arc::new(ManagedProcess {
                info: info.clone(),
                log,
                vterm: None,
                status: StdRwLock::new(ProcessStatus::Running),
                pty: StdMutex::new(None),
                tunnel: StdMutex::new(None),
                spawned: false,
                done: CancellationToken::new(),
                tail_stop,
            });

            self.processes
                .write()
                .await
                .insert(info.name.clone(), process.clone());
            info!(name = %info.name, pid = info.pid, "reattached to running session");
            reattached.push(process);
        }
        reattached
    }

    /// Stops a reattached process we hold no child handle for. Delegates
    /// to [`ProcessManager::stop`] when the process was spawned this run.
    pub async fn stop_reconnected(&self, name: &str) -> Result<()> {
        let process = self.lookup(name).await?;

        if process.spawned {
            return self.stop(name).await;
        }

        process.tail_stop.cancel();

        let pid = process.info.pid;
        signal_group(pid, Signal::SIGTERM);
        tokio::time::sleep(RECONNECTED_STOP_GRACE).await;
        if store::is_process_alive(pid) {
            warn!(name, pid, "still alive after SIGTERM, killing process group");
            signal_group(pid, Signal::SIGKILL);
        }

        self.processes.write().await.remove(name);
        store::remove_session(&self.sessions_dir, name)?;
        info!(name, "reattached process stopped");
        Ok(())
    }

    /// Forwards raw input bytes (keystrokes) to the child's terminal.
    pub async fn write_input(&self, name: &str, data: &[u8]) -> Result<()> {
        self.lookup(name).await?.write_input(data)
    }

    /// Resizes the PTY and the virtual terminal together.
    pub async fn resize_pty(&self, name: &str, rows: u16, cols: u16) -> Result<()> {
        self.lookup(name).await?.resize(rows, cols)
    }

    /// Opens a tunnel for a running process. At most one tunnel per
    /// process; the handle is recorded on the managed process.
    pub async fn start_tunnel(&self, name: &str) -> Result<Arc<TunnelHandle>> {
        let process = self.lookup(name).await?;
        if process.status() != ProcessStatus::Running {
            return Err(Error::NotRunning(name.to_string()));
        }

        let mut guard = process.tunnel.lock().unwrap_or_else(|e| e.into_inner());
        if guard
            .as_ref()
            .is_some_and(|t| t.status() != TunnelStatus::Off)
        {
            return Err(Error::TunnelActive(name.to_string()));
        }

        let handle = tunnel::start(process.info.port)?;
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Waits for the tunnel URL with a 30 second ceiling. On timeout or
    /// premature tunnel exit the tunnel is torn down before the error is
    /// returned.
    pub async fn tunnel_url(&self, name: &str) -> Result<String> {
        let process = self.lookup(name).await?;
        let handle = process
            .tunnel()
            .ok_or_else(|| Error::NoTunnel(name.to_string()))?;

        match handle.wait_for_url(TUNNEL_URL_TIMEOUT).await {
            Ok(url) => Ok(url),
            Err(err) => {
                tunnel::stop(&handle).await;
                process.take_tunnel();
                Err(err)
            }
        }
    }

    /// Stops the tunnel attached to a process, if any.
    pub async fn stop_tunnel(&self, name: &str) -> Result<()> {
        let process = self.lookup(name).await?;
        let handle = process
            .take_tunnel()
            .ok_or_else(|| Error::NoTunnel(name.to_string()))?;
        tunnel::stop(&handle).await;
        Ok(())
    }

    /// Snapshot of every managed process.
    pub async fn list(&self) -> Vec<Arc<ManagedProcess>> {
        self.processes.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(name).cloned()
    }

    async fn lookup(&self, name: &str) -> Result<Arc<ManagedProcess>> {
        self.processes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

/// Pumps the PTY master into the triple sink: raw bytes to the log file
/// and the virtual terminal, sanitized bytes to the log buffer. Exits on
/// read error or EOF (the child's slave side closed) or once `stop`
/// fires. Sink failures are swallowed; the stream must keep draining.
fn spawn_pty_reader(
    mut reader: File,
    mut log_file: File,
    vterm: Arc<VtermScreen>,
    log: Arc<LogBuffer>,
    stop: CancellationToken,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    if let Err(err) = log_file.write_all(chunk) {
                        debug!(error = %err, "log file write failed");
                    }
                    vterm.write(chunk);
                    log.write(&sanitize_for_log(chunk));
                }
                Err(_) => break,
            }
            if stop.is_cancelled() {
                break;
            }
        }
        debug!("pty reader finished");
    });
}

/// Observes child exit and runs the teardown sequence: drain window for
/// the reader, cancel the reader, release the PTY master, update status,
/// append the diagnostic line, stop any attached tunnel, then fire
/// `done`.
fn spawn_exit_waiter(process: Arc<ManagedProcess>, mut child: Child) {
    tokio::spawn(async move {
        let exit = tokio::task::spawn_blocking(move || child.wait()).await;

        tokio::time::sleep(EXIT_DRAIN_DELAY).await;
        process.tail_stop.cancel();
        process
            .pty
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match exit {
            Ok(Ok(status)) if status.success() => {
                process.set_status(ProcessStatus::Stopped);
                process.log.write(b"\n[process exited normally]\n");
            }
            Ok(Ok(status)) => {
                process.set_status(ProcessStatus::Error);
                process
                    .log
                    .write(format!("\n[process exited with error: {status}]\n").as_bytes());
            }
            Ok(Err(err)) => {
                process.set_status(ProcessStatus::Error);
                process
                    .log
                    .write(format!("\n[process exited with error: {err}]\n").as_bytes());
            }
            Err(err) => {
                process.set_status(ProcessStatus::Error);
                process
                    .log
                    .write(format!("\n[process exited with error: {err}]\n").as_bytes());
            }
        }
        process.log.flush();

        if let Some(tunnel) = process.take_tunnel() {
            tunnel::stop(&tunnel).await;
        }

        info!(
            name = %process.info.name,
            status = process.status().as_str(),
            "process exited"
        );
        process.done.cancel();
    });
}

/// Follows the session log file from `offset`, sanitizing new bytes into
/// the log buffer. Used for reattached sessions only. Polls for growth;
/// when `stop` fires, a final drain picks up bytes written between the
/// last poll and the signal.
fn spawn_log_tailer(path: PathBuf, log: Arc<LogBuffer>, offset: u64, stop: CancellationToken) {
    tokio::spawn(async move {
        let Some(mut file) = open_with_retry(&path, &stop).await else {
            return;
        };

        if offset > 0 && file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            return;
        }

        let mut buf = [0u8; 4096];
        loop {
            if stop.is_cancelled() {
                while let Ok(n) = file.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    log.write(&sanitize_for_log(&buf[..n]));
                }
                debug!(path = %path.display(), "log tail finished");
                return;
            }

            match file.read(&mut buf).await {
                Ok(0) => tokio::time::sleep(TAIL_POLL).await,
                Ok(n) => {
                    log.write(&sanitize_for_log(&buf[..n]));
                }
                Err(_) => return,
            }
        }
    });
}

/// The log file may not exist yet when tailing begins; retry for a few
/// seconds before giving up.
async fn open_with_retry(path: &Path, stop: &CancellationToken) -> Option<tokio::fs::File> {
    let mut file = tokio::fs::File::open(path).await.ok();
    let mut attempts = 0;
    while file.is_none() && attempts < 50 && !stop.is_cancelled() {
        tokio::time::sleep(TAIL_POLL).await;
        file = tokio::fs::File::open(path).await.ok();
        attempts += 1;
    }
    file
}
