//! devhelm-core - supervision core for the devhelm dashboard
//!
//! Spawns dev processes on a pseudo-terminal in their own process group,
//! captures their output into a per-session log file, a bounded in-memory
//! line ring and a virtual terminal screen, and persists a JSON descriptor
//! per session so that children survive dashboard exits and can be
//! reattached on the next run.

use std::io;

use thiserror::Error;

pub mod config;
pub mod process;

pub use process::logbuf::{LogBuffer, LogSubscription, DEFAULT_MAX_LINES};
pub use process::manager::{ManagedProcess, ProcessManager, ProcessStatus};
pub use process::store::{is_process_alive, SessionDescriptor};
pub use process::tunnel::{cloudflared_available, TunnelHandle, TunnelStatus};
pub use process::vterm::VtermScreen;

/// Errors surfaced synchronously by supervisor operations. Asynchronous
/// failures (a child dying, a sink write failing) never reach the caller
/// through this type; they show up as status changes and diagnostic log
/// lines instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("process {0:?} already running")]
    AlreadyRunning(String),

    #[error("process {0:?} not found")]
    NotFound(String),

    #[error("process {0:?} is not running")]
    NotRunning(String),

    #[error("process {0:?} has no PTY")]
    NoPty(String),

    #[error("failed to start {name:?}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("tunnel already active for {0:?}")]
    TunnelActive(String),

    #[error("no tunnel for {0:?}")]
    NoTunnel(String),

    #[error("tunnel exited before producing a URL")]
    TunnelExited,

    #[error("timed out waiting for tunnel URL")]
    TunnelUrlTimeout,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
