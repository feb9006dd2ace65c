//! PTY plumbing and process-group control.
//!
//! Children are spawned with a fresh PTY pair as their stdio and a new
//! process group, but stay in the supervisor's session: the slave never
//! becomes their controlling terminal. Closing the master therefore does
//! not deliver SIGHUP, which is what lets dev servers outlive the
//! dashboard. `isatty` on the slave still reports true, so colors and
//! interactive prompts behave normally.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::{getpgid, Pid};

pub const DEFAULT_PTY_ROWS: u16 = 24;
pub const DEFAULT_PTY_COLS: u16 = 80;

nix::ioctl_write_ptr_bad!(tiocswinsz, nix::libc::TIOCSWINSZ, Winsize);

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Master side of a pseudo-terminal pair: the supervisor reads child
/// output from it and writes keystrokes into it.
pub struct PtyMaster {
    file: File,
}

impl PtyMaster {
    /// Duplicates the master for the blocking read loop; the original
    /// stays with the managed process for input and resizing.
    pub fn reader(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Forwards raw input bytes to the child's terminal.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut file = &self.file;
        file.write_all(data)
    }

    /// Updates the terminal window size; the child sees SIGWINCH.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let ws = winsize(rows, cols);
        unsafe { tiocswinsz(self.file.as_raw_fd(), &ws) }.map_err(io::Error::from)?;
        Ok(())
    }
}

/// Opens a PTY of the given geometry and spawns `cmd` with the slave as
/// stdin, stdout and stderr, in a new process group.
///
/// Takes the command by value: the slave descriptors live inside its
/// stdio configuration, and dropping the command here is what closes the
/// parent's copies so that master reads reach EOF once the child exits.
pub fn spawn_with_pty(mut cmd: Command, rows: u16, cols: u16) -> io::Result<(Child, PtyMaster)> {
    let ws = winsize(rows, cols);
    let pty = openpty(Some(&ws), None).map_err(io::Error::from)?;

    cmd.stdin(Stdio::from(pty.slave.try_clone()?))
        .stdout(Stdio::from(pty.slave.try_clone()?))
        .stderr(Stdio::from(pty.slave))
        .process_group(0);

    let child = cmd.spawn()?;
    drop(cmd);

    Ok((
        child,
        PtyMaster {
            file: File::from(pty.master),
        },
    ))
}

/// Delivers a signal to the process group led by `pid`, falling back to
/// the PID alone when the group lookup fails.
pub(crate) fn signal_group(pid: i32, sig: Signal) {
    if pid <= 0 {
        return;
    }
    let pid = Pid::from_raw(pid);
    match getpgid(Some(pid)) {
        Ok(pgid) => {
            let _ = killpg(pgid, sig);
        }
        Err(_) => {
            let _ = signal::kill(pid, sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn spawned_child_sees_a_tty() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "test -t 1 && echo tty || echo notty"]);
        let (mut child, master) = spawn_with_pty(cmd, 24, 80).unwrap();

        let mut reader = master.reader().unwrap();
        let mut out = Vec::new();
        // EOF arrives once the child exits and its slave fds close.
        let _ = reader.read_to_end(&mut out);
        let _ = child.wait();

        assert!(String::from_utf8_lossy(&out).contains("tty"));
    }

    #[test]
    fn child_runs_in_its_own_process_group() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 1"]);
        let (mut child, _master) = spawn_with_pty(cmd, 24, 80).unwrap();

        let pid = Pid::from_raw(child.id() as i32);
        let pgid = getpgid(Some(pid)).unwrap();
        assert_eq!(pgid, pid);
        assert_ne!(pgid, getpgid(None).unwrap());

        signal_group(child.id() as i32, Signal::SIGKILL);
        let _ = child.wait();
    }

    #[test]
    fn resize_is_accepted() {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 1"]);
        let (mut child, master) = spawn_with_pty(cmd, 24, 80).unwrap();

        master.resize(40, 120).unwrap();

        signal_group(child.id() as i32, Signal::SIGKILL);
        let _ = child.wait();
    }
}
