//! The external host process: starting or adopting it, watching it, ending it.

pub mod discovery;
pub mod inspect;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::channel::port::RUNTIME_DIR_ENV;
use crate::error::{HostError, Result};
use discovery::LaunchSpec;

const ATTACHED_EXIT_POLL: Duration = Duration::from_millis(50);

/// Check if a process with the given PID is alive
///
/// Uses `nix::sys::signal::kill` with the null signal, which distinguishes
/// a missing process (`ESRCH`) from one we may not signal (`EPERM`).
pub fn is_process_alive(pid: u32) -> bool {
    let pid_i32 = match i32::try_from(pid) {
        Ok(v) => v,
        Err(_) => return false,
    };

    match kill(Pid::from_raw(pid_i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    }
}

/// A host process the supervisor either created or attached to.
///
/// Only a created process is ever killed.
#[derive(Debug)]
pub struct HostProcess {
    pid: u32,
    child: Option<Child>,
}

impl HostProcess {
    /// Start a new host. Its output is forwarded to the log line by line.
    pub fn spawn(spec: &LaunchSpec, runtime_dir: &Path) -> Result<Self> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.arguments)
            .env(RUNTIME_DIR_ENV, runtime_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            HostError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to start host {}: {e}", spec.executable.display()),
            ))
        })?;
        let pid = child.id();
        info!(pid, executable = %spec.executable.display(), "Started host process");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, pid, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, pid, true);
        }

        Ok(Self {
            pid,
            child: Some(child),
        })
    }

    /// Adopt a running host without taking ownership of its lifetime.
    pub fn attach(pid: u32) -> Result<Self> {
        if !is_process_alive(pid) {
            return Err(HostError::ProcessExited);
        }
        info!(pid, "Attached to host process");
        Ok(Self {
            pid,
            child: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.child.is_none()
    }

    pub fn has_exited(&mut self) -> bool {
        match &mut self.child {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    log_exit(self.pid, status);
                    true
                }
                Ok(None) => false,
                Err(_) => !is_process_alive(self.pid),
            },
            None => !is_process_alive(self.pid),
        }
    }

    /// Fail with [`HostError::ProcessExited`] if the host is gone.
    pub fn ensure_running(&mut self) -> Result<()> {
        if self.has_exited() {
            return Err(HostError::ProcessExited);
        }
        Ok(())
    }

    /// Wait up to `timeout` for the host to exit. Returns whether it did.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        match &mut self.child {
            Some(child) => match child.wait_timeout(timeout) {
                Ok(Some(status)) => {
                    log_exit(self.pid, status);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "Failed to wait for host process");
                    false
                }
            },
            None => {
                let deadline = Instant::now() + timeout;
                loop {
                    if !is_process_alive(self.pid) {
                        return true;
                    }
                    if Instant::now() >= deadline {
                        return false;
                    }
                    thread::sleep(ATTACHED_EXIT_POLL);
                }
            }
        }
    }

    /// Forcibly terminate a created host and reap it. No-op when attached.
    pub fn kill(&mut self) {
        let Some(child) = &mut self.child else {
            debug!(pid = self.pid, "Not terminating an attached host");
            return;
        };
        warn!(pid = self.pid, "Terminating host process");
        // The process may have exited on its own in the meantime.
        let _ = child.kill();
        match child.wait() {
            Ok(status) => log_exit(self.pid, status),
            Err(e) => warn!(pid = self.pid, error = %e, "Failed to reap host process"),
        }
    }
}

fn log_exit(pid: u32, status: ExitStatus) {
    match status.code() {
        Some(code) => info!(pid, code, "Host process exited"),
        None => info!(pid, "Host process was terminated by a signal"),
    }
}

fn forward_output<R: Read + Send + 'static>(stream: R, pid: u32, is_stderr: bool) {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else {
                break;
            };
            if is_stderr {
                warn!(pid, "host: {line}");
            } else {
                info!(pid, "host: {line}");
            }
        }
    });
}
