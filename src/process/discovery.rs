//! Deciding which host to drive: attach to a running one or start a new one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

use crate::config::HostSettings;

/// Configured preference for obtaining a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartupAction {
    AttachToExisting,
    #[default]
    StartDefault,
    StartUserSpecified,
}

/// Process discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("No running '{name}' process to attach to")]
    NoRunningHost { name: String },

    #[error("Several '{name}' processes are running ({pids:?}); cannot choose one to attach to")]
    MultipleHosts { name: String, pids: Vec<u32> },

    #[error("A '{name}' process is already running (pid {pid}); attach to it or stop it first")]
    AlreadyRunning { name: String, pid: u32 },

    #[error("Host executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    #[error("Could not locate the '{name}' executable on PATH")]
    ExecutableNotResolved { name: String },

    #[error("No host executable configured for a user-specified startup")]
    NoExecutableConfigured,

    #[error("Host working directory not found: {}", .0.display())]
    WorkingDirectoryNotFound(PathBuf),
}

/// Explicit choices from the command line; they win over configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupRequest {
    /// `Some(true)` forces attaching, `Some(false)` forbids it
    pub attach: Option<bool>,
    pub executable: Option<PathBuf>,
}

/// How to start a new host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            working_directory: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    Attach { pid: u32 },
    Create(LaunchSpec),
}

/// Finds host processes and executables.
pub trait ProcessFinder {
    /// Pids of running processes called `name`, excluding the current one.
    fn find_by_name(&self, name: &str) -> Vec<u32>;

    fn locate_executable(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Scans `/proc/<pid>/comm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcFinder;

/// The kernel truncates process names to this many bytes.
const COMM_LEN: usize = 15;

impl ProcessFinder for ProcFinder {
    fn find_by_name(&self, name: &str) -> Vec<u32> {
        let own_pid = std::process::id();
        let wanted = truncate_comm(name);

        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };

        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_string_lossy().parse::<u32>().ok())
            .filter(|&pid| pid != own_pid)
            .filter(|pid| {
                fs::read_to_string(format!("/proc/{pid}/comm"))
                    .is_ok_and(|comm| comm.trim_end() == wanted)
            })
            .collect();
        pids.sort_unstable();
        pids
    }
}

fn truncate_comm(name: &str) -> &str {
    if name.len() <= COMM_LEN {
        return name;
    }
    let mut end = COMM_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Resolve exactly one host to attach to or one executable to start.
///
/// Precedence: an explicit attach request, then an explicit executable, then
/// the configured startup action. An explicit "do not attach" turns an
/// `attach-to-existing` preference into `start-default`.
pub fn resolve_target(
    request: &StartupRequest,
    settings: &HostSettings,
    finder: &dyn ProcessFinder,
) -> Result<HostTarget, DiscoveryError> {
    let action = if request.attach == Some(true) {
        StartupAction::AttachToExisting
    } else if request.executable.is_some() {
        StartupAction::StartUserSpecified
    } else if request.attach == Some(false) && settings.startup == StartupAction::AttachToExisting
    {
        StartupAction::StartDefault
    } else {
        settings.startup
    };
    debug!(?action, "Resolving host target");

    let name = settings.process_name.as_str();
    if action == StartupAction::AttachToExisting {
        let pids = finder.find_by_name(name);
        return match pids.as_slice() {
            [] => Err(DiscoveryError::NoRunningHost {
                name: name.to_string(),
            }),
            [pid] => Ok(HostTarget::Attach { pid: *pid }),
            _ => Err(DiscoveryError::MultipleHosts {
                name: name.to_string(),
                pids,
            }),
        };
    }

    if let Some(&pid) = finder.find_by_name(name).first() {
        return Err(DiscoveryError::AlreadyRunning {
            name: name.to_string(),
            pid,
        });
    }

    let executable = match action {
        StartupAction::StartUserSpecified => {
            let executable = request
                .executable
                .clone()
                .or_else(|| settings.executable.clone())
                .ok_or(DiscoveryError::NoExecutableConfigured)?;
            if !executable.is_file() {
                return Err(DiscoveryError::ExecutableNotFound(executable));
            }
            executable
        }
        _ => finder
            .locate_executable(name)
            .ok_or_else(|| DiscoveryError::ExecutableNotResolved {
                name: name.to_string(),
            })?,
    };

    if let Some(dir) = &settings.working_directory {
        if !dir.is_dir() {
            return Err(DiscoveryError::WorkingDirectoryNotFound(dir.clone()));
        }
    }

    Ok(HostTarget::Create(LaunchSpec {
        executable,
        arguments: settings.arguments.clone(),
        working_directory: settings.working_directory.clone(),
    }))
}
