//! Observing a host process from the outside.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{HostError, Result};

/// Handle of a host's main window: the path of its command inbox socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowHandle(PathBuf);

impl WindowHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Where the host with `pid` creates its main window.
pub fn window_path(runtime_dir: &Path, pid: u32) -> PathBuf {
    runtime_dir.join(format!("hostdrive-host.{pid}.window"))
}

/// What the supervisor needs to know about a running host.
pub trait HostInspector: Send + Sync {
    /// The host's top-level window, once it has created one.
    fn main_window(&self, pid: u32) -> Option<WindowHandle>;

    /// Whether the host is waiting for input rather than busy.
    fn is_input_idle(&self, pid: u32) -> bool;

    /// Files mapped into the host's address space.
    fn loaded_modules(&self, pid: u32) -> Result<Vec<PathBuf>>;

    /// Whether `module` is among the loaded modules, ignoring case.
    fn has_module(&self, pid: u32, module: &Path) -> Result<bool> {
        let wanted = module
            .canonicalize()
            .unwrap_or_else(|_| module.to_path_buf())
            .to_string_lossy()
            .to_lowercase();
        Ok(self
            .loaded_modules(pid)?
            .iter()
            .any(|loaded| loaded.to_string_lossy().to_lowercase() == wanted))
    }
}

/// Reads host state from `/proc`.
#[derive(Debug, Clone)]
pub struct ProcInspector {
    runtime_dir: PathBuf,
}

impl ProcInspector {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }
}

impl HostInspector for ProcInspector {
    fn main_window(&self, pid: u32) -> Option<WindowHandle> {
        let path = window_path(&self.runtime_dir, pid);
        path.exists().then(|| WindowHandle::new(path))
    }

    fn is_input_idle(&self, pid: u32) -> bool {
        fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| process_state(&stat))
            .is_some_and(|state| state == 'S')
    }

    fn loaded_modules(&self, pid: u32) -> Result<Vec<PathBuf>> {
        let maps = fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HostError::ProcessExited
            } else {
                HostError::Io(e)
            }
        })?;
        Ok(mapped_files(&maps))
    }
}

/// The state letter of a `/proc/<pid>/stat` line.
///
/// The command name may contain spaces and parentheses, so the state is
/// read after the last `)`.
fn process_state(stat: &str) -> Option<char> {
    let after_name = &stat[stat.rfind(')')? + 1..];
    after_name.trim_start().chars().next()
}

/// Distinct file paths of the file-backed mappings in a `maps` listing.
fn mapped_files(maps: &str) -> Vec<PathBuf> {
    maps.lines()
        // Address, permissions, offset, device and inode never contain '/'.
        .filter_map(|line| line.find('/').map(|start| &line[start..]))
        .map(|path| path.strip_suffix(" (deleted)").unwrap_or(path))
        .map(PathBuf::from)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
