use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

/// Checks whether an access-point process is alive by cross-referencing
/// its PID files with `/proc`.
#[derive(Debug, Clone)]
pub struct WifiProbe {
    pid_files: Vec<PathBuf>,
    proc_root: PathBuf,
}

impl WifiProbe {
    pub fn new(pid_files: Vec<PathBuf>, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            pid_files,
            proc_root: proc_root.into(),
        }
    }

    /// True when any band's PID file names a running process.
    pub fn is_alive(&self) -> bool {
        self.pid_files
            .iter()
            .any(|pid_file| pid_alive(pid_file, &self.proc_root))
    }
}

fn pid_alive(pid_file: &Path, proc_root: &Path) -> bool {
    let Ok(content) = fs::read_to_string(pid_file) else {
        return false;
    };
    match content.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => proc_root.join(pid.to_string()).exists(),
        _ => {
            debug!("Ignoring malformed PID file {}", pid_file.display());
            false
        }
    }
}

/// Emits liveness only on transitions.
#[derive(Debug, Default)]
pub struct WifiLatch {
    last: Option<bool>,
}

impl WifiLatch {
    pub fn observe(&mut self, alive: bool) -> Option<bool> {
        if self.last == Some(alive) {
            return None;
        }
        self.last = Some(alive);
        Some(alive)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
