//! Process-wide registry of in-flight launched children, so a global cancel
//! can terminate every tracked subprocess without threading handles through
//! every caller.
//!
//! Tracks pids rather than owned [`tokio::process::Child`] handles: the
//! launcher needs to `wait_with_output` the child itself, which consumes it,
//! so the registry can't also hold it. Termination goes through `kill(2)`
//! directly instead.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Default)]
pub struct ProcessRegistry {
    pids: Mutex<HashSet<u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32) {
        self.pids.lock().expect("process registry mutex poisoned").insert(pid);
    }

    pub fn deregister(&self, pid: u32) {
        self.pids.lock().expect("process registry mutex poisoned").remove(&pid);
    }

    pub fn tracked_count(&self) -> usize {
        self.pids.lock().expect("process registry mutex poisoned").len()
    }

    /// Send SIGTERM to every tracked child and clear the registry.
    #[cfg(unix)]
    pub fn terminate_all(&self) {
        let mut pids = self.pids.lock().expect("process registry mutex poisoned");
        for pid in pids.iter() {
            unsafe {
                libc::kill(*pid as libc::pid_t, libc::SIGTERM);
            }
        }
        pids.clear();
    }

    #[cfg(not(unix))]
    pub fn terminate_all(&self) {
        self.pids.lock().expect("process registry mutex poisoned").clear();
    }
}
