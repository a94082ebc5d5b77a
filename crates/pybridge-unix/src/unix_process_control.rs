use async_trait::async_trait;
use pybridge_core::{ProcessControl, ProcessId, TerminationResult};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::sync::Mutex;
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
    use tracing::{debug, info, warn};

    /// Process-group based tree control. Every child is spawned as the leader of
    /// its own group so one `killpg` reaches the whole tree.
    pub struct UnixProcessControl {
        system: Mutex<System>,
    }

    impl Default for UnixProcessControl {
        fn default() -> Self {
            Self::new()
        }
    }

    impl UnixProcessControl {
        pub fn new() -> Self {
            debug!("Initializing Unix process control");
            Self {
                system: Mutex::new(System::new()),
            }
        }

        fn signal_one(pid: ProcessId, sig: Signal) -> TerminationResult {
            match signal::kill(NixPid::from_raw(pid as i32), sig) {
                Ok(()) => TerminationResult::Success,
                Err(Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(Errno::EPERM) => TerminationResult::AccessDenied,
                Err(e) => TerminationResult::Failed(format!("{sig} failed: {e}")),
            }
        }

        fn signal_group(pgid: ProcessId, sig: Signal) -> TerminationResult {
            match signal::killpg(NixPid::from_raw(pgid as i32), sig) {
                Ok(()) => TerminationResult::Success,
                Err(Errno::ESRCH) => TerminationResult::ProcessNotFound,
                Err(Errno::EPERM) => TerminationResult::AccessDenied,
                Err(e) => TerminationResult::Failed(format!("{sig} to group failed: {e}")),
            }
        }

        /// Descendants of `parent_pid`, grandchildren before their parents
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                if process.parent().map(|ppid| ppid.as_u32()) == Some(parent_pid) {
                    let child_pid = pid.as_u32();
                    if result.contains(&child_pid) {
                        continue;
                    }
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }

    #[async_trait]
    impl ProcessControl for UnixProcessControl {
        fn platform_name(&self) -> &'static str {
            "Unix"
        }

        fn prepare(&self, command: &mut tokio::process::Command) {
            command.process_group(0);
        }

        fn is_alive(&self, pid: ProcessId) -> bool {
            signal::kill(NixPid::from_raw(pid as i32), None).is_ok()
        }

        async fn find_child_processes(&self, pid: ProcessId) -> Vec<ProcessId> {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing(),
            );
            let mut children = Vec::new();
            Self::find_children_recursive(&system, pid, &mut children);
            children
        }

        async fn terminate_tree(&self, root_pid: ProcessId) -> TerminationResult {
            // Collect descendants before the group dies and they get reparented.
            let children = self.find_child_processes(root_pid).await;
            info!(pid = root_pid, children = children.len(), "Terminating process tree");

            match Self::signal_group(root_pid, Signal::SIGKILL) {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => warn!(pid = root_pid, ?result, "SIGKILL to process group failed"),
            }

            // Descendants that left the group (setsid, daemonizing shells)
            for child_pid in &children {
                match Self::signal_one(*child_pid, Signal::SIGKILL) {
                    TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                    result => warn!(pid = child_pid, ?result, "Failed to kill child process"),
                }
            }

            match Self::signal_one(root_pid, Signal::SIGKILL) {
                TerminationResult::ProcessNotFound => {
                    debug!(pid = root_pid, "Root process already gone");
                    TerminationResult::Success
                }
                result => result,
            }
        }

        fn emergency_kill(&self, pid: ProcessId) {
            if !Self::signal_group(pid, Signal::SIGKILL).is_gone() {
                let _ = Self::signal_one(pid, Signal::SIGKILL);
            }
        }
    }

}

#[cfg(unix)]
pub use unix_impl::UnixProcessControl;

// Stub for non-Unix hosts so the workspace still builds there
#[cfg(not(unix))]
#[derive(Default)]
pub struct UnixProcessControl;

#[cfg(not(unix))]
impl UnixProcessControl {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(not(unix))]
#[async_trait]
impl ProcessControl for UnixProcessControl {
    fn platform_name(&self) -> &'static str {
        "Unix"
    }

    fn prepare(&self, _command: &mut tokio::process::Command) {}

    fn is_alive(&self, _pid: ProcessId) -> bool {
        false
    }

    async fn find_child_processes(&self, _pid: ProcessId) -> Vec<ProcessId> {
        Vec::new()
    }

    async fn terminate_tree(&self, _root_pid: ProcessId) -> TerminationResult {
        TerminationResult::Failed("Unix process control is unavailable on this platform".into())
    }

    fn emergency_kill(&self, _pid: ProcessId) {}
}
