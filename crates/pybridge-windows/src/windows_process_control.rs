use async_trait::async_trait;
use pybridge_core::{ProcessControl, ProcessId, TerminationResult};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Windows process-tree control built on `taskkill /T` with a sysinfo fallback
pub struct WindowsProcessControl {
    system: Mutex<System>,
}

impl Default for WindowsProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowsProcessControl {
    pub fn new() -> Self {
        debug!("Initializing Windows process control");
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// `Ok(true)` when taskkill reports success, `Ok(false)` when the PID is unknown
    async fn taskkill_tree(&self, pid: ProcessId) -> std::io::Result<bool> {
        let mut command = Command::new("taskkill");
        command.args(["/F", "/T", "/PID", &pid.to_string()]);
        self.prepare(&mut command);
        let output = command.output().await?;
        Ok(output.status.success())
    }

    fn refreshed(&self) -> std::sync::MutexGuard<'_, System> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        system
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

    /// Kill each PID through sysinfo, children first
    fn kill_manually(&self, root_pid: ProcessId) -> TerminationResult {
        let system = self.refreshed();
        let mut pids = Vec::new();
        Self::find_children_recursive(&system, root_pid, &mut pids);
        pids.push(root_pid);

        let mut root_result = TerminationResult::ProcessNotFound;
        for pid in pids {
            let result = match system.process(Pid::from_u32(pid)) {
                Some(process) if process.kill() => TerminationResult::Success,
                Some(_) => TerminationResult::Failed(format!("failed to kill PID {pid}")),
                None => TerminationResult::ProcessNotFound,
            };
            if pid == root_pid {
                root_result = result;
            } else if !result.is_gone() {
                warn!(pid = %pid, result = ?result, "Failed to terminate child process");
            }
        }
        root_result
    }
}

#[async_trait]
impl ProcessControl for WindowsProcessControl {
    fn platform_name(&self) -> &'static str {
        "Windows"
    }

    #[allow(unused_variables)]
    fn prepare(&self, command: &mut Command) {
        #[cfg(windows)]
        command.creation_flags(windows::Win32::System::Threading::CREATE_NO_WINDOW.0);
    }

    fn is_alive(&self, pid: ProcessId) -> bool {
        self.refreshed().process(Pid::from_u32(pid)).is_some()
    }

    async fn find_child_processes(&self, pid: ProcessId) -> Vec<ProcessId> {
        let system = self.refreshed();
        let mut children = Vec::new();
        Self::find_children_recursive(&system, pid, &mut children);
        children
    }

    async fn terminate_tree(&self, root_pid: ProcessId) -> TerminationResult {
        info!(root_pid = %root_pid, "Terminating process tree");

        match self.taskkill_tree(root_pid).await {
            Ok(true) => {
                info!(root_pid = %root_pid, "Process tree terminated");
                TerminationResult::Success
            }
            Ok(false) if !self.is_alive(root_pid) => {
                debug!(root_pid = %root_pid, "Process tree already gone");
                TerminationResult::ProcessNotFound
            }
            Ok(false) => {
                warn!(root_pid = %root_pid, "taskkill failed, killing tree manually");
                self.kill_manually(root_pid)
            }
            Err(e) => {
                warn!(root_pid = %root_pid, error = %e, "taskkill unavailable, killing tree manually");
                self.kill_manually(root_pid)
            }
        }
    }

    fn emergency_kill(&self, pid: ProcessId) {
        let mut command = std::process::Command::new("taskkill");
        command.args(["/F", "/T", "/PID", &pid.to_string()]);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(windows::Win32::System::Threading::CREATE_NO_WINDOW.0);
        }
        if command.output().is_err() {
            let _ = self.kill_manually(pid);
        }
    }
}
