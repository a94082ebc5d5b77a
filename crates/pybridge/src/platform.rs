use pybridge_core::{ProcessControl, ProcessControlFactory};
use std::sync::Arc;
use tracing::debug;

/// Selects the process-control implementation for the host at compile time
pub struct PlatformProcessControlFactory;

impl ProcessControlFactory for PlatformProcessControlFactory {
    #[cfg(unix)]
    type Control = pybridge_unix::UnixProcessControl;

    #[cfg(windows)]
    type Control = pybridge_windows::WindowsProcessControl;

    fn create_process_control() -> Self::Control {
        #[cfg(unix)]
        return pybridge_unix::UnixProcessControlFactory::create_process_control();

        #[cfg(windows)]
        return pybridge_windows::WindowsProcessControlFactory::create_process_control();
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return pybridge_unix::UnixProcessControlFactory::platform_name();

        #[cfg(windows)]
        return pybridge_windows::WindowsProcessControlFactory::platform_name();
    }
}

#[cfg(not(any(unix, windows)))]
compile_error!("Unsupported platform: only Unix and Windows are currently supported");

/// Shared handle to the host's process control
pub fn process_control() -> Arc<dyn ProcessControl> {
    debug!(
        platform = PlatformProcessControlFactory::platform_name(),
        "Creating process control"
    );
    Arc::new(PlatformProcessControlFactory::create_process_control())
}

/// Native interpreter location inside an environment prefix
pub fn native_interpreter_path(install_path: &str) -> std::path::PathBuf {
    let prefix = std::path::Path::new(install_path);
    if cfg!(windows) {
        prefix.join("python.exe")
    } else {
        prefix.join("bin").join("python")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let control = process_control();
        assert_eq!(
            control.platform_name(),
            PlatformProcessControlFactory::platform_name()
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_native_interpreter_path() {
        assert_eq!(
            native_interpreter_path("/opt/conda/envs/foo"),
            std::path::PathBuf::from("/opt/conda/envs/foo/bin/python")
        );
    }

    #[test]
    #[cfg(windows)]
    fn test_native_interpreter_path() {
        assert_eq!(
            native_interpreter_path(r"C:\miniconda3"),
            std::path::PathBuf::from(r"C:\miniconda3\python.exe")
        );
    }
}
