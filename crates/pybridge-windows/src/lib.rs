//! Windows process-tree control: hidden consoles and `taskkill /T`

mod windows_process_control;

pub use windows_process_control::WindowsProcessControl;

use pybridge_core::ProcessControlFactory;

pub struct WindowsProcessControlFactory;

impl ProcessControlFactory for WindowsProcessControlFactory {
    type Control = WindowsProcessControl;

    fn create_process_control() -> WindowsProcessControl {
        WindowsProcessControl::new()
    }

    fn platform_name() -> &'static str {
        "Windows"
    }
}
