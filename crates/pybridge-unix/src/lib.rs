mod unix_process_control;

pub use unix_process_control::UnixProcessControl;

use pybridge_core::ProcessControlFactory;

pub struct UnixProcessControlFactory;

impl ProcessControlFactory for UnixProcessControlFactory {
    type Control = UnixProcessControl;

    fn create_process_control() -> UnixProcessControl {
        UnixProcessControl::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
