//! PyBridge Core - Platform-independent types for the Python environment bridge
//!
//! Error taxonomy, option structs, the process-control seam implemented by the
//! platform crates, shell escaping, WSL path translation and the parsers for
//! `conda info --json` and `wsl -l -v`.

mod config;
mod environment;
mod error;
mod process;
mod stream;

pub mod escape;
pub mod paths;

pub use config::*;
pub use environment::*;
pub use error::*;
pub use process::*;
pub use stream::{Utf8LineCodec, decode_output, stream_lines};
