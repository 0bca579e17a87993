//! # ioc-task
//!
//! IOC discovery and child process supervision for the IOC launcher.
//!
//! ## Features
//!
//! - Directory walk for `instance.cmd` files and their three keys
//! - One child process per IOC with piped stdin, stdout and stderr
//! - Non-blocking line capture with bounded per-stream history
//! - Hang-up detection and automatic stop on the next tick
//! - Async supervisor that publishes captured lines to subscribers

#[cfg(not(unix))]
compile_error!("ioc-task supports unix platforms only");

pub mod discovery;
pub mod instance;
pub mod process;
pub mod registry;
pub mod state;
pub mod stream;
pub mod supervisor;

// Discovery
pub use discovery::{
    discover, extract_value, parse_instance_file, InstanceDescriptor, InstanceFields, InstanceKey,
    ScanLevel, ScanOutcome, Scanner, INSTANCE_FILE, IOC_DIR_PREFIX,
};

// Processes
pub use instance::{DrainReport, ProcessInstance};
pub use process::{parent_death_signal_supported, ProcessSpec, SpawnedProcess};
pub use registry::{InstanceRegistry, TickReport};
pub use state::InstanceState;

// Output capture
pub use stream::{Drain, Feed, StreamBuffer, StreamKind, HANGUP_SENTINEL};

// Async front door
pub use supervisor::{InstanceSummary, LineEvent, Supervisor, SupervisorHandle};
