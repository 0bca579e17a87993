//! Config - launcher 설정
//!
//! - `launcher.rs` - 스캔 루트, 실행 명령, 스트림 버퍼링

mod launcher;

pub use launcher::{
    LaunchConfig, LauncherConfig, OverflowPolicy, StreamConfig, DEFAULT_ROOT,
    DEFAULT_STREAM_CAPACITY, LAUNCHER_CONFIG_FILE, MAX_POLL_TIMEOUT_MS, MIN_POLL_TIMEOUT_MS,
    ROOT_ENV,
};
