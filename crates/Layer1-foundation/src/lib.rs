//! # ioc-foundation
//!
//! IOC launcher 기반 레이어:
//! - Error: 공통 에러 분류와 `Result` alias
//! - Config: 스캔 루트, 자식 실행 명령, 스트림 버퍼링
//! - Storage: JSON 설정 저장소 (글로벌 + 프로젝트)

pub mod config;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

pub use config::{
    LaunchConfig, LauncherConfig, OverflowPolicy, StreamConfig, DEFAULT_ROOT,
    DEFAULT_STREAM_CAPACITY, LAUNCHER_CONFIG_FILE, ROOT_ENV,
};

pub use storage::ConfigStore;
