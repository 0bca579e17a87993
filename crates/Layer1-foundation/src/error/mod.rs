//! Error types for the IOC launcher
//!
//! 탐색 에러는 scanner 가 로그만 남기고 흡수,
//! 수명주기/I/O 에러는 바로 호출자에게 반환

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// IOC launcher 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 탐색 관련
    // ========================================================================
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Incomplete instance file {}: missing {}", path.display(), missing.join(", "))]
    ConfigIncomplete {
        path: PathBuf,
        missing: Vec<&'static str>,
    },

    // ========================================================================
    // 프로세스 수명주기 관련
    // ========================================================================
    #[error("Process creation failed: {0}")]
    ProcessCreation(String),

    #[error("IOC not responding: {0}")]
    ChildUnresponsive(String),

    #[error("Instance not running: {0}")]
    NotRunning(String),

    #[error("Wait for child failed: {0}")]
    Wait(String),

    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 자식이 스트림을 닫았는지 (hang-up)
    pub fn is_hangup(&self) -> bool {
        matches!(self, Error::ChildUnresponsive(_))
    }

    /// instance.cmd 키 누락 헬퍼
    pub fn config_incomplete(path: impl Into<PathBuf>, missing: Vec<&'static str>) -> Self {
        Error::ConfigIncomplete {
            path: path.into(),
            missing,
        }
    }
}
