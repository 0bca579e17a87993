//! Launcher Config - 스캔 루트, 자식 실행 명령, 스트림 설정
//!
//! 글로벌 파일 → 프로젝트 파일 → 환경변수 → CLI 플래그 순으로 적용.
//! 각 레이어는 기본값과 다른 필드만 덮어씀 (기본값으로 되돌리기는 불가).

use crate::storage::ConfigStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const LAUNCHER_CONFIG_FILE: &str = "launcher.json";

/// 스캔 루트를 덮어쓰는 환경변수
pub const ROOT_ENV: &str = "IOC_LAUNCHER_ROOT";

/// 아무 설정도 없을 때의 스캔 루트
pub const DEFAULT_ROOT: &str = "/data/bdee";

/// 스트림 누적 버퍼 기본 크기 (bytes)
pub const DEFAULT_STREAM_CAPACITY: usize = 4096;

/// drain 한 번의 readiness 타임아웃 범위 (ms)
pub const MIN_POLL_TIMEOUT_MS: u64 = 1;
pub const MAX_POLL_TIMEOUT_MS: u64 = 5;

// ============================================================================
// Launcher Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    /// `instance.cmd` 를 찾을 디렉토리 트리
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// 인스턴스 프로세스 실행 방법
    #[serde(default)]
    pub launch: LaunchConfig,

    /// 출력 스트림 버퍼링
    #[serde(default)]
    pub stream: StreamConfig,

    /// supervisor 루프 유휴 간격
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            launch: LaunchConfig::default(),
            stream: StreamConfig::default(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl LauncherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 프로젝트 병합 로드, 그 다음 환경변수
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        if let Ok(global) = ConfigStore::global() {
            if let Some(global_config) = global.load_optional::<LauncherConfig>(LAUNCHER_CONFIG_FILE)? {
                debug!("Loaded global launcher config from {}", global.base_dir().display());
                config.merge(global_config);
            }
        }

        if let Ok(project) = ConfigStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<LauncherConfig>(LAUNCHER_CONFIG_FILE)?
            {
                debug!("Loaded project launcher config from {}", project.base_dir().display());
                config.merge(project_config);
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// 지정된 파일 하나 (CLI `--config`), 그 다음 환경변수
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::new();
        let file: LauncherConfig = crate::storage::json::load_file(path)?;
        config.merge(file);
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// 프로젝트 설정 저장, 저장된 경로 반환
    pub fn save_project(&self) -> Result<PathBuf> {
        ConfigStore::current_project()?.save(LAUNCHER_CONFIG_FILE, self)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// 다른 레이어와 병합
    ///
    /// other 의 필드가 기본값과 다를 때만 other 가 우선. 기본값과 같은 필드는
    /// "설정 안 함" 으로 취급하므로, 뒤 레이어가 앞 레이어의 값을 기본값으로
    /// 되돌릴 수는 없음 (`launch.args` 는 빈 배열, `workingDir` 는 null 이 기본값).
    pub fn merge(&mut self, other: LauncherConfig) {
        if other.root != default_root() {
            self.root = other.root;
        }
        if other.tick_interval_ms != default_tick_interval_ms() {
            self.tick_interval_ms = other.tick_interval_ms;
        }
        self.launch.merge(other.launch);
        self.stream.merge(other.stream);
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                self.root = PathBuf::from(root);
            }
        }
    }

    /// 실행 불가능한 설정 거부, poll 타임아웃은 범위로 clamp
    pub fn validate(&mut self) -> Result<()> {
        if self.stream.capacity == 0 {
            return Err(Error::Config("stream capacity must be greater than zero".into()));
        }
        if self.launch.program.as_os_str().is_empty() {
            return Err(Error::Config("launch program must not be empty".into()));
        }
        self.stream.poll_timeout_ms = self
            .stream
            .poll_timeout_ms
            .clamp(MIN_POLL_TIMEOUT_MS, MAX_POLL_TIMEOUT_MS);
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    // ========================================================================
    // Builder
    // ========================================================================

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }
}

// ============================================================================
// Launch Config
// ============================================================================

/// 자식 명령줄: `program args... mode stagePath instanceName port`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    /// 시작 스크립트 또는 실행 파일
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// 인스턴스 위치 인자 앞에 붙는 인자
    #[serde(default)]
    pub args: Vec<String>,

    /// 첫 번째 위치 인자
    #[serde(default = "default_mode")]
    pub mode: String,

    /// 마지막 위치 인자
    #[serde(default = "default_port")]
    pub port: String,

    /// 자식 작업 디렉토리 (없으면 launcher 의 것을 상속)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            mode: default_mode(),
            port: default_port(),
            working_dir: None,
        }
    }
}

impl LaunchConfig {
    /// `program` + 앞쪽 `args` 로 실행
    pub fn command(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    fn merge(&mut self, other: LaunchConfig) {
        if other.program != default_program() {
            self.program = other.program;
        }
        if !other.args.is_empty() {
            self.args = other.args;
        }
        if other.mode != default_mode() {
            self.mode = other.mode;
        }
        if other.port != default_port() {
            self.port = other.port;
        }
        if other.working_dir.is_some() {
            self.working_dir = other.working_dir;
        }
    }
}

// ============================================================================
// Stream Config
// ============================================================================

/// 누적 버퍼가 개행 없이 가득 찼을 때 drain 의 동작
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// 읽기 중단, 조각은 유지되고 drain 은 `Full` 반환
    Hold,
    /// 조각을 버리고 계속 읽기
    Drop,
    /// 조각을 완성된 줄로 내보내고 계속 읽기
    #[default]
    Split,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfig {
    /// 누적 버퍼 크기 (bytes)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// drain 당 readiness 타임아웃
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            poll_timeout_ms: default_poll_timeout_ms(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl StreamConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    fn merge(&mut self, other: StreamConfig) {
        if other.capacity != default_capacity() {
            self.capacity = other.capacity;
        }
        if other.poll_timeout_ms != default_poll_timeout_ms() {
            self.poll_timeout_ms = other.poll_timeout_ms;
        }
        if other.overflow != OverflowPolicy::default() {
            self.overflow = other.overflow;
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn default_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_program() -> PathBuf {
    PathBuf::from("tools/start_ioc.sh")
}

fn default_mode() -> String {
    "dev".to_string()
}

fn default_port() -> String {
    "0000".to_string()
}

fn default_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

fn default_poll_timeout_ms() -> u64 {
    1
}

fn default_tick_interval_ms() -> u64 {
    20
}
