//! Storage 모듈
//!
//! - `json`: launcher 설정용 JSON 파일 저장소

pub(crate) mod json;

pub use json::ConfigStore;
