//! JSON 파일 저장소

mod store;

pub(crate) use store::load_file;
pub use store::ConfigStore;
