pub mod api;
pub mod config;
pub mod pipeline;
pub mod recording;
pub mod repository;

pub use pipeline::{Pipeline, PipelineSettings};
pub use recording::{RecordingLogger, RecordingMiddleware};
pub use repository::{InMemoryRepository, ProjectRepository, ProjectUpdate, SqliteRepository};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Service version: the build's git hash when stamped, else the crate version.
pub fn version() -> String {
    match option_env!("WAYPOINT_GIT_HASH") {
        Some(git_hash) if git_hash.len() >= 8 => git_hash[..8].to_string(),
        Some(git_hash) if !git_hash.is_empty() => git_hash.to_string(),
        _ => built_info::PKG_VERSION.to_string(),
    }
}

pub struct AppState {
    pub pipeline: Pipeline,
}
