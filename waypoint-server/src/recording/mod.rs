//! JSONL recording of outbound GitHub and Gemini traffic.

pub mod logger;
pub mod middleware;

pub use logger::RecordingLogger;
pub use middleware::RecordingMiddleware;
pub use waypoint_core::recording::*;
