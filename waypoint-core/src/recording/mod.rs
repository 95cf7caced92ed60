//! Types shared by the outbound-traffic recorder.
//!
//! The recorder itself (background logger and reqwest middleware) lives in
//! the server; these pieces are kept here so any client of the core can tag
//! requests with a correlation id and scrub what it records.

pub mod sanitizer;
pub mod types;

pub use sanitizer::{Sanitizer, SENSITIVE_HEADERS, SENSITIVE_JSON_KEYS, SENSITIVE_QUERY_KEYS};
pub use types::*;
