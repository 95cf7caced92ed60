//! HTTP client construction shared by the GitHub and Gemini clients.

use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::time::Duration;

/// Plain `reqwest` client with the service user agent and `timeout`.
///
/// Callers that need middleware wrap this in their own
/// [`ClientBuilder`].
pub fn base_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("waypoint/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}

pub fn create_http_client(timeout: Duration) -> Result<ClientWithMiddleware, reqwest::Error> {
    Ok(ClientBuilder::new(base_http_client(timeout)?).build())
}
