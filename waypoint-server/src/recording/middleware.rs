use axum::http::{self, HeaderValue};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::collections::HashMap;
use uuid::Uuid;

use super::{
    CorrelationId, Direction, RecordedEvent, RecordingLogger, Sanitizer, ServiceType,
    CORRELATION_ID_HEADER,
};

/// Bodies larger than this are recorded by size only.
const MAX_RECORDED_BODY: usize = 10_000;

pub struct RecordingMiddleware {
    logger: RecordingLogger,
    service_type: ServiceType,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger, service_type: ServiceType) -> Self {
        Self {
            logger,
            service_type,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        // Header first, then extensions, then a fresh id.
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| extensions.get::<CorrelationId>().map(|id| id.0.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let request_data = extract_request_data(&req);
        self.record(
            Direction::Request,
            format!("{} {}", request_data.method, extract_path(&request_data.url)),
            serde_json::to_value(&request_data).unwrap_or(serde_json::Value::Null),
            &correlation_id,
        );

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => {
                let response_data = extract_response_data(resp);
                self.record(
                    Direction::Response,
                    format!("response_{}", response_data.status_code),
                    serde_json::to_value(&response_data).unwrap_or(serde_json::Value::Null),
                    &correlation_id,
                );
            }
            Err(err) => {
                self.record(
                    Direction::Response,
                    "error".to_string(),
                    serde_json::json!({
                        "error": err.to_string(),
                        "error_type": format!("{:?}", err)
                    }),
                    &correlation_id,
                );
            }
        }

        response
    }
}

impl RecordingMiddleware {
    fn record(
        &self,
        direction: Direction,
        operation: String,
        data: serde_json::Value,
        correlation_id: &str,
    ) {
        let mut metadata = HashMap::new();
        metadata.insert("service".to_string(), format!("{:?}", self.service_type));

        self.logger.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.to_string(),
            event_type: self.service_type.event_type(),
            direction,
            operation,
            data,
            metadata,
        });
    }
}

fn header_map(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn extract_request_data(request: &Request) -> RequestData {
    let body = match request.body() {
        Some(body) => match body.as_bytes() {
            Some(bytes) if bytes.len() > MAX_RECORDED_BODY => {
                format!("[LARGE_BODY_{}b]", bytes.len())
            }
            Some(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Sanitizer::sanitize_body(text),
                Err(_) => format!("[BINARY_BODY_{}b]", bytes.len()),
            },
            None => "[STREAM_BODY]".to_string(),
        },
        None => "[NO_BODY]".to_string(),
    };

    RequestData {
        method: request.method().to_string(),
        url: Sanitizer::sanitize_url(request.url().as_str()),
        headers: Sanitizer::sanitize_headers(&header_map(request.headers())),
        body,
    }
}

fn extract_response_data(response: &Response) -> ResponseData {
    ResponseData {
        status_code: response.status().as_u16(),
        headers: Sanitizer::sanitize_headers(&header_map(response.headers())),
        body_size: response.content_length().unwrap_or(0),
    }
}

#[derive(Debug, serde::Serialize)]
struct RequestData {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Debug, serde::Serialize)]
struct ResponseData {
    status_code: u16,
    headers: HashMap<String, String>,
    body_size: u64,
}

fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}
