use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String,      // ISO 8601 timestamp
    pub correlation_id: String, // Groups the calls made for one pipeline operation
    pub event_type: EventType,
    pub direction: Direction,
    pub operation: String,       // e.g. "GET /repos/o/r/commits", "response_200"
    pub data: serde_json::Value, // Sanitized request/response data
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EventType {
    HostingApiCall,
    GenerativeApiCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum ServiceType {
    Hosting,
    Generative,
}

impl ServiceType {
    pub fn event_type(self) -> EventType {
        match self {
            Self::Hosting => EventType::HostingApiCall,
            Self::Generative => EventType::GenerativeApiCall,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

// Header name for correlation ID propagation
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
