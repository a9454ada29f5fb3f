use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the status code of a failed reply.
pub const HEADER_ERROR_CODE: &str = "fim-error-code";
/// Header carrying a human readable description of a failed reply.
pub const HEADER_ERROR: &str = "fim-error";

// Request or reply travelling over a request/reply bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub sender_id: String,
    pub subject: Option<String>,
    pub timestamp_ms: u64,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    pub fn new(sender_id: &str, payload: Vec<u8>) -> Self {
        Self {
            message_id: uuid::Uuid::now_v7().to_string(),
            correlation_id: None,
            sender_id: sender_id.to_string(),
            subject: None,
            timestamp_ms: now_epoch_ms(),
            headers: HashMap::new(),
            payload,
        }
    }

    /// Reply to `request`, correlated by its message id.
    pub fn reply_to(request: &MessageEnvelope, sender_id: &str, payload: Vec<u8>) -> Self {
        let mut reply = Self::new(sender_id, payload).with_correlation_id(&request.message_id);
        reply.subject = request.subject.clone();
        reply
    }

    /// Failed reply to `request` with the error headers set.
    pub fn error_reply(
        request: &MessageEnvelope,
        sender_id: &str,
        code: &str,
        description: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self::reply_to(request, sender_id, payload)
            .with_header(HEADER_ERROR_CODE, code)
            .with_header(HEADER_ERROR, description)
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Status code of a failed reply, `None` on success.
    pub fn error_code(&self) -> Option<&str> {
        self.header(HEADER_ERROR_CODE).filter(|c| !c.is_empty())
    }
}

fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
