//! JSON payload helpers.

use serde::Serialize;
use serde::de::DeserializeOwned;

use vqueue_core::{Message, QueueError, QueueResult, ReceivedMessage};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Serialize `value` into a message tagged `application/json`.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> QueueResult<Message> {
    let body = serde_json::to_vec(value).map_err(|e| QueueError::Codec(e.to_string()))?;
    Ok(Message::new(body).with_content_type(JSON_CONTENT_TYPE))
}

/// Deserialize a received body. The content type is not checked.
pub fn decode_json<T: DeserializeOwned>(message: &ReceivedMessage) -> QueueResult<T> {
    serde_json::from_slice(&message.body).map_err(|e| {
        QueueError::Codec(format!("message {}: {e}", message.sequence))
    })
}
