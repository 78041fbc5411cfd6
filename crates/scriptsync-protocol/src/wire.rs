//! Wire format: one JSON object per WebSocket text frame.

use scriptsync_types::Message;

use crate::error::ProtocolError;

/// Maximum encoded message size (16 MiB). Scripts are sent whole, so this is
/// generous, but it still bounds what a spool file or frame may allocate.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message as a UTF-8 JSON string.
pub fn encode_message(msg: &Message) -> Result<String, ProtocolError> {
    let text =
        serde_json::to_string(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Serialization(format!(
            "message size {} exceeds maximum {MAX_MESSAGE_SIZE}",
            text.len()
        )));
    }
    Ok(text)
}

/// Decode a message from a JSON string.
pub fn decode_message(text: &str) -> Result<Message, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::Deserialization(format!(
            "message size {} exceeds maximum {MAX_MESSAGE_SIZE}",
            text.len()
        )));
    }
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}
