// Message codec — line-framed JSON for the direct channel, with size limits

use super::types::SealedMessage;
use thiserror::Error;

/// Maximum encoded frame size: 256 KB
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Maximum text content: 64 KB
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Serialize a sealed message into one frame (compact JSON, no newlines)
pub fn encode_sealed(sealed: &SealedMessage) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(sealed).map_err(|e| CodecError::Malformed(e.to_string()))?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Parse one frame received on the direct channel
pub fn decode_sealed(bytes: &[u8]) -> Result<SealedMessage, CodecError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Reject content that would not fit in a frame once encrypted
pub fn check_content(content: &str) -> Result<(), CodecError> {
    if content.len() > MAX_CONTENT_SIZE {
        return Err(CodecError::TooLarge {
            size: content.len(),
            max: MAX_CONTENT_SIZE,
        });
    }
    Ok(())
}
