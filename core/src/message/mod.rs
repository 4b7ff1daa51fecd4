// Message module — plaintext messages, their sealed wire form and framing

pub mod codec;
pub mod types;

pub use codec::{check_content, decode_sealed, encode_sealed, CodecError};
pub use types::{Message, MessageFields, SealedMessage};
