//! # Peer Wire Messages
//!
//! Framing for the BitTorrent peer wire protocol. Every message is
//! length-prefixed:
//!
//! ```text
//! <length: u32 big-endian><id: u8><payload>
//! ```
//!
//! A length of 0 is a keep-alive and carries neither id nor payload. For any
//! other length the first payload byte is the message id:
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability bits |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//! | 20 | EXTENDED | extension id, extension payload |
//!
//! An announced length above [`MESSAGE_LEN_MAX`] is rejected before any
//! buffer is allocated, so a misbehaving peer cannot make us reserve
//! arbitrary amounts of memory.

use anyhow::Result;
use byteorder::{BigEndian, WriteBytesExt};

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_EXTENDED: MessageId = 20;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

// Upper bound on an announced frame length: one 16 KiB block would fit many
// times over, 1 MiB plus header keeps a hostile peer from making us allocate.
pub const MESSAGE_LEN_MAX: usize = (1 << 20) + 9;

#[derive(Default, Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    ///
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    /// * `payload` - The content of the message.
    ///
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message with its length prefix.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // Frame length covers the id byte plus the payload
        let message_len = 1 + self.payload.len();

        let mut serialized: Vec<u8> = vec![];
        serialized.write_u32::<BigEndian>(message_len as u32)?;
        serialized.push(self.id);
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Deserialize a message from the bytes following the length prefix.
///
/// # Arguments
///
/// * `message_buf` - The message to deserialize.
/// * `message_len` - The message length.
///
pub fn deserialize_message(message_buf: &[u8], message_len: usize) -> Result<Message> {
    let id: MessageId = message_buf[0];
    let payload: MessagePayload = message_buf[1..message_len].to_vec();

    Ok(Message::new_with_payload(id, payload))
}
