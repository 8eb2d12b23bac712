//! # Peer Handshake
//!
//! The handshake is the first exchange on every peer connection, a fixed
//! 68-byte message sent in both directions:
//!
//! ```text
//! <0x13><"BitTorrent protocol"><reserved: 8><info_hash: 20><peer_id: 20>
//! ```
//!
//! It confirms both ends speak the same protocol, that they are in the same
//! swarm (the info-hash must match), and exchanges peer ids. The 8 reserved
//! bytes advertise optional capabilities: bit 20, counting from the least
//! significant bit of the last byte, signals support for the extension
//! protocol and lands in `reserved[5]` as `0x10`.

use anyhow::{anyhow, Result};

const PROTOCOL_ID: &str = "BitTorrent protocol";

// Extension-protocol capability flag in reserved[5]
const EXTENSION_BIT: u8 = 0x10;

/// Total size of a serialized handshake.
pub const HANDSHAKE_LEN: usize = 68;

/// A peer handshake message.
pub struct Handshake {
    /// 8 reserved capability bytes
    pub reserved: [u8; 8],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte unique identifier for the sending peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a handshake with no capabilities advertised.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte unique identifier for this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    ///
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Build a handshake advertising extension-protocol support.
    pub fn with_extensions(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        let mut handshake = Handshake::new(peer_id, info_hash);
        handshake.reserved[5] |= EXTENSION_BIT;
        handshake
    }

    /// Whether the sender advertised extension-protocol support.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }

    /// Serialize the handshake into its fixed 68-byte layout.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut serialized: Vec<u8> = Vec::with_capacity(HANDSHAKE_LEN);

        serialized.push(PROTOCOL_ID.len() as u8);
        serialized.extend_from_slice(PROTOCOL_ID.as_bytes());
        serialized.extend_from_slice(&self.reserved);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);

        if serialized.len() != HANDSHAKE_LEN {
            return Err(anyhow!("handshake fields have invalid lengths"));
        }

        Ok(serialized)
    }
}

/// Deserialize and validate a received 68-byte handshake.
///
/// The first byte must be 0x13 and the 19-byte protocol literal must match;
/// anything else is a different or corrupted protocol and the connection is
/// not worth keeping.
pub fn deserialize_handshake(buf: &[u8]) -> Result<Handshake> {
    if buf.len() != HANDSHAKE_LEN {
        return Err(anyhow!("handshake received from peer has invalid length"));
    }
    if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID.as_bytes() {
        return Err(anyhow!("invalid protocol identifier received from peer"));
    }

    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&buf[20..28]);

    Ok(Handshake {
        reserved,
        info_hash: buf[28..48].to_vec(),
        peer_id: buf[48..68].to_vec(),
    })
}
