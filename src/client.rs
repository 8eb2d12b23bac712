//! # Peer Session
//!
//! Client side of the peer wire protocol: one [`Client`] per TCP connection,
//! owning the socket, the peer's bitfield and the choke state, and walking
//! the session through its lifecycle:
//!
//! ```text
//! connect -> handshake -> bitfield -> interested -> (wait unchoke) -> requests
//! ```
//!
//! ## Block Transfer
//!
//! Pieces are fetched as 16KB blocks. Each REQUEST names `(index, begin,
//! length)` and the matching PIECE response repeats `(index, begin)` before
//! the data. Responses are matched by `(index, begin)`, never by arrival
//! order: a response for another piece, a misaligned or out-of-range offset,
//! a wrong-sized block or a block already received is discarded rather than
//! treated as an error, so reordering and duplication by the peer are
//! harmless.
//!
//! ## Extension Sub-Protocol
//!
//! When both handshakes advertised bit 20, message id 20 carries a second
//! layer of framing: one extension-id byte, then an extension payload. Id 0
//! is the extension handshake, a bencoded dictionary whose `"m"` key maps
//! extension names to the ids the sender wants them addressed by. We publish
//! `{"m": {"ut_metadata": 1}}` and use the peer's `ut_metadata` id to
//! request metadata pieces, which is how a magnet-link session obtains the
//! info dictionary it has only the hash of.

use crate::bencode::{self, Bencode};
use crate::handshake::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

// Extension id of the extension handshake itself
const EXTENSION_HANDSHAKE_ID: u8 = 0;

// The id we publish for ut_metadata in our extension handshake; the peer
// addresses metadata responses to it
pub const UT_METADATA_ID: u8 = 1;

// ut_metadata message types
const METADATA_REQUEST: i64 = 0;
const METADATA_DATA: i64 = 1;
const METADATA_REJECT: i64 = 2;

// Metadata travels in chunks of this size, the last one possibly shorter
const METADATA_PIECE_SIZE: usize = 16384;

/// A session with one remote peer.
pub struct Client {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Bitfield indicating which pieces the peer has
    bitfield: Vec<u8>,
    /// Whether the peer has choked this client
    choked: bool,
    /// Whether we advertise the extension protocol in our handshake
    extensions: bool,
    /// Whether the peer advertised the extension protocol
    peer_extensions: bool,
    /// Peer id received in the remote handshake
    remote_id: Vec<u8>,
    /// The peer's ut_metadata id, learned from its extension handshake
    peer_ut_metadata: Option<u8>,
}

impl Client {
    /// Open a TCP connection to a peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port.
    /// * `peer_id` - 20-byte identifier for this client, freshly random per run.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    /// * `extensions` - Whether to advertise extension-protocol support.
    ///
    pub fn new(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>, extensions: bool) -> Result<Client> {
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = match TcpStream::connect_timeout(&peer_socket, Duration::from_secs(15)) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not connect to peer")),
        };

        info!("Connected to peer {:?}", peer.id);

        Ok(Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: vec![],
            choked: true,
            extensions,
            peer_extensions: false,
            remote_id: vec![],
            peer_ut_metadata: None,
        })
    }

    /// Returns whether this client is choked by the peer.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Returns whether the peer advertised extension-protocol support.
    pub fn peer_supports_extensions(&self) -> bool {
        self.peer_extensions
    }

    /// The peer id the remote sent in its handshake.
    pub fn remote_peer_id(&self) -> &[u8] {
        &self.remote_id
    }

    /// The peer's ut_metadata id, once its extension handshake was read.
    pub fn metadata_extension_id(&self) -> Option<u8> {
        self.peer_ut_metadata
    }

    /// Checks if the peer has a specific piece available.
    ///
    /// Bitfield bytes hold 8 pieces each, most significant bit first:
    /// bit 7 of byte 0 is piece 0.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.bitfield.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Marks a piece as available in the peer's bitfield, growing it if the
    /// index is beyond what the peer originally announced.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - offset);
    }

    /// Sets read and write timeouts on the connection so a silent peer
    /// converts into an error instead of a hang.
    ///
    /// # Arguments
    ///
    /// * `secs` - Timeout duration in seconds.
    ///
    pub fn set_connection_timeout(&self, secs: u64) -> Result<()> {
        if self
            .conn
            .set_write_timeout(Some(Duration::from_secs(secs)))
            .is_err()
        {
            return Err(anyhow!("could not set write timeout"));
        }

        if self
            .conn
            .set_read_timeout(Some(Duration::from_secs(secs)))
            .is_err()
        {
            return Err(anyhow!("could not set read timeout"));
        }

        Ok(())
    }

    /// Perform the 68-byte handshake with the remote peer.
    ///
    /// Sends our handshake (advertising extensions if configured), reads the
    /// peer's, validates the protocol literal and the info-hash, and records
    /// the remote peer id and extension capability.
    pub fn handshake_with_peer(&mut self) -> Result<()> {
        let handshake = if self.extensions {
            Handshake::with_extensions(self.peer_id.clone(), self.info_hash.clone())
        } else {
            Handshake::new(self.peer_id.clone(), self.info_hash.clone())
        };

        let handshake_encoded: Vec<u8> = handshake.serialize()?;
        if self.conn.write_all(&handshake_encoded).is_err() {
            return Err(anyhow!("could not send handshake to peer"));
        }

        let mut handshake_buf = [0u8; HANDSHAKE_LEN];
        if self.conn.read_exact(&mut handshake_buf).is_err() {
            return Err(anyhow!("could not read handshake received from peer"));
        }

        let handshake_decoded = deserialize_handshake(&handshake_buf)?;
        if handshake_decoded.info_hash != self.info_hash {
            return Err(anyhow!("info hash received from peer does not match"));
        }

        self.peer_extensions = handshake_decoded.supports_extensions();
        self.remote_id = handshake_decoded.peer_id;

        Ok(())
    }

    /// Read and parse one message from the peer.
    ///
    /// Reads the 4-byte length prefix, then exactly that many payload bytes.
    /// A zero length is a keep-alive.
    pub fn read_message(&mut self) -> Result<Message> {
        let message_len: usize = self.read_message_len()?;

        if message_len == 0 {
            debug!("Receive KEEP_ALIVE from peer {:?}", self.peer.id);
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        let mut message_buf: Vec<u8> = vec![0; message_len];
        if self.conn.read_exact(&mut message_buf).is_err() {
            return Err(anyhow!("could not read message received from peer"));
        }

        deserialize_message(&message_buf, message_len)
    }

    /// Read the 4-byte big-endian length prefix of an incoming message.
    ///
    /// Lengths above [`MESSAGE_LEN_MAX`] are rejected before allocating.
    fn read_message_len(&mut self) -> Result<usize> {
        let mut buf = [0; 4];
        if self.conn.read_exact(&mut buf).is_err() {
            return Err(anyhow!("could not read message length received from peer"));
        }

        let mut cursor = Cursor::new(buf);
        let message_len = cursor.read_u32::<BigEndian>()? as usize;

        if message_len > MESSAGE_LEN_MAX {
            return Err(anyhow!(
                "message length {} received from peer exceeds limit",
                message_len
            ));
        }

        Ok(message_len)
    }

    /// Send a message to the peer.
    fn send_message(&mut self, message: Message) -> Result<()> {
        let message_encoded = message.serialize()?;
        if self.conn.write_all(&message_encoded).is_err() {
            return Err(anyhow!("could not send message to peer"));
        }

        Ok(())
    }

    /// Process a CHOKE message: the peer will ignore our requests until it
    /// unchokes us again.
    pub fn read_choke(&mut self) {
        debug!("Receive MESSAGE_CHOKE from peer {:?}", self.peer.id);
        self.choked = true
    }

    /// Process an UNCHOKE message: requests may flow again.
    pub fn read_unchoke(&mut self) {
        debug!("Receive MESSAGE_UNCHOKE from peer {:?}", self.peer.id);
        self.choked = false
    }

    /// Send an UNCHOKE message to the peer.
    pub fn send_unchoke(&mut self) -> Result<()> {
        debug!("Send MESSAGE_UNCHOKE to peer {:?}", self.peer.id);
        self.send_message(Message::new(MESSAGE_UNCHOKE))
    }

    /// Send an INTERESTED message, required before the peer will honor
    /// piece requests.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Send MESSAGE_INTERESTED to peer {:?}", self.peer.id);
        self.send_message(Message::new(MESSAGE_INTERESTED))
    }

    /// Notify the peer that we now have a verified piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based index of the downloaded piece.
    ///
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        debug!("Send MESSAGE_HAVE to peer {:?}", self.peer.id);
        self.send_message(Message::new_with_payload(
            MESSAGE_HAVE,
            index.to_be_bytes().to_vec(),
        ))
    }

    /// Process a HAVE message and update the peer's bitfield.
    pub fn read_have(&mut self, message: Message) -> Result<()> {
        debug!("Receive MESSAGE_HAVE from peer {:?}", self.peer.id);

        if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
            return Err(anyhow!("received invalid MESSAGE_HAVE from peer"));
        }

        let mut payload_cursor = Cursor::new(&message.payload);
        let index = payload_cursor.read_u32::<BigEndian>()?;
        self.set_piece(index);

        Ok(())
    }

    /// Read the peer's BITFIELD message, sent right after the handshake.
    ///
    /// Keep-alives before it are tolerated; any other message in its place
    /// is a protocol violation.
    pub fn read_bitfield(&mut self) -> Result<()> {
        loop {
            let message: Message = self.read_message()?;
            match message.id {
                MESSAGE_KEEPALIVE => continue,
                MESSAGE_BITFIELD => {
                    debug!("Receive MESSAGE_BITFIELD from peer {:?}", self.peer.id);
                    self.bitfield = message.payload;
                    return Ok(());
                }
                _ => return Err(anyhow!("received invalid MESSAGE_BITFIELD from peer")),
            }
        }
    }

    /// Send a REQUEST for one block of a piece.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Block size in bytes, at most 16KB.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        let mut payload: Vec<u8> = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());

        debug!(
            "Send MESSAGE_REQUEST for piece {:?} [{:?}:{:?}] to peer {:?}",
            index,
            begin,
            begin + length,
            self.peer.id
        );

        self.send_message(Message::new_with_payload(MESSAGE_REQUEST, payload))
    }

    /// Process a PIECE message carrying one block.
    ///
    /// The block is accepted only when `(index, begin)` matches an
    /// outstanding block of `piece_work`: right piece, block-aligned offset
    /// in range, expected length, not yet received. Anything else is
    /// discarded so duplicated or reordered responses cannot corrupt the
    /// piece.
    pub fn read_piece(&mut self, message: Message, piece_work: &mut PieceWork) -> Result<()> {
        if message.id != MESSAGE_PIECE || message.payload.len() < 8 {
            return Err(anyhow!("received invalid MESSAGE_PIECE from peer"));
        }

        let payload = message.payload;

        let mut payload_cursor = Cursor::new(&payload[0..8]);
        let index = payload_cursor.read_u32::<BigEndian>()?;
        let begin = payload_cursor.read_u32::<BigEndian>()?;
        let block = &payload[8..];

        if index != piece_work.index {
            debug!(
                "Discard block for piece {:?} while downloading piece {:?}",
                index, piece_work.index
            );
            return Ok(());
        }

        // An outstanding block begins on a 16KB boundary inside the piece
        // and runs to the next boundary or the end of the piece
        let block_index = (begin / BLOCK_SIZE) as usize;
        let aligned = begin % BLOCK_SIZE == 0;
        let expected_len = piece_work.length.saturating_sub(begin).min(BLOCK_SIZE);

        if !aligned
            || block_index >= piece_work.received.len()
            || block.len() as u32 != expected_len
            || piece_work.received[block_index]
        {
            debug!(
                "Discard unmatched block [{}:{}] for piece {:?} from peer {:?}",
                begin,
                begin as usize + block.len(),
                index,
                self.peer.id
            );
            return Ok(());
        }

        debug!(
            "Download piece {:?} [{:?}:{:?}] from peer {:?}",
            index,
            begin,
            begin + expected_len,
            self.peer.id
        );

        piece_work.data[begin as usize..begin as usize + block.len()].copy_from_slice(block);
        piece_work.received[block_index] = true;
        piece_work.downloaded += expected_len;
        piece_work.requests = piece_work.requests.saturating_sub(1);

        Ok(())
    }

    /// Send our extension handshake, publishing `{"m": {"ut_metadata": 1}}`.
    pub fn send_extension_handshake(&mut self) -> Result<()> {
        let mut names: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        names.insert(b"ut_metadata".to_vec(), Bencode::Int(UT_METADATA_ID as i64));

        let mut entries: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        entries.insert(b"m".to_vec(), Bencode::Dict(names));

        let mut payload = vec![EXTENSION_HANDSHAKE_ID];
        payload.extend_from_slice(&bencode::encode(&Bencode::Dict(entries)));

        debug!("Send extension handshake to peer {:?}", self.peer.id);
        self.send_message(Message::new_with_payload(MESSAGE_EXTENDED, payload))
    }

    /// Read the peer's extension handshake and learn its ut_metadata id.
    ///
    /// Ordinary peer messages arriving first (keep-alives, have, choke
    /// state, a late bitfield) are absorbed into the session state.
    pub fn read_extension_handshake(&mut self) -> Result<u8> {
        loop {
            let message = self.read_message()?;
            match message.id {
                MESSAGE_KEEPALIVE => continue,
                MESSAGE_CHOKE => self.read_choke(),
                MESSAGE_UNCHOKE => self.read_unchoke(),
                MESSAGE_HAVE => self.read_have(message)?,
                MESSAGE_BITFIELD => self.bitfield = message.payload,
                MESSAGE_EXTENDED => {
                    if message.payload.first() != Some(&EXTENSION_HANDSHAKE_ID) {
                        continue;
                    }

                    let entries = bencode::decode(&message.payload[1..])?;
                    let ut_metadata = entries.get(b"m")?.get(b"ut_metadata")?.as_int()?;
                    if !(1..=255).contains(&ut_metadata) {
                        return Err(anyhow!("peer published invalid ut_metadata id"));
                    }

                    debug!(
                        "Peer {:?} publishes ut_metadata id {}",
                        self.peer.id, ut_metadata
                    );

                    self.peer_ut_metadata = Some(ut_metadata as u8);
                    return Ok(ut_metadata as u8);
                }
                _ => {
                    return Err(anyhow!(
                        "received unexpected message while waiting for extension handshake"
                    ))
                }
            }
        }
    }

    /// Fetch the complete metadata (the raw info dictionary) via ut_metadata.
    ///
    /// Requests metadata pieces one at a time and concatenates the returned
    /// bytes until `total_size` is reached. The caller verifies the result
    /// against the expected info-hash.
    pub fn fetch_metadata(&mut self) -> Result<Vec<u8>> {
        let ut_metadata = self
            .peer_ut_metadata
            .ok_or_else(|| anyhow!("peer did not publish a ut_metadata id"))?;

        let mut metadata: Vec<u8> = vec![];
        let mut piece: i64 = 0;

        loop {
            self.send_metadata_request(ut_metadata, piece)?;
            let (total_size, data) = self.read_metadata_data(piece)?;
            metadata.extend_from_slice(&data);

            if metadata.len() >= total_size {
                if metadata.len() != total_size {
                    return Err(anyhow!("metadata received from peer has invalid size"));
                }
                info!(
                    "Fetched {} bytes of metadata from peer {:?}",
                    metadata.len(),
                    self.peer.id
                );
                return Ok(metadata);
            }
            if data.len() != METADATA_PIECE_SIZE {
                return Err(anyhow!("metadata piece received from peer is truncated"));
            }

            piece += 1;
        }
    }

    /// Request one metadata piece: `{"msg_type": 0, "piece": N}` addressed
    /// to the peer's ut_metadata id.
    fn send_metadata_request(&mut self, ut_metadata: u8, piece: i64) -> Result<()> {
        let mut entries: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        entries.insert(b"msg_type".to_vec(), Bencode::Int(METADATA_REQUEST));
        entries.insert(b"piece".to_vec(), Bencode::Int(piece));

        let mut payload = vec![ut_metadata];
        payload.extend_from_slice(&bencode::encode(&Bencode::Dict(entries)));

        debug!(
            "Send metadata request for piece {} to peer {:?}",
            piece, self.peer.id
        );
        self.send_message(Message::new_with_payload(MESSAGE_EXTENDED, payload))
    }

    /// Await the ut_metadata data message for one metadata piece.
    ///
    /// The payload is a bencoded header dictionary immediately followed by
    /// the raw metadata bytes; the boundary is wherever the decode cursor
    /// lands after the header.
    fn read_metadata_data(&mut self, piece: i64) -> Result<(usize, Vec<u8>)> {
        loop {
            let message = self.read_message()?;
            match message.id {
                MESSAGE_KEEPALIVE => continue,
                MESSAGE_CHOKE => self.read_choke(),
                MESSAGE_UNCHOKE => self.read_unchoke(),
                MESSAGE_HAVE => self.read_have(message)?,
                MESSAGE_BITFIELD => self.bitfield = message.payload,
                MESSAGE_EXTENDED => {
                    if message.payload.first() != Some(&UT_METADATA_ID) {
                        continue;
                    }

                    let mut pos = 1;
                    let header = bencode::decode_at(&message.payload, &mut pos)?;

                    match header.get(b"msg_type")?.as_int()? {
                        METADATA_DATA => {}
                        METADATA_REJECT => {
                            return Err(anyhow!("peer rejected our metadata request"))
                        }
                        other => {
                            return Err(anyhow!(
                                "received invalid metadata message type {} from peer",
                                other
                            ))
                        }
                    }

                    if header.get(b"piece")?.as_int()? != piece {
                        debug!("Discard metadata data for another piece");
                        continue;
                    }

                    let total_size = header.get(b"total_size")?.as_int()?;
                    if total_size <= 0 {
                        return Err(anyhow!("peer announced invalid metadata size"));
                    }

                    return Ok((total_size as usize, message.payload[pos..].to_vec()));
                }
                _ => {
                    return Err(anyhow!(
                        "received unexpected message while waiting for metadata"
                    ))
                }
            }
        }
    }

    /// Tear down and re-establish the connection after a failure.
    ///
    /// The choke state resets because it is connection-specific; the
    /// handshake must be redone by the caller.
    pub fn reconnect(&mut self) -> Result<()> {
        info!("Attempting to reconnect to peer {:?}", self.peer.id);

        if let Err(e) = self.conn.shutdown(Shutdown::Both) {
            warn!("Error shutting down existing connection: {}", e);
        }

        let peer_socket = SocketAddr::new(IpAddr::V4(self.peer.ip), self.peer.port);
        let new_conn = match TcpStream::connect_timeout(&peer_socket, Duration::from_secs(15)) {
            Ok(conn) => conn,
            Err(_) => return Err(anyhow!("could not reconnect to peer")),
        };

        self.conn = new_conn;
        self.choked = true;
        self.set_connection_timeout(30)?;

        info!("Successfully reconnected to peer {:?}", self.peer.id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_peer::{spawn_peer, ScriptedPeer};

    use boring::sha::Sha1;

    fn info_hash_of(info: &[u8]) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(info);
        hasher.finish().to_vec()
    }

    fn connect(addr: std::net::SocketAddr, info_hash: Vec<u8>, extensions: bool) -> Client {
        let peer = Peer::from_addr(addr).unwrap();
        let mut client = Client::new(peer, vec![9; 20], info_hash, extensions).unwrap();
        client.set_connection_timeout(5).unwrap();
        client.handshake_with_peer().unwrap();
        client
    }

    #[test]
    fn test_handshake_records_remote_identity() {
        let info_hash = vec![3; 20];
        let script = ScriptedPeer::new(info_hash.clone(), vec![0b1000_0000]);
        let (addr, handle) = spawn_peer(script);

        let client = connect(addr, info_hash, false);
        assert_eq!(client.remote_peer_id(), &[b'T'; 20]);
        assert!(!client.peer_supports_extensions());

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_handshake_rejects_wrong_info_hash() {
        let script = ScriptedPeer::new(vec![3; 20], vec![0b1000_0000]);
        let (addr, handle) = spawn_peer(script);

        let peer = Peer::from_addr(addr).unwrap();
        let mut client = Client::new(peer, vec![9; 20], vec![4; 20], false).unwrap();
        client.set_connection_timeout(5).unwrap();
        assert!(client.handshake_with_peer().is_err());

        drop(client);
        let _ = handle.join();
    }

    #[test]
    fn test_bitfield_and_have() {
        let info_hash = vec![3; 20];
        let script = ScriptedPeer::new(info_hash.clone(), vec![0b1010_0000]);
        let (addr, handle) = spawn_peer(script);

        let mut client = connect(addr, info_hash, false);
        client.read_bitfield().unwrap();
        assert!(client.has_piece(0));
        assert!(!client.has_piece(1));
        assert!(client.has_piece(2));
        assert!(!client.has_piece(64));

        // A HAVE for a piece beyond the announced bitfield grows it
        client
            .read_have(Message::new_with_payload(
                MESSAGE_HAVE,
                9u32.to_be_bytes().to_vec(),
            ))
            .unwrap();
        assert!(client.has_piece(9));

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_read_piece_matching_policy() {
        let info_hash = vec![3; 20];
        let script = ScriptedPeer::new(info_hash.clone(), vec![0b1000_0000]);
        let (addr, handle) = spawn_peer(script);
        let mut client = connect(addr, info_hash, false);

        let mut piece_work = PieceWork::new(1, vec![0; 20], BLOCK_SIZE + 10);

        let mut payload = vec![];
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&vec![7; BLOCK_SIZE as usize]);

        // Accepted block
        client
            .read_piece(
                Message::new_with_payload(MESSAGE_PIECE, payload.clone()),
                &mut piece_work,
            )
            .unwrap();
        assert_eq!(piece_work.downloaded, BLOCK_SIZE);
        assert!(piece_work.received[0]);

        // Duplicate of the same block is discarded
        client
            .read_piece(
                Message::new_with_payload(MESSAGE_PIECE, payload),
                &mut piece_work,
            )
            .unwrap();
        assert_eq!(piece_work.downloaded, BLOCK_SIZE);

        // Wrong piece index is discarded
        let mut other = vec![];
        other.extend_from_slice(&2u32.to_be_bytes());
        other.extend_from_slice(&0u32.to_be_bytes());
        other.extend_from_slice(&vec![7; BLOCK_SIZE as usize]);
        client
            .read_piece(
                Message::new_with_payload(MESSAGE_PIECE, other),
                &mut piece_work,
            )
            .unwrap();
        assert_eq!(piece_work.downloaded, BLOCK_SIZE);

        // Misaligned offset is discarded
        let mut misaligned = vec![];
        misaligned.extend_from_slice(&1u32.to_be_bytes());
        misaligned.extend_from_slice(&5u32.to_be_bytes());
        misaligned.extend_from_slice(&[7; 10]);
        client
            .read_piece(
                Message::new_with_payload(MESSAGE_PIECE, misaligned),
                &mut piece_work,
            )
            .unwrap();
        assert_eq!(piece_work.downloaded, BLOCK_SIZE);

        // The short final block completes the piece
        let mut last = vec![];
        last.extend_from_slice(&1u32.to_be_bytes());
        last.extend_from_slice(&BLOCK_SIZE.to_be_bytes());
        last.extend_from_slice(&[8; 10]);
        client
            .read_piece(
                Message::new_with_payload(MESSAGE_PIECE, last),
                &mut piece_work,
            )
            .unwrap();
        assert_eq!(piece_work.downloaded, piece_work.length);

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_extension_handshake_and_metadata_fetch() {
        // Metadata spanning two ut_metadata pieces
        let mut info = b"d6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:".to_vec();
        info.extend_from_slice(&[0xAB; 20]);
        let mut metadata = vec![0u8; METADATA_PIECE_SIZE - 30];
        metadata.extend_from_slice(&info);

        let info_hash = info_hash_of(&metadata);
        let script = ScriptedPeer::new(info_hash.clone(), vec![0b1000_0000])
            .with_extensions(metadata.clone());
        let (addr, handle) = spawn_peer(script);

        let mut client = connect(addr, info_hash, true);
        assert!(client.peer_supports_extensions());
        client.read_bitfield().unwrap();

        client.send_extension_handshake().unwrap();
        let ut_metadata = client.read_extension_handshake().unwrap();
        assert_eq!(ut_metadata, 7);
        assert_eq!(client.metadata_extension_id(), Some(7));

        let fetched = client.fetch_metadata().unwrap();
        assert_eq!(fetched, metadata);

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_metadata_rejection() {
        let info_hash = vec![3; 20];
        let script = ScriptedPeer::new(info_hash.clone(), vec![0b1000_0000])
            .with_extensions(vec![1, 2, 3])
            .reject_metadata();
        let (addr, handle) = spawn_peer(script);

        let mut client = connect(addr, info_hash, true);
        client.read_bitfield().unwrap();
        client.send_extension_handshake().unwrap();
        client.read_extension_handshake().unwrap();

        assert!(client.fetch_metadata().is_err());

        drop(client);
        handle.join().unwrap();
    }
}
