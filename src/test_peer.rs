//! Scripted peer for socket-level tests.
//!
//! Binds a real TCP listener on a loopback port and serves one connection
//! with canned protocol behavior: handshake echo, bitfield announcement,
//! unchoke-on-interested, block requests answered from a payload, and
//! optionally the extension handshake plus ut_metadata responses.

use crate::bencode::{self, Bencode};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

// The ut_metadata id the scripted peer publishes for itself
const SCRIPTED_UT_METADATA_ID: u8 = 7;

const METADATA_PIECE_SIZE: usize = 16384;

/// Canned behavior for one scripted peer.
pub struct ScriptedPeer {
    info_hash: Vec<u8>,
    bitfield: Vec<u8>,
    payload: Vec<u8>,
    piece_length: u32,
    extensions: bool,
    metadata: Vec<u8>,
    reject_metadata: bool,
    corrupt_blocks: bool,
}

impl ScriptedPeer {
    pub fn new(info_hash: Vec<u8>, bitfield: Vec<u8>) -> ScriptedPeer {
        ScriptedPeer {
            info_hash,
            bitfield,
            payload: vec![],
            piece_length: 0,
            extensions: false,
            metadata: vec![],
            reject_metadata: false,
            corrupt_blocks: false,
        }
    }

    /// Serve block requests from `payload`, split into `piece_length` pieces.
    pub fn with_payload(mut self, payload: Vec<u8>, piece_length: u32) -> ScriptedPeer {
        self.payload = payload;
        self.piece_length = piece_length;
        self
    }

    /// Advertise the extension protocol and serve `metadata` via ut_metadata.
    pub fn with_extensions(mut self, metadata: Vec<u8>) -> ScriptedPeer {
        self.extensions = true;
        self.metadata = metadata;
        self
    }

    /// Answer every metadata request with a rejection.
    pub fn reject_metadata(mut self) -> ScriptedPeer {
        self.reject_metadata = true;
        self
    }

    /// Flip a byte in every served block so piece verification fails.
    pub fn corrupt_blocks(mut self) -> ScriptedPeer {
        self.corrupt_blocks = true;
        self
    }
}

/// Start the scripted peer and return its address and thread handle.
///
/// The thread serves a single connection and returns when the client hangs
/// up or after an idle timeout.
pub fn spawn_peer(script: ScriptedPeer) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (conn, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let _ = serve(conn, &script);
    });

    (addr, handle)
}

fn serve(mut conn: TcpStream, script: &ScriptedPeer) -> std::io::Result<()> {
    conn.set_read_timeout(Some(Duration::from_secs(10)))?;

    // Handshake: read the client's 68 bytes, answer with our own
    let mut handshake = [0u8; 68];
    conn.read_exact(&mut handshake)?;

    let mut response = vec![0x13];
    response.extend_from_slice(b"BitTorrent protocol");
    let mut reserved = [0u8; 8];
    if script.extensions {
        reserved[5] |= 0x10;
    }
    response.extend_from_slice(&reserved);
    response.extend_from_slice(&script.info_hash);
    response.extend_from_slice(&[b'T'; 20]);
    conn.write_all(&response)?;

    // Announce which pieces we have
    send_frame(&mut conn, 5, &script.bitfield)?;

    loop {
        let length = match conn.read_u32::<BigEndian>() {
            Ok(length) => length as usize,
            Err(_) => return Ok(()),
        };
        if length == 0 {
            continue;
        }

        let mut frame = vec![0u8; length];
        conn.read_exact(&mut frame)?;

        match frame[0] {
            // interested: unchoke the client
            2 => send_frame(&mut conn, 1, &[])?,
            // request: serve the block out of the payload
            6 => {
                let mut cursor = Cursor::new(&frame[1..13]);
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let block_len = cursor.read_u32::<BigEndian>()? as usize;

                let offset = (index * script.piece_length + begin) as usize;
                let mut block = script.payload[offset..offset + block_len].to_vec();
                if script.corrupt_blocks {
                    block[0] ^= 0xFF;
                }

                let mut payload = vec![];
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&block);
                send_frame(&mut conn, 7, &payload)?;
            }
            // extended: extension handshake or ut_metadata exchange
            20 => match frame[1] {
                0 => {
                    let mut names: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
                    names.insert(
                        b"ut_metadata".to_vec(),
                        Bencode::Int(SCRIPTED_UT_METADATA_ID as i64),
                    );
                    let mut entries: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
                    entries.insert(b"m".to_vec(), Bencode::Dict(names));

                    let mut payload = vec![0];
                    payload.extend_from_slice(&bencode::encode(&Bencode::Dict(entries)));
                    send_frame(&mut conn, 20, &payload)?;
                }
                SCRIPTED_UT_METADATA_ID => {
                    let request = bencode::decode(&frame[2..]).unwrap();
                    let piece = request.get(b"piece").unwrap().as_int().unwrap();

                    let mut entries: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
                    let mut payload = vec![1];

                    if script.reject_metadata {
                        entries.insert(b"msg_type".to_vec(), Bencode::Int(2));
                        entries.insert(b"piece".to_vec(), Bencode::Int(piece));
                        payload.extend_from_slice(&bencode::encode(&Bencode::Dict(entries)));
                    } else {
                        let begin = piece as usize * METADATA_PIECE_SIZE;
                        let end = (begin + METADATA_PIECE_SIZE).min(script.metadata.len());

                        entries.insert(b"msg_type".to_vec(), Bencode::Int(1));
                        entries.insert(b"piece".to_vec(), Bencode::Int(piece));
                        entries.insert(
                            b"total_size".to_vec(),
                            Bencode::Int(script.metadata.len() as i64),
                        );
                        payload.extend_from_slice(&bencode::encode(&Bencode::Dict(entries)));
                        payload.extend_from_slice(&script.metadata[begin..end]);
                    }

                    send_frame(&mut conn, 20, &payload)?;
                }
                _ => {}
            },
            // choke/unchoke/have/keep-alive and anything else: ignore
            _ => {}
        }
    }
}

fn send_frame(conn: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    conn.write_u32::<BigEndian>(1 + payload.len() as u32)?;
    conn.write_all(&[id])?;
    conn.write_all(payload)
}
