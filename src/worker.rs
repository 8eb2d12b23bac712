//! # Download Worker
//!
//! One worker per peer connection. Workers share the piece queue and the
//! output buffer; everything else (the socket, the session state, the piece
//! being assembled) is owned by the worker alone.
//!
//! ## Worker Loop
//!
//! 1. **Session setup**: connect, handshake (with retries), read the
//!    bitfield, send interested
//! 2. **Acquire**: claim the lowest pending piece the peer owns; exit when
//!    none is left
//! 3. **Fetch**: request the piece block by block, up to 5 requests in
//!    flight
//! 4. **Verify**: SHA-1 the assembled piece against the torrent's digest
//! 5. **Commit**: copy the verified piece into its range of the output
//!    buffer and mark it done
//!
//! Any failure releases the in-flight piece back to the queue. A corrupt
//! piece also ends the session: the peer sent bad data and is not worth
//! keeping. The worker reports progress and its exit over a channel so the
//! coordinating thread can drive the progress display and detect
//! completion.

use crate::client::*;
use crate::message::*;
use crate::peer::*;
use crate::piece::*;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::Sender;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Maximum number of concurrent block requests per peer
const NB_REQUESTS_MAX: u32 = 5;

// Attempts at establishing a usable session before giving up on a peer
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_SECS: u64 = 5;

/// State shared between the scheduler and its workers for one download.
pub struct DownloadShared {
    /// Piece indices waiting to be fetched
    pub queue: PieceQueue,
    /// Assembly buffer for the whole payload
    pub buffer: OutputBuffer,
    /// Expected SHA-1 digest per piece
    pub hashes: Vec<Vec<u8>>,
    /// Size of each piece except possibly the last
    pub piece_length: u64,
    /// Total payload size
    pub total_length: u64,
}

impl DownloadShared {
    pub fn new(hashes: Vec<Vec<u8>>, piece_length: u64, total_length: u64) -> DownloadShared {
        DownloadShared {
            queue: PieceQueue::new(hashes.len()),
            buffer: OutputBuffer::new(total_length as usize),
            hashes,
            piece_length,
            total_length,
        }
    }

    /// Actual size of a piece; the last piece is usually shorter.
    pub fn piece_size(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.total_length);
        (end - begin) as u32
    }

    /// Byte offset of a piece in the payload.
    pub fn piece_offset(&self, index: u32) -> usize {
        (index as u64 * self.piece_length) as usize
    }
}

/// Progress reports sent by workers to the coordinating thread.
pub enum WorkerEvent {
    /// A piece was fetched, verified and written to the output buffer
    Piece { index: u32, length: u32 },
    /// The worker exited, with the error that stopped it if any
    Exited { peer: u32, error: Option<String> },
}

/// Manages downloading from a single peer.
pub struct Worker {
    /// Information about the remote peer (IP, port, ID)
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Download state shared with the scheduler and the other workers
    shared: Arc<DownloadShared>,
    /// Channel for progress and exit reports
    events: Sender<WorkerEvent>,
}

impl Worker {
    /// Create a worker for one peer.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer information including IP address and port.
    /// * `peer_id` - 20-byte identifier for this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    /// * `shared` - Queue, buffer and piece digests shared across workers.
    /// * `events` - Channel for progress and exit reports.
    ///
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        shared: Arc<DownloadShared>,
        events: Sender<WorkerEvent>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            shared,
            events,
        }
    }

    /// Run the worker to completion and report its exit.
    pub fn start_download(&self) {
        let error = self.run().err().map(|e| e.to_string());

        if let Some(ref e) = error {
            debug!("Worker for peer {:?} exiting: {}", self.peer.id, e);
        }

        let _ = self.events.send(WorkerEvent::Exited {
            peer: self.peer.id,
            error,
        });
    }

    fn run(&self) -> Result<()> {
        let mut client = self.open_session()?;

        client.send_unchoke()?;
        client.send_interested()?;

        loop {
            // Claim the lowest pending piece this peer owns
            let index = match self.shared.queue.acquire(|i| client.has_piece(i)) {
                Some(index) => index,
                None => {
                    info!("Worker for peer {:?} found no piece left to claim", self.peer.id);
                    return Ok(());
                }
            };

            let mut piece_work = PieceWork::new(
                index,
                self.shared.hashes[index as usize].clone(),
                self.shared.piece_size(index),
            );

            if let Err(e) = download_piece(&mut client, &mut piece_work) {
                self.shared.queue.release(index);
                return Err(e);
            }

            // A corrupt piece also ends the session with this peer
            if let Err(e) = verify_piece(&piece_work) {
                self.shared.queue.release(index);
                return Err(e);
            }

            self.shared
                .buffer
                .write(self.shared.piece_offset(index), &piece_work.data);
            self.shared.queue.complete(index);

            if client.send_have(index).is_err() {
                debug!("Could not notify peer {:?} of downloaded piece", self.peer.id);
            }

            let _ = self.events.send(WorkerEvent::Piece {
                index,
                length: piece_work.length,
            });
        }
    }

    /// Connect, handshake and read the bitfield, retrying a few times
    /// before declaring the peer unusable.
    fn open_session(&self) -> Result<Client> {
        let mut client = Client::new(
            self.peer.clone(),
            self.peer_id.clone(),
            self.info_hash.clone(),
            false,
        )?;
        client.set_connection_timeout(5)?;

        let mut attempt = 0;
        loop {
            match client
                .handshake_with_peer()
                .and_then(|_| client.read_bitfield())
            {
                Ok(_) => {
                    debug!("Session established with peer {:?}", self.peer.id);
                    return Ok(client);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(anyhow!(
                            "could not establish session with peer after {} attempts: {}",
                            MAX_RETRIES,
                            e
                        ));
                    }

                    debug!(
                        "Session setup failed (attempt {}/{}), retrying in {} seconds: {}",
                        attempt, MAX_RETRIES, RETRY_DELAY_SECS, e
                    );
                    thread::sleep(Duration::from_secs(RETRY_DELAY_SECS));
                    client.reconnect()?;
                }
            }
        }
    }
}

/// Fetch one piece from a connected, interested session.
///
/// Keeps up to 5 block requests in flight while unchoked. A choke abandons
/// the outstanding requests; every unreceived block is reissued once the
/// peer unchokes again.
///
/// # Arguments
///
/// * `client` - A client connected to a remote peer.
/// * `piece_work` - The piece to download.
///
pub fn download_piece(client: &mut Client, piece_work: &mut PieceWork) -> Result<()> {
    // Generous timeout while blocks are in flight
    client.set_connection_timeout(30)?;

    piece_work.reset();

    while piece_work.downloaded < piece_work.length {
        if !client.is_choked() {
            while piece_work.requests < NB_REQUESTS_MAX && piece_work.requested < piece_work.length
            {
                let remaining = piece_work.length - piece_work.requested;
                let block_size = remaining.min(BLOCK_SIZE);

                client.send_request(piece_work.index, piece_work.requested, block_size)?;

                piece_work.requests += 1;
                piece_work.requested += block_size;
            }
        }

        let message: Message = client.read_message()?;

        match message.id {
            MESSAGE_CHOKE => {
                client.read_choke();
                // Outstanding requests are dead; restart them after unchoke
                piece_work.reset();
                warn!("Peer choked us, waiting for unchoke");
            }
            MESSAGE_UNCHOKE => {
                client.read_unchoke();
                debug!("Peer unchoked us, resuming requests");
            }
            MESSAGE_HAVE => client.read_have(message)?,
            MESSAGE_PIECE => client.read_piece(message, piece_work)?,
            MESSAGE_KEEPALIVE => debug!("Received keep-alive from peer"),
            _ => debug!("Ignoring message {} during piece download", message.id),
        }
    }

    info!("Successfully downloaded piece {:?}", piece_work.index);

    Ok(())
}

/// Check a downloaded piece against its published digest.
///
/// # Arguments
///
/// * `piece_work` - The fully downloaded piece.
///
pub fn verify_piece(piece_work: &PieceWork) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(&piece_work.data);
    let hash = hasher.finish().to_vec();

    if hash != piece_work.hash {
        return Err(anyhow!(
            "piece {} downloaded from peer failed hash verification",
            piece_work.index
        ));
    }

    debug!(
        "Successfully verified integrity of piece {:?}",
        piece_work.index
    );

    Ok(())
}
