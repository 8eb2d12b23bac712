//! # Torrent Management
//!
//! Parses torrent metainfo, discovers peers and coordinates the download.
//!
//! ## Metainfo
//!
//! A torrent file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URLs for peer discovery
//! - **info**: dictionary with `length`, `name`, `piece length` and
//!   `pieces`, the concatenated 20-byte SHA-1 digests of every piece
//!
//! The info-hash identifying the torrent is the SHA-1 of the `info`
//! dictionary exactly as it appears in the file. The raw byte span is
//! located with the bencode cursor and hashed as-is; re-encoding a parsed
//! struct could reorder or reframe fields and change the hash.
//!
//! ## Download Coordination
//!
//! The scheduler fills a piece queue, spawns up to four workers (one peer
//! each, every worker on its own thread) and then drives the progress bar
//! off their event channel. Workers fetch, verify and commit pieces into
//! the shared output buffer; the scheduler joins them all and hands the
//! assembled payload back only when no piece is left undone.

use crate::bencode;
use crate::client::Client;
use crate::peer::Peer;
use crate::piece::PieceWork;
use crate::tracker;
use crate::worker::{self, DownloadShared, Worker, WorkerEvent};

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use crossbeam_channel::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bytes::ByteBuf;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

// Size of SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

// Worker pool size; fewer workers run when the tracker returns fewer peers
const NB_WORKERS_MAX: usize = 4;

/// A torrent and everything needed to download it.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 hash per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u64,
    /// Total size of the file in bytes
    length: u64,
    /// Suggested filename from the metadata
    name: String,
    /// 20-byte identifier for this client instance, fresh every run
    peer_id: Vec<u8>,
    /// Peers discovered from the trackers
    peers: Vec<Peer>,
}

/// BencodeInfo structure.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u64,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u64,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
}

/// BencodeTorrent structure.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    // URL of the tracker
    announce: String,
    #[serde(rename = "announce-list", default)]
    // List of tracker URL tiers
    announce_list: Vec<Vec<String>>,
    // Informations about file
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Split the concatenated digests into one hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let pieces = &self.pieces;

        if pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(anyhow!("torrent piece hashes are invalid"));
        }

        Ok(pieces
            .chunks(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

/// Generate a random 20-byte peer id for this run.
pub(crate) fn generate_peer_id() -> Vec<u8> {
    let mut peer_id: Vec<u8> = vec![0; 20];
    let mut rng = rand::thread_rng();
    for byte in peer_id.iter_mut() {
        *byte = rng.gen();
    }
    peer_id
}

impl Torrent {
    /// Open a torrent file.
    ///
    /// Parses the metainfo and computes the info-hash over the original
    /// `info` bytes. Peers are not contacted until
    /// [`discover_peers`](Torrent::discover_peers).
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the torrent.
    ///
    pub fn open(filepath: PathBuf) -> Result<Torrent> {
        let buf = match fs::read(&filepath) {
            Ok(buf) => buf,
            Err(_) => return Err(anyhow!("could not read torrent file")),
        };

        let bencode = match de::from_bytes::<BencodeTorrent>(&buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent file")),
        };

        // Hash the info dictionary exactly as published
        let raw_info = bencode::raw_dict_value(&buf, b"info")?
            .ok_or_else(|| anyhow!("torrent has no info dictionary"))?;
        let mut hasher = Sha1::new();
        hasher.update(raw_info);
        let info_hash = hasher.finish().to_vec();

        // Collect tracker tiers, shuffled within each tier as per BEP 12
        let tiers = if !bencode.announce_list.is_empty() {
            let mut tiers = bencode.announce_list.clone();
            let mut rng = rand::thread_rng();
            for tier in &mut tiers {
                tier.shuffle(&mut rng);
            }
            tiers
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce.clone()]]
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        };

        Torrent::build(
            tiers,
            info_hash,
            bencode.info,
            generate_peer_id(),
        )
    }

    /// Build a torrent from metadata fetched over the extension protocol.
    ///
    /// `info_bytes` must already be verified against the expected
    /// info-hash; the `peer_id` is the one already used for the bootstrap
    /// tracker query, so the whole run presents a single identity.
    ///
    /// # Arguments
    ///
    /// * `trackers` - Tracker URLs from the magnet link.
    /// * `info_bytes` - The raw bencoded info dictionary.
    /// * `peer_id` - The 20-byte id already in use for this run.
    ///
    pub fn from_metadata(trackers: Vec<String>, info_bytes: &[u8], peer_id: Vec<u8>) -> Result<Torrent> {
        let info = match de::from_bytes::<BencodeInfo>(info_bytes) {
            Ok(info) => info,
            Err(_) => return Err(anyhow!("could not decode metadata received from peer")),
        };

        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let info_hash = hasher.finish().to_vec();

        Torrent::build(vec![trackers], info_hash, info, peer_id)
    }

    fn build(
        tiers: Vec<Vec<String>>,
        info_hash: Vec<u8>,
        info: BencodeInfo,
        peer_id: Vec<u8>,
    ) -> Result<Torrent> {
        let pieces_hashes = info.split_pieces_hashes()?;

        if info.piece_length == 0 {
            return Err(anyhow!("torrent has invalid piece length"));
        }

        // num_pieces = ceil(length / piece_length) must match the digests
        let nb_pieces = info.length.div_ceil(info.piece_length) as usize;
        if nb_pieces != pieces_hashes.len() {
            return Err(anyhow!(
                "torrent has {} piece hashes but length implies {}",
                pieces_hashes.len(),
                nb_pieces
            ));
        }

        Ok(Torrent {
            tiers,
            info_hash,
            pieces_hashes,
            piece_length: info.piece_length,
            length: info.length,
            name: info.name,
            peer_id,
            peers: vec![],
        })
    }

    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the first tracker URL.
    pub fn announce(&self) -> &str {
        &self.tiers[0][0]
    }

    /// Returns the 20-byte info-hash.
    pub fn info_hash(&self) -> &[u8] {
        &self.info_hash
    }

    /// Returns the total file size in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns the piece size in bytes.
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Returns the per-piece SHA-1 digests.
    pub fn pieces_hashes(&self) -> &[Vec<u8>] {
        &self.pieces_hashes
    }

    /// Returns the peer id used for this run.
    pub fn peer_id(&self) -> &[u8] {
        &self.peer_id
    }

    /// Returns the peers discovered from the trackers.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Query all trackers and store the discovered peers.
    pub fn discover_peers(&mut self) -> Result<()> {
        let announce_urls: Vec<String> = self.tiers.iter().flatten().cloned().collect();

        self.peers = tracker::request_peers(
            &announce_urls,
            &self.info_hash,
            &self.peer_id,
            self.length,
        )?;

        Ok(())
    }

    /// Download the whole file.
    ///
    /// Spawns up to four workers, one per peer, and returns the assembled
    /// payload once every piece has been fetched and verified. Fails when
    /// all workers have exited with pieces still undone.
    pub fn download(&self) -> Result<Vec<u8>> {
        if self.peers.is_empty() {
            return Err(anyhow!("no peers available for download"));
        }

        println!(
            "Downloading {:?} ({:?} pieces)",
            self.name,
            self.pieces_hashes.len(),
        );

        let shared = Arc::new(DownloadShared::new(
            self.pieces_hashes.clone(),
            self.piece_length,
            self.length,
        ));

        // Workers report progress and exits over this channel
        let (event_tx, event_rx) = unbounded();

        let nb_workers = self.peers.len().min(NB_WORKERS_MAX);
        let mut handles = Vec::with_capacity(nb_workers);
        for peer in self.peers.iter().take(nb_workers) {
            let worker = Worker::new(
                peer.clone(),
                self.peer_id.clone(),
                self.info_hash.clone(),
                Arc::clone(&shared),
                event_tx.clone(),
            );

            handles.push(thread::spawn(move || {
                worker.start_download();
            }));
        }
        drop(event_tx);

        // Create progress bar
        let pb = ProgressBar::new(self.length);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut exited = 0;
        let mut last_error: Option<String> = None;
        while exited < nb_workers {
            match event_rx.recv() {
                Ok(WorkerEvent::Piece { length, .. }) => pb.inc(length as u64),
                Ok(WorkerEvent::Exited { peer, error }) => {
                    exited += 1;
                    if let Some(e) = error {
                        warn!("Worker for peer {:?} failed: {}", peer, e);
                        last_error = Some(e);
                    }
                }
                Err(_) => break,
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        pb.finish_and_clear();

        let remaining = shared.queue.remaining();
        if remaining > 0 {
            return Err(anyhow!(
                "download incomplete, {} pieces missing (last worker error: {})",
                remaining,
                last_error.unwrap_or_else(|| "none".to_string())
            ));
        }

        Ok(shared.buffer.take())
    }

    /// Download a single verified piece.
    ///
    /// Tries the discovered peers in order until one serves the piece.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece index.
    ///
    pub fn download_piece(&self, index: u32) -> Result<Vec<u8>> {
        if index as usize >= self.pieces_hashes.len() {
            return Err(anyhow!("piece index {} is out of range", index));
        }
        if self.peers.is_empty() {
            return Err(anyhow!("no peers available for download"));
        }

        let mut last_error = anyhow!("no peer served piece {}", index);

        for peer in &self.peers {
            let mut piece_work = PieceWork::new(
                index,
                self.pieces_hashes[index as usize].clone(),
                self.get_piece_length(index),
            );

            match self.fetch_piece_from(peer.clone(), &mut piece_work) {
                Ok(_) => return Ok(piece_work.data),
                Err(e) => {
                    debug!("Peer {:?} did not serve piece {}: {}", peer.id, index, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Run a one-piece session against a single peer.
    fn fetch_piece_from(&self, peer: Peer, piece_work: &mut PieceWork) -> Result<()> {
        let mut client = Client::new(peer, self.peer_id.clone(), self.info_hash.clone(), false)?;
        client.set_connection_timeout(5)?;
        client.handshake_with_peer()?;
        client.read_bitfield()?;

        if !client.has_piece(piece_work.index) {
            return Err(anyhow!("peer does not have piece {}", piece_work.index));
        }

        client.send_unchoke()?;
        client.send_interested()?;

        worker::download_piece(&mut client, piece_work)?;
        worker::verify_piece(piece_work)
    }

    /// Get the actual length of a piece; the last one is usually shorter.
    ///
    /// # Arguments
    ///
    /// * `index` - The piece index.
    ///
    pub fn get_piece_length(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        (end - begin) as u32
    }
}
