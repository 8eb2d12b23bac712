//! # Magpie BitTorrent Client
//!
//! A command-line BitTorrent client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Multi-peer concurrent downloading with piece verification
//! - Magnet link support via the ut_metadata extension
//! - Bencode inspection commands for torrent debugging
//!
//! ## Usage
//!
//! ```bash
//! magpie info <torrent>
//! magpie download -o <output> <torrent>
//! magpie magnet_info <magnet-link>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads metainfo, coordinates the
//!   download and the progress display
//! - **Worker threads**: Each drives the session with one peer, pulling
//!   piece indices from a shared queue
//! - **Shared state**: A mutex-guarded piece queue and an output buffer of
//!   disjoint per-piece ranges
//!
//! Structured command output goes to stdout; diagnostics and errors go to
//! stderr, and the process exits nonzero on any failure.

#[macro_use]
extern crate log;

mod bencode;
mod client;
mod handshake;
mod magnet;
mod message;
mod peer;
mod piece;
#[cfg(test)]
mod test_peer;
mod torrent;
mod tracker;
mod worker;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use client::Client;
use magnet::Magnet;
use peer::Peer;
use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// The bencoded value
        value: String,
    },

    /// Print the metainfo of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Print the peers returned by the trackers
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Handshake with a peer and print its id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },

    /// Download a single verified piece
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Zero-based piece index
        piece: u32,
    },

    /// Download the whole file
    Download {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Parse a magnet link and print its tracker and info hash
    #[command(name = "magnet_parse")]
    MagnetParse {
        /// The magnet link
        link: String,
    },

    /// Handshake with extension support and print the peer's ids
    #[command(name = "magnet_handshake")]
    MagnetHandshake {
        /// The magnet link
        link: String,
    },

    /// Fetch the metainfo over ut_metadata and print it
    #[command(name = "magnet_info")]
    MagnetInfo {
        /// The magnet link
        link: String,
    },

    /// Download a single verified piece via a magnet link
    #[command(name = "magnet_download_piece")]
    MagnetDownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// The magnet link
        link: String,
        /// Zero-based piece index
        piece: u32,
    },

    /// Download the whole file via a magnet link
    #[command(name = "magnet_download")]
    MagnetDownload {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// The magnet link
        link: String,
    },
}

/// Print the metainfo fields the way `info` and `magnet_info` report them.
fn print_torrent_info(torrent: &Torrent) {
    println!("Tracker URL: {}", torrent.announce());
    println!("Length: {}", torrent.length());
    println!("Info Hash: {}", hex::encode(torrent.info_hash()));
    println!("Piece Length: {}", torrent.piece_length());
    println!("Piece Hashes:");
    for hash in torrent.pieces_hashes() {
        println!("{}", hex::encode(hash));
    }
}

/// Write a downloaded artifact to the user-supplied path.
fn save_output(path: &Path, data: &[u8]) -> Result<()> {
    if let Err(e) = fs::write(path, data) {
        return Err(anyhow!(
            "could not write data to file '{}': {}",
            path.display(),
            e
        ));
    }

    println!("Saved in \"{}\".", path.display());

    Ok(())
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Decode { value } => {
            let decoded = bencode::decode(value.as_bytes())?;
            println!("{}", decoded.to_json());
        }

        Command::Info { torrent } => {
            let torrent = Torrent::open(torrent)?;
            print_torrent_info(&torrent);
        }

        Command::Peers { torrent } => {
            let mut torrent = Torrent::open(torrent)?;
            torrent.discover_peers()?;
            for peer in torrent.peers() {
                println!("{}", peer);
            }
        }

        Command::Handshake { torrent, peer } => {
            let torrent = Torrent::open(torrent)?;

            let addr = peer
                .parse()
                .map_err(|_| anyhow!("could not parse peer address '{}'", peer))?;
            let peer = Peer::from_addr(addr)?;

            let mut client = Client::new(
                peer,
                torrent.peer_id().to_vec(),
                torrent.info_hash().to_vec(),
                false,
            )?;
            client.set_connection_timeout(15)?;
            client.handshake_with_peer()?;

            println!("Peer ID: {}", hex::encode(client.remote_peer_id()));
        }

        Command::DownloadPiece {
            output,
            torrent,
            piece,
        } => {
            let mut torrent = Torrent::open(torrent)?;
            torrent.discover_peers()?;

            let data = torrent.download_piece(piece)?;
            save_output(&output, &data)?;
        }

        Command::Download { output, torrent } => {
            let mut torrent = Torrent::open(torrent)?;
            torrent.discover_peers()?;

            let data = torrent.download()?;
            save_output(&output, &data)?;
        }

        Command::MagnetParse { link } => {
            let magnet = Magnet::parse(&link)?;
            println!("Tracker URL: {}", magnet.announce()?);
            println!("Info Hash: {}", hex::encode(magnet.info_hash()));
        }

        Command::MagnetHandshake { link } => {
            let magnet = Magnet::parse(&link)?;
            let (client, _) = magnet.connect()?;

            let ut_metadata = client
                .metadata_extension_id()
                .ok_or_else(|| anyhow!("peer did not publish a ut_metadata id"))?;

            println!("Peer ID: {}", hex::encode(client.remote_peer_id()));
            println!("Peer Metadata Extension ID: {}", ut_metadata);
        }

        Command::MagnetInfo { link } => {
            let magnet = Magnet::parse(&link)?;
            let torrent = magnet.fetch_info()?;
            print_torrent_info(&torrent);
        }

        Command::MagnetDownloadPiece {
            output,
            link,
            piece,
        } => {
            let magnet = Magnet::parse(&link)?;
            let mut torrent = magnet.fetch_info()?;
            torrent.discover_peers()?;

            let data = torrent.download_piece(piece)?;
            save_output(&output, &data)?;
        }

        Command::MagnetDownload { output, link } => {
            let magnet = Magnet::parse(&link)?;
            let mut torrent = magnet.fetch_info()?;
            torrent.discover_peers()?;

            let data = torrent.download()?;
            save_output(&output, &data)?;
        }
    }

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
