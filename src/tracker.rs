//! # Tracker Client
//!
//! Peer discovery over HTTP. Every announce URL gets a GET request with the
//! torrent identity and our transfer state:
//!
//! ```text
//! info_hash=<20 raw bytes, percent-encoded>
//! peer_id=<20 raw bytes, percent-encoded>
//! port=6881 uploaded=0 downloaded=0 left=<bytes remaining> compact=1
//! ```
//!
//! The bencoded response carries a compact `peers` byte string, 6 bytes per
//! peer. All trackers are queried in parallel with a 15 second timeout;
//! failing trackers are skipped and only an empty overall result is an
//! error. During a magnet bootstrap the payload length is still unknown, so
//! callers pass a placeholder `left` value.

use crate::peer::{peers_from_compact, Peer};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_bencode::de;
use serde_bytes::ByteBuf;
use url::Url;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Port reported to trackers as the one we listen on.
pub const PORT: u16 = 6881;

/// BencodeTracker structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Interval time to refresh the list of peers in seconds
    #[serde(default)]
    interval: u32,
    // Compact peer list
    peers: ByteBuf,
}

/// Request peers from every tracker in parallel.
///
/// # Arguments
///
/// * `announce_urls` - Tracker URLs, already flattened across tiers.
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `peer_id` - The 20-byte id used for every query and handshake this run.
/// * `left` - Bytes left to download, as reported to the tracker.
///
pub fn request_peers(
    announce_urls: &[String],
    info_hash: &[u8],
    peer_id: &[u8],
    left: u64,
) -> Result<Vec<Peer>> {
    // Deduplicate URLs across tiers
    let mut unique_urls = HashSet::new();
    for url in announce_urls {
        unique_urls.insert(url.clone());
    }

    if unique_urls.is_empty() {
        return Err(anyhow!("no tracker URLs available"));
    }

    // Shared storage for peer bytes from successful tracker responses
    let all_peers_bytes = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    for tracker_url in unique_urls {
        let info_hash = info_hash.to_vec();
        let peer_id = peer_id.to_vec();
        let all_peers_bytes = Arc::clone(&all_peers_bytes);

        let handle = thread::spawn(move || {
            let full_url = match build_tracker_url(&info_hash, &tracker_url, &peer_id, left) {
                Ok(url) => url,
                Err(_) => return, // skip on error
            };

            let client = match reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
            {
                Ok(client) => client,
                Err(_) => return,
            };

            let response = match client.get(&full_url).send() {
                Ok(response) => match response.bytes() {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                },
                Err(_) => return,
            };

            let tracker_bencode = match de::from_bytes::<BencodeTracker>(&response) {
                Ok(bencode) => bencode,
                Err(_) => return,
            };

            debug!(
                "Tracker {} returned {} peer bytes",
                tracker_url,
                tracker_bencode.peers.len()
            );

            if let Ok(mut guard) = all_peers_bytes.lock() {
                guard.push(tracker_bencode.peers.to_vec());
            }
        });

        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    // Collect peers from all responses
    let all_peers_bytes = all_peers_bytes.lock().unwrap();
    let mut all_peers = Vec::new();
    for peers_bytes in all_peers_bytes.iter() {
        match peers_from_compact(peers_bytes) {
            Ok(mut peers) => all_peers.append(&mut peers),
            Err(_) => continue, // skip invalid responses
        }
    }

    if all_peers.is_empty() {
        return Err(anyhow!("could not get peers from any tracker"));
    }

    // Deduplicate peers by (ip, port) and assign sequential ids
    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    for peer in all_peers {
        if seen.insert((peer.ip, peer.port)) {
            peers.push(peer);
        }
    }
    for (i, peer) in peers.iter_mut().enumerate() {
        peer.id = i as u32;
    }

    info!("Discovered {} peers from trackers", peers.len());

    Ok(peers)
}

/// Build the announce URL with its query string.
///
/// The info-hash and peer id are raw bytes, so they are percent-encoded by
/// hand rather than through a text-based encoder.
fn build_tracker_url(
    info_hash: &[u8],
    announce: &str,
    peer_id: &[u8],
    left: u64,
) -> Result<String> {
    // Each byte becomes %XX
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    let base_url = match Url::parse(announce) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse tracker url")),
    };

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        PORT,
        left
    );

    let mut url = base_url.to_string();
    if url.contains('?') {
        url.push('&');
    } else {
        url.push('?');
    }
    url.push_str(&query);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tracker_url() {
        let info_hash = [0x12, 0xAF, 0x00].as_slice();
        let peer_id = [b'a', b'b'].as_slice();

        let url =
            build_tracker_url(info_hash, "http://tracker.example.com/announce", peer_id, 42)
                .unwrap();

        assert!(url.starts_with("http://tracker.example.com/announce?"));
        assert!(url.contains("info_hash=%12%AF%00"));
        assert!(url.contains("peer_id=%61%62"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("left=42"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn test_build_tracker_url_with_existing_query() {
        let url = build_tracker_url(&[1], "http://tracker.example.com/announce?key=abc", &[2], 0)
            .unwrap();
        assert!(url.contains("announce?key=abc&info_hash="));
    }

    #[test]
    fn test_build_tracker_url_invalid() {
        assert!(build_tracker_url(&[1], "not a url", &[2], 0).is_err());
    }

    #[test]
    fn test_request_peers_without_urls() {
        assert!(request_peers(&[], &[0; 20], &[0; 20], 0).is_err());
    }
}
