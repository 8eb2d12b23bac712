//! # Magnet Links
//!
//! A magnet link carries just enough to join a swarm without a torrent
//! file: the info-hash, optionally a display name and tracker URLs.
//!
//! ```text
//! magnet:?xt=urn:btih:<40-hex-info-hash>&dn=<name>&tr=<tracker>
//! ```
//!
//! Parameters may appear in any order and `tr` may repeat; the first
//! tracker is used for the bootstrap. The missing metainfo (piece size,
//! length, piece digests) is fetched from a peer over the ut_metadata
//! extension and verified against the info-hash, after which a magnet
//! download proceeds exactly like a torrent-file download.

use crate::client::Client;
use crate::peer::Peer;
use crate::torrent::{generate_peer_id, Torrent};
use crate::tracker;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use url::Url;

// Reported to trackers as bytes left while the real length is unknown
const BOOTSTRAP_LEFT: u64 = 999;

/// A parsed magnet link.
pub struct Magnet {
    /// 20-byte info-hash from the `xt` parameter
    info_hash: Vec<u8>,
    /// Display name, if the link carries one
    name: Option<String>,
    /// Tracker URLs from the `tr` parameters, in link order
    trackers: Vec<String>,
}

impl Magnet {
    /// Parse a magnet link.
    ///
    /// # Arguments
    ///
    /// * `link` - The magnet URI.
    ///
    pub fn parse(link: &str) -> Result<Magnet> {
        let url = match Url::parse(link) {
            Ok(url) => url,
            Err(_) => return Err(anyhow!("could not parse magnet link")),
        };

        if url.scheme() != "magnet" {
            return Err(anyhow!("link is not a magnet link"));
        }

        let mut info_hash: Option<Vec<u8>> = None;
        let mut name: Option<String> = None;
        let mut trackers: Vec<String> = vec![];

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let hex_hash = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| anyhow!("magnet link xt is not a btih urn"))?;
                    if hex_hash.len() != 40 {
                        return Err(anyhow!("magnet link info hash has invalid length"));
                    }
                    let hash = hex::decode(hex_hash)
                        .map_err(|_| anyhow!("magnet link info hash is not valid hex"))?;
                    info_hash = Some(hash);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => debug!("Ignoring magnet link parameter {:?}", key),
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| anyhow!("magnet link has no info hash (xt parameter)"))?;

        Ok(Magnet {
            info_hash,
            name,
            trackers,
        })
    }

    /// Returns the 20-byte info-hash.
    pub fn info_hash(&self) -> &[u8] {
        &self.info_hash
    }

    /// Returns the display name, if any.
    #[allow(dead_code)]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the tracker used for the bootstrap.
    pub fn announce(&self) -> Result<&str> {
        self.trackers
            .first()
            .map(|tracker| tracker.as_str())
            .ok_or_else(|| anyhow!("magnet link has no tracker (tr parameter)"))
    }

    /// Discover peers and establish an extension-capable session.
    ///
    /// Queries the tracker with a placeholder `left` (the real length is
    /// unknown until the metadata arrives), then tries peers in order until
    /// one completes the handshake with extension support and publishes a
    /// ut_metadata id. Returns the live session and the peer id used, so
    /// later tracker queries keep the same identity.
    pub fn connect(&self) -> Result<(Client, Vec<u8>)> {
        let announce = self.announce()?.to_string();
        let peer_id = generate_peer_id();

        let peers = tracker::request_peers(
            &[announce],
            &self.info_hash,
            &peer_id,
            BOOTSTRAP_LEFT,
        )?;

        let mut last_error = anyhow!("no peer with extension support available");

        for peer in peers {
            match self.extension_session(peer, &peer_id) {
                Ok(client) => return Ok((client, peer_id)),
                Err(e) => {
                    debug!("Bootstrap peer unusable: {}", e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn extension_session(&self, peer: Peer, peer_id: &[u8]) -> Result<Client> {
        let mut client = Client::new(peer, peer_id.to_vec(), self.info_hash.clone(), true)?;
        client.set_connection_timeout(5)?;
        client.handshake_with_peer()?;

        if !client.peer_supports_extensions() {
            return Err(anyhow!("peer does not support the extension protocol"));
        }

        client.read_bitfield()?;
        client.send_extension_handshake()?;
        client.read_extension_handshake()?;

        Ok(client)
    }

    /// Bootstrap the full metainfo via ut_metadata.
    ///
    /// The fetched metadata must SHA-1 to the link's info-hash before it is
    /// trusted as the info dictionary.
    pub fn fetch_info(&self) -> Result<Torrent> {
        let (mut client, peer_id) = self.connect()?;

        let metadata = client.fetch_metadata()?;

        let mut hasher = Sha1::new();
        hasher.update(&metadata);
        if hasher.finish().to_vec() != self.info_hash {
            return Err(anyhow!("metadata received from peer failed hash verification"));
        }

        Torrent::from_metadata(self.trackers.clone(), &metadata, peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HASH: &str = "ad42ce8109f54c99613ce38f9b4d87e70f24a165";

    #[test]
    fn test_parse_full_link() {
        let link = format!(
            "magnet:?xt=urn:btih:{}&dn=sample.txt&tr=http%3A%2F%2Ftracker.example%2Fannounce",
            SAMPLE_HASH
        );
        let magnet = Magnet::parse(&link).unwrap();

        assert_eq!(hex::encode(magnet.info_hash()), SAMPLE_HASH);
        assert_eq!(magnet.name(), Some("sample.txt"));
        assert_eq!(magnet.announce().unwrap(), "http://tracker.example/announce");
    }

    #[test]
    fn test_parse_reordered_parameters() {
        let link = format!(
            "magnet:?tr=http%3A%2F%2Ftracker.example%2Fannounce&dn=sample.txt&xt=urn:btih:{}",
            SAMPLE_HASH
        );
        let magnet = Magnet::parse(&link).unwrap();
        assert_eq!(hex::encode(magnet.info_hash()), SAMPLE_HASH);
    }

    #[test]
    fn test_parse_multiple_trackers_first_wins() {
        let link = format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Ffirst.example&tr=http%3A%2F%2Fsecond.example",
            SAMPLE_HASH
        );
        let magnet = Magnet::parse(&link).unwrap();
        assert_eq!(magnet.announce().unwrap(), "http://first.example");
    }

    #[test]
    fn test_parse_without_tracker() {
        let link = format!("magnet:?xt=urn:btih:{}", SAMPLE_HASH);
        let magnet = Magnet::parse(&link).unwrap();
        assert!(magnet.announce().is_err());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        // Missing info hash
        assert!(Magnet::parse("magnet:?dn=sample.txt").is_err());
        // Wrong scheme
        assert!(Magnet::parse(&format!("http:?xt=urn:btih:{}", SAMPLE_HASH)).is_err());
        // Truncated hash
        assert!(Magnet::parse("magnet:?xt=urn:btih:abcdef").is_err());
        // Non-hex hash
        let bad = "z".repeat(40);
        assert!(Magnet::parse(&format!("magnet:?xt=urn:btih:{}", bad)).is_err());
        // Not a btih urn
        assert!(Magnet::parse(&format!("magnet:?xt=urn:sha1:{}", SAMPLE_HASH)).is_err());
        // Not a URL at all
        assert!(Magnet::parse("sample.torrent").is_err());
    }
}
