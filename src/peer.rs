//! # Peer Addresses
//!
//! Peers come back from the tracker in a compact binary list: 6 bytes per
//! peer, an IPv4 address followed by a big-endian port.
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! This module parses that list into [`Peer`] values and formats them back
//! into the `A.B.C.D:port` form used for display and for the `handshake`
//! command's address argument.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const PEER_SIZE: usize = 6;

type PeerId = u32;

/// A peer in the swarm.
#[derive(Clone)]
pub struct Peer {
    /// Sequential identifier used for logging
    pub id: PeerId,
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer listens on
    pub port: u16,
}

impl Peer {
    /// Build a peer from a parsed socket address.
    ///
    /// Only IPv4 peers are supported, matching the compact tracker format.
    pub fn from_addr(addr: SocketAddr) -> Result<Peer> {
        match addr.ip() {
            IpAddr::V4(ip) => Ok(Peer {
                id: 0,
                ip,
                port: addr.port(),
            }),
            IpAddr::V6(_) => Err(anyhow!("only IPv4 peers are supported")),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list received from a tracker.
///
/// # Arguments
///
/// * `compact` - Concatenated 6-byte peer entries.
///
/// # Errors
///
/// Returns an error if the list length is not a multiple of 6 bytes.
pub fn peers_from_compact(compact: &[u8]) -> Result<Vec<Peer>> {
    if compact.len() % PEER_SIZE != 0 {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let nb_peers = compact.len() / PEER_SIZE;
    let mut peers: Vec<Peer> = Vec::with_capacity(nb_peers);

    for i in 0..nb_peers {
        let entry = &compact[i * PEER_SIZE..(i + 1) * PEER_SIZE];

        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer {
            id: i as u32,
            ip,
            port,
        });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact() {
        let compact = [192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0, 80];
        let peers = peers_from_compact(&compact).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "192.168.1.1:6881");
        assert_eq!(peers[1].to_string(), "10.0.0.2:80");
        assert_eq!(peers[0].id, 0);
        assert_eq!(peers[1].id, 1);
    }

    #[test]
    fn test_parse_empty() {
        assert!(peers_from_compact(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_reject_truncated() {
        assert!(peers_from_compact(&[127, 0, 0, 1, 0]).is_err());
    }

    #[test]
    fn test_from_addr() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let peer = Peer::from_addr(addr).unwrap();
        assert_eq!(peer.to_string(), "127.0.0.1:6881");

        let addr: SocketAddr = "[::1]:6881".parse().unwrap();
        assert!(Peer::from_addr(addr).is_err());
    }
}
