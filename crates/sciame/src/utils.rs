//! Compact peer-address encoding shared by PEX and the peer-list ingest
//! paths (tracker responses, resume files, LPD).
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Parse a compact list of ipv4 peers, 6 bytes each: 4 for the address and 2
/// for the port, both big-endian.
pub fn from_compact_v4(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

/// Parse a compact list of ipv6 peers, 18 bytes each: 16 for the address and
/// 2 for the port, both big-endian.
pub fn from_compact_v6(buf: &[u8]) -> Vec<SocketAddr> {
    buf.chunks_exact(18)
        .map(|c| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&c[..16]);
            let port = u16::from_be_bytes([c[16], c[17]]);
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        })
        .collect()
}

/// Encode a peer address in the compact format used by PEX and trackers.
pub fn to_compact(addr: &SocketAddr, buf: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        let v4: SocketAddr = "187.45.10.2:51413".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:6881".parse().unwrap();

        let mut buf = Vec::new();
        to_compact(&v4, &mut buf);
        assert_eq!(buf.len(), 6);
        assert_eq!(from_compact_v4(&buf), vec![v4]);

        let mut buf = Vec::new();
        to_compact(&v6, &mut buf);
        assert_eq!(buf.len(), 18);
        assert_eq!(from_compact_v6(&buf), vec![v6]);
    }

    #[test]
    fn truncated_records_are_dropped() {
        // a trailing partial record never yields a bogus address
        let mut buf = Vec::new();
        to_compact(&"10.0.0.1:6881".parse().unwrap(), &mut buf);
        buf.extend_from_slice(&[1, 2, 3]);
        assert_eq!(from_compact_v4(&buf).len(), 1);
    }
}
