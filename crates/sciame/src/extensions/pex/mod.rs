//! Peer exchange (BEP 11).
//!
//! Connected peers that both advertise `ut_pex` gossip their swarm view to
//! each other: compact lists of addresses that appeared and disappeared
//! since the previous message, plus one flags byte per added peer.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
};

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::{AsString, SingleItemEncoder, ToBencode},
};

use super::{extended::ExtMsg, UT_PEX_ID};
use crate::utils::{from_compact_v4, from_compact_v6, to_compact};

/// Cap on added and dropped entries per message and address family.
pub const MAX_PEX_PEER_COUNT: usize = 50;

/// Per-peer capability flags carried in `added.f` / `added6.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PexFlags {
    /// Peer prefers encrypted connections.
    pub encryption: bool,
    /// Peer is a seeder or partial seed.
    pub seed: bool,
    /// Peer supports uTP.
    pub utp: bool,
    /// Peer supports the holepunch extension.
    pub holepunch: bool,
    /// Peer is known to accept incoming connections.
    pub connectable: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
            utp: b & 0x04 != 0,
            holepunch: b & 0x08 != 0,
            connectable: b & 0x10 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.encryption {
            b |= 0x01;
        }
        if self.seed {
            b |= 0x02;
        }
        if self.utp {
            b |= 0x04;
        }
        if self.holepunch {
            b |= 0x08;
        }
        if self.connectable {
            b |= 0x10;
        }
        b
    }
}

/// A snapshot of the swarm as one peer advertises it: the set we compare
/// and diff against on every PEX tick. A `BTreeMap` keeps it sorted, which
/// makes the generated diffs deterministic.
pub type PexView = BTreeMap<SocketAddr, PexFlags>;

/// One `ut_pex` message: added and dropped peers since the last message,
/// split by address family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pex {
    pub added: Vec<(SocketAddr, PexFlags)>,
    pub added6: Vec<(SocketAddr, PexFlags)>,
    pub dropped: Vec<SocketAddr>,
    pub dropped6: Vec<SocketAddr>,
}

impl ExtMsg for Pex {
    const ID: u8 = UT_PEX_ID;
}

impl Pex {
    /// Diff two views into a message: what `new` has that `old` lacks goes
    /// into added, the reverse into dropped. Each list is capped at
    /// [`MAX_PEX_PEER_COUNT`] entries, and the holepunch bit is always
    /// stripped from the flags we forward.
    pub fn delta(old: &PexView, new: &PexView) -> Self {
        let mut msg = Self::default();

        for (addr, flags) in new {
            if old.contains_key(addr) {
                continue;
            }
            let mut flags = *flags;
            flags.holepunch = false;
            let list = match addr {
                SocketAddr::V4(_) => &mut msg.added,
                SocketAddr::V6(_) => &mut msg.added6,
            };
            if list.len() < MAX_PEX_PEER_COUNT {
                list.push((*addr, flags));
            }
        }

        for addr in old.keys() {
            if new.contains_key(addr) {
                continue;
            }
            let list = match addr {
                SocketAddr::V4(_) => &mut msg.dropped,
                SocketAddr::V6(_) => &mut msg.dropped6,
            };
            if list.len() < MAX_PEX_PEER_COUNT {
                list.push(*addr);
            }
        }

        msg
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    /// Every address this message announces as added.
    pub fn all_added(&self) -> impl Iterator<Item = &(SocketAddr, PexFlags)> {
        self.added.iter().chain(self.added6.iter())
    }

    fn compact(addrs: impl Iterator<Item = SocketAddr>) -> Vec<u8> {
        let mut buf = Vec::new();
        for addr in addrs {
            to_compact(&addr, &mut buf);
        }
        buf
    }

    fn flag_bytes(list: &[(SocketAddr, PexFlags)]) -> Vec<u8> {
        list.iter().map(|(_, f)| f.to_byte()).collect()
    }
}

impl ToBencode for Pex {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(
                b"added",
                AsString(Self::compact(self.added.iter().map(|(a, _)| *a))),
            )?;
            e.emit_pair(b"added.f", AsString(Self::flag_bytes(&self.added)))?;
            e.emit_pair(
                b"added6",
                AsString(Self::compact(self.added6.iter().map(|(a, _)| *a))),
            )?;
            e.emit_pair(b"added6.f", AsString(Self::flag_bytes(&self.added6)))?;
            e.emit_pair(
                b"dropped",
                AsString(Self::compact(self.dropped.iter().copied())),
            )?;
            e.emit_pair(
                b"dropped6",
                AsString(Self::compact(self.dropped6.iter().copied())),
            )?;
            Ok(())
        })
    }
}

impl FromBencode for Pex {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;

        let mut added_raw = Vec::new();
        let mut added_flags = Vec::new();
        let mut added6_raw = Vec::new();
        let mut added6_flags = Vec::new();
        let mut dropped = Vec::new();
        let mut dropped6 = Vec::new();

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"added", value) => {
                    added_raw = AsString::<Vec<u8>>::decode_bencode_object(value)
                        .context("added")?
                        .0;
                }
                (b"added.f", value) => {
                    added_flags =
                        AsString::<Vec<u8>>::decode_bencode_object(value)
                            .context("added.f")?
                            .0;
                }
                (b"added6", value) => {
                    added6_raw =
                        AsString::<Vec<u8>>::decode_bencode_object(value)
                            .context("added6")?
                            .0;
                }
                (b"added6.f", value) => {
                    added6_flags =
                        AsString::<Vec<u8>>::decode_bencode_object(value)
                            .context("added6.f")?
                            .0;
                }
                (b"dropped", value) => {
                    let AsString(raw) =
                        AsString::<Vec<u8>>::decode_bencode_object(value)
                            .context("dropped")?;
                    dropped = from_compact_v4(&raw);
                }
                (b"dropped6", value) => {
                    let AsString(raw) =
                        AsString::<Vec<u8>>::decode_bencode_object(value)
                            .context("dropped6")?;
                    dropped6 = from_compact_v6(&raw);
                }
                _ => {}
            }
        }

        let zip_flags = |addrs: Vec<SocketAddr>, flags: &[u8]| {
            addrs
                .into_iter()
                .enumerate()
                .map(|(i, addr)| {
                    let f = flags
                        .get(i)
                        .map(|b| PexFlags::from_byte(*b))
                        .unwrap_or_default();
                    (addr, f)
                })
                .collect::<Vec<_>>()
        };

        Ok(Self {
            added: zip_flags(from_compact_v4(&added_raw), &added_flags),
            added6: zip_flags(from_compact_v6(&added6_raw), &added6_flags),
            dropped,
            dropped6,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn flags_byte_roundtrip() {
        let flags = PexFlags {
            encryption: true,
            utp: true,
            connectable: true,
            ..Default::default()
        };
        assert_eq!(PexFlags::from_byte(flags.to_byte()), flags);
    }

    #[test]
    fn roundtrip_preserves_addresses_and_flags() {
        let mut msg = Pex::default();
        msg.added.push((
            v4("187.45.10.2:51413"),
            PexFlags { seed: true, ..Default::default() },
        ));
        msg.added6.push((
            "[2001:db8::1]:6881".parse().unwrap(),
            PexFlags { encryption: true, ..Default::default() },
        ));
        msg.dropped.push(v4("10.0.0.1:6881"));

        let bytes = msg.to_bencode().unwrap();
        let back = Pex::from_bencode(&bytes).unwrap();

        assert_eq!(back, msg);
    }

    #[test]
    fn delta_computes_added_and_dropped() {
        let mut old = PexView::new();
        old.insert(v4("1.1.1.1:1"), PexFlags::default());
        old.insert(v4("2.2.2.2:2"), PexFlags::default());

        let mut new = PexView::new();
        new.insert(v4("2.2.2.2:2"), PexFlags::default());
        new.insert(
            v4("3.3.3.3:3"),
            PexFlags { holepunch: true, seed: true, ..Default::default() },
        );

        let msg = Pex::delta(&old, &new);
        assert_eq!(msg.added.len(), 1);
        assert_eq!(msg.added[0].0, v4("3.3.3.3:3"));
        // the holepunch bit never leaves the client
        assert!(!msg.added[0].1.holepunch);
        assert!(msg.added[0].1.seed);
        assert_eq!(msg.dropped, vec![v4("1.1.1.1:1")]);
    }

    #[test]
    fn delta_is_capped() {
        let old = PexView::new();
        let mut new = PexView::new();
        for i in 0..70u16 {
            new.insert(
                v4(&format!("10.0.{}.{}:6881", i / 256, i % 256)),
                PexFlags::default(),
            );
        }

        let msg = Pex::delta(&old, &new);
        assert_eq!(msg.added.len(), MAX_PEX_PEER_COUNT);
    }

    #[test]
    fn no_delta_is_empty() {
        let mut view = PexView::new();
        view.insert(v4("1.1.1.1:1"), PexFlags::default());
        assert!(Pex::delta(&view, &view).is_empty());
    }
}
