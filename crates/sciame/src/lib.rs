//! A BitTorrent peer engine.
//!
//! This library implements the swarm side of a BitTorrent client: it keeps a
//! pool of known peer endpoints per torrent, opens and accepts connections,
//! speaks the peer wire protocol with the Fast Extension (BEP 6) and the
//! extension protocol (BEP 10) carrying PEX (BEP 11) and metadata exchange
//! (BEP 9), schedules block requests rarest-first with an endgame mode,
//! runs the reciprocal choking algorithm, and culls dead or surplus
//! connections.
//!
//! It deliberately does *not* implement trackers, disk storage, piece
//! checksumming, DHT, or any user interface. Those are collaborators that the
//! embedding application wires in through the channel contracts on
//! [`manager::Manager`]: a block cache speaking [`torrent::CacheMsg`], a
//! stats sink speaking [`torrent::StatsMsg`], an optional DHT task, and a
//! [`manager::Blocklist`].
//!
//! The engine is a small constellation of event loops: one [`manager`] task
//! per session, one [`torrent`] task per active torrent, and one [`peer`]
//! task per live connection. Every piece of mutable state has exactly one
//! owning task; everything else talks to it over channels.

pub mod bitfield;
pub mod config;
pub mod counter;
pub mod error;
pub mod extensions;
pub mod manager;
pub mod peer;
pub mod torrent;
pub mod utils;
