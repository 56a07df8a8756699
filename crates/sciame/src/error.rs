use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    manager::ManagerMsg,
    peer::PeerMsg,
    torrent::{CacheMsg, TorrentMsg},
};

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("message id {id} arrived with an invalid length {len}")]
    MessageLength { id: u8, len: usize },

    #[error("unknown message id {0}")]
    MessageId(u8),

    #[error("the handshake received is not valid")]
    HandshakeInvalid,

    #[error("the peer took too long to send the handshake")]
    HandshakeTimeout,

    #[error("bitfield length {got} does not fit the torrent's {expected} bytes")]
    BitfieldLength { expected: usize, got: usize },

    #[error("piece index or block range lies outside the torrent")]
    BlockOutOfRange,

    #[error("block arrived with {got} bytes where {expected} were requested")]
    WrongBlockSize { expected: u32, got: u32 },

    #[error("block was not requested or was already completed")]
    UnexpectedBlock,

    #[error("fast extension message from a peer that didn't negotiate it")]
    FastExtensionDisabled,

    #[error("the peer closed the socket")]
    PeerClosedSocket,

    #[error("the peer took too long to respond")]
    Timeout,

    #[error("the connecting address is blocklisted")]
    Blocklisted,

    #[error("could not find torrent for the given info_hash")]
    TorrentDoesNotExist,

    #[error("the block cache failed to write: {0}")]
    CacheIo(String),

    #[error("failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("io error")]
    IO(#[from] io::Error),

    #[error("error while trying to load configuration: {0}")]
    FromConfigError(#[from] config::ConfigError),

    #[error("could not send message to torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),

    #[error("could not send message to peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<PeerMsg>),

    #[error("could not send message to manager")]
    SendErrorManager(#[from] mpsc::error::SendError<ManagerMsg>),

    #[error("could not send message to the block cache")]
    SendErrorCache(#[from] mpsc::error::SendError<CacheMsg>),

    #[error("could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}
