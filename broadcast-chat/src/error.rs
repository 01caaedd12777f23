use std::{io, str::Utf8Error};

use thiserror::Error;

use crate::{envelope::MAX_FRAME_LEN, peer::PeerState};

/// A single envelope body could not be decoded.
///
/// The frame it came from has already been consumed, so the stream is still
/// aligned and the reader may carry on with the next frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown envelope kind tag {0:#04x}")]
    UnknownKind(u8),
    #[error("frame ended before the {0} field")]
    Truncated(&'static str),
    #[error("{field} length prefix declares {declared} bytes but only {remaining} remain")]
    LengthOverrun {
        field: &'static str,
        declared: usize,
        remaining: usize,
    },
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 {
        field: &'static str,
        #[source]
        source: Utf8Error,
    },
    #[error("{0} unexpected bytes after the timestamp")]
    TrailingBytes(usize),
    #[error("timestamp {0}ms is out of range")]
    TimestampOutOfRange(i64),
    #[error("illegal identity {0:?}")]
    InvalidIdentity(String),
    #[error("{0} envelopes are not accepted from clients")]
    UnexpectedKind(&'static str),
    #[error("connection already joined as {0:?}")]
    AlreadyJoined(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport failure")]
    Transport(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("operation not valid while {0:?}")]
    InvalidState(PeerState),
}

impl ChatError {
    /// Only a malformed envelope body leaves the stream usable; everything
    /// else means the connection is over.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChatError::Protocol(_))
    }
}
