use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Local, SubsecRound, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChatError, ProtocolError};

/// Identity stamped on envelopes the server originates.
pub const SYSTEM_SENDER: &str = "Server";

/// Separator used in `RosterUpdate` content. Never legal inside an identity.
pub const ROSTER_DELIMITER: char = ',';

/// Upper bound on a frame body. Anything larger is treated as a broken stream.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const JOIN_CONTENT: &str = "joined the chat";
const LEAVE_CONTENT: &str = "left the chat";

// kind tag + two string length prefixes + timestamp
const FIXED_BODY_LEN: usize = 1 + 4 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Join,
    Leave,
    Chat,
    RosterUpdate,
}

impl EnvelopeKind {
    fn tag(self) -> u8 {
        match self {
            EnvelopeKind::Join => 1,
            EnvelopeKind::Leave => 2,
            EnvelopeKind::Chat => 3,
            EnvelopeKind::RosterUpdate => 4,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(EnvelopeKind::Join),
            2 => Ok(EnvelopeKind::Leave),
            3 => Ok(EnvelopeKind::Chat),
            4 => Ok(EnvelopeKind::RosterUpdate),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Join => "join",
            EnvelopeKind::Leave => "leave",
            EnvelopeKind::Chat => "chat",
            EnvelopeKind::RosterUpdate => "roster_update",
        }
    }
}

/// One unit of the wire protocol.
///
/// Envelopes are immutable once built. Timestamps are kept at millisecond
/// precision because that is all the wire carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: String,
    content: String,
    timestamp: DateTime<Utc>,
    kind: EnvelopeKind,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::with_timestamp(kind, sender, content, Utc::now())
    }

    pub fn with_timestamp(
        kind: EnvelopeKind,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            timestamp: timestamp.trunc_subsecs(3),
            kind,
        }
    }

    pub fn join(identity: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Join, identity, JOIN_CONTENT)
    }

    pub fn leave(identity: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Leave, identity, LEAVE_CONTENT)
    }

    pub fn chat(identity: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Chat, identity, text)
    }

    pub fn roster<S: AsRef<str>>(identities: &[S]) -> Self {
        Self::new(
            EnvelopeKind::RosterUpdate,
            SYSTEM_SENDER,
            join_roster(identities),
        )
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.with_timezone(&Local).format("%H:%M:%S"),
            self.sender,
            self.content
        )
    }
}

/// Serializes an envelope into one complete, length-prefixed frame.
pub fn encode(envelope: &Envelope) -> Bytes {
    let sender = envelope.sender.as_bytes();
    let content = envelope.content.as_bytes();
    let body_len = FIXED_BODY_LEN + sender.len() + content.len();

    let mut frame = BytesMut::with_capacity(4 + body_len);
    frame.put_u32(body_len as u32);
    frame.put_u8(envelope.kind.tag());
    frame.put_u32(sender.len() as u32);
    frame.put_slice(sender);
    frame.put_u32(content.len() as u32);
    frame.put_slice(content);
    frame.put_i64(envelope.timestamp.timestamp_millis());
    frame.freeze()
}

/// Decodes a frame body (everything after the outer length prefix).
pub fn decode(body: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut buf = body;

    if !buf.has_remaining() {
        return Err(ProtocolError::Truncated("kind"));
    }
    let kind = EnvelopeKind::from_tag(buf.get_u8())?;
    let sender = take_string(&mut buf, "sender")?;
    let content = take_string(&mut buf, "content")?;

    if buf.remaining() < 8 {
        return Err(ProtocolError::Truncated("timestamp"));
    }
    let millis = buf.get_i64();
    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes(buf.remaining()));
    }
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(ProtocolError::TimestampOutOfRange(millis))?;

    Ok(Envelope {
        sender,
        content,
        timestamp,
        kind,
    })
}

fn take_string<'a>(buf: &mut &'a [u8], field: &'static str) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated(field));
    }
    let declared = buf.get_u32() as usize;
    if declared > buf.remaining() {
        return Err(ProtocolError::LengthOverrun {
            field,
            declared,
            remaining: buf.remaining(),
        });
    }

    let current: &'a [u8] = *buf;
    let (raw, rest) = current.split_at(declared);
    let text = std::str::from_utf8(raw)
        .map_err(|source| ProtocolError::InvalidUtf8 { field, source })?
        .to_owned();
    *buf = rest;
    Ok(text)
}

/// Reads the next envelope from a byte stream.
///
/// Returns `Ok(None)` when the peer closed the stream between frames. A
/// malformed body surfaces as a recoverable [`ChatError::Protocol`] after the
/// whole frame has been consumed; EOF inside a frame is a transport error.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<Envelope>, ChatError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let read = reader.read(&mut prefix).await?;
    if read == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[read..]).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChatError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode(&body)?))
}

/// Writes one envelope and flushes so the peer sees it immediately.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ChatError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope);
    if frame.len() - 4 > MAX_FRAME_LEN {
        return Err(ChatError::FrameTooLarge(frame.len() - 4));
    }
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub fn join_roster<S: AsRef<str>>(identities: &[S]) -> String {
    let mut joined = String::new();
    for (index, identity) in identities.iter().enumerate() {
        if index > 0 {
            joined.push(ROSTER_DELIMITER);
        }
        joined.push_str(identity.as_ref());
    }
    joined
}

pub fn parse_roster(content: &str) -> Vec<String> {
    content
        .split(ROSTER_DELIMITER)
        .filter(|identity| !identity.is_empty())
        .map(str::to_owned)
        .collect()
}

/// An identity must survive a trip through the roster string unchanged and
/// must not impersonate the server.
pub fn validate_identity(identity: &str) -> Result<(), ProtocolError> {
    if identity.is_empty() || identity.contains(ROSTER_DELIMITER) || identity == SYSTEM_SENDER {
        return Err(ProtocolError::InvalidIdentity(identity.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tokio::io::duplex;

    use super::*;

    fn body_of(envelope: &Envelope) -> Bytes {
        encode(envelope).slice(4..)
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().expect("valid instant");
        let envelopes = [
            Envelope::with_timestamp(EnvelopeKind::Join, "alice", "joined the chat", at),
            Envelope::with_timestamp(EnvelopeKind::Leave, "bob", "", at),
            Envelope::with_timestamp(EnvelopeKind::Chat, "zoë", "héllo, wörld 👋", at),
            Envelope::with_timestamp(EnvelopeKind::RosterUpdate, SYSTEM_SENDER, "alice,bob", at),
        ];

        for envelope in envelopes {
            let decoded = decode(&body_of(&envelope)).expect("decode");
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn locally_built_envelopes_roundtrip_exactly() {
        let envelope = Envelope::chat("alice", "hi");
        assert_eq!(decode(&body_of(&envelope)).expect("decode"), envelope);
    }

    #[test]
    fn frame_prefix_counts_body_bytes() {
        let frame = encode(&Envelope::chat("al", "hey"));
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);
        assert_eq!(declared, FIXED_BODY_LEN + 2 + 3);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut body = body_of(&Envelope::chat("alice", "hi")).to_vec();
        body[0] = 9;
        assert_eq!(decode(&body), Err(ProtocolError::UnknownKind(9)));
    }

    #[test]
    fn overrunning_length_prefix_is_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(3);
        body.put_u32(500);
        body.put_slice(b"alice");
        assert!(matches!(
            decode(&body),
            Err(ProtocolError::LengthOverrun {
                field: "sender",
                declared: 500,
                ..
            })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = body_of(&Envelope::chat("alice", "hi")).to_vec();
        body.push(0);
        assert_eq!(decode(&body), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut body = BytesMut::new();
        body.put_u8(3);
        body.put_u32(2);
        body.put_slice(&[0xff, 0xfe]);
        body.put_u32(0);
        body.put_i64(0);
        assert!(matches!(
            decode(&body),
            Err(ProtocolError::InvalidUtf8 { field: "sender", .. })
        ));
    }

    #[test]
    fn empty_body_is_truncated() {
        assert_eq!(decode(&[]), Err(ProtocolError::Truncated("kind")));
    }

    #[tokio::test]
    async fn reader_skips_malformed_frame_and_continues() {
        let (mut writer, mut reader) = duplex(1024);
        let mut broken = encode(&Envelope::chat("alice", "lost")).to_vec();
        broken[4] = 0x7f;
        let good = Envelope::chat("alice", "kept");

        writer.write_all(&broken).await.expect("write broken");
        write_envelope(&mut writer, &good).await.expect("write good");

        let first = read_envelope(&mut reader).await;
        assert!(matches!(
            first,
            Err(ChatError::Protocol(ProtocolError::UnknownKind(0x7f)))
        ));
        assert!(first.as_ref().err().is_some_and(ChatError::is_recoverable));

        let second = read_envelope(&mut reader).await.expect("read").expect("frame");
        assert_eq!(second, good);
    }

    #[tokio::test]
    async fn clean_eof_between_frames_is_none() {
        let (writer, mut reader) = duplex(64);
        drop(writer);
        assert!(read_envelope(&mut reader).await.expect("clean eof").is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_unrecoverable() {
        let (mut writer, mut reader) = duplex(1024);
        let frame = encode(&Envelope::chat("alice", "cut short"));
        writer.write_all(&frame[..frame.len() - 3]).await.expect("write");
        drop(writer);

        let err = read_envelope(&mut reader).await.expect_err("truncated frame");
        assert!(matches!(err, ChatError::Transport(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn oversized_frame_is_unrecoverable() {
        let (mut writer, mut reader) = duplex(64);
        writer
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .expect("write prefix");

        let err = read_envelope(&mut reader).await.expect_err("too large");
        assert!(matches!(err, ChatError::FrameTooLarge(len) if len == MAX_FRAME_LEN + 1));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn roster_joins_without_trailing_delimiter() {
        assert_eq!(join_roster(&["alice", "bob"]), "alice,bob");
        assert_eq!(join_roster::<&str>(&[]), "");

        let envelope = Envelope::roster(&["alice".to_string()]);
        assert_eq!(envelope.kind(), EnvelopeKind::RosterUpdate);
        assert_eq!(envelope.sender(), SYSTEM_SENDER);
        assert_eq!(envelope.content(), "alice");
    }

    #[test]
    fn roster_parses_back_into_identities() {
        assert_eq!(parse_roster("alice,bob"), vec!["alice", "bob"]);
        assert!(parse_roster("").is_empty());
    }

    #[test]
    fn identities_cannot_contain_the_delimiter() {
        assert!(validate_identity("alice").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("a,b").is_err());
        assert!(validate_identity(SYSTEM_SENDER).is_err());
    }

    #[test]
    fn display_uses_clock_sender_and_content() {
        let rendered = Envelope::chat("alice", "hi").to_string();
        assert!(rendered.starts_with('['));
        assert!(rendered.ends_with("] alice: hi"));
    }
}
