use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{Mutex, Notify},
};
use tracing::{debug, warn};

use super::hub::Hub;
use crate::{
    envelope::{Envelope, EnvelopeKind, read_envelope, validate_identity, write_envelope},
    error::{ChatError, ProtocolError},
};

pub type ConnectionId = u64;

type Outbound = Box<dyn AsyncWrite + Send + Unpin>;

/// Server-side owner of one client connection.
///
/// The read half lives in the handler's own task (see [`run`]); the write half
/// sits behind a lock so any task can deliver to this client during a
/// broadcast.
pub struct ClientHandler {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    identity: OnceLock<String>,
    outbound: Mutex<Option<Outbound>>,
    closed: AtomicBool,
    closing: Notify,
}

impl ClientHandler {
    pub fn new<W>(id: ConnectionId, peer: Option<SocketAddr>, outbound: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            peer,
            identity: OnceLock::new(),
            outbound: Mutex::new(Some(Box::new(outbound))),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.get().map(String::as_str)
    }

    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Binds this connection to an identity. The first successful claim wins
    /// and can never be replaced.
    pub fn claim_identity(&self, identity: &str) -> Result<(), ProtocolError> {
        validate_identity(identity)?;
        self.identity
            .set(identity.to_owned())
            .map_err(|_| ProtocolError::AlreadyJoined(self.identity().unwrap_or_default().to_owned()))
    }

    /// Writes one envelope to this client. Sending to a closed handler is a
    /// silent no-op.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ChatError> {
        let mut outbound = self.outbound.lock().await;
        match outbound.as_mut() {
            Some(writer) => write_envelope(writer, envelope).await,
            None => Ok(()),
        }
    }

    /// Flips the liveness flag. Only the caller that sees `true` may tear the
    /// connection down.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) async fn teardown(&self) {
        // Stored as a permit if the read loop is not currently waiting.
        self.closing.notify_one();
        if let Some(mut writer) = self.outbound.lock().await.take() {
            if let Err(error) = writer.shutdown().await {
                debug!(connection = self.id, ?error, "failed to shut down writer cleanly");
            }
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// Read loop for one connection: read, decode, dispatch, repeat.
///
/// Ends on EOF, an unrecoverable read error, a processed Leave, or an
/// external close, and always finishes with an idempotent close.
pub async fn run<R>(hub: Arc<Hub>, handler: Arc<ClientHandler>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = select! {
            () = handler.closing.notified() => break,
            next = read_envelope(&mut reader) => next,
        };

        match next {
            Ok(Some(envelope)) => {
                if let Flow::Close = dispatch(&hub, &handler, envelope).await {
                    break;
                }
            }
            Ok(None) => {
                debug!(connection = handler.id, "client closed the stream");
                break;
            }
            Err(error) if error.is_recoverable() => {
                warn!(connection = handler.id, %error, "discarding malformed envelope");
            }
            Err(error) => {
                debug!(connection = handler.id, ?error, "connection lost");
                break;
            }
        }
    }

    hub.close(&handler).await;
}

async fn dispatch(hub: &Hub, handler: &Arc<ClientHandler>, envelope: Envelope) -> Flow {
    match envelope.kind() {
        EnvelopeKind::Join => match handler.claim_identity(envelope.sender()) {
            Ok(()) => {
                hub.log()
                    .record(format!("New user connected: {}", envelope.sender()));
                hub.broadcast(&envelope).await;
                hub.broadcast_roster().await;
            }
            Err(error) => warn!(connection = handler.id, %error, "discarding join"),
        },
        EnvelopeKind::Leave => {
            hub.broadcast(&envelope).await;
            return Flow::Close;
        }
        EnvelopeKind::Chat => hub.broadcast(&envelope).await,
        EnvelopeKind::RosterUpdate => {
            let error = ProtocolError::UnexpectedKind(EnvelopeKind::RosterUpdate.as_str());
            warn!(connection = handler.id, %error, "discarding envelope");
        }
    }
    Flow::Continue
}
