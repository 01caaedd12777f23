//! Client side of the chat protocol.
//!
//! A [`PeerConnection`] connects to a server, announces itself with a Join,
//! and runs a read loop that turns incoming envelopes into [`PeerEvent`]s for
//! whoever subscribed. Events are delivered over unbounded channels from the
//! read loop's task; a UI has to hop back onto its own thread itself.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    envelope::{Envelope, EnvelopeKind, parse_roster, read_envelope, validate_identity, write_envelope},
    error::ChatError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Any non-roster envelope, including ones this client sent itself.
    Message(Envelope),
    Roster(Vec<String>),
    ConnectionChanged(bool),
}

#[derive(Clone)]
pub struct PeerConnection {
    shared: Arc<Shared>,
}

struct Shared {
    session: Mutex<Session>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

struct Session {
    state: PeerState,
    identity: Option<String>,
    roster: Vec<String>,
    // Bumped on every successful connect; a read loop only acts for its own.
    generation: u64,
}

impl Default for PeerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerConnection {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    state: PeerState::Disconnected,
                    identity: None,
                    roster: Vec::new(),
                    generation: 0,
                }),
                writer: AsyncMutex::new(None),
                reader_task: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a new observer. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn state(&self) -> PeerState {
        lock(&self.shared.session).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    pub fn identity(&self) -> Option<String> {
        lock(&self.shared.session).identity.clone()
    }

    /// The most recent roster received from the server.
    pub fn roster(&self) -> Vec<String> {
        lock(&self.shared.session).roster.clone()
    }

    /// Opens the connection and joins as `identity`.
    ///
    /// There is no retry: on failure the connection returns to the state it
    /// was in and the error is handed back.
    pub async fn connect(&self, host: &str, port: u16, identity: &str) -> Result<(), ChatError> {
        validate_identity(identity)?;

        let previous = {
            let mut session = lock(&self.shared.session);
            match session.state {
                PeerState::Disconnected | PeerState::Closed => {}
                other => return Err(ChatError::InvalidState(other)),
            }
            let previous = session.state;
            session.state = PeerState::Connecting;
            previous
        };

        let (reader, writer) = match self.open(host, port, identity).await {
            Ok(halves) => halves,
            Err(err) => {
                lock(&self.shared.session).state = previous;
                return Err(err);
            }
        };

        *self.shared.writer.lock().await = Some(writer);
        let generation = {
            let mut session = lock(&self.shared.session);
            session.state = PeerState::Connected;
            session.identity = Some(identity.to_owned());
            session.roster.clear();
            session.generation += 1;
            session.generation
        };
        info!(host, port, identity, "connected");
        self.shared.notify(PeerEvent::ConnectionChanged(true));

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(read_loop(shared, reader, generation));
        *lock(&self.shared.reader_task) = Some(task);
        Ok(())
    }

    async fn open(
        &self,
        host: &str,
        port: u16,
        identity: &str,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf), ChatError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ChatError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;

        let (reader, mut writer) = stream.into_split();
        write_envelope(&mut writer, &Envelope::join(identity)).await?;
        Ok((reader, writer))
    }

    /// Sends `text` as a Chat envelope. Does nothing unless connected.
    pub async fn send_text(&self, text: &str) {
        let (identity, generation) = {
            let session = lock(&self.shared.session);
            match (&session.state, &session.identity) {
                (PeerState::Connected, Some(identity)) => (identity.clone(), session.generation),
                _ => return,
            }
        };

        let result = {
            let mut writer = self.shared.writer.lock().await;
            match writer.as_mut() {
                Some(writer) => write_envelope(writer, &Envelope::chat(identity, text)).await,
                None => return,
            }
        };

        match result {
            Ok(()) => {}
            Err(ChatError::Transport(error)) => {
                warn!(?error, "failed to send message");
                if let Some(reader) = self.shared.connection_lost(generation).await {
                    reader.abort();
                }
            }
            Err(error) => warn!(%error, "message not sent"),
        }
    }

    /// Leaves the chat and releases the connection. Only has an effect while
    /// connected.
    pub async fn disconnect(&self) {
        let identity = {
            let mut session = lock(&self.shared.session);
            if session.state != PeerState::Connected {
                return;
            }
            session.state = PeerState::Closing;
            session.identity.clone().unwrap_or_default()
        };

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(error) = write_envelope(&mut writer, &Envelope::leave(identity)).await {
                debug!(?error, "failed to send leave");
            }
            if let Err(error) = writer.shutdown().await {
                debug!(?error, "failed to shut down writer cleanly");
            }
        }
        if let Some(task) = lock(&self.shared.reader_task).take() {
            task.abort();
        }

        lock(&self.shared.session).state = PeerState::Closed;
        info!("disconnected");
        self.shared.notify(PeerEvent::ConnectionChanged(false));
    }
}

impl Shared {
    fn notify(&self, event: PeerEvent) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Session lock is held across `notify` so a reconnect cannot slip in
    /// between the generation check and delivery.
    fn dispatch(&self, generation: u64, envelope: Envelope) {
        let mut session = lock(&self.session);
        if session.generation != generation {
            return;
        }
        match envelope.kind() {
            EnvelopeKind::RosterUpdate => {
                let roster = parse_roster(envelope.content());
                session.roster = roster.clone();
                self.notify(PeerEvent::Roster(roster));
            }
            _ => self.notify(PeerEvent::Message(envelope)),
        }
    }

    /// Transport failure while connected. Loses any race against
    /// `disconnect`, so observers hear about the disconnect exactly once.
    ///
    /// Returns the read loop's handle; callers other than the read loop
    /// itself must abort it.
    async fn connection_lost(&self, generation: u64) -> Option<JoinHandle<()>> {
        {
            let mut session = lock(&self.session);
            if session.state != PeerState::Connected || session.generation != generation {
                return None;
            }
            session.state = PeerState::Closing;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(error) = writer.shutdown().await {
                debug!(?error, "failed to shut down writer cleanly");
            }
        }
        let reader = lock(&self.reader_task).take();

        lock(&self.session).state = PeerState::Closed;
        info!("connection to server lost");
        self.notify(PeerEvent::ConnectionChanged(false));
        reader
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, generation: u64) {
    loop {
        match read_envelope(&mut reader).await {
            Ok(Some(envelope)) => shared.dispatch(generation, envelope),
            Ok(None) => {
                debug!("server closed the stream");
                break;
            }
            Err(error) if error.is_recoverable() => {
                warn!(%error, "discarding malformed envelope");
            }
            Err(error) => {
                debug!(?error, "read failed");
                break;
            }
        }
    }
    // Our own handle; this task is about to finish anyway.
    drop(shared.connection_lost(generation).await);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
