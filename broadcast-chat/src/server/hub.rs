use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, warn};

use super::{
    handler::{ClientHandler, ConnectionId},
    log::EventLog,
    registry::Registry,
};
use crate::{
    envelope::{Envelope, EnvelopeKind},
    error::ChatError,
};

/// Shared server state: the registry of live connections, the event log, and
/// the broadcast fan-out built on top of them.
pub struct Hub {
    registry: Registry,
    log: EventLog,
    next_id: AtomicU64,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            log: EventLog::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Records the envelope in the event log and delivers it to every
    /// registered connection, the sender's own included.
    pub async fn broadcast(&self, envelope: &Envelope) {
        if envelope.kind() != EnvelopeKind::RosterUpdate {
            self.log.record(envelope.to_string());
        }
        self.fan_out(envelope).await;
    }

    /// Sends the current roster to every registered connection.
    pub async fn broadcast_roster(&self) {
        let roster = self.registry.roster_snapshot().await;
        self.fan_out(&Envelope::roster(&roster)).await;
    }

    pub async fn roster_snapshot(&self) -> Vec<String> {
        self.registry.roster_snapshot().await
    }

    // Writes happen serially on the calling task, in registry order. A slow
    // recipient delays everyone after it.
    async fn fan_out(&self, envelope: &Envelope) {
        let recipients = self.registry.snapshot().await;
        let mut broken = Vec::new();

        for handler in &recipients {
            match handler.send(envelope).await {
                Ok(()) => {}
                Err(ChatError::Transport(error)) => {
                    debug!(connection = handler.id(), ?error, "failed to deliver envelope");
                    broken.push(Arc::clone(handler));
                }
                Err(error) => {
                    warn!(connection = handler.id(), %error, "dropping undeliverable envelope");
                }
            }
        }

        for handler in &broken {
            self.close(handler).await;
        }
    }

    /// Tears a connection down and tells the remaining clients.
    ///
    /// Safe to call any number of times from any task; only the first call has
    /// an effect.
    pub fn close<'a>(&'a self, handler: &'a Arc<ClientHandler>) -> BoxFuture<'a, ()> {
        async move {
            if !handler.mark_closed() {
                return;
            }
            handler.teardown().await;
            debug!(connection = handler.id(), peer = ?handler.peer(), "connection closed");

            if self.registry.unregister(handler.id()).await.is_some() {
                self.log.record(format!(
                    "Client disconnected: {}",
                    handler.identity().unwrap_or("unknown")
                ));
            }
            self.broadcast_roster().await;
        }
        .boxed()
    }
}
