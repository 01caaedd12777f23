use std::sync::Arc;

use tokio::sync::Mutex;

use super::handler::{ClientHandler, ConnectionId};

/// Live connections in the order they were accepted.
///
/// Callers never iterate the live set directly; [`Registry::snapshot`] hands
/// out a point-in-time copy that stays valid while connections come and go.
#[derive(Default)]
pub struct Registry {
    handlers: Mutex<Vec<Arc<ClientHandler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a handler with the same connection id is already
    /// registered.
    pub async fn register(&self, handler: Arc<ClientHandler>) -> bool {
        let mut handlers = self.handlers.lock().await;
        if handlers.iter().any(|existing| existing.id() == handler.id()) {
            return false;
        }
        handlers.push(handler);
        true
    }

    /// Removing an unknown or already removed id is a no-op returning `None`.
    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<ClientHandler>> {
        let mut handlers = self.handlers.lock().await;
        let index = handlers.iter().position(|handler| handler.id() == id)?;
        Some(handlers.remove(index))
    }

    pub async fn snapshot(&self) -> Vec<Arc<ClientHandler>> {
        self.handlers.lock().await.clone()
    }

    /// Identities of joined connections, in connection order.
    pub async fn roster_snapshot(&self) -> Vec<String> {
        self.handlers
            .lock()
            .await
            .iter()
            .filter_map(|handler| handler.identity().map(str::to_owned))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.handlers.lock().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.handlers.lock().await.is_empty()
    }
}
