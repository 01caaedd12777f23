//! Server side of the chat: the listener, per-connection handlers, the
//! connection registry and the broadcast fan-out.

pub mod handler;
pub mod hub;
pub mod log;
pub mod registry;

use std::{future::Future, net::SocketAddr, sync::Arc};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::error::ChatError;
use handler::ClientHandler;
use hub::Hub;

/// A chat server that can be started and stopped repeatedly.
pub struct ChatServer {
    hub: Arc<Hub>,
    running: Mutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl Default for ChatServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatServer {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::new()),
            running: Mutex::new(None),
        }
    }

    /// Binds `addr` and starts accepting connections on a background task.
    ///
    /// Returns the address actually bound, which matters when asking for
    /// port 0.
    pub async fn start(&self, addr: impl Into<SocketAddr>) -> Result<SocketAddr, ChatError> {
        let addr = addr.into();
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ChatError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.hub
                    .log()
                    .record(format!("Failed to start server: {source}"));
                return Err(ChatError::Bind {
                    addr: addr.to_string(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;
        self.hub
            .log()
            .record(format!("Server started on {local_addr}"));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&self.hub), shutdown_rx));

        *running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Closes the listening socket, then every live connection. Calling this
    /// on a server that is not running does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.hub.log().record("Stopping server...");

        let _ = running.shutdown.send(());
        if let Err(error) = running.accept_task.await {
            warn!(?error, "accept loop ended abnormally");
        }

        for handler in self.hub.registry().snapshot().await {
            self.hub.close(&handler).await;
        }
    }

    /// Runs until `shutdown` resolves, then stops the server.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        self.stop().await;
    }

    pub async fn run_until_ctrl_c(&self) {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.local_addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Every registered connection, whether or not it has joined yet.
    pub async fn client_count(&self) -> usize {
        self.hub.registry().len().await
    }

    pub async fn roster_snapshot(&self) -> Vec<String> {
        self.hub.roster_snapshot().await
    }

    pub fn log_snapshot(&self) -> Vec<String> {
        self.hub.log().snapshot()
    }
}

async fn accept_loop(listener: TcpListener, hub: Arc<Hub>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        select! {
            _ = &mut shutdown => {
                info!("listener shutting down");
                break;
            }
            accept_result = listener.accept() => {
                handle_accept_result(accept_result, &hub).await;
            }
        }
    }
}

async fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    hub: &Arc<Hub>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, hub).await,
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

// Registration happens before the accept loop moves on, so once the loop has
// stopped every accepted connection is visible to `stop`.
async fn spawn_client_handler(stream: TcpStream, peer: SocketAddr, hub: &Arc<Hub>) {
    let (reader, writer) = stream.into_split();
    let handler = Arc::new(ClientHandler::new(hub.next_id(), Some(peer), writer));
    hub.registry().register(Arc::clone(&handler)).await;
    info!(peer = %peer, connection = handler.id(), "accepted connection");

    let hub = Arc::clone(hub);
    tokio::spawn(handler::run(hub, handler, reader));
}
