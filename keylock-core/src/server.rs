//! Listener and accept loop.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::machine::{transition, Action, Event, IoState};
use crate::connection::{Connection, ConnectionSettings, Transport};
use crate::error::ServerError;
use crate::service::LockService;

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

enum Incoming {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Listener {
    /// Bind the unix socket when a path is configured, TCP otherwise.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        if let Some(path) = config.unix_socket_path() {
            return Self::bind_unix(config, path);
        }

        let addr = config
            .bind_addr()
            .map_err(|err| ServerError::InvalidConfig(err.to_string()))?;
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "listening on tcp");
        Ok(Listener::Tcp(listener))
    }

    #[cfg(unix)]
    fn bind_unix(config: &ServerConfig, path: PathBuf) -> Result<Self, ServerError> {
        use std::os::unix::fs::PermissionsExt;

        let mode = config
            .socket_mode()
            .map_err(|err| ServerError::InvalidConfig(err.to_string()))?;
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let listener = tokio::net::UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        info!(path = %path.display(), mode = %format!("{mode:o}"), "listening on unix socket");
        Ok(Listener::Unix { listener, path })
    }

    #[cfg(not(unix))]
    fn bind_unix(_config: &ServerConfig, path: PathBuf) -> Result<Self, ServerError> {
        Err(ServerError::InvalidConfig(format!(
            "unix sockets are not supported on this platform: {}",
            path.display()
        )))
    }

    /// Bound TCP address, if listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix { .. } => None,
        }
    }

    async fn accept(&self) -> io::Result<Incoming> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Incoming::Tcp(stream, peer))
            }
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Incoming::Unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Listener::Unix { path, .. } = self {
            if let Err(err) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %err, "failed to remove socket file");
            }
        }
    }
}

pub struct Server {
    listener: Listener,
    service: Arc<LockService>,
    settings: ConnectionSettings,
    limit: Arc<Semaphore>,
    shutdown_grace: Duration,
}

impl Server {
    pub async fn bind(config: &ServerConfig, service: Arc<LockService>) -> Result<Self, ServerError> {
        let listener = Listener::bind(config).await?;
        Ok(Self {
            listener,
            service,
            settings: ConnectionSettings::from_config(config),
            limit: Arc::new(Semaphore::new(config.max_connections)),
            shutdown_grace: config.shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips, then give open connections
    /// the configured grace period to finish before aborting them.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let mut tasks = JoinSet::new();
        let mut state = IoState::Listening;

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => {
                    info!("stopping accept loop");
                    Event::Quit
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "connection task failed");
                    }
                    continue;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(Incoming::Tcp(stream, peer)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(error = %err, "failed to set TCP_NODELAY");
                        }
                        self.spawn(&mut tasks, stream, peer.to_string(), &shutdown);
                        Event::Accepted
                    }
                    #[cfg(unix)]
                    Ok(Incoming::Unix(stream)) => {
                        self.spawn(&mut tasks, stream, "unix".to_string(), &shutdown);
                        Event::Accepted
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };

            let (next, action) = transition(state, event);
            trace!(from = %state, to = %next, ?event, ?action, "listener transition");
            state = next;
            if action == Action::Close {
                break;
            }
        }

        self.drain(tasks).await;
        info!("server stopped");
        Ok(())
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        debug!(open = tasks.len(), "waiting for connections to close");
        let closed = tokio::time::timeout(self.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if closed.is_err() {
            warn!(
                open = tasks.len(),
                grace = ?self.shutdown_grace,
                "shutdown grace period elapsed, aborting connections"
            );
            tasks.shutdown().await;
        }
    }

    fn spawn<T: Transport>(
        &self,
        tasks: &mut JoinSet<()>,
        stream: T,
        peer: String,
        shutdown: &watch::Receiver<bool>,
    ) {
        let Some(permit) = self.admit(&peer) else {
            return;
        };

        let registration = self.service.connect(peer.clone());
        debug!(conn_id = %registration.id, %peer, "accepted connection");
        let connection = Connection::new(
            stream,
            self.service.clone(),
            registration,
            self.settings,
            shutdown.clone(),
        );
        tasks.spawn(async move {
            connection.run().await;
            drop(permit);
        });
    }

    fn admit(&self, peer: &str) -> Option<OwnedSemaphorePermit> {
        match self.limit.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                warn!(%peer, error = %ServerError::MaxConnectionsReached, "dropping connection");
                self.service.metrics().connection_rejected();
                None
            }
        }
    }
}
