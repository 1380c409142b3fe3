//! Per-connection I/O driver.
//!
//! Each accepted socket runs in its own task. The task owns the socket, the
//! read and write buffers and the [`IoState`]; the session half lives in the
//! [`ConnectionRegistry`](crate::session::ConnectionRegistry) behind the
//! [`LockService`].

pub mod buffer;
pub mod machine;

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::config::ServerConfig;
use crate::lock::display_key;
use crate::protocol::Reply;
use crate::service::{LockService, Outcome, Registration};
use buffer::{ReadBuffer, WriteBuffer};
use machine::{transition, Action, Event, IoState};

/// Non-blocking byte stream driven by readiness.
pub trait Transport: Send + Sync + 'static {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send;
    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send;
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl Transport for TcpStream {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send {
        TcpStream::readable(self)
    }

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send {
        TcpStream::writable(self)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

#[cfg(unix)]
impl Transport for tokio::net::UnixStream {
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send {
        tokio::net::UnixStream::readable(self)
    }

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send {
        tokio::net::UnixStream::writable(self)
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        tokio::net::UnixStream::try_write(self, buf)
    }
}

/// Buffer sizes applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub read_buffer_size: usize,
    pub max_read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            max_read_buffer_size: config.max_read_buffer_size,
            write_buffer_size: config.write_buffer_size,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

pub struct Connection<T> {
    stream: T,
    service: Arc<LockService>,
    registration: Registration,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    state: IoState,
    close_after_flush: bool,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> Connection<T> {
    pub fn new(
        stream: T,
        service: Arc<LockService>,
        registration: Registration,
        settings: ConnectionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            service,
            registration,
            read_buf: ReadBuffer::new(settings.read_buffer_size, settings.max_read_buffer_size),
            write_buf: WriteBuffer::new(settings.write_buffer_size),
            state: IoState::Reading,
            close_after_flush: false,
            shutdown,
        }
    }

    /// Drive the connection until it closes. The session is released when the
    /// connection is dropped.
    #[instrument(level = "debug", skip_all, fields(conn_id = %self.registration.id))]
    pub async fn run(mut self) {
        let mut next_event = None;
        loop {
            let event = match next_event.take() {
                Some(event) => event,
                None => self.step(),
            };
            let (state, action) = transition(self.state, event);
            trace!(from = %self.state, to = %state, ?event, ?action, "io transition");
            self.state = state;

            next_event = match action {
                Action::None => None,
                Action::AwaitReadable => self.await_readable().await,
                Action::AwaitWritable => self.await_writable().await,
                Action::Close => break,
            };
        }
        debug!("connection closed");
    }

    fn step(&mut self) -> Event {
        match self.state {
            IoState::Reading => self.read_step(),
            IoState::Writing => self.write_step(),
            IoState::Waiting => Event::Rearmed,
            IoState::Listening | IoState::Closing => Event::Quit,
        }
    }

    fn queue(&mut self, reply: &Reply) {
        self.write_buf.push_reply(reply);
    }

    fn read_step(&mut self) -> Event {
        if let Ok(wakeup) = self.registration.wakeups.try_recv() {
            self.queue(&wakeup.reply);
            return Event::Woken;
        }

        if let Some(line) = self.read_buf.take_line() {
            return match self.service.execute(self.registration.id, &line) {
                Outcome::Reply(reply) => {
                    if reply.is_error() {
                        debug!(line = %display_key(&line), %reply, "command rejected");
                    }
                    self.queue(&reply);
                    Event::ReplyQueued
                }
                Outcome::Wait => Event::MustWait,
                Outcome::Close => Event::Quit,
            };
        }

        let spare = match self.read_buf.spare_mut() {
            Ok(spare) => spare,
            Err(err) => {
                warn!(error = %err, buffered = self.read_buf.buffered(), "discarding request input");
                self.read_buf.discard();
                self.queue(&Reply::OutOfMemory);
                return Event::ReplyQueued;
            }
        };

        match self.stream.try_read(spare) {
            Ok(0) => Event::EndOfStream,
            Ok(n) => {
                self.read_buf.advance(n);
                Event::DataArrived
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Event::ReadWouldBlock,
            Err(err) => {
                debug!(error = %err, "read failed");
                Event::IoError
            }
        }
    }

    fn write_step(&mut self) -> Event {
        if self.write_buf.is_empty() {
            return Event::WriteComplete {
                close_after: self.close_after_flush,
            };
        }

        match self.stream.try_write(self.write_buf.pending()) {
            Ok(0) => Event::IoError,
            Ok(n) => {
                self.write_buf.consume(n);
                if self.write_buf.is_empty() {
                    Event::WriteComplete {
                        close_after: self.close_after_flush,
                    }
                } else {
                    Event::PartialWrite
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Event::WriteWouldBlock,
            Err(err) => {
                debug!(error = %err, "write failed");
                Event::IoError
            }
        }
    }

    /// Wait for input or a wakeup from the notifier, whichever comes first.
    async fn await_readable(&mut self) -> Option<Event> {
        if self.read_buf.has_line() {
            return None;
        }
        if *self.shutdown.borrow() {
            return Some(Event::Quit);
        }

        tokio::select! {
            biased;
            wakeup = self.registration.wakeups.recv() => match wakeup {
                Some(wakeup) => {
                    self.queue(&wakeup.reply);
                    Some(Event::Woken)
                }
                None => Some(Event::IoError),
            },
            ready = self.stream.readable() => match ready {
                Ok(()) => None,
                Err(err) => {
                    debug!(error = %err, "readiness failed");
                    Some(Event::IoError)
                }
            },
            _ = self.shutdown.changed() => {
                debug!("shutting down idle connection");
                Some(Event::Quit)
            }
        }
    }

    /// Wait until the socket accepts more output. Shutdown lets the pending
    /// reply finish before the connection closes.
    async fn await_writable(&mut self) -> Option<Event> {
        let watching = !self.close_after_flush;
        tokio::select! {
            ready = self.stream.writable() => match ready {
                Ok(()) => None,
                Err(err) => {
                    debug!(error = %err, "readiness failed");
                    Some(Event::IoError)
                }
            },
            _ = self.shutdown.changed(), if watching => {
                self.close_after_flush = true;
                None
            }
        }
    }
}

/// Releases the session even when the task is aborted mid-flight.
impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        self.service.disconnect(self.registration.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::metrics::Metrics;

    async fn spawn_pair(
        service: &Arc<LockService>,
        settings: ConnectionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<TcpStream> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let client = TcpStream::connect(listener.local_addr()?).await?;
        let (server, peer) = listener.accept().await?;
        let registration = service.connect(peer.to_string());
        let connection = Connection::new(server, service.clone(), registration, settings, shutdown);
        tokio::spawn(connection.run());
        Ok(client)
    }

    #[tokio::test]
    async fn aborted_connection_releases_its_lock() -> Result<()> {
        let service = Arc::new(LockService::new(&ServerConfig::default(), Metrics::new()));
        let (_tx, rx) = watch::channel(false);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let client = TcpStream::connect(listener.local_addr()?).await?;
        let (server, peer) = listener.accept().await?;
        let registration = service.connect(peer.to_string());
        let connection = Connection::new(
            server,
            service.clone(),
            registration,
            ConnectionSettings::default(),
            rx,
        );
        let task = tokio::spawn(connection.run());

        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);
        write.write_all(b"lock k w\r\n").await?;
        assert_eq!(read_line(&mut reader).await?, "+OK, lock success\r\n");

        task.abort();
        assert!(task.await.is_err_and(|err| err.is_cancelled()));
        assert!(service.lookup("k").is_none());
        assert_eq!(service.snapshot().connections.total_connections, 0);
        Ok(())
    }

    async fn read_line<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for a reply"))??;
        Ok(line)
    }

    #[tokio::test]
    async fn pipelined_commands_get_replies_in_order() -> Result<()> {
        let service = Arc::new(LockService::new(&ServerConfig::default(), Metrics::new()));
        let (_tx, rx) = watch::channel(false);
        let client = spawn_pair(&service, ConnectionSettings::default(), rx).await?;
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"lock k w\r\nfind nope\r\nunlock\r\n").await?;
        assert_eq!(read_line(&mut reader).await?, "+OK, lock success\r\n");
        assert_eq!(read_line(&mut reader).await?, "+OK, the key is not exist\r\n");
        assert_eq!(read_line(&mut reader).await?, "+OK, unlock success\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_request_is_discarded_and_connection_stays_open() -> Result<()> {
        let service = Arc::new(LockService::new(&ServerConfig::default(), Metrics::new()));
        let (_tx, rx) = watch::channel(false);
        let settings = ConnectionSettings {
            read_buffer_size: 8,
            max_read_buffer_size: 16,
            write_buffer_size: 2048,
        };
        let client = spawn_pair(&service, settings, rx).await?;
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(&[b'x'; 16]).await?;
        assert_eq!(
            read_line(&mut reader).await?,
            "-ERR, out of memory reading request\r\n"
        );

        write.write_all(b"\r\nhelp\r\n").await?;
        assert_eq!(read_line(&mut reader).await?, "-ERR, unimplemented\r\n");
        let usage = read_line(&mut reader).await?;
        assert!(usage.starts_with("+OK, lock server command usage (V0.0.1)"), "{usage}");
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_closes_idle_connections() -> Result<()> {
        let service = Arc::new(LockService::new(&ServerConfig::default(), Metrics::new()));
        let (tx, rx) = watch::channel(false);
        let client = spawn_pair(&service, ConnectionSettings::default(), rx).await?;
        let (read, mut write) = client.into_split();
        let mut reader = BufReader::new(read);

        write.write_all(b"lock k w\r\n").await?;
        assert_eq!(read_line(&mut reader).await?, "+OK, lock success\r\n");

        tx.send(true)?;
        assert_eq!(read_line(&mut reader).await?, "");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.lookup("k").is_none());
        Ok(())
    }
}
