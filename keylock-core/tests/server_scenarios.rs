use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use keylock_core::error::ServerError;
use keylock_core::{LockService, Metrics, Server, ServerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE: Duration = Duration::from_millis(200);

struct TestServer {
    addr: SocketAddr,
    service: Arc<LockService>,
    shutdown: watch::Sender<bool>,
    serving: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Result<Self> {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..config
        };
        let service = Arc::new(LockService::new(&config, Metrics::new()));
        let server = Server::bind(&config, service.clone()).await?;
        let addr = server
            .local_addr()
            .ok_or_else(|| anyhow!("server is not listening on tcp"))?;
        let (shutdown, rx) = watch::channel(false);
        let serving = tokio::spawn(server.serve(rx));
        Ok(Self {
            addr,
            service,
            shutdown,
            serving,
        })
    }

    async fn client(&self) -> Result<Client> {
        let stream = TcpStream::connect(self.addr).await?;
        let (read, write) = stream.into_split();
        Ok(Client {
            reader: BufReader::new(read),
            writer: write,
        })
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await?;
        Ok(())
    }

    async fn send_bytes(&mut self, line: &[u8]) -> Result<()> {
        self.writer.write_all(&[line, &b"\r\n"[..]].concat()).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for a reply"))??;
        if n == 0 {
            return Err(anyhow!("connection closed"));
        }
        Ok(line.trim_end_matches("\r\n").to_string())
    }

    async fn request(&mut self, line: &str) -> Result<String> {
        self.send(line).await?;
        self.recv().await
    }

    /// True when nothing arrives for a short while.
    async fn is_silent(&mut self) -> bool {
        let mut line = String::new();
        timeout(SILENCE, self.reader.read_line(&mut line)).await.is_err()
    }

    async fn is_closed(&mut self) -> Result<bool> {
        let mut line = String::new();
        let n = timeout(REPLY_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out waiting for close"))??;
        Ok(n == 0)
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) -> Result<()> {
    for _ in 0..100 {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("condition not reached in time"))
}

#[tokio::test]
async fn read_lock_is_reported_by_find() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;

    assert_eq!(a.request("lock a r").await?, "+OK, lock success");
    let found = a.request("find a").await?;
    assert!(found.starts_with("+OK, the key read locked ref 1 at "), "{found}");
    assert_eq!(a.request("find a").await?, found);
    Ok(())
}

#[tokio::test]
async fn blocked_writer_is_woken_by_unlock() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;
    let mut b = server.client().await?;

    assert_eq!(a.request("lock a r").await?, "+OK, lock success");
    b.send("lock a w").await?;
    assert!(b.is_silent().await, "blocked lock must not be answered yet");

    assert_eq!(a.request("unlock").await?, "+OK, unlock success");
    assert_eq!(b.recv().await?, "+OK, lock success");
    assert!(b.request("find a").await?.starts_with("+OK, the key write locked ref 1"));
    Ok(())
}

#[tokio::test]
async fn nonblocking_write_fails_against_reader() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;
    let mut c = server.client().await?;

    a.request("lock a r").await?;
    assert_eq!(c.request("lock a wn").await?, "-ERR, lock failed");
    Ok(())
}

#[tokio::test]
async fn distinct_non_utf8_keys_are_locked_independently() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;
    let mut c = server.client().await?;

    a.send_bytes(b"lock \xff w").await?;
    assert_eq!(a.recv().await?, "+OK, lock success");
    c.send_bytes(b"lock \xfe wn").await?;
    assert_eq!(c.recv().await?, "+OK, lock success");

    let mut line = b"lock ".to_vec();
    line.extend_from_slice(&[0xE9; 30]);
    line.extend_from_slice(b" r");
    let mut d = server.client().await?;
    d.send_bytes(&line).await?;
    assert_eq!(d.recv().await?, "+OK, lock success");
    assert_eq!(server.service.snapshot().locked_keys, 3);
    Ok(())
}

#[tokio::test]
async fn find_matches_a_full_length_key() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;
    let key = "k".repeat(64);

    assert_eq!(a.request(&format!("lock {key} r")).await?, "+OK, lock success");
    let found = a.request(&format!("find {key}")).await?;
    assert!(found.starts_with("+OK, the key read locked ref 1 at "), "{found}");
    Ok(())
}

#[tokio::test]
async fn protocol_errors_are_reported_per_command() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;

    assert_eq!(a.request("lock a x").await?, "-ERR, illegal flags parameter");
    assert_eq!(a.request("unlock").await?, "-ERR, sequence error");
    assert_eq!(a.request("bogus").await?, "-ERR, unimplemented");
    assert_eq!(a.request("lock a r").await?, "+OK, lock success");
    Ok(())
}

#[tokio::test]
async fn dropped_holder_releases_and_wakes_waiter() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;
    let mut b = server.client().await?;

    a.request("lock k w").await?;
    b.send("lock k w").await?;
    assert!(b.is_silent().await);

    drop(a);
    assert_eq!(b.recv().await?, "+OK, lock success");
    assert_eq!(b.request("unlock").await?, "+OK, unlock success");
    Ok(())
}

#[tokio::test]
async fn quit_closes_the_connection() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;

    a.request("lock k w").await?;
    a.send("quit").await?;
    assert!(a.is_closed().await?);
    eventually(|| server.service.lookup("k").is_none()).await?;
    Ok(())
}

#[tokio::test]
async fn stats_and_help_blocks() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;

    a.request("lock k r").await?;
    assert_eq!(a.request("stats").await?, "+OK, server stats:");
    let mut lines = Vec::new();
    for _ in 0..7 {
        lines.push(a.recv().await?);
    }
    assert!(lines[0].starts_with("server started: "));
    assert_eq!(lines[1], "current conns: 1");
    assert_eq!(lines[3], "locked cmds: 1");
    assert_eq!(lines[6], "unlock cmds: 0");

    assert_eq!(a.request("help").await?, "+OK, lock server command usage (V0.0.1):");
    for expected in ["lock key_string {n | w/r}", "unlock", "quit", "find key_string", "stats", "help"] {
        assert_eq!(a.recv().await?, expected);
    }
    Ok(())
}

#[tokio::test]
async fn connections_over_the_limit_are_dropped() -> Result<()> {
    let server = TestServer::start(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await?;
    let mut a = server.client().await?;
    assert_eq!(a.request("find k").await?, "+OK, the key is not exist");

    let mut b = server.client().await?;
    assert!(b.is_closed().await?);
    assert_eq!(server.service.metrics().snapshot().rejected_connections, 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_accepting_and_releases_locks() -> Result<()> {
    let server = TestServer::start(ServerConfig::default()).await?;
    let mut a = server.client().await?;
    a.request("lock k w").await?;

    server.shutdown.send(true)?;
    assert!(a.is_closed().await?);
    eventually(|| server.service.lookup("k").is_none()).await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_aborts_peers_that_never_drain_replies() -> Result<()> {
    let server = TestServer::start(ServerConfig {
        shutdown_grace_ms: 200,
        ..ServerConfig::default()
    })
    .await?;
    let Client { mut reader, mut writer } = server.client().await?;

    writer.write_all(b"lock k w\r\n").await?;
    let mut line = String::new();
    timeout(REPLY_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for a reply"))??;
    assert_eq!(line, "+OK, lock success\r\n");

    // keep requesting help without ever reading the replies
    let flood = tokio::spawn(async move {
        let requests = b"help\r\n".repeat(200_000);
        let _ = writer.write_all(&requests).await;
        writer
    });
    tokio::time::sleep(SILENCE).await;

    server.shutdown.send(true)?;
    timeout(REPLY_TIMEOUT, server.serving)
        .await
        .map_err(|_| anyhow!("server did not stop after the grace period"))???;
    assert!(server.service.lookup("k").is_none());
    assert_eq!(server.service.snapshot().connections.total_connections, 0);

    flood.abort();
    drop(reader);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_listener_applies_access_mask() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    use tokio::net::UnixStream;

    let path = std::env::temp_dir().join(format!("keylock-test-{}.sock", std::process::id()));
    let config = ServerConfig {
        socket_path: Some(path.to_string_lossy().into_owned()),
        socket_access: "0600".to_string(),
        ..ServerConfig::default()
    };
    let service = Arc::new(LockService::new(&config, Metrics::new()));
    let server = Server::bind(&config, service).await?;
    let (_shutdown, rx) = watch::channel(false);
    tokio::spawn(server.serve(rx));

    let mode = std::fs::metadata(&path)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);

    let stream = UnixStream::connect(&path).await?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    write.write_all(b"lock k w\n").await?;
    let mut line = String::new();
    timeout(REPLY_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for a reply"))??;
    assert_eq!(line, "+OK, lock success\r\n");
    Ok(())
}
