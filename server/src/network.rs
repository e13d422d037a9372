//! Server network layer: listening socket, acceptor pool and per-connection
//! frame dispatch

use crate::broadcast::{broadcast, BroadcastReport};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::heartbeat::run_heartbeat;
use crate::peer::PeerSocket;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::shutdown::{wait_for_shutdown, Shutdown};
use log::{debug, error, info, warn};
use shared::{decode, encode, PacketType, FRAME_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};

/// Registry shared by every loop of the server
pub type SharedRegistry = Arc<RwLock<ConnectionRegistry<Arc<PeerSocket>>>>;

const LISTEN_BACKLOG: u32 = 1024;
/// Frames read per readiness event before the task yields to its worker
pub const FRAMES_PER_WAKEUP: usize = 64;
// Pause after a failed accept (e.g. descriptor exhaustion) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Binds a listening socket for `host:port`
///
/// Every resolved address is tried in order; the first that binds and listens
/// wins. Failing to set `SO_REUSEADDR` is only a warning.
pub async fn bind_listen(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let address = format!("{}:{}", host, port);
    let candidates: Vec<SocketAddr> = lookup_host(&address)
        .await
        .map_err(|source| ServerError::Resolve {
            address: address.clone(),
            source,
        })?
        .collect();

    let mut last_error =
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved");
    for candidate in candidates {
        match listen_on(candidate) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("Could not bind {}: {}", candidate, e);
                last_error = e;
            }
        }
    }

    Err(ServerError::Bind {
        address,
        source: last_error,
    })
}

fn listen_on(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Err(e) = socket.set_reuseaddr(true) {
        warn!("Unable to set SO_REUSEADDR on {}: {}", addr, e);
    }
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// The connection-dispatch engine
///
/// `run` drives a pool of acceptor loops that share the listening socket, one
/// task per accepted connection, and the heartbeat loop. The multi-threaded
/// runtime supplies the worker threads and the readiness source; each
/// connection task is polled by one worker at a time, so a handle is never
/// processed by two workers at once.
pub struct Server {
    listener: Arc<TcpListener>,
    registry: SharedRegistry,
    config: ServerConfig,
    shutdown: Shutdown,
    next_handle: Arc<AtomicU64>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        debug!("Binding {}", config.address());
        let listener = bind_listen(&config.host, config.port).await?;
        info!(
            "Server listening on {}",
            listener.local_addr().map_err(ServerError::Io)?
        );

        Ok(Server {
            listener: Arc::new(listener),
            registry: Arc::new(RwLock::new(ConnectionRegistry::new(
                config.max_connections,
            ))),
            config,
            shutdown: Shutdown::new(),
            next_handle: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sends one frame to every connection except `exclude`
    ///
    /// Once shutdown has been triggered nothing is sent.
    pub async fn broadcast(
        &self,
        kind: PacketType,
        payload: &[u8],
        exclude: Option<ConnectionHandle>,
    ) -> Result<BroadcastReport, ServerError> {
        if self.shutdown.is_triggered() {
            debug!("Skipping broadcast of {}: shutting down", kind);
            return Ok(BroadcastReport::default());
        }
        broadcast(&self.registry, kind, payload, exclude).await
    }

    /// Serves until the shutdown flag is set, then waits for every loop and
    /// connection task to finish
    pub async fn run(&self) -> Result<(), ServerError> {
        // Each connection task holds a clone; recv() yields None once all are gone.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        let workers = self.config.workers.max(1);
        let mut acceptors = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let acceptor = Acceptor {
                worker_id,
                listener: Arc::clone(&self.listener),
                registry: Arc::clone(&self.registry),
                next_handle: Arc::clone(&self.next_handle),
                shutdown: self.shutdown.subscribe(),
                done_tx: done_tx.clone(),
            };
            acceptors.push(tokio::spawn(acceptor.run()));
        }
        drop(done_tx);

        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.registry),
            self.config.heartbeat_interval,
            self.shutdown.subscribe(),
        ));

        info!("Server started with {} acceptor loops", workers);

        for acceptor in acceptors {
            if let Err(e) = acceptor.await {
                error!("Acceptor task panicked: {}", e);
            }
        }
        if let Err(e) = heartbeat.await {
            error!("Heartbeat task panicked: {}", e);
        }
        let _ = done_rx.recv().await;

        info!("All connection tasks finished");
        Ok(())
    }
}

/// One of the acceptor loops racing on the shared listener
struct Acceptor {
    worker_id: usize,
    listener: Arc<TcpListener>,
    registry: SharedRegistry,
    next_handle: Arc<AtomicU64>,
    shutdown: watch::Receiver<bool>,
    done_tx: mpsc::Sender<()>,
}

impl Acceptor {
    async fn run(mut self) {
        debug!("Acceptor {} started", self.worker_id);
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = wait_for_shutdown(&mut self.shutdown) => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr).await,
                Err(e) => {
                    warn!("Acceptor {} failed to accept: {}", self.worker_id, e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        debug!("Acceptor {} stopped", self.worker_id);
    }

    /// Registers a fresh connection, starts its task and sends the accept-time
    /// PING
    async fn admit(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(PeerSocket::new(handle, stream, peer_addr));

        let registered = {
            let mut registry = self.registry.write().await;
            registry.register(handle, peer_addr, Arc::clone(&peer))
        };
        if let Err(e) = registered {
            // Dropping the only reference closes the socket.
            warn!("Rejecting connection from {}: {}", peer_addr, e);
            return;
        }
        info!("Accepted connection #{} from {}", handle, peer_addr);

        tokio::spawn(serve_connection(
            Arc::clone(&peer),
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            self.done_tx.clone(),
        ));

        match encode(PacketType::Ping, b"") {
            Ok(frame) => {
                if let Err(e) = peer.send_frame(&frame).await {
                    debug!("Initial PING to connection #{} failed: {}", handle, e);
                }
            }
            Err(e) => error!("Failed to encode PING: {}", e),
        }
    }
}

/// Why a connection task stopped
#[derive(Debug)]
enum Teardown {
    Shutdown,
    Reaped,
    Failed(ServerError),
}

/// Owns the read side of one connection until it ends
async fn serve_connection(
    peer: Arc<PeerSocket>,
    registry: SharedRegistry,
    mut shutdown: watch::Receiver<bool>,
    _done: mpsc::Sender<()>,
) {
    let handle = peer.handle();

    let teardown = loop {
        let ready = tokio::select! {
            ready = peer.ready() => ready,
            _ = peer.closed() => break Teardown::Reaped,
            _ = wait_for_shutdown(&mut shutdown) => break Teardown::Shutdown,
        };

        match ready {
            Ok(ready) if ready.is_read_closed() && !ready.is_readable() => {
                break Teardown::Failed(ServerError::ConnectionClosed);
            }
            Ok(_) => {}
            Err(e) => break Teardown::Failed(ServerError::Io(e)),
        }

        match drain_frames(&peer) {
            Ok(read) if read == FRAMES_PER_WAKEUP => tokio::task::yield_now().await,
            Ok(_) => {}
            Err(e) => break Teardown::Failed(e),
        }
    };

    let removed = registry.write().await.unregister(handle);
    match (&teardown, removed) {
        (Teardown::Failed(reason), Some(connection)) => {
            info!(
                "Connection #{} ({}) closed after {}s: {}",
                handle,
                connection.peer_addr,
                connection.connected_at.elapsed().as_secs(),
                reason
            );
        }
        (_, Some(connection)) => {
            debug!(
                "Connection #{} ({}) released after {}s: {:?}",
                handle,
                connection.peer_addr,
                connection.connected_at.elapsed().as_secs(),
                teardown
            );
        }
        (_, None) => {
            debug!("Connection #{} was already unregistered", handle);
        }
    }
}

/// Reads frames until the socket would block, at most [`FRAMES_PER_WAKEUP`]
/// of them, and returns how many were read
///
/// Each read must return exactly one frame; a short read, zero bytes or an I/O
/// error ends the connection. Stopping at the cap leaves the readiness set, so
/// the next wait returns at once.
fn drain_frames(peer: &PeerSocket) -> Result<usize, ServerError> {
    let mut read = 0;
    while read < FRAMES_PER_WAKEUP {
        let mut buf = [0u8; FRAME_SIZE];
        match peer.stream().try_read(&mut buf) {
            Ok(0) => return Err(ServerError::ConnectionClosed),
            Ok(n) if n != FRAME_SIZE => {
                return Err(shared::ProtocolError::MalformedFrame {
                    len: n,
                    expected: FRAME_SIZE,
                }
                .into())
            }
            Ok(_) => {
                let packet = decode(&buf)?;
                read += 1;
                debug!(
                    "Received {} from connection #{} ({})",
                    packet.kind,
                    peer.handle(),
                    peer.peer_addr()
                );
                match packet.kind {
                    PacketType::Pong => info!("Pong from connection #{}", peer.handle()),
                    PacketType::Ping => {}
                    PacketType::Other(code) => {
                        warn!(
                            "Ignoring unknown packet type {} from connection #{}",
                            code,
                            peer.handle()
                        );
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(read),
            Err(e) => return Err(ServerError::Io(e)),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_bind_listen_on_ephemeral_port() {
        let listener = bind_listen("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_listen_reports_unresolvable_host() {
        let err = bind_listen("host.invalid.", 80).await.unwrap_err();
        assert!(err.is_startup());
    }

    #[tokio::test]
    async fn test_bind_listen_reports_port_in_use() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = std_listener.local_addr().unwrap().port();

        let err = bind_listen("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_server_bind_uses_config() {
        let config = ServerConfig {
            host: "127.0.0.1".to_owned(),
            max_connections: 3,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();

        assert_eq!(server.registry().read().await.max_connections(), 3);
        assert!(server.registry().read().await.is_empty());
        assert_eq!(server.config().host, "127.0.0.1");
    }

    async fn served_pair() -> (Arc<PeerSocket>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        (Arc::new(PeerSocket::new(7, stream, peer_addr)), remote)
    }

    #[tokio::test]
    async fn test_drain_frames_stops_at_cap() {
        use tokio::io::AsyncWriteExt;

        let (peer, mut remote) = served_pair().await;
        let frame = encode(PacketType::Pong, b"").unwrap();
        for _ in 0..FRAMES_PER_WAKEUP + 3 {
            remote.write_all(&frame).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        peer.ready().await.unwrap();
        assert_eq!(drain_frames(&peer).unwrap(), FRAMES_PER_WAKEUP);

        peer.ready().await.unwrap();
        assert_eq!(drain_frames(&peer).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_drain_frames_rejects_invalid_length() {
        use tokio::io::AsyncWriteExt;

        let (peer, mut remote) = served_pair().await;
        let mut frame = encode(PacketType::Pong, b"").unwrap();
        frame[12..16].copy_from_slice(&1000u32.to_le_bytes());
        remote.write_all(&frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        peer.ready().await.unwrap();
        let err = drain_frames(&peer).unwrap_err();
        assert!(matches!(
            err,
            ServerError::Protocol(shared::ProtocolError::InvalidLength { length: 1000, .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_after_shutdown_sends_nothing() {
        let config = ServerConfig {
            host: "127.0.0.1".to_owned(),
            ..ServerConfig::default()
        };
        let server = Server::bind(config).await.unwrap();
        server.shutdown_handle().trigger();

        let report = server.broadcast(PacketType::Ping, b"", None).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
    }
}
