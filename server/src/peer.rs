use crate::registry::ConnectionHandle;
use log::warn;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

/// Upper bound on a single frame write
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

// Zero timeout still polls the peek once, so the probe never waits.
const PROBE_TIMEOUT: Duration = Duration::ZERO;

/// Server side of one accepted TCP connection
///
/// Reading is reserved for the connection task that owns the handle. Writers
/// (accept probe, heartbeat, broadcast) may come from any task; the write lock
/// keeps every frame contiguous on the wire. A send that stops partway through
/// a frame leaves the stream misaligned, so the socket is marked broken, every
/// later send is refused and the owning task is told to close.
#[derive(Debug)]
pub struct PeerSocket {
    handle: ConnectionHandle,
    peer_addr: SocketAddr,
    stream: TcpStream,
    send_timeout: Duration,
    write_lock: Mutex<()>,
    broken: AtomicBool,
    close: Notify,
}

impl PeerSocket {
    pub fn new(handle: ConnectionHandle, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        PeerSocket {
            handle,
            peer_addr,
            stream,
            send_timeout: SEND_TIMEOUT,
            write_lock: Mutex::new(()),
            broken: AtomicBool::new(false),
            close: Notify::new(),
        }
    }

    /// Replaces the per-frame write timeout
    pub fn with_send_timeout(mut self, limit: Duration) -> Self {
        self.send_timeout = limit;
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// True once a frame was cut short on the wire
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Writes one whole frame, holding the write lock for its full length
    ///
    /// If the write fails or times out after part of the frame went out, the
    /// socket is marked broken and closed.
    pub async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.is_broken() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection stream is misaligned",
            ));
        }

        let mut written = 0;
        let result = timeout(self.send_timeout, self.write_all(frame, &mut written)).await;
        let result = match result {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "frame send timed out",
            )),
        };

        if result.is_err() && written > 0 && written < frame.len() {
            warn!(
                "Send to connection #{} ({}) stopped after {} of {} bytes, closing",
                self.handle,
                self.peer_addr,
                written,
                frame.len()
            );
            self.broken.store(true, Ordering::Release);
            self.close();
        }
        result
    }

    async fn write_all(&self, frame: &[u8], written: &mut usize) -> io::Result<()> {
        while *written < frame.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&frame[*written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => *written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Checks, without consuming data or waiting, whether the peer has already
    /// closed its side of the connection
    pub async fn probe_closed(&self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            timeout(PROBE_TIMEOUT, self.stream.peek(&mut byte)).await,
            Ok(Ok(0))
        )
    }

    /// Waits for readiness on the read side
    pub(crate) async fn ready(&self) -> io::Result<tokio::io::Ready> {
        self.stream.ready(Interest::READABLE).await
    }

    /// Asks the owning connection task to tear the connection down
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves after [`PeerSocket::close`] has been called
    pub(crate) async fn closed(&self) {
        self.close.notified().await;
    }
}
