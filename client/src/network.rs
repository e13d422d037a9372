use log::{debug, info, warn};
use shared::{decode, encode, Packet, PacketType, ProtocolError, FRAME_SIZE};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

/// Per-attempt connect timeout and default receive timeout
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to resolve {address}: {source}")]
    Resolve { address: String, source: io::Error },
    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Client role of the protocol: one TCP connection to a server
pub struct Client {
    stream: TcpStream,
    server_addr: SocketAddr,
    pings_received: u64,
}

impl Client {
    /// Connects to `address:port`, trying each resolved address in turn
    pub async fn connect(address: &str, port: u16) -> Result<Self, ClientError> {
        let target = format!("{}:{}", address, port);
        let candidates: Vec<SocketAddr> = lookup_host(&target)
            .await
            .map_err(|source| ClientError::Resolve {
                address: target.clone(),
                source,
            })?
            .collect();

        let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved");
        for candidate in candidates {
            match timeout(IO_TIMEOUT, TcpStream::connect(candidate)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    info!("Connected to [{}]", candidate);
                    return Ok(Self::from_stream(stream, candidate));
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
                }
            }
            debug!("Connect attempt to {} failed: {}", candidate, last_error);
        }

        Err(ClientError::Connect {
            address: target,
            source: last_error,
        })
    }

    fn from_stream(stream: TcpStream, server_addr: SocketAddr) -> Self {
        Client {
            stream,
            server_addr,
            pings_received: 0,
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn pings_received(&self) -> u64 {
        self.pings_received
    }

    /// Sends one frame
    pub async fn send(&mut self, kind: PacketType, payload: &[u8]) -> Result<(), ClientError> {
        let frame = encode(kind, payload)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Waits for the next frame from the server
    pub async fn recv(&mut self) -> Result<Packet, ClientError> {
        let mut buf = [0u8; FRAME_SIZE];
        match self.stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ClientError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }

        let packet = decode(&buf)?;
        if packet.kind == PacketType::Ping {
            self.pings_received += 1;
        }
        Ok(packet)
    }

    /// Like [`Client::recv`] but gives up after `limit`
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<Packet, ClientError> {
        timeout(limit, self.recv())
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Answers every PING with a PONG until the server closes the connection
    pub async fn run(&mut self) -> Result<(), ClientError> {
        loop {
            let packet = match self.recv().await {
                Ok(packet) => packet,
                Err(ClientError::ConnectionClosed) => {
                    info!("Server closed the connection");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            info!("We've received a {}", packet.kind);
            match packet.kind {
                PacketType::Ping => self.send(PacketType::Pong, b"").await?,
                PacketType::Pong => {}
                PacketType::Other(code) => warn!("Ignoring unknown packet type {}", code),
            }
        }
    }

    /// Closes the write side; the server sees end-of-stream
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
