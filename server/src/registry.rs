//! Connection registry shared by the acceptors, connection tasks, heartbeat and
//! broadcast
//!
//! This module tracks which connections are live:
//! - Registration at accept time, bounded by a configured maximum
//! - Idempotent removal when a connection is torn down
//! - Ordered snapshots for the heartbeat and broadcast fan-out
//!
//! The registry never touches sockets. Each entry carries an opaque peer value
//! (the server stores its socket wrapper there) so that looking up a live
//! connection and reaching its socket is a single atomic step.

use crate::error::ServerError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Identifier of a connection, unique for the lifetime of the process.
pub type ConnectionHandle = u64;

/// A registered, connected peer
#[derive(Debug, Clone)]
pub struct Connection<P> {
    /// Handle assigned at accept time
    pub handle: ConnectionHandle,
    /// Remote address captured at accept time
    pub peer_addr: SocketAddr,
    /// When the connection was registered
    pub connected_at: Instant,
    /// Value attached by the owner of the registry
    pub peer: P,
}

/// Table of live connections keyed by handle
///
/// An entry exists exactly while the connection is connected; removing it is
/// the transition to disconnected. Callers share the registry behind a lock so
/// that readers never observe a half-applied update.
#[derive(Debug)]
pub struct ConnectionRegistry<P> {
    connections: HashMap<ConnectionHandle, Connection<P>>,
    max_connections: usize,
}

impl<P> ConnectionRegistry<P> {
    /// Creates an empty registry that admits at most `max_connections` entries
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Marks `handle` as connected from `peer_addr`
    ///
    /// Fails with `CapacityExceeded` when the table is full and with
    /// `AlreadyRegistered` when the handle is live; neither case touches the
    /// existing entries. Callers must close the underlying socket on failure.
    pub fn register(
        &mut self,
        handle: ConnectionHandle,
        peer_addr: SocketAddr,
        peer: P,
    ) -> Result<(), ServerError> {
        if self.connections.contains_key(&handle) {
            return Err(ServerError::AlreadyRegistered { handle });
        }
        if self.connections.len() >= self.max_connections {
            return Err(ServerError::CapacityExceeded {
                max: self.max_connections,
            });
        }

        self.connections.insert(
            handle,
            Connection {
                handle,
                peer_addr,
                connected_at: Instant::now(),
                peer,
            },
        );
        Ok(())
    }

    /// Marks `handle` as disconnected
    ///
    /// Returns the removed entry, or None when the handle was not connected.
    /// Unregistering twice is a no-op, so whichever task observes a failure
    /// first gets the entry and the others see None.
    pub fn unregister(&mut self, handle: ConnectionHandle) -> Option<Connection<P>> {
        self.connections.remove(&handle)
    }

    pub fn is_connected(&self, handle: ConnectionHandle) -> bool {
        self.connections.contains_key(&handle)
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection<P>> {
        self.connections.get(&handle)
    }

    /// Connected handles in ascending order
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = self.connections.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Finds the connection whose remote end is `addr`
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        self.connections
            .values()
            .find(|connection| connection.peer_addr == addr)
            .map(|connection| connection.handle)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl<P: Clone> ConnectionRegistry<P> {
    /// Handles and their attached values in ascending handle order
    ///
    /// Fan-out code copies the targets out with this and releases the lock
    /// before doing any I/O.
    pub fn peers(&self) -> Vec<(ConnectionHandle, SocketAddr, P)> {
        let mut peers: Vec<_> = self
            .connections
            .values()
            .map(|connection| (connection.handle, connection.peer_addr, connection.peer.clone()))
            .collect();
        peers.sort_unstable_by_key(|(handle, _, _)| *handle);
        peers
    }
}
