use crate::registry::ConnectionHandle;
use shared::ProtocolError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to resolve listen address {address}: {source}")]
    Resolve { address: String, source: io::Error },
    #[error("failed to bind TCP listener on {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("connection table is full ({max} connections)")]
    CapacityExceeded { max: usize },
    #[error("connection #{handle} is already registered")]
    AlreadyRegistered { handle: ConnectionHandle },
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Errors that leave the process unable to serve at all.
    pub fn is_startup(&self) -> bool {
        matches!(self, ServerError::Resolve { .. } | ServerError::Bind { .. })
    }
}
