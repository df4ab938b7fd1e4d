//! Centralized error type for the remotefx umbrella crate.
//!
//! Wraps all subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol: {0}")]
    Protocol(#[from] remotefx_protocol::ProtocolError),

    #[cfg(feature = "server")]
    #[error(transparent)]
    Server(#[from] remotefx_server::ServerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
