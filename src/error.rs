//! Crate-level error type

use std::io;

use crate::bpe::BpeError;
use crate::device::DeviceError;
use crate::rpc::ProtocolError;
use crate::translation::{EngineError, ModelError};

/// Errors that stop the server
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Bpe(#[from] BpeError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to set Ctrl+C handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
