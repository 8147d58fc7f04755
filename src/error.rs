use crate::protocol::ProtocolError;
use crate::shm::ShmError;
use crate::wait::WaitError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Process exit statuses, one per failure stage.
pub mod exit {
    pub const USAGE: u8 = 1;
    pub const FILE: u8 = 2;
    pub const IDENTIFIER: u8 = 3;
    pub const CREATE: u8 = 4;
    pub const ATTACH: u8 = 5;
    pub const DETACH: u8 = 6;
    pub const DESTROY: u8 = 7;
    pub const TRANSFER: u8 = 8;
    pub const TIMEOUT: u8 = 9;
    pub const CANCELLED: u8 = 10;
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("cannot read {}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ShmError),

    #[error("I/O error during transfer")]
    Io(#[from] io::Error),

    #[error("corrupt chunk")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl TransferError {
    pub fn exit_code(&self) -> u8 {
        match self {
            TransferError::Source { .. } | TransferError::Destination { .. } => exit::FILE,
            TransferError::Channel(err) => channel_exit_code(err),
            TransferError::Io(_) | TransferError::Protocol(_) => exit::TRANSFER,
            TransferError::Wait(WaitError::Timeout { .. }) => exit::TIMEOUT,
            TransferError::Wait(WaitError::Cancelled { .. }) => exit::CANCELLED,
        }
    }
}

fn channel_exit_code(err: &ShmError) -> u8 {
    match err {
        ShmError::Identifier { .. } => exit::IDENTIFIER,
        ShmError::Create { .. } => exit::CREATE,
        ShmError::Attach { .. } => exit::ATTACH,
        ShmError::Detach(_) => exit::DETACH,
        ShmError::Destroy { .. } => exit::DESTROY,
    }
}

/// Exit status for an error chain, looking through any added context.
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| {
            if let Some(err) = cause.downcast_ref::<TransferError>() {
                Some(err.exit_code())
            } else {
                cause.downcast_ref::<ShmError>().map(channel_exit_code)
            }
        })
        .unwrap_or(exit::USAGE)
}
