//! IPC message types for delegate → owner delivery

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::flags::IpcFlags;
use crate::constants::ipc::KIND_FLAGS_UPDATE;

/// A tagged, copy-by-value payload sent by a delegate
///
/// `kind` tells the owner how to interpret `payload`; the owner rejects
/// any kind it does not recognise.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: u32,
    pub payload: Vec<u8>,
}

/// Owner's answer to a single envelope
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Message understood and processed
    Handled,

    /// Unknown discriminator or malformed payload; nothing was changed
    Rejected,
}

/// Decoded content of an envelope the owner understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Flags update from a newly launched instance
    FlagsUpdate(IpcFlags),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown message kind {0}")]
    UnknownKind(u32),

    #[error("payload for message kind {kind} must be {expected} bytes, got {actual}")]
    PayloadLength {
        kind: u32,
        expected: usize,
        actual: usize,
    },
}

impl Envelope {
    pub fn flags_update(flags: IpcFlags) -> Self {
        Self {
            kind: KIND_FLAGS_UPDATE,
            payload: flags.to_le_bytes().to_vec(),
        }
    }

    /// Validate discriminator and payload shape
    pub fn decode(&self) -> Result<Request, ProtocolError> {
        match self.kind {
            KIND_FLAGS_UPDATE => {
                let bytes: [u8; 4] =
                    self.payload
                        .as_slice()
                        .try_into()
                        .map_err(|_| ProtocolError::PayloadLength {
                            kind: self.kind,
                            expected: 4,
                            actual: self.payload.len(),
                        })?;
                Ok(Request::FlagsUpdate(IpcFlags::from_le_bytes(bytes)))
            }
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}
