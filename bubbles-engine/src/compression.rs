//! Payload compression negotiated during the room join.
//!
//! Uses LZ4 block compression with a prepended size, the same framing
//! the relay and every client agree on once `Lz4` is accepted.

use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolError;

/// Codec applied to position payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    /// Pick the codec for a client that asked for compression or not.
    pub fn requested(compressed: bool) -> Self {
        if compressed {
            Self::Lz4
        } else {
            Self::None
        }
    }

    /// What the relay answers to a request, given whether it allows compression.
    pub fn negotiate(self, allow_compression: bool) -> Self {
        if allow_compression {
            self
        } else {
            Self::None
        }
    }

    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::None => data.to_vec(),
            Self::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| ProtocolError::Decompression(e.to_string())),
        }
    }
}
