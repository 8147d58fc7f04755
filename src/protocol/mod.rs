mod flags;

pub use flags::Flags;

use thiserror::Error;

/// Region size used when none is given: 1 flags byte + 99 payload bytes.
pub const DEFAULT_REGION_SIZE: usize = 100;

/// Smallest region that can still carry a byte of data per chunk.
pub const MIN_REGION_SIZE: usize = 3;

/// Offset of the flags byte inside the region.
pub const FLAGS_OFFSET: usize = 0;

/// Offset of the payload area inside the region.
pub const PAYLOAD_OFFSET: usize = 1;

/// Written right after the last data byte. Everything behind it is zero.
pub const TERMINATOR: u8 = 0x80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("region of {size} bytes is too small, need at least {MIN_REGION_SIZE}")]
    RegionTooSmall { size: usize },

    #[error("chunk of {len} bytes does not fit a payload area of {area} bytes")]
    ChunkTooLarge { len: usize, area: usize },

    #[error("payload has no terminator byte")]
    MissingTerminator,

    #[error("chunk without EOF carries {len} bytes, expected a full chunk of {expected}")]
    ShortChunk { len: usize, expected: usize },
}

/// Geometry of a channel region of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    size: usize,
}

impl Layout {
    pub fn new(size: usize) -> Result<Self, ProtocolError> {
        if size < MIN_REGION_SIZE {
            return Err(ProtocolError::RegionTooSmall { size });
        }
        Ok(Self { size })
    }

    /// Whole region, flags byte included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes after the flags byte.
    pub fn payload_area(&self) -> usize {
        self.size - PAYLOAD_OFFSET
    }

    /// Most data bytes a single chunk can carry; one byte of the payload
    /// area is always reserved for the terminator.
    pub fn max_chunk(&self) -> usize {
        self.payload_area() - 1
    }

    /// Chunks needed for a file of `len` bytes. A length that is a multiple
    /// of `max_chunk` (zero included) ends with an empty EOF chunk.
    pub fn chunk_count(&self, len: u64) -> u64 {
        len / self.max_chunk() as u64 + 1
    }
}

/// One handshake's worth of file data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub eof: bool,
}

impl Chunk {
    pub fn new(data: Vec<u8>, eof: bool) -> Self {
        Self { data, eof }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Lay the chunk out in a payload area: data, terminator, zero padding.
    pub fn encode_into(&self, area: &mut [u8]) -> Result<(), ProtocolError> {
        let len = self.data.len();
        if len >= area.len() {
            return Err(ProtocolError::ChunkTooLarge {
                len,
                area: area.len(),
            });
        }
        let (data, rest) = area.split_at_mut(len);
        data.copy_from_slice(&self.data);
        if let Some((marker, padding)) = rest.split_first_mut() {
            *marker = TERMINATOR;
            padding.fill(0);
        }
        Ok(())
    }

    /// Recover a chunk from a payload area. A chunk that does not carry EOF
    /// must be full, otherwise the receiver would lose track of the end.
    pub fn decode(area: &[u8], eof: bool) -> Result<Self, ProtocolError> {
        let end = area
            .iter()
            .rposition(|&b| b != 0)
            .ok_or(ProtocolError::MissingTerminator)?;
        if area[end] != TERMINATOR {
            return Err(ProtocolError::MissingTerminator);
        }
        let full = area.len() - 1;
        if !eof && end != full {
            return Err(ProtocolError::ShortChunk {
                len: end,
                expected: full,
            });
        }
        Ok(Self::new(area[..end].to_vec(), eof))
    }
}
