//! Multipart upload bookkeeping
//!
//! Bodies are streamed of unknown length. They are cut into parts as they
//! arrive; a body that ends before the first part fills is sent as a single
//! PutObject instead.

use bytes::{Bytes, BytesMut};

/// Minimum part size (5MB) - S3 requirement
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Maximum parts allowed
pub const MAX_PARTS: usize = 10000;

/// Multipart upload state
#[derive(Debug)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<CompletedPart>,
}

impl MultipartUpload {
    pub fn new(upload_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
            parts: Vec::new(),
        }
    }

    /// Number for the next part, or `None` once the part limit is reached
    pub fn next_part_number(&self) -> Option<u32> {
        if self.parts.len() >= MAX_PARTS {
            None
        } else {
            Some(self.parts.len() as u32 + 1)
        }
    }
}

/// Completed part info
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Accumulates body chunks into parts of at least `part_size` bytes
#[derive(Debug)]
pub struct PartBuffer {
    part_size: usize,
    buf: BytesMut,
}

impl PartBuffer {
    pub fn new(part_size: usize) -> Self {
        let part_size = std::cmp::max(part_size, MIN_PART_SIZE);
        Self {
            part_size,
            buf: BytesMut::new(),
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    /// Add a chunk; returns a full part once enough bytes are buffered
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() >= self.part_size {
            Some(self.buf.split().freeze())
        } else {
            None
        }
    }

    /// Whatever is left once the body has ended
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
