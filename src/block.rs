//! FileBlock: the fixed-capacity wire form of one file.
//!
//! A block is always exactly `capacity` bytes on the wire. Content shorter
//! than the capacity is zero-padded; content longer than the capacity is cut
//! at the capacity. This is a hard ceiling on transferable file size, kept
//! for compatibility with the line protocol this service speaks. Receivers
//! take everything up to the first zero byte, so a file that itself contains
//! a zero byte arrives cut at that byte.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::io::AsyncReadExt;

use crate::protocol_core::content_end;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    buf: Vec<u8>,
    original_len: u64,
}

impl FileBlock {
    /// Pad or truncate `content` to exactly `capacity` bytes.
    pub fn encode(content: &[u8], capacity: usize) -> Self {
        let mut buf = vec![0u8; capacity];
        let n = content.len().min(capacity);
        buf[..n].copy_from_slice(&content[..n]);
        Self {
            buf,
            original_len: content.len() as u64,
        }
    }

    /// Read at most `capacity` bytes of a local file into a block.
    pub async fn read_file(path: &Path, capacity: usize) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("open {}", path.display()))?;
        let original_len = file
            .metadata()
            .await
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let mut content = Vec::with_capacity(capacity.min(original_len as usize));
        file.take(capacity as u64)
            .read_to_end(&mut content)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let mut block = Self::encode(&content, capacity);
        block.original_len = original_len;
        Ok(block)
    }

    /// Interpret a received wire buffer, never looking past `capacity`.
    pub fn from_wire(mut buf: Vec<u8>, capacity: usize) -> Self {
        buf.truncate(capacity);
        let original_len = content_end(&buf) as u64;
        Self { buf, original_len }
    }

    /// Content up to the first zero byte.
    pub fn content(&self) -> &[u8] {
        &self.buf[..content_end(&self.buf)]
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Size of the source before it was cut to the capacity.
    pub fn original_len(&self) -> u64 {
        self.original_len
    }

    pub fn is_truncated(&self) -> bool {
        self.original_len > self.buf.len() as u64
    }

    pub fn into_wire(self) -> Vec<u8> {
        self.buf
    }
}
