use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::CacheError;

/// A chunk of file content that knows whether it is gzip-compressed.
///
/// `len()` always reports the uncompressed size. An empty block is never
/// compressed, whatever the cache configuration says.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataBlock {
    data: Bytes,
    compressed: bool,
    length: usize,
}

impl DataBlock {
    /// Wrap uncompressed bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len();
        Self {
            data,
            compressed: false,
            length,
        }
    }

    /// The sentinel block for zero-length files.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap bytes, gzip-compressing them first when `compress` is set.
    ///
    /// Data that gzip does not make smaller is kept as it is.
    pub fn prepare(data: impl Into<Bytes>, compress: bool) -> Result<Self, CacheError> {
        let data = data.into();
        if !compress || data.is_empty() {
            return Ok(Self::new(data));
        }
        let length = data.len();
        let gzipped = compress_fast(&data)?;
        if gzipped.len() >= length {
            return Ok(Self::new(data));
        }
        Ok(Self {
            data: gzipped.into(),
            compressed: true,
            length,
        })
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Size of the original, uncompressed content.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of bytes this block occupies in memory.
    pub fn stored_len(&self) -> usize {
        self.data.len()
    }

    /// The bytes exactly as stored, compressed or not.
    pub fn raw(&self) -> &Bytes {
        &self.data
    }

    /// The uncompressed content, decompressing if needed.
    pub fn uncompressed(&self) -> Result<Bytes, CacheError> {
        if !self.compressed {
            return Ok(self.data.clone());
        }
        let data = decompress(&self.data)?;
        if data.len() != self.length {
            return Err(CacheError::Compression(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "decompressed {} bytes, expected {}",
                    data.len(),
                    self.length
                ),
            )));
        }
        Ok(data.into())
    }

    /// The content gzip-compressed, reusing the stored bytes when possible.
    pub fn gzipped(&self) -> Result<Bytes, CacheError> {
        if self.compressed {
            return Ok(self.data.clone());
        }
        Ok(compress_fast(&self.data)?.into())
    }
}

/// Gzip with the fastest compression level. Empty input stays empty.
pub fn compress_fast(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data).map_err(CacheError::Compression)?;
    encoder.finish().map_err(CacheError::Compression)
}

/// Inverse of [`compress_fast`]. Empty input stays empty.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(CacheError::Compression)?;
    Ok(out)
}
