//! Payload compression.
//!
//! The writer keeps one compressor stream per cache file and ends every record
//! with a full flush: the record is byte-aligned, decodable as soon as it is
//! on disk, and never refers back into an earlier record. A reader that skips
//! a damaged record therefore still decodes the ones after it. The stream is
//! raw deflate (no zlib wrapper), so a record can be inflated on its own by a
//! fresh decompressor.

use crate::error::{FormatError, FormatResult};
use crate::mode::CompressMode;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

const OUTPUT_SLACK: usize = 64;

/// Record-at-a-time compressor.
pub trait Compressor: Send {
    /// The mode recorded in each envelope.
    fn mode(&self) -> CompressMode;

    /// Compresses one record. The output decodes without any earlier
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Compress`] if the underlying codec fails.
    fn compress(&mut self, input: &[u8]) -> FormatResult<Vec<u8>>;

    /// Upper bound on the output length for an input of `input_len` bytes.
    fn max_output_len(&self, input_len: usize) -> usize;

    /// Drops all dictionary state. Called whenever the cache file is
    /// recreated.
    fn reset(&mut self);
}

/// Mirror of [`Compressor`].
pub trait Decompressor: Send {
    /// Decompresses one record, failing if the output would exceed
    /// `max_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Decompress`] on malformed input or oversized
    /// output.
    fn decompress(&mut self, input: &[u8], max_len: usize) -> FormatResult<Vec<u8>>;

    /// Drops all dictionary state.
    fn reset(&mut self);
}

/// Returns the compressor for `mode`.
#[must_use]
pub fn compressor_for(mode: CompressMode) -> Box<dyn Compressor> {
    match mode {
        CompressMode::None => Box::new(NoCompression),
        CompressMode::Zlib => Box::new(ZlibCompressor::new()),
    }
}

/// Identity transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn mode(&self) -> CompressMode {
        CompressMode::None
    }

    fn compress(&mut self, input: &[u8]) -> FormatResult<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn max_output_len(&self, input_len: usize) -> usize {
        input_len
    }

    fn reset(&mut self) {}
}

impl Decompressor for NoCompression {
    fn decompress(&mut self, input: &[u8], max_len: usize) -> FormatResult<Vec<u8>> {
        if input.len() > max_len {
            return Err(FormatError::Decompress(format!(
                "stored payload of {} bytes exceeds {max_len}",
                input.len()
            )));
        }
        Ok(input.to_vec())
    }

    fn reset(&mut self) {}
}

/// Streaming raw-deflate compressor.
pub struct ZlibCompressor {
    inner: Compress,
}

impl ZlibCompressor {
    /// Creates a compressor at the default level.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZlibCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCompressor")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl Compressor for ZlibCompressor {
    fn mode(&self) -> CompressMode {
        CompressMode::Zlib
    }

    fn compress(&mut self, input: &[u8]) -> FormatResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.max_output_len(input.len()));
        let start = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            self.inner
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Full)
                .map_err(|e| FormatError::Compress(e.to_string()))?;

            let consumed = (self.inner.total_in() - start) as usize;
            // A flush is only complete once the codec stops short of the end
            // of the output buffer.
            if consumed == input.len() && out.len() < out.capacity() {
                return Ok(out);
            }
            out.reserve(OUTPUT_SLACK);
        }
    }

    fn max_output_len(&self, input_len: usize) -> usize {
        input_len + (input_len >> 12) + (input_len >> 14) + (input_len >> 25) + OUTPUT_SLACK / 2
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Streaming raw-deflate decompressor.
pub struct ZlibDecompressor {
    inner: Decompress,
}

impl ZlibDecompressor {
    /// Creates a decompressor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }
}

impl Default for ZlibDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZlibDecompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDecompressor")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl Decompressor for ZlibDecompressor {
    fn decompress(&mut self, input: &[u8], max_len: usize) -> FormatResult<Vec<u8>> {
        // One spare byte so overflow is detectable.
        let mut out = Vec::with_capacity(max_len + 1);
        let start = self.inner.total_in();

        loop {
            let consumed = (self.inner.total_in() - start) as usize;
            let produced = out.len();
            let status = self
                .inner
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| FormatError::Decompress(e.to_string()))?;

            if out.len() > max_len {
                return Err(FormatError::Decompress(format!(
                    "output exceeds {max_len} bytes"
                )));
            }
            let now_consumed = (self.inner.total_in() - start) as usize;
            if now_consumed == input.len() {
                return Ok(out);
            }
            if status == Status::StreamEnd {
                return Err(FormatError::Decompress(
                    "unexpected end of deflate stream".into(),
                ));
            }
            if now_consumed == consumed && out.len() == produced {
                return Err(FormatError::Decompress("decoder made no progress".into()));
            }
        }
    }

    fn reset(&mut self) {
        self.inner.reset(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MAX_RECORD_LEN;

    fn sample(seed: u8, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| b"abcdefghij"[(i + seed as usize) % 10])
            .collect()
    }

    #[test]
    fn zlib_records_decode_in_sequence() {
        let mut compressor = ZlibCompressor::new();
        let records: Vec<Vec<u8>> = (0..5).map(|i| sample(i, 300 + usize::from(i) * 50)).collect();
        let encoded: Vec<Vec<u8>> = records
            .iter()
            .map(|r| compressor.compress(r).unwrap())
            .collect();

        assert!(encoded.iter().all(|e| e.len() < 100));

        let mut decompressor = ZlibDecompressor::new();
        for (record, bytes) in records.iter().zip(&encoded) {
            assert_eq!(&decompressor.decompress(bytes, MAX_RECORD_LEN).unwrap(), record);
        }
    }

    #[test]
    fn zlib_record_decodes_without_predecessors() {
        let shared = b"repeated across records: connection pool exhausted, retrying".repeat(4);
        let mut compressor = ZlibCompressor::new();
        let first = compressor.compress(&shared).unwrap();
        let second = compressor.compress(&shared).unwrap();

        // The second record must not lean on the first one's window.
        let mut fresh = ZlibDecompressor::new();
        assert_eq!(fresh.decompress(&second, MAX_RECORD_LEN).unwrap(), shared);
        assert!(!first.is_empty());
    }

    #[test]
    fn zlib_reset_streams_concatenate() {
        let mut compressor = ZlibCompressor::new();
        let first = compressor.compress(&sample(1, 500)).unwrap();
        compressor.reset();
        let second = compressor.compress(&sample(2, 500)).unwrap();

        let mut decompressor = ZlibDecompressor::new();
        assert_eq!(decompressor.decompress(&first, MAX_RECORD_LEN).unwrap(), sample(1, 500));
        assert_eq!(decompressor.decompress(&second, MAX_RECORD_LEN).unwrap(), sample(2, 500));
    }

    #[test]
    fn zlib_incompressible_fits_bound() {
        let mut compressor = ZlibCompressor::new();
        let mut state = 0x1234_5678u32;
        let noise: Vec<u8> = (0..MAX_RECORD_LEN)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let bound = compressor.max_output_len(noise.len());
        let out = compressor.compress(&noise).unwrap();
        assert!(out.len() <= bound, "{} > {}", out.len(), bound);

        let mut decompressor = ZlibDecompressor::new();
        assert_eq!(decompressor.decompress(&out, MAX_RECORD_LEN).unwrap(), noise);
    }

    #[test]
    fn zlib_rejects_oversized_output() {
        let mut compressor = ZlibCompressor::new();
        let out = compressor.compress(&[7u8; 2048]).unwrap();

        let mut decompressor = ZlibDecompressor::new();
        assert!(matches!(
            decompressor.decompress(&out, 1024),
            Err(FormatError::Decompress(_))
        ));
    }

    #[test]
    fn zlib_garbage_fails() {
        let mut decompressor = ZlibDecompressor::new();
        // Block type 3 is reserved in deflate.
        assert!(decompressor.decompress(&[0xFF, 0xFF, 0xFF, 0xFF], 1024).is_err());
    }

    #[test]
    fn no_compression_is_identity() {
        let mut codec = NoCompression;
        assert_eq!(Compressor::compress(&mut codec, b"abc").unwrap(), b"abc");
        assert_eq!(codec.decompress(b"abc", 3).unwrap(), b"abc");
        assert!(codec.decompress(b"abcd", 3).is_err());
    }

    #[test]
    fn compressor_for_reports_mode() {
        assert_eq!(compressor_for(CompressMode::None).mode(), CompressMode::None);
        assert_eq!(compressor_for(CompressMode::Zlib).mode(), CompressMode::Zlib);
    }
}
