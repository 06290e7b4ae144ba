//! Record envelopes: encoding, parsing and forward recovery.

use crate::cipher::{RecordKey, ServerSecret, SessionCipher, IV_LEN, PUBLIC_KEY_LEN};
use crate::compress::{Compressor, Decompressor, NoCompression, ZlibDecompressor};
use crate::error::{FormatError, FormatResult};
use crate::marker::{find_marker, rfind_marker, SYNC_MARKER, SYNC_MARKER_LEN};
use crate::mode::{CompressMode, EncryptMode, ModeByte};
use std::ops::Range;
use thiserror::Error;

/// Largest record a caller may write.
pub const MAX_RECORD_LEN: usize = 16 * 1024;

/// Largest payload accepted in the length field. Leaves room for deflate
/// framing on incompressible input.
pub const MAX_STORED_LEN: usize = MAX_RECORD_LEN + 64;

/// Size of the mode byte.
pub const MODE_LEN: usize = 1;
/// Size of the length field.
pub const LEN_FIELD_LEN: usize = 2;
/// Size of the IV plus ephemeral public key in encrypted envelopes.
pub const CIPHER_BLOCK_LEN: usize = IV_LEN + PUBLIC_KEY_LEN;
/// Smallest byte count that could still hold an envelope.
pub const MIN_ENVELOPE_LEN: usize = MODE_LEN + LEN_FIELD_LEN + SYNC_MARKER_LEN;

/// Total envelope size for a payload of `payload_len` bytes.
#[must_use]
pub const fn envelope_len(payload_len: usize, encrypted: bool) -> usize {
    let cipher = if encrypted { CIPHER_BLOCK_LEN } else { 0 };
    MODE_LEN + cipher + LEN_FIELD_LEN + payload_len + SYNC_MARKER_LEN
}

/// Checks a caller-supplied record length.
///
/// # Errors
///
/// Returns [`FormatError::EmptyRecord`] or [`FormatError::RecordTooLarge`].
pub fn validate_record(record: &[u8]) -> FormatResult<()> {
    if record.is_empty() {
        return Err(FormatError::EmptyRecord);
    }
    if record.len() > MAX_RECORD_LEN {
        return Err(FormatError::RecordTooLarge {
            len: record.len(),
            max: MAX_RECORD_LEN,
        });
    }
    Ok(())
}

/// Random-access bytes an envelope can be parsed from.
///
/// Implemented for byte slices (the mapped cache file) and, in the core
/// crate, for archive files read through a storage backend.
pub trait RecordSource {
    /// Total number of bytes.
    fn source_len(&self) -> usize;

    /// Copies `buf.len()` bytes starting at `offset`. Returns `false` if the
    /// range is out of bounds or unreadable.
    fn read_exact_at(&self, offset: usize, buf: &mut [u8]) -> bool;

    /// Offset of the first sync marker at or after `from`.
    fn find_marker_from(&self, from: usize) -> Option<usize>;
}

impl RecordSource for [u8] {
    fn source_len(&self) -> usize {
        self.len()
    }

    fn read_exact_at(&self, offset: usize, buf: &mut [u8]) -> bool {
        match offset
            .checked_add(buf.len())
            .and_then(|end| self.get(offset..end))
        {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn find_marker_from(&self, from: usize) -> Option<usize> {
        find_marker(self, from)
    }
}

/// IV and ephemeral public key of an encrypted envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherBlock {
    /// Per-record IV.
    pub iv: [u8; IV_LEN],
    /// Writer's ephemeral public key.
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

/// A structurally valid envelope located in a [`RecordSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Offset of the mode byte.
    pub start: usize,
    /// Decoded mode byte.
    pub mode: ModeByte,
    /// Present when the payload is encrypted.
    pub cipher: Option<CipherBlock>,
    /// Where the stored payload lives.
    pub payload: Range<usize>,
    /// Offset just past the trailing sync marker.
    pub end: usize,
}

/// Why an envelope could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Fewer bytes remain than the envelope needs.
    #[error("not enough bytes left for a record")]
    Truncated,
    /// The mode byte has unknown nibbles.
    #[error("illegal mode byte {0:#04x}")]
    IllegalMode(u8),
    /// The length field is zero or larger than [`MAX_STORED_LEN`].
    #[error("illegal payload length {0}")]
    IllegalLength(usize),
    /// The bytes after the payload are not a sync marker.
    #[error("sync marker mismatch")]
    MarkerMismatch,
}

/// Parses the envelope starting at `start`.
///
/// # Errors
///
/// Returns the first field that is out of range. Callers recover with
/// [`resync`].
pub fn parse_envelope<S: RecordSource + ?Sized>(
    src: &S,
    start: usize,
) -> Result<Envelope, EnvelopeError> {
    let total = src.source_len();
    let remaining = total.saturating_sub(start);
    if remaining < MIN_ENVELOPE_LEN {
        return Err(EnvelopeError::Truncated);
    }

    let mut byte = [0u8; MODE_LEN];
    if !src.read_exact_at(start, &mut byte) {
        return Err(EnvelopeError::Truncated);
    }
    let mode = ModeByte::from_byte(byte[0]).ok_or(EnvelopeError::IllegalMode(byte[0]))?;
    if remaining < envelope_len(1, mode.is_encrypted()) {
        return Err(EnvelopeError::Truncated);
    }

    let mut cursor = start + MODE_LEN;
    let cipher = if mode.is_encrypted() {
        let mut block = [0u8; CIPHER_BLOCK_LEN];
        if !src.read_exact_at(cursor, &mut block) {
            return Err(EnvelopeError::Truncated);
        }
        cursor += CIPHER_BLOCK_LEN;
        let mut iv = [0u8; IV_LEN];
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        iv.copy_from_slice(&block[..IV_LEN]);
        public_key.copy_from_slice(&block[IV_LEN..]);
        Some(CipherBlock { iv, public_key })
    } else {
        None
    };

    let mut len_bytes = [0u8; LEN_FIELD_LEN];
    if !src.read_exact_at(cursor, &mut len_bytes) {
        return Err(EnvelopeError::Truncated);
    }
    let len = usize::from(u16::from_le_bytes(len_bytes));
    if len == 0 || len > MAX_STORED_LEN {
        return Err(EnvelopeError::IllegalLength(len));
    }
    cursor += LEN_FIELD_LEN;

    let payload = cursor..cursor + len;
    if payload.end + SYNC_MARKER_LEN > total {
        return Err(EnvelopeError::Truncated);
    }
    let mut marker = [0u8; SYNC_MARKER_LEN];
    if !src.read_exact_at(payload.end, &mut marker) || marker != SYNC_MARKER {
        return Err(EnvelopeError::MarkerMismatch);
    }

    Ok(Envelope {
        start,
        mode,
        cipher,
        end: payload.end + SYNC_MARKER_LEN,
        payload,
    })
}

/// Position to resume at after a damaged envelope starting at `start`:
/// just past the next sync marker, searching from the byte after `start`.
#[must_use]
pub fn resync<S: RecordSource + ?Sized>(src: &S, start: usize) -> Option<usize> {
    src.find_marker_from(start + 1)
        .map(|at| at + SYNC_MARKER_LEN)
}

/// Result of replaying the records of a cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSummary {
    /// Where the next record should be written.
    pub end: usize,
    /// Number of intact records.
    pub records: usize,
    /// Sum of their stored payload lengths.
    pub payload_bytes: usize,
    /// Number of damaged stretches skipped.
    pub skipped: usize,
}

/// Walks the records of `data` from `start`, recovering past damage, and
/// reports where writing should resume.
///
/// Only bytes up to the end of the last sync marker are considered: anything
/// after it is zero fill or a torn write.
#[must_use]
pub fn scan_records(data: &[u8], start: usize) -> ScanSummary {
    let tail = data.get(start..).unwrap_or_default();
    let limit = rfind_marker(tail).map_or(start, |at| start + at + SYNC_MARKER_LEN);
    let region = &data[..limit.min(data.len())];

    let mut summary = ScanSummary {
        end: start,
        ..ScanSummary::default()
    };
    let mut pos = start;
    while region.len().saturating_sub(pos) >= MIN_ENVELOPE_LEN {
        match parse_envelope(region, pos) {
            Ok(envelope) => {
                summary.records += 1;
                summary.payload_bytes += envelope.payload.len();
                pos = envelope.end;
            }
            Err(_) => {
                summary.skipped += 1;
                match resync(region, pos) {
                    Some(next) => pos = next,
                    None => break,
                }
            }
        }
    }
    summary.end = pos.max(start);
    summary
}

/// Turns records into envelopes.
pub struct RecordEncoder {
    compressor: Box<dyn Compressor>,
    cipher: Option<SessionCipher>,
}

impl RecordEncoder {
    /// Creates an encoder.
    #[must_use]
    pub fn new(compressor: Box<dyn Compressor>, cipher: Option<SessionCipher>) -> Self {
        Self { compressor, cipher }
    }

    /// Mode byte written with every record.
    #[must_use]
    pub fn mode(&self) -> ModeByte {
        let encrypt = if self.cipher.is_some() {
            EncryptMode::Aes
        } else {
            EncryptMode::None
        };
        ModeByte::new(self.compressor.mode(), encrypt)
    }

    /// Worst-case envelope size for a record of `record_len` bytes.
    #[must_use]
    pub fn max_encoded_len(&self, record_len: usize) -> usize {
        envelope_len(
            self.compressor.max_output_len(record_len),
            self.cipher.is_some(),
        )
    }

    /// Compresses, encrypts and frames one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record length is invalid or the compressor
    /// fails.
    pub fn encode(&mut self, record: &[u8]) -> FormatResult<Vec<u8>> {
        validate_record(record)?;
        let mut payload = self.compressor.compress(record)?;
        if payload.len() > MAX_STORED_LEN {
            return Err(FormatError::RecordTooLarge {
                len: payload.len(),
                max: MAX_STORED_LEN,
            });
        }

        let mode = self.mode();
        let mut out = Vec::with_capacity(envelope_len(payload.len(), mode.is_encrypted()));
        out.push(mode.to_byte());
        if let Some(cipher) = &self.cipher {
            let iv = cipher.seal(&mut payload);
            out.extend_from_slice(&iv);
            out.extend_from_slice(cipher.public_key());
        }
        // MAX_STORED_LEN fits in u16.
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&payload);
        out.extend_from_slice(&SYNC_MARKER);
        Ok(out)
    }

    /// Starts a new compression stream and switches to `cipher`.
    pub fn reset(&mut self, cipher: Option<SessionCipher>) {
        self.compressor.reset();
        self.cipher = cipher;
    }
}

impl std::fmt::Debug for RecordEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordEncoder")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// Why a structurally valid envelope's payload could not be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The record is encrypted and no secret was supplied.
    #[error("record is encrypted but no secret is configured")]
    CipherNotReady,
    /// Key agreement with the record's public key failed.
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),
    /// The payload did not decompress.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Turns envelope payloads back into records.
///
/// Every record is inflated from a clean state, so a damaged or skipped
/// record never affects the next one. The record key for the most recent
/// ephemeral public key is cached.
pub struct RecordDecoder {
    plain: NoCompression,
    zlib: ZlibDecompressor,
    secret: Option<ServerSecret>,
    cached_key: Option<([u8; PUBLIC_KEY_LEN], RecordKey)>,
}

impl RecordDecoder {
    /// Creates a decoder, optionally able to decrypt.
    #[must_use]
    pub fn new(secret: Option<ServerSecret>) -> Self {
        Self {
            plain: NoCompression,
            zlib: ZlibDecompressor::new(),
            secret,
            cached_key: None,
        }
    }

    /// Decodes the stored payload of `envelope`.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`].
    pub fn decode(&mut self, envelope: &Envelope, mut stored: Vec<u8>) -> Result<Vec<u8>, DecodeError> {
        if let Some(block) = &envelope.cipher {
            let key = self.key_for(&block.public_key)?;
            key.decrypt(&block.iv, &mut stored);
        }

        let decompressor: &mut dyn Decompressor = match envelope.mode.compress {
            CompressMode::None => &mut self.plain,
            CompressMode::Zlib => &mut self.zlib,
        };
        decompressor.reset();
        decompressor
            .decompress(&stored, MAX_RECORD_LEN)
            .map_err(|e| DecodeError::Decompress(e.to_string()))
    }

    /// Drops any decompression state left by the previous record.
    pub fn reset(&mut self) {
        self.zlib.reset();
    }

    fn key_for(&mut self, public_key: &[u8; PUBLIC_KEY_LEN]) -> Result<&RecordKey, DecodeError> {
        let secret = self.secret.as_ref().ok_or(DecodeError::CipherNotReady)?;
        let stale = self
            .cached_key
            .as_ref()
            .map_or(true, |(cached, _)| cached != public_key);
        if stale {
            let key = secret
                .record_key(public_key)
                .map_err(|e| DecodeError::KeyAgreement(e.to_string()))?;
            self.cached_key = Some((*public_key, key));
        }
        match &self.cached_key {
            Some((_, key)) => Ok(key),
            None => Err(DecodeError::CipherNotReady),
        }
    }
}

impl std::fmt::Debug for RecordDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordDecoder")
            .field("can_decrypt", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}
