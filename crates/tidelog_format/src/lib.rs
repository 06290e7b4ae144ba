//! # tidelog Format
//!
//! The binary layout shared by the writer and the reader.
//!
//! A file is a header followed by record envelopes:
//!
//! ```text
//! header:   [magic:4][version:1][name_len:2][name][sync marker:8]
//! envelope: [mode:1][iv:16 + public key:32, if encrypted][len:2][payload][sync marker:8]
//! ```
//!
//! All integers are little-endian. The sync marker after every envelope is
//! what makes the format self-healing: when a field is out of range the
//! parser searches for the next marker and resumes right after it, so damage
//! costs at most the record it hit.
//!
//! This crate also provides the payload transforms: [`Compressor`] /
//! [`Decompressor`] implementations and the AES-128-CFB record cipher keyed
//! through X25519 key agreement.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cipher;
mod compress;
mod error;
mod header;
mod marker;
mod mode;
mod record;

pub use cipher::{
    KeyPair, PeerPublicKey, RecordKey, ServerSecret, SessionCipher, IV_LEN, KEY_LEN,
    PUBLIC_KEY_LEN,
};
pub use compress::{
    compressor_for, Compressor, Decompressor, NoCompression, ZlibCompressor, ZlibDecompressor,
};
pub use error::{FormatError, FormatResult};
pub use header::{
    encode_header, header_len, parse_header, HeaderMismatch, FORMAT_VERSION, HEADER_PREFIX_LEN,
    MAGIC,
};
pub use marker::{find_marker, rfind_marker, MarkerSearcher, SYNC_MARKER, SYNC_MARKER_LEN};
pub use mode::{CompressMode, EncryptMode, ModeByte};
pub use record::{
    envelope_len, parse_envelope, resync, scan_records, validate_record, CipherBlock,
    DecodeError, Envelope, EnvelopeError, RecordDecoder, RecordEncoder, RecordSource,
    ScanSummary, CIPHER_BLOCK_LEN, LEN_FIELD_LEN, MAX_RECORD_LEN, MAX_STORED_LEN,
    MIN_ENVELOPE_LEN, MODE_LEN,
};
