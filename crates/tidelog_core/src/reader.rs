//! Sequential decoding of archive files.

use crate::error::{CoreError, CoreResult};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tidelog_format::{
    header_len, parse_envelope, parse_header, resync, DecodeError, EnvelopeError, HeaderMismatch,
    MarkerSearcher, RecordDecoder, RecordSource, ServerSecret, SYNC_MARKER_LEN,
};
use tidelog_storage::{FileBackend, StorageBackend};
use tracing::{debug, warn};

const SEARCH_CHUNK: usize = 64 * 1024;

/// Reads and validates the header of `backend`, returning its length.
pub(crate) fn read_header<B: StorageBackend + ?Sized>(
    backend: &B,
    channel: &str,
) -> Result<usize, HeaderMismatch> {
    let size = backend.size().map_err(|_| HeaderMismatch::ReadFail)?;
    let wanted = (header_len(channel) as u64).min(size);
    // header_len is bounded by a u16 name length, so this fits.
    let bytes = backend
        .read_at(0, wanted as usize)
        .map_err(|_| HeaderMismatch::ReadFail)?;
    parse_header(&bytes, channel)
}

/// Why [`LogReader::read`] did not produce a record.
///
/// Every variant except [`ReadError::BufferTooSmall`] has already moved the
/// cursor past the failed record, so calling read again skims to the next
/// intact one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// Fewer bytes remain than a record needs.
    #[error("not enough bytes left for a record at {position}")]
    Truncated {
        /// Offset of the failed record.
        position: usize,
    },
    /// The file could not be read.
    #[error("read failed at {position}")]
    Io {
        /// Offset of the failed read.
        position: usize,
    },
    /// Unknown mode byte.
    #[error("illegal mode byte {mode:#04x} at {position}")]
    IllegalMode {
        /// The byte found.
        mode: u8,
        /// Offset of the failed record.
        position: usize,
    },
    /// An encrypted record was found but no secret was supplied.
    #[error("record at {position} is encrypted and no secret is configured")]
    CipherNotReady {
        /// Offset of the skipped record.
        position: usize,
    },
    /// The record's key could not be derived.
    #[error("key agreement failed for record at {position}")]
    KeyAgreement {
        /// Offset of the skipped record.
        position: usize,
    },
    /// The length field is zero or too large.
    #[error("illegal length {len} at {position}")]
    IllegalLength {
        /// The length found.
        len: usize,
        /// Offset of the failed record.
        position: usize,
    },
    /// The caller's buffer cannot hold the record. The record is kept and
    /// returned by the next read with a large enough buffer.
    #[error("record needs {needed} bytes")]
    BufferTooSmall {
        /// Length of the pending record.
        needed: usize,
    },
    /// The payload did not decompress.
    #[error("decompression failed for record at {position}")]
    Decompress {
        /// Offset of the skipped record.
        position: usize,
    },
    /// The trailing sync marker was wrong.
    #[error("sync marker mismatch for record at {position}")]
    MarkerMismatch {
        /// Offset of the failed record.
        position: usize,
    },
}

impl ReadError {
    /// The negative status code of this failure.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Truncated { .. } => -2,
            Self::Io { .. } => -3,
            Self::IllegalMode { .. } => -4,
            Self::CipherNotReady { .. } => -5,
            Self::IllegalLength { .. } => -10,
            Self::BufferTooSmall { .. } => -11,
            Self::KeyAgreement { .. } => -13,
            Self::Decompress { .. } => -15,
            Self::MarkerMismatch { .. } => -20,
        }
    }

    fn from_envelope(err: EnvelopeError, position: usize) -> Self {
        match err {
            EnvelopeError::Truncated => Self::Truncated { position },
            EnvelopeError::IllegalMode(mode) => Self::IllegalMode { mode, position },
            EnvelopeError::IllegalLength(len) => Self::IllegalLength { len, position },
            EnvelopeError::MarkerMismatch => Self::MarkerMismatch { position },
        }
    }

    fn from_decode(err: &DecodeError, position: usize) -> Self {
        match err {
            DecodeError::CipherNotReady => Self::CipherNotReady { position },
            DecodeError::KeyAgreement(_) => Self::KeyAgreement { position },
            DecodeError::Decompress(_) => Self::Decompress { position },
        }
    }
}

/// A [`RecordSource`] over a storage backend, searching in chunks.
struct BackendSource<'a, B: StorageBackend + ?Sized> {
    backend: &'a B,
    len: usize,
}

impl<B: StorageBackend + ?Sized> RecordSource for BackendSource<'_, B> {
    fn source_len(&self) -> usize {
        self.len
    }

    fn read_exact_at(&self, offset: usize, buf: &mut [u8]) -> bool {
        offset + buf.len() <= self.len && self.backend.read_into(offset as u64, buf).is_ok()
    }

    fn find_marker_from(&self, from: usize) -> Option<usize> {
        let searcher = MarkerSearcher::forward();
        let mut state = 0;
        let mut chunk = vec![0u8; SEARCH_CHUNK.min(self.len.saturating_sub(from))];
        let mut offset = from;
        while offset < self.len {
            let n = chunk.len().min(self.len - offset);
            let buf = &mut chunk[..n];
            if self.backend.read_into(offset as u64, buf).is_err() {
                return None;
            }
            for (i, byte) in buf.iter().enumerate() {
                if searcher.step(&mut state, *byte) {
                    return Some(offset + i + 1 - SYNC_MARKER_LEN);
                }
            }
            offset += n;
        }
        None
    }
}

/// Sequential reader over one archive file.
///
/// # Example
///
/// ```no_run
/// use tidelog_core::LogReader;
/// use std::path::Path;
///
/// let mut reader = LogReader::open(Path::new("logs/app-20240101.log"), "app", None)?;
/// while let Some(record) = reader.read_record().transpose() {
///     match record {
///         Ok(bytes) => println!("{} bytes", bytes.len()),
///         Err(err) => eprintln!("skipped: {err}"),
///     }
/// }
/// # Ok::<(), tidelog_core::CoreError>(())
/// ```
pub struct LogReader<B: StorageBackend = FileBackend> {
    backend: B,
    path: PathBuf,
    size: usize,
    header_len: usize,
    position: usize,
    decoder: RecordDecoder,
    pending: Option<Vec<u8>>,
}

impl LogReader<FileBackend> {
    /// Opens the archive at `path` written by `channel`.
    ///
    /// An archive whose header does not match is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::HeaderRejected`] for a mismatched header, or an
    /// I/O error if the file cannot be opened.
    pub fn open(path: &Path, channel: &str, secret: Option<ServerSecret>) -> CoreResult<Self> {
        let backend = FileBackend::open_read_only(path)?;
        match read_header(&backend, channel) {
            Ok(header_len) => Self::with_header(backend, path.to_path_buf(), header_len, secret),
            Err(reason) => {
                drop(backend);
                warn!(path = %path.display(), %reason, "archive header mismatch, removing");
                if let Err(err) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %err, "fail to remove rejected archive");
                }
                Err(CoreError::HeaderRejected {
                    path: path.to_path_buf(),
                    reason,
                })
            }
        }
    }

    /// Picks up bytes appended since the reader was opened, such as a day
    /// archive that was flushed into meanwhile.
    ///
    /// # Errors
    ///
    /// Returns an error if the file metadata cannot be read.
    pub fn refresh(&mut self) -> CoreResult<usize> {
        self.size = self.backend.refresh_size()? as usize;
        Ok(self.size)
    }
}

impl<B: StorageBackend> LogReader<B> {
    /// Reads from any backend. Nothing is deleted on a header mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::HeaderRejected`] if the header does not match.
    pub fn from_backend(backend: B, channel: &str, secret: Option<ServerSecret>) -> CoreResult<Self> {
        let header_len = read_header(&backend, channel).map_err(|reason| CoreError::HeaderRejected {
            path: PathBuf::new(),
            reason,
        })?;
        Self::with_header(backend, PathBuf::new(), header_len, secret)
    }

    fn with_header(
        backend: B,
        path: PathBuf,
        header_len: usize,
        secret: Option<ServerSecret>,
    ) -> CoreResult<Self> {
        let size = backend.size()? as usize;
        debug!(path = %path.display(), size, "reader opened");
        Ok(Self {
            backend,
            path,
            size,
            header_len,
            position: header_len,
            decoder: RecordDecoder::new(secret),
            pending: None,
        })
    }

    /// Path of the archive; empty for readers built with
    /// [`LogReader::from_backend`].
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size seen by the reader.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the first record.
    #[must_use]
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// Offset of the next record.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves the cursor without validating the target. Seek to a record
    /// boundary, such as [`LogReader::header_len`] or a previous
    /// [`LogReader::position`]; any other offset skims to the next marker.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
        self.pending = None;
        self.decoder.reset();
    }

    /// Decodes the next record. Returns `Ok(None)` at the end of the file.
    ///
    /// # Errors
    ///
    /// Returns a [`ReadError`] for a damaged or undecodable record; the
    /// cursor has moved past it unless the variant says otherwise.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        let start = self.position;
        if start >= self.size {
            return Ok(None);
        }

        let source = BackendSource {
            backend: &self.backend,
            len: self.size,
        };
        let envelope = match parse_envelope(&source, start) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.position = resync(&source, start).unwrap_or(self.size);
                debug!(path = %self.path.display(), start, resume = self.position, error = %err, "damaged record");
                return Err(ReadError::from_envelope(err, start));
            }
        };

        self.position = envelope.end;
        let mut stored = vec![0u8; envelope.payload.len()];
        if let Err(err) = self
            .backend
            .read_into(envelope.payload.start as u64, &mut stored)
        {
            debug!(path = %self.path.display(), start, error = %err, "payload read failed");
            return Err(ReadError::Io { position: start });
        }
        self.decoder
            .decode(&envelope, stored)
            .map(Some)
            .map_err(|err| ReadError::from_decode(&err, start))
    }

    /// Decodes the next record into `buf`, returning its length, or 0 at
    /// the end of the file.
    ///
    /// # Errors
    ///
    /// Same as [`LogReader::read_record`], plus
    /// [`ReadError::BufferTooSmall`] when `buf` is too short.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let Some(record) = self.read_record()? else {
            return Ok(0);
        };
        if record.len() > buf.len() {
            let needed = record.len();
            self.pending = Some(record);
            return Err(ReadError::BufferTooSmall { needed });
        }
        buf[..record.len()].copy_from_slice(&record);
        Ok(record.len())
    }
}

impl<B: StorageBackend> Iterator for LogReader<B> {
    type Item = Result<Vec<u8>, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

impl<B: StorageBackend> std::fmt::Debug for LogReader<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tidelog_format::{
        compressor_for, encode_header, CompressMode, KeyPair, PeerPublicKey, RecordEncoder,
        SessionCipher, SYNC_MARKER,
    };
    use tidelog_storage::InMemoryBackend;

    fn build(channel: &str, mode: CompressMode, records: &[&[u8]]) -> Vec<u8> {
        let mut data = encode_header(channel).unwrap();
        let mut encoder = RecordEncoder::new(compressor_for(mode), None);
        for record in records {
            data.extend(encoder.encode(record).unwrap());
        }
        data
    }

    fn reader(data: Vec<u8>) -> LogReader<InMemoryBackend> {
        LogReader::from_backend(InMemoryBackend::with_data(data), "test", None).unwrap()
    }

    #[test]
    fn reads_records_in_order() {
        let data = build("test", CompressMode::Zlib, &[b"one", b"two", b"three"]);
        let records: Vec<_> = reader(data).map(Result::unwrap).collect();
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn header_mismatch_rejected() {
        let data = build("other", CompressMode::None, &[b"x"]);
        let result = LogReader::from_backend(InMemoryBackend::with_data(data), "test", None);
        assert!(matches!(
            result,
            Err(CoreError::HeaderRejected {
                reason: HeaderMismatch::ChannelMismatch,
                ..
            })
        ));
    }

    #[test]
    fn open_deletes_mismatched_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test-20240101.log");
        fs::write(&path, build("other", CompressMode::None, &[b"x"])).unwrap();

        assert!(LogReader::open(&path, "test", None).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn skims_past_damaged_record() {
        let mut data = build("test", CompressMode::None, &[b"first", b"second", b"third"]);
        // Mode byte of the second record.
        let second = header_len("test") + 3 + b"first".len() + SYNC_MARKER.len();
        data[second] = 0xEE;

        let mut reader = reader(data);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"first");
        let err = reader.read_record().unwrap_err();
        assert_eq!(err.code(), -4);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"third");
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn small_buffer_keeps_record_pending() {
        let data = build("test", CompressMode::None, &[b"0123456789", b"ab"]);
        let mut reader = reader(data);

        let mut small = [0u8; 4];
        let err = reader.read(&mut small).unwrap_err();
        assert_eq!(err, ReadError::BufferTooSmall { needed: 10 });
        assert_eq!(err.code(), -11);

        let mut big = [0u8; 32];
        assert_eq!(reader.read(&mut big).unwrap(), 10);
        assert_eq!(&big[..10], b"0123456789");
        assert_eq!(reader.read(&mut big).unwrap(), 2);
        assert_eq!(reader.read(&mut big).unwrap(), 0);
    }

    #[test]
    fn seek_replays_from_header() {
        let data = build("test", CompressMode::Zlib, &[b"alpha", b"beta"]);
        let mut reader = reader(data);
        assert_eq!(reader.by_ref().count(), 2);

        let start = reader.header_len();
        reader.seek(start);
        assert_eq!(reader.position(), start);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"alpha");
    }

    #[test]
    fn encrypted_records_need_secret() {
        let pair = KeyPair::generate();
        let peer = PeerPublicKey::from_hex(&pair.public_hex()).unwrap();
        let mut data = encode_header("test").unwrap();
        let mut encoder = RecordEncoder::new(
            compressor_for(CompressMode::Zlib),
            Some(SessionCipher::establish(&peer).unwrap()),
        );
        data.extend(encoder.encode(b"secret one").unwrap());
        data.extend(encoder.encode(b"secret two").unwrap());

        let mut locked = reader(data.clone());
        let err = locked.read_record().unwrap_err();
        assert_eq!(err.code(), -5);

        let secret = ServerSecret::from_hex(&pair.secret_hex()).unwrap();
        let unlocked =
            LogReader::from_backend(InMemoryBackend::with_data(data), "test", Some(secret)).unwrap();
        let records: Vec<_> = unlocked.map(Result::unwrap).collect();
        assert_eq!(records, vec![b"secret one".to_vec(), b"secret two".to_vec()]);
    }

    #[test]
    fn torn_tail_reports_truncation_once() {
        let mut data = build("test", CompressMode::None, &[b"whole"]);
        data.extend_from_slice(&[0x11, 0x05]);
        let mut reader = reader(data);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"whole");
        assert!(matches!(
            reader.read_record(),
            Err(ReadError::Truncated { .. })
        ));
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn marker_search_crosses_chunks() {
        let backend = InMemoryBackend::with_data({
            let mut data = vec![0u8; SEARCH_CHUNK + 3];
            data.extend_from_slice(&SYNC_MARKER);
            data
        });
        let source = BackendSource {
            backend: &backend,
            len: SEARCH_CHUNK + 3 + SYNC_MARKER_LEN,
        };
        assert_eq!(source.find_marker_from(0), Some(SEARCH_CHUNK + 3));
        assert_eq!(source.find_marker_from(SEARCH_CHUNK + 4), None);
    }

    /// Serves every read except those touching `broken`.
    struct FlakyBackend {
        inner: InMemoryBackend,
        broken: std::ops::Range<u64>,
    }

    impl StorageBackend for FlakyBackend {
        fn read_at(&self, offset: u64, len: usize) -> tidelog_storage::StorageResult<Vec<u8>> {
            let end = offset + len as u64;
            if offset < self.broken.end && self.broken.start < end {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "gone").into());
            }
            self.inner.read_at(offset, len)
        }

        fn size(&self) -> tidelog_storage::StorageResult<u64> {
            self.inner.size()
        }
    }

    #[test]
    fn failed_payload_read_moves_past_record() {
        let data = build("test", CompressMode::None, &[b"first", b"second", b"third"]);
        let second = header_len("test") + 3 + b"first".len() + SYNC_MARKER.len();
        let payload = (second + 3) as u64;
        let backend = FlakyBackend {
            inner: InMemoryBackend::with_data(data),
            broken: payload..payload + 1,
        };
        let mut reader = LogReader::from_backend(backend, "test", None).unwrap();

        let results: Vec<_> = reader.by_ref().take(10).collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref().unwrap(), b"first");
        assert_eq!(results[1].as_ref().unwrap_err().code(), -3);
        assert_eq!(results[2].as_deref().unwrap(), b"third");
        assert_eq!(reader.read_record().unwrap(), None);
    }

    #[test]
    fn seek_to_later_record_decodes_zlib() {
        let data = build("test", CompressMode::Zlib, &[b"alpha alpha", b"alpha beta"]);
        let mut reader = reader(data);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"alpha alpha");
        let second = reader.position();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"alpha beta");

        reader.seek(second);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"alpha beta");
    }

    #[test]
    fn refresh_sees_appended_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test-20240101.log");
        fs::write(&path, build("test", CompressMode::None, &[b"a"])).unwrap();
        let mut reader = LogReader::open(&path, "test", None).unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"a");
        assert_eq!(reader.read_record().unwrap(), None);

        let more = build("test", CompressMode::None, &[b"b"]);
        let mut all = fs::read(&path).unwrap();
        all.extend_from_slice(&more[header_len("test")..]);
        fs::write(&path, all).unwrap();

        reader.refresh().unwrap();
        assert_eq!(reader.read_record().unwrap().unwrap(), b"b");
    }
}
