//! Record encryption.
//!
//! ## Security Model
//!
//! - Payloads are encrypted with AES-128-CFB, a stream mode, so the
//!   ciphertext has the same length as the plaintext
//! - Every record carries its own random IV and is independently decryptable
//! - The AES key is derived with HKDF-SHA256 from an X25519 shared secret
//!   between an ephemeral key pair (regenerated each time a cache file is
//!   loaded) and the long-lived peer public key from the configuration
//! - The ephemeral public key travels with each record so the holder of the
//!   peer secret can rebuild the key
//! - Keys are zeroized on drop and redacted from `Debug` output

use crate::error::{FormatError, FormatResult};
use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;

/// Size of the AES-128 key in bytes.
pub const KEY_LEN: usize = 16;
/// Size of the per-record IV in bytes.
pub const IV_LEN: usize = 16;
/// Size of an X25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

const KDF_INFO: &[u8] = b"tidelog-record-key-v1";

/// Symmetric key for one cache-file generation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecordKey {
    bytes: [u8; KEY_LEN],
}

impl RecordKey {
    fn derive(shared: &SharedSecret) -> FormatResult<Self> {
        if !shared.was_contributory() {
            return Err(FormatError::InvalidKey(
                "key agreement produced a low-order shared secret".into(),
            ));
        }
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        hk.expand(KDF_INFO, &mut bytes)
            .map_err(|_| FormatError::Cipher("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    /// Encrypts `buf` in place.
    pub fn encrypt(&self, iv: &[u8; IV_LEN], buf: &mut [u8]) {
        Aes128CfbEnc::new(&self.bytes.into(), &(*iv).into()).encrypt(buf);
    }

    /// Decrypts `buf` in place.
    pub fn decrypt(&self, iv: &[u8; IV_LEN], buf: &mut [u8]) {
        Aes128CfbDec::new(&self.bytes.into(), &(*iv).into()).decrypt(buf);
    }
}

impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The long-lived public key records are encrypted towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerPublicKey {
    bytes: [u8; PUBLIC_KEY_LEN],
}

impl PeerPublicKey {
    /// Parses a 64-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidKey`] if the string is not exactly 32
    /// hex-encoded bytes.
    pub fn from_hex(text: &str) -> FormatResult<Self> {
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        hex::decode_to_slice(text.trim(), &mut bytes)
            .map_err(|e| FormatError::InvalidKey(format!("peer public key: {e}")))?;
        Ok(Self { bytes })
    }

    /// Wraps raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Returns the key as hex.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

/// Writer-side cipher state: a derived key plus the ephemeral public key
/// stored next to every record.
pub struct SessionCipher {
    key: RecordKey,
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl SessionCipher {
    /// Generates an ephemeral key pair and agrees a key with `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidKey`] if `peer` is a low-order point.
    pub fn establish(peer: &PeerPublicKey) -> FormatResult<Self> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(peer.bytes));
        Ok(Self {
            key: RecordKey::derive(&shared)?,
            public_key,
        })
    }

    /// The ephemeral public key for this session.
    #[must_use]
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// Encrypts `buf` in place under a fresh random IV and returns the IV.
    pub fn seal(&self, buf: &mut [u8]) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        self.key.encrypt(&iv, buf);
        iv
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Reader-side secret matching a [`PeerPublicKey`].
pub struct ServerSecret {
    secret: StaticSecret,
}

impl ServerSecret {
    /// Parses a 64-character hex string.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidKey`] if the string is not exactly 32
    /// hex-encoded bytes.
    pub fn from_hex(text: &str) -> FormatResult<Self> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(text.trim(), &mut bytes[..])
            .map_err(|e| FormatError::InvalidKey(format!("server secret: {e}")))?;
        Ok(Self {
            secret: StaticSecret::from(*bytes),
        })
    }

    /// The public half, to be configured on writers.
    #[must_use]
    pub fn public_key(&self) -> PeerPublicKey {
        PeerPublicKey::from_bytes(PublicKey::from(&self.secret).to_bytes())
    }

    /// Rebuilds the record key for records written by `client_public`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidKey`] if `client_public` is a low-order
    /// point.
    pub fn record_key(&self, client_public: &[u8; PUBLIC_KEY_LEN]) -> FormatResult<RecordKey> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*client_public));
        RecordKey::derive(&shared)
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSecret")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// A freshly generated peer key pair, for provisioning.
#[derive(Debug)]
pub struct KeyPair {
    secret: ServerSecret,
}

impl KeyPair {
    /// Generates a random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: ServerSecret {
                secret: StaticSecret::random_from_rng(OsRng),
            },
        }
    }

    /// The secret as hex. Handle with care.
    #[must_use]
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret.secret.to_bytes()))
    }

    /// The public key as hex.
    #[must_use]
    pub fn public_hex(&self) -> String {
        self.secret.public_key().to_hex()
    }
}
