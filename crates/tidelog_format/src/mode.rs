//! The per-record mode byte.

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressMode {
    /// Stored as-is.
    None = 1,
    /// Raw deflate, one sync-flushed block run per record.
    Zlib = 2,
}

/// Payload encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptMode {
    /// Plaintext.
    None = 1,
    /// AES-128-CFB with a per-record IV.
    Aes = 2,
}

impl CompressMode {
    const fn from_nibble(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Zlib),
            _ => None,
        }
    }
}

impl EncryptMode {
    const fn from_nibble(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Aes),
            _ => None,
        }
    }
}

/// Compression in the high nibble, encryption in the low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeByte {
    /// Compression applied to the payload.
    pub compress: CompressMode,
    /// Encryption applied after compression.
    pub encrypt: EncryptMode,
}

impl ModeByte {
    /// Creates a mode byte.
    #[must_use]
    pub const fn new(compress: CompressMode, encrypt: EncryptMode) -> Self {
        Self { compress, encrypt }
    }

    /// Packs into the on-disk byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        ((self.compress as u8) << 4) | self.encrypt as u8
    }

    /// Unpacks an on-disk byte, rejecting unknown nibbles.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match (
            CompressMode::from_nibble(byte >> 4),
            EncryptMode::from_nibble(byte & 0x0F),
        ) {
            (Some(compress), Some(encrypt)) => Some(Self { compress, encrypt }),
            _ => None,
        }
    }

    /// Whether an IV and public key precede the length field.
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        matches!(self.encrypt, EncryptMode::Aes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_nibbles() {
        assert_eq!(ModeByte::new(CompressMode::None, EncryptMode::None).to_byte(), 0x11);
        assert_eq!(ModeByte::new(CompressMode::Zlib, EncryptMode::None).to_byte(), 0x21);
        assert_eq!(ModeByte::new(CompressMode::Zlib, EncryptMode::Aes).to_byte(), 0x22);
    }

    #[test]
    fn only_known_bytes_parse() {
        let valid: Vec<u8> = (0..=u8::MAX)
            .filter(|b| ModeByte::from_byte(*b).is_some())
            .collect();
        assert_eq!(valid, vec![0x11, 0x12, 0x21, 0x22]);
        for byte in valid {
            assert_eq!(ModeByte::from_byte(byte).unwrap().to_byte(), byte);
        }
    }

    #[test]
    fn encrypted_flag() {
        assert!(ModeByte::from_byte(0x12).unwrap().is_encrypted());
        assert!(!ModeByte::from_byte(0x21).unwrap().is_encrypted());
    }
}
