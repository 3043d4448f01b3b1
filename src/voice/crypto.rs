use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::XChaCha20Poly1305;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Only the low 4 bytes of the nonce travel with the packet.
pub const NONCE_SUFFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("secret key must be {KEY_LEN} bytes, got {0}")]
    KeyLength(usize),
    #[error("unsupported encryption mode `{0}`")]
    UnsupportedMode(String),
    #[error("packet too short to decrypt")]
    PacketTooShort,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed (authentication error)")]
    DecryptionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    AeadAes256GcmRtpSize,
    AeadXChaCha20Poly1305RtpSize,
}

impl EncryptionMode {
    /// In order of preference.
    pub const SUPPORTED: [EncryptionMode; 2] = [
        EncryptionMode::AeadAes256GcmRtpSize,
        EncryptionMode::AeadXChaCha20Poly1305RtpSize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMode::AeadAes256GcmRtpSize => "aead_aes256_gcm_rtpsize",
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => "aead_xchacha20_poly1305_rtpsize",
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            EncryptionMode::AeadAes256GcmRtpSize => 12,
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => 24,
        }
    }

    /// Pick the best mode the server offers.
    pub fn negotiate(offered: &[String]) -> Option<Self> {
        Self::SUPPORTED
            .into_iter()
            .find(|mode| offered.iter().any(|o| o == mode.as_str()))
    }
}

impl FromStr for EncryptionMode {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::SUPPORTED
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CryptoError::UnsupportedMode(s.to_string()))
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Cipher {
    Aes(Box<Aes256Gcm>),
    XChaCha(Box<XChaCha20Poly1305>),
}

/// Packet sealer for one voice session. Outbound packets are
/// `header || ciphertext+tag || nonce suffix`, with the header as AAD.
pub struct VoiceCipher {
    mode: EncryptionMode,
    cipher: Cipher,
    nonce: u32,
}

impl fmt::Debug for VoiceCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceCipher")
            .field("mode", &self.mode)
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl VoiceCipher {
    pub fn new(mode: EncryptionMode, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::KeyLength(key.len()));
        }
        let cipher = match mode {
            EncryptionMode::AeadAes256GcmRtpSize => Cipher::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength(key.len()))?,
            )),
            EncryptionMode::AeadXChaCha20Poly1305RtpSize => Cipher::XChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| CryptoError::KeyLength(key.len()))?,
            )),
        };
        Ok(Self {
            mode,
            cipher,
            nonce: 0,
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    fn full_nonce(&self, suffix: [u8; NONCE_SUFFIX_LEN]) -> [u8; 24] {
        let mut nonce = [0u8; 24];
        nonce[..NONCE_SUFFIX_LEN].copy_from_slice(&suffix);
        nonce
    }

    pub fn seal(&mut self, header: &[u8], payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let suffix = self.nonce.to_be_bytes();
        self.nonce = self.nonce.wrapping_add(1);

        let nonce = self.full_nonce(suffix);
        let nonce = &nonce[..self.mode.nonce_len()];
        let msg = Payload {
            msg: payload,
            aad: header,
        };
        let sealed = match &self.cipher {
            Cipher::Aes(c) => c.encrypt(nonce.into(), msg),
            Cipher::XChaCha(c) => c.encrypt(nonce.into(), msg),
        }
        .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut packet = Vec::with_capacity(header.len() + sealed.len() + NONCE_SUFFIX_LEN);
        packet.extend_from_slice(header);
        packet.extend_from_slice(&sealed);
        packet.extend_from_slice(&suffix);
        Ok(packet)
    }

    /// Decrypt an inbound packet whose first `aad_len` bytes are authenticated
    /// plaintext. Returns the decrypted payload only.
    pub fn open(&self, packet: &[u8], aad_len: usize) -> Result<Vec<u8>, CryptoError> {
        if packet.len() < aad_len + TAG_LEN + NONCE_SUFFIX_LEN {
            return Err(CryptoError::PacketTooShort);
        }
        let (body, suffix) = packet.split_at(packet.len() - NONCE_SUFFIX_LEN);
        let (aad, ciphertext) = body.split_at(aad_len);
        let mut tail = [0u8; NONCE_SUFFIX_LEN];
        tail.copy_from_slice(suffix);

        let nonce = self.full_nonce(tail);
        let nonce = &nonce[..self.mode.nonce_len()];
        let msg = Payload {
            msg: ciphertext,
            aad,
        };
        match &self.cipher {
            Cipher::Aes(c) => c.decrypt(nonce.into(), msg),
            Cipher::XChaCha(c) => c.decrypt(nonce.into(), msg),
        }
        .map_err(|_| CryptoError::DecryptionFailed)
    }
}
