//! Per-block encryption and session key derivation.
//!
//! Key derivation: Argon2id(password, salt) with a configurable iteration
//! count, executed once per file/session and cached in [`CryptoSession`].
//!
//! Per-block IV: 12-byte AES-GCM nonce = 8-byte session nonce ‖ 4-byte LE
//! block index. The session nonce is generated once per container file, so
//! no two blocks ever see the same (key, nonce) pair.
//!
//! The nonce is never stored with the payload; readers rebuild it from the
//! block index. An encrypted payload is `ciphertext ‖ GCM tag (16 B)`.

use crate::types::{EncryptionStrength, KeyDerivation};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use thiserror::Error;

type Aes128Gcm = AesGcm<Aes128, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;
type Aes256Gcm = AesGcm<Aes256, U12>;

/// Byte length of the per-file session nonce.
pub const SESSION_NONCE_LEN: usize = 8;
/// Byte length of the GCM authentication tag appended to every block.
pub const GCM_TAG_LEN: usize = 16;

/// Argon2id memory cost (KiB). Iteration count comes from the config.
const KDF_MEMORY_KIB: u32 = 64 * 1024;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("wrong password: derived key check mismatch")]
    WrongPassword,
    #[error("encryption failed for block {block_index}")]
    EncryptionFailed { block_index: u32 },
    #[error("authentication failed for block {block_index}: wrong key or corrupted data")]
    AuthenticationFailed { block_index: u32 },
    #[error("decryption failed for block {block_index}")]
    DecryptionFailed { block_index: u32 },
    #[error("encryption strength 'none' has no cipher")]
    NoCipher,
}

enum SessionCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// A cached encryption session: derived key, cipher instance and per-file
/// nonce. Constructed once per container open/create, reused for every block.
pub struct CryptoSession {
    strength: EncryptionStrength,
    key: Vec<u8>,
    session_nonce: [u8; SESSION_NONCE_LEN],
    cipher: SessionCipher,
}

impl CryptoSession {
    /// Derive a session from a password using the given derivation config,
    /// with a freshly generated session nonce (write path).
    pub fn create(
        strength: EncryptionStrength,
        password: &str,
        derivation: &KeyDerivation,
    ) -> Result<Self, CryptoError> {
        let mut session_nonce = [0u8; SESSION_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut session_nonce);
        Self::with_nonce(strength, password, derivation, session_nonce)
    }

    /// Rebuild a session for an existing container (read path): same key
    /// derivation, the file's stored session nonce.
    pub fn open(
        strength: EncryptionStrength,
        password: &str,
        derivation: &KeyDerivation,
        stored_nonce: &[u8],
    ) -> Result<Self, CryptoError> {
        let mut session_nonce = [0u8; SESSION_NONCE_LEN];
        if stored_nonce.len() != SESSION_NONCE_LEN {
            return Err(CryptoError::KeyDerivation("bad session nonce length".into()));
        }
        session_nonce.copy_from_slice(stored_nonce);
        Self::with_nonce(strength, password, derivation, session_nonce)
    }

    fn with_nonce(
        strength: EncryptionStrength,
        password: &str,
        derivation: &KeyDerivation,
        session_nonce: [u8; SESSION_NONCE_LEN],
    ) -> Result<Self, CryptoError> {
        let key = derive_key(strength, password, derivation)?;
        let cipher = match strength {
            EncryptionStrength::None => return Err(CryptoError::NoCipher),
            EncryptionStrength::Standard => SessionCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&key)
                    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?,
            )),
            EncryptionStrength::Medium => SessionCipher::Aes192(Box::new(
                Aes192Gcm::new_from_slice(&key)
                    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?,
            )),
            EncryptionStrength::High => SessionCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?,
            )),
        };
        Ok(Self { strength, key, session_nonce, cipher })
    }

    pub fn strength(&self) -> EncryptionStrength {
        self.strength
    }

    pub fn session_nonce(&self) -> &[u8; SESSION_NONCE_LEN] {
        &self.session_nonce
    }

    /// BLAKE3 of the derived key, stored in the layout snapshot so a wrong
    /// password is reported before any block payload is touched.
    pub fn key_check(&self) -> [u8; 32] {
        *blake3::hash(&self.key).as_bytes()
    }

    /// Compare against a stored key check; mismatch means wrong password.
    pub fn verify_key_check(&self, stored: &[u8]) -> Result<(), CryptoError> {
        if stored != self.key_check() {
            return Err(CryptoError::WrongPassword);
        }
        Ok(())
    }

    /// Deterministic per-block nonce. Unique as long as the session nonce is
    /// unique per file and block indices are unique within a file.
    fn block_nonce(&self, block_index: u32) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..SESSION_NONCE_LEN].copy_from_slice(&self.session_nonce);
        nonce[SESSION_NONCE_LEN..].copy_from_slice(&block_index.to_le_bytes());
        nonce
    }

    /// Encrypt one block payload. Output is `ciphertext ‖ GCM tag`.
    pub fn encrypt_block(&self, block_index: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.block_nonce(block_index);
        let nonce = Nonce::from_slice(&nonce);
        let out = match &self.cipher {
            SessionCipher::Aes128(c) => c.encrypt(nonce, plaintext),
            SessionCipher::Aes192(c) => c.encrypt(nonce, plaintext),
            SessionCipher::Aes256(c) => c.encrypt(nonce, plaintext),
        };
        out.map_err(|_| CryptoError::EncryptionFailed { block_index })
    }

    /// Decrypt one block payload. On authentication failure no plaintext is
    /// ever returned, partial or otherwise.
    pub fn decrypt_block(&self, block_index: u32, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < GCM_TAG_LEN {
            return Err(CryptoError::DecryptionFailed { block_index });
        }
        let nonce = self.block_nonce(block_index);
        let nonce = Nonce::from_slice(&nonce);
        let out = match &self.cipher {
            SessionCipher::Aes128(c) => c.decrypt(nonce, payload),
            SessionCipher::Aes192(c) => c.decrypt(nonce, payload),
            SessionCipher::Aes256(c) => c.decrypt(nonce, payload),
        };
        out.map_err(|_| CryptoError::AuthenticationFailed { block_index })
    }
}

/// Argon2id key derivation. `iterations` maps to the time cost; the salt
/// comes from the stored derivation config so every container derives a
/// distinct key even under password reuse.
fn derive_key(
    strength: EncryptionStrength,
    password: &str,
    derivation: &KeyDerivation,
) -> Result<Vec<u8>, CryptoError> {
    let KeyDerivation::PasswordBased { iterations, salt } = derivation;
    let out_len = strength.key_len();
    if out_len == 0 {
        return Err(CryptoError::NoCipher);
    }
    let params = Params::new(KDF_MEMORY_KIB, (*iterations).max(1), 1, Some(out_len))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = vec![0u8; out_len];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kdf() -> KeyDerivation {
        // Minimal cost for tests.
        KeyDerivation::PasswordBased { iterations: 1, salt: b"vximage-test-salt".to_vec() }
    }

    fn session(strength: EncryptionStrength, password: &str) -> CryptoSession {
        CryptoSession::create(strength, password, &kdf()).unwrap()
    }

    #[test]
    fn encrypt_decrypt_roundtrip_all_strengths() {
        let data = b"sector payload bytes".to_vec();
        for strength in [
            EncryptionStrength::Standard,
            EncryptionStrength::Medium,
            EncryptionStrength::High,
        ] {
            let s = session(strength, "hunter2");
            let ct = s.encrypt_block(7, &data).unwrap();
            assert_ne!(ct, data);
            assert_eq!(s.decrypt_block(7, &ct).unwrap(), data);
        }
    }

    #[test]
    fn wrong_key_fails_authentication_without_plaintext() {
        let s1 = session(EncryptionStrength::High, "correct");
        let s2 = session(EncryptionStrength::High, "incorrect");
        let ct = s1.encrypt_block(0, b"secret").unwrap();
        match s2.decrypt_block(0, &ct) {
            Err(CryptoError::AuthenticationFailed { block_index: 0 }) => {}
            other => panic!("expected AuthenticationFailed, got {other:?}"),
        }
    }

    #[test]
    fn wrong_block_index_fails_authentication() {
        // The nonce binds the ciphertext to its block index; replaying a
        // block at a different index must fail.
        let s = session(EncryptionStrength::High, "pw");
        let ct = s.encrypt_block(3, b"block three").unwrap();
        assert!(s.decrypt_block(4, &ct).is_err());
    }

    #[test]
    fn block_nonces_never_repeat_within_session() {
        let s = session(EncryptionStrength::Standard, "pw");
        let a = s.block_nonce(0);
        let b = s.block_nonce(1);
        let c = s.block_nonce(u32::MAX);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn key_check_detects_wrong_password() {
        let s1 = session(EncryptionStrength::High, "correct");
        let s2 = session(EncryptionStrength::High, "incorrect");
        let stored = s1.key_check();
        assert!(s1.verify_key_check(&stored).is_ok());
        assert!(matches!(s2.verify_key_check(&stored), Err(CryptoError::WrongPassword)));
    }

    #[test]
    fn reopened_session_decrypts() {
        let writer = session(EncryptionStrength::Medium, "pw");
        let ct = writer.encrypt_block(11, b"payload").unwrap();
        let reader = CryptoSession::open(
            EncryptionStrength::Medium,
            "pw",
            &kdf(),
            writer.session_nonce(),
        )
        .unwrap();
        assert_eq!(reader.decrypt_block(11, &ct).unwrap(), b"payload");
    }
}
