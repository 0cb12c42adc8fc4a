//! Salted key digestion and per-entry encryption.
//!
//! Every key is placed and compared by its salted SHA-256 digest, so raw
//! routing keys are not recoverable from disk contents alone. Entry bodies
//! are encrypted with AES-256 in cipher feedback mode under a key derived
//! from `(salt, iv, routing key)`: the ciphertext is bound to the key that
//! must be presented to decrypt it, not to a store-wide master key.
//!
//! The scheme is confidentiality-only. There is no authenticity tag; a bit
//! flip in ciphertext decrypts to garbage plaintext that the block type's
//! own verification must catch.

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use sha2::{Digest, Sha256};

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Length of the store salt in bytes.
pub const SALT_LEN: usize = 16;
/// Length of a digested routing key in bytes.
pub const DIGEST_LEN: usize = 32;
/// Length of a per-entry IV in bytes.
pub const IV_LEN: usize = 16;

/// Holds the store salt and performs all digesting and entry encryption.
///
/// The salt is fixed for the life of the store; losing it invalidates every
/// digest-derived slot mapping and every entry key.
#[derive(Clone)]
pub(crate) struct EntryCipher {
    salt: [u8; SALT_LEN],
}

impl EntryCipher {
    pub(crate) fn new(salt: [u8; SALT_LEN]) -> Self {
        Self { salt }
    }

    pub(crate) fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Salted digest of a plaintext routing key.
    pub(crate) fn digest(&self, routing_key: &[u8]) -> [u8; DIGEST_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(routing_key);
        hasher.update(self.salt);
        hasher.finalize().into()
    }

    /// Encrypt an entry body in place.
    pub(crate) fn encrypt(&self, iv: &[u8; IV_LEN], routing_key: &[u8], body: &mut [u8]) {
        let key = self.derive_key(iv, routing_key);
        Aes256CfbEnc::new(&key.into(), &(*iv).into()).encrypt(body);
    }

    /// Decrypt an entry body in place.
    ///
    /// With a wrong routing key this "succeeds" into garbage; callers must
    /// have compared the stored digest first.
    pub(crate) fn decrypt(&self, iv: &[u8; IV_LEN], routing_key: &[u8], body: &mut [u8]) {
        let key = self.derive_key(iv, routing_key);
        Aes256CfbDec::new(&key.into(), &(*iv).into()).decrypt(body);
    }

    /// Per-entry key: SHA-256(salt || iv || routing key).
    fn derive_key(&self, iv: &[u8; IV_LEN], routing_key: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(iv);
        hasher.update(routing_key);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for EntryCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the salt
        f.debug_struct("EntryCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> EntryCipher {
        EntryCipher::new([7u8; SALT_LEN])
    }

    #[test]
    fn test_digest_deterministic() {
        let c = cipher();
        assert_eq!(c.digest(b"key"), c.digest(b"key"));
        assert_ne!(c.digest(b"key"), c.digest(b"other"));
    }

    #[test]
    fn test_digest_depends_on_salt() {
        let a = EntryCipher::new([1u8; SALT_LEN]);
        let b = EntryCipher::new([2u8; SALT_LEN]);
        assert_ne!(a.digest(b"key"), b.digest(b"key"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let c = cipher();
        let iv = [9u8; IV_LEN];
        let mut body = b"some entry body, longer than one aes block......".to_vec();
        let plain = body.clone();

        c.encrypt(&iv, b"routing key", &mut body);
        assert_ne!(body, plain);

        c.decrypt(&iv, b"routing key", &mut body);
        assert_eq!(body, plain);
    }

    #[test]
    fn test_wrong_key_decrypts_to_garbage() {
        let c = cipher();
        let iv = [9u8; IV_LEN];
        let mut body = b"some entry body, longer than one aes block......".to_vec();
        let plain = body.clone();

        c.encrypt(&iv, b"routing key", &mut body);
        c.decrypt(&iv, b"wrong key", &mut body);
        assert_ne!(body, plain);
    }

    #[test]
    fn test_iv_changes_ciphertext() {
        let c = cipher();
        let mut a = b"identical plaintext bodies".to_vec();
        let mut b = a.clone();
        c.encrypt(&[1u8; IV_LEN], b"key", &mut a);
        c.encrypt(&[2u8; IV_LEN], b"key", &mut b);
        assert_ne!(a, b);
    }
}
