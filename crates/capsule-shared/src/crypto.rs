//! Payload codec: XChaCha20-Poly1305 with a fresh random nonce per message.
//!
//! The nonce is returned next to the ciphertext instead of being prepended,
//! so callers can persist it with the capsule metadata.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub type Nonce = [u8; NONCE_SIZE];

/// Output of [`encrypt`]: the ciphertext (tag appended) and the nonce used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: Nonce,
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305, CryptoError> {
    XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: SYMMETRIC_KEY_SIZE,
        got: key.len(),
    })
}

pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = cipher_for(key)?;
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Sealed { ciphertext, nonce })
}

pub fn decrypt(key: &[u8], ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for(key)?;
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Parse a 64-character hex string into a master key.
pub fn key_from_hex(hex_key: &str) -> Result<SymmetricKey, CryptoError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
    SymmetricKey::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKeyLength {
        expected: SYMMETRIC_KEY_SIZE,
        got: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TAG_SIZE;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = b"Open me in ten years";

        let sealed = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let key = generate_symmetric_key();

        let sealed = encrypt(&key, b"").unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_SIZE);
        assert!(decrypt(&key, &sealed.ciphertext, &sealed.nonce)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

        let sealed = encrypt(&key, &plaintext).unwrap();
        assert_eq!(sealed.ciphertext.len(), plaintext.len() + TAG_SIZE);
        assert_eq!(
            decrypt(&key, &sealed.ciphertext, &sealed.nonce).unwrap(),
            plaintext
        );
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = generate_symmetric_key();
        let plaintext = b"same bytes twice";

        let a = encrypt(&key, plaintext).unwrap();
        let b = encrypt(&key, plaintext).unwrap();

        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(decrypt(&key, &a.ciphertext, &a.nonce).unwrap(), plaintext);
        assert_eq!(decrypt(&key, &b.ciphertext, &b.nonce).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let sealed = encrypt(&key1, b"Secret message").unwrap();
        assert_eq!(
            decrypt(&key2, &sealed.ciphertext, &sealed.nonce),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();

        let mut sealed = encrypt(&key, b"Important data").unwrap();
        sealed.ciphertext[0] ^= 0xFF;

        assert!(decrypt(&key, &sealed.ciphertext, &sealed.nonce).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = generate_symmetric_key();

        let sealed = encrypt(&key, b"Important data").unwrap();
        let truncated = &sealed.ciphertext[..sealed.ciphertext.len() - 1];

        assert!(decrypt(&key, truncated, &sealed.nonce).is_err());
        assert!(decrypt(&key, &[], &sealed.nonce).is_err());
    }

    #[test]
    fn test_wrong_nonce_length_fails() {
        let key = generate_symmetric_key();

        let sealed = encrypt(&key, b"data").unwrap();
        assert_eq!(
            decrypt(&key, &sealed.ciphertext, &sealed.nonce[..12]),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_invalid_key_length() {
        let short = [0u8; 16];
        assert_eq!(
            encrypt(&short, b"data"),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: 16
            })
        );
        assert!(matches!(
            decrypt(&short, b"data", &[0u8; NONCE_SIZE]),
            Err(CryptoError::InvalidKeyLength { .. })
        ));
    }

    #[test]
    fn test_key_from_hex() {
        let key = key_from_hex(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xab; 32]);

        assert!(matches!(
            key_from_hex("abcd"),
            Err(CryptoError::InvalidKeyLength { got: 2, .. })
        ));
        assert!(matches!(
            key_from_hex(&"zz".repeat(32)),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
    }
}
