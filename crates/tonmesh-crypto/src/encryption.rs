//! Encryptors and decryptors
//!
//! Two key kinds can encrypt: a peer's Ed25519 identity (first contact, no
//! channel yet) and an AES channel key. Identity encryption generates a
//! fresh ephemeral key per message and prepends its public half, so the
//! output is 64 bytes longer than the input; channel encryption adds 32.

use crate::constants::{CHANNEL_OVERHEAD, ED25519_KEY_SIZE, IDENTITY_OVERHEAD};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{PrivateKey, PublicKey, Signature};
use crate::symmetric::{self, AesKey};

/// Encrypting half of a key
#[derive(Clone, Debug)]
pub enum Encryptor {
    /// Encrypt to an identity through an ephemeral X25519 agreement
    Ed25519(PublicKey),
    /// Encrypt with a channel key
    Aes(AesKey),
}

/// Decrypting half of a key
#[derive(Clone, Debug)]
pub enum Decryptor {
    Ed25519(PrivateKey),
    Aes(AesKey),
}

impl Encryptor {
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        match self {
            Encryptor::Ed25519(remote) => {
                let ephemeral = PrivateKey::generate();
                let shared = ephemeral.shared_key(remote);

                let mut out = Vec::with_capacity(IDENTITY_OVERHEAD + plaintext.len());
                out.extend_from_slice(ephemeral.public_key().as_bytes());
                out.extend_from_slice(&symmetric::encrypt(shared.as_bytes(), plaintext));
                out
            }
            Encryptor::Aes(key) => key.encrypt(plaintext),
        }
    }

    /// Bytes added to every plaintext
    pub fn overhead(&self) -> usize {
        match self {
            Encryptor::Ed25519(_) => IDENTITY_OVERHEAD,
            Encryptor::Aes(_) => CHANNEL_OVERHEAD,
        }
    }

    /// Check a signature; only identity keys sign
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        match self {
            Encryptor::Ed25519(key) => key.verify(message, &Signature::try_from_slice(signature)?),
            Encryptor::Aes(_) => Err(CryptoError::Unsupported("AES")),
        }
    }
}

impl Decryptor {
    pub fn decrypt(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            Decryptor::Ed25519(key) => {
                if ciphertext.len() < IDENTITY_OVERHEAD {
                    return Err(CryptoError::CiphertextTooShort {
                        min: IDENTITY_OVERHEAD,
                        actual: ciphertext.len(),
                    });
                }
                let (ephemeral, body) = ciphertext.split_at(ED25519_KEY_SIZE);
                let ephemeral = PublicKey::try_from_slice(ephemeral)?;
                let shared = key.shared_key(&ephemeral);
                symmetric::decrypt(shared.as_bytes(), body)
            }
            Decryptor::Aes(key) => key.decrypt(ciphertext),
        }
    }

    pub fn sign(&self, message: &[u8]) -> CryptoResult<Signature> {
        match self {
            Decryptor::Ed25519(key) => Ok(key.sign(message)),
            Decryptor::Aes(_) => Err(CryptoError::Unsupported("AES")),
        }
    }
}

impl PublicKey {
    pub fn encryptor(&self) -> Encryptor {
        Encryptor::Ed25519(*self)
    }
}

impl PrivateKey {
    pub fn decryptor(&self) -> Decryptor {
        Decryptor::Ed25519(self.clone())
    }
}

impl AesKey {
    pub fn encryptor(&self) -> Encryptor {
        Encryptor::Aes(self.clone())
    }

    pub fn decryptor(&self) -> Decryptor {
        Decryptor::Aes(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let key = PrivateKey::generate();
        let encryptor = key.public_key().encryptor();

        let ciphertext = encryptor.encrypt(b"first contact");
        assert_eq!(ciphertext.len(), 13 + encryptor.overhead());

        let plaintext = key.decryptor().decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"first contact");
    }

    #[test]
    fn test_identity_encryption_is_randomized() {
        let key = PrivateKey::generate();
        let encryptor = key.public_key().encryptor();
        assert_ne!(encryptor.encrypt(b"same"), encryptor.encrypt(b"same"));
    }

    #[test]
    fn test_identity_wrong_recipient() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();

        let ciphertext = key.public_key().encryptor().encrypt(b"for key only");
        assert!(other.decryptor().decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_identity_tampered() {
        let key = PrivateKey::generate();
        let mut ciphertext = key.public_key().encryptor().encrypt(b"do not touch");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(key.decryptor().decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_identity_too_short() {
        let key = PrivateKey::generate();
        assert!(matches!(
            key.decryptor().decrypt(&[0u8; 40]),
            Err(CryptoError::CiphertextTooShort { min: 64, .. })
        ));
    }

    #[test]
    fn test_overheads() {
        let identity = PrivateKey::generate().public_key().encryptor();
        let channel = AesKey::generate().encryptor();
        assert_eq!(identity.overhead() - channel.overhead(), 32);
    }

    #[test]
    fn test_sign_through_decryptor() {
        let key = PrivateKey::generate();
        let sig = key.decryptor().sign(b"msg").unwrap();
        assert!(key.public_key().encryptor().verify(b"msg", sig.as_bytes()).is_ok());
        assert!(key.public_key().encryptor().verify(b"msg", &[0u8; 10]).is_err());
    }

    #[test]
    fn test_aes_never_signs() {
        let key = AesKey::generate();
        assert!(matches!(key.decryptor().sign(b"msg"), Err(CryptoError::Unsupported(_))));
        assert!(key.encryptor().verify(b"msg", &[0u8; 64]).is_err());
    }
}
