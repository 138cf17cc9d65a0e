//! Cryptographic primitives for the session layer
//!
//! Provides identity keys, ephemeral ECDH, and session key derivation.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use trellis_core::NodeKey;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, SharedSecret};

/// AEAD tag size appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Non-contributory key exchange")]
    NonContributory,
    #[error("Nonce space exhausted")]
    NonceExhausted,
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Generate keypairs until one derives an address inside `fc00::/8`.
    pub fn generate_mesh() -> Self {
        loop {
            let keypair = Self::generate();
            if keypair.node_key().has_mesh_address() {
                return keypair;
            }
        }
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Seed bytes, for persisting the identity
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Node identity for this keypair
    pub fn node_key(&self) -> NodeKey {
        NodeKey(self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig = Signature::from_slice(signature)
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// Session keys derived from ECDH
pub struct SessionKeys {
    /// Key for encrypting outgoing messages
    encrypt_key: [u8; 32],
    /// Key for decrypting incoming messages
    decrypt_key: [u8; 32],
    /// Nonce counter for outgoing messages
    nonce_counter: u64,
}

impl SessionKeys {
    /// Derive session keys from shared secret and role
    ///
    /// Both sides call this with their own ephemeral as `our_public`; the
    /// directional keys line up because roles are assigned by key ordering.
    pub fn derive(
        shared_secret: &SharedSecret,
        our_public: &X25519Public,
        their_public: &X25519Public,
        context: &[u8],
    ) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(context), shared_secret.as_bytes());

        let is_initiator = our_public.as_bytes() < their_public.as_bytes();

        let mut encrypt_key = [0u8; 32];
        let mut decrypt_key = [0u8; 32];

        let (enc_info, dec_info): (&[u8], &[u8]) = if is_initiator {
            (b"low_to_high", b"high_to_low")
        } else {
            (b"high_to_low", b"low_to_high")
        };

        hkdf.expand(enc_info, &mut encrypt_key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        hkdf.expand(dec_info, &mut decrypt_key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;

        Ok(Self {
            encrypt_key,
            decrypt_key,
            nonce_counter: 0,
        })
    }

    /// Reserve the next outgoing nonce
    pub fn next_nonce(&mut self) -> Result<u64, CryptoError> {
        let nonce = self.nonce_counter;
        self.nonce_counter = nonce.checked_add(1).ok_or(CryptoError::NonceExhausted)?;
        Ok(nonce)
    }

    /// Nonces handed out so far
    pub fn nonces_used(&self) -> u64 {
        self.nonce_counter
    }

    /// Encrypt a message with AEAD under an explicit nonce
    pub fn encrypt(
        &self,
        nonce_counter: u64,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.encrypt_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let nonce_bytes = nonce_bytes(nonce_counter);
        cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt a message with AEAD
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        associated_data: &[u8],
        nonce_counter: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.decrypt_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let nonce_bytes = nonce_bytes(nonce_counter);
        cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: associated_data,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// X25519 ephemeral key exchange
pub struct EphemeralKeyExchange {
    secret: EphemeralSecret,
    public: X25519Public,
}

impl EphemeralKeyExchange {
    /// Generate new ephemeral keypair
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Perform key exchange and derive shared secret
    pub fn exchange(self, their_public: &[u8; 32]) -> Result<SharedSecret, CryptoError> {
        let their_public = X25519Public::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(shared)
    }
}

impl Default for EphemeralKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Transcript hash binding both identities and both ephemerals
///
/// Used as the HKDF salt, so the two ends only agree on keys when they saw
/// the same handshake.
pub fn transcript_hash(
    initiator: &NodeKey,
    responder: &NodeKey,
    initiator_ephemeral: &[u8; 32],
    responder_ephemeral: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"trellis-transcript-v1:");
    hasher.update(initiator.as_bytes());
    hasher.update(responder.as_bytes());
    hasher.update(initiator_ephemeral);
    hasher.update(responder_ephemeral);
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> (SessionKeys, SessionKeys) {
        let alice = EphemeralKeyExchange::new();
        let bob = EphemeralKeyExchange::new();

        let alice_pub = X25519Public::from(alice.public_key());
        let bob_pub = X25519Public::from(bob.public_key());

        let alice_shared = alice.exchange(bob_pub.as_bytes()).unwrap();
        let bob_shared = bob.exchange(alice_pub.as_bytes()).unwrap();

        let alice_keys = SessionKeys::derive(&alice_shared, &alice_pub, &bob_pub, b"test").unwrap();
        let bob_keys = SessionKeys::derive(&bob_shared, &bob_pub, &alice_pub, b"test").unwrap();
        (alice_keys, bob_keys)
    }

    #[test]
    fn test_keypair_sign_verify() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);

        assert!(KeyPair::verify(&kp.public_key(), msg, &sig).is_ok());
        assert!(KeyPair::verify(&kp.public_key(), b"other", &sig).is_err());
        assert!(KeyPair::verify(&kp.public_key(), msg, &sig[..10]).is_err());
    }

    #[test]
    fn test_seed_roundtrip() {
        let kp = KeyPair::from_seed(&[9; 32]);
        let restored = KeyPair::from_seed(&kp.seed());
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_generate_mesh_address() {
        let kp = KeyPair::generate_mesh();
        assert_eq!(kp.node_key().address().octets()[0], 0xfc);
    }

    #[test]
    fn test_ephemeral_key_exchange() {
        let alice = EphemeralKeyExchange::new();
        let bob = EphemeralKeyExchange::new();

        let alice_pub = alice.public_key();
        let bob_pub = bob.public_key();

        let alice_shared = alice.exchange(&bob_pub).unwrap();
        let bob_shared = bob.exchange(&alice_pub).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = EphemeralKeyExchange::new();
        assert!(matches!(
            alice.exchange(&[0u8; 32]),
            Err(CryptoError::NonContributory)
        ));
    }

    #[test]
    fn test_session_encryption() {
        let (mut alice, mut bob) = session_pair();

        let nonce = alice.next_nonce().unwrap();
        let ciphertext = alice.encrypt(nonce, b"secret message", b"context").unwrap();
        assert_eq!(ciphertext.len(), 14 + TAG_SIZE);

        let plaintext = bob.decrypt(&ciphertext, b"context", nonce).unwrap();
        assert_eq!(plaintext, b"secret message");

        // Reverse direction uses the other key
        let nonce = bob.next_nonce().unwrap();
        let ciphertext = bob.encrypt(nonce, b"reply", b"").unwrap();
        assert_eq!(alice.decrypt(&ciphertext, b"", nonce).unwrap(), b"reply");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (mut alice, bob) = session_pair();
        let nonce = alice.next_nonce().unwrap();
        let mut ciphertext = alice.encrypt(nonce, b"payload", b"aad").unwrap();

        assert!(bob.decrypt(&ciphertext, b"other aad", nonce).is_err());
        assert!(bob.decrypt(&ciphertext, b"aad", nonce + 1).is_err());
        ciphertext[0] ^= 1;
        assert!(bob.decrypt(&ciphertext, b"aad", nonce).is_err());
    }

    #[test]
    fn test_transcript_binds_roles() {
        let a = NodeKey([1; 32]);
        let b = NodeKey([2; 32]);
        assert_ne!(
            transcript_hash(&a, &b, &[3; 32], &[4; 32]),
            transcript_hash(&b, &a, &[3; 32], &[4; 32])
        );
    }
}
