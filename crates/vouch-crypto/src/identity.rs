//! Local signing identity and peer public keys.
//!
//! Each Vouch user has one long-term ECDSA P-256 key pair created at setup.
//! The private half lives only inside [`Identity`] and has no serialized
//! form; the public half is exported as a JWK string for contact exchange
//! and pin records.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    EcdsaKeyPair, KeyPair, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    ECDSA_P256_SHA256_FIXED_SIGNING,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of handshake nonces.
pub const NONCE_LEN: usize = 32;

/// Uncompressed SEC1 point: 0x04 || x(32) || y(32).
const POINT_LEN: usize = 65;
const COORD_LEN: usize = 32;

/// A peer's P-256 verification key.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    point: Vec<u8>,
}

/// JSON Web Key form of a P-256 public key. Unknown members such as
/// `ext` or `key_ops` are ignored on import.
#[derive(Serialize, Deserialize)]
struct Jwk {
    kty: String,
    crv: String,
    x: String,
    y: String,
}

impl PublicKey {
    /// Wrap an uncompressed SEC1 point.
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != POINT_LEN || bytes[0] != 0x04 {
            return Err(CryptoError::InvalidKey(
                "expected an uncompressed P-256 point".into(),
            ));
        }
        Ok(Self {
            point: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.point
    }

    /// Export as a JWK JSON string.
    pub fn export(&self) -> String {
        let jwk = Jwk {
            kty: "EC".into(),
            crv: "P-256".into(),
            x: URL_SAFE_NO_PAD.encode(&self.point[1..1 + COORD_LEN]),
            y: URL_SAFE_NO_PAD.encode(&self.point[1 + COORD_LEN..]),
        };
        // Serializing four strings cannot fail.
        serde_json::to_string(&jwk).unwrap_or_default()
    }

    /// Import a JWK JSON string produced by [`PublicKey::export`] or by a
    /// WebCrypto `exportKey('jwk', ...)` call.
    pub fn import(jwk: &str) -> Result<Self, CryptoError> {
        let jwk: Jwk = serde_json::from_str(jwk)
            .map_err(|e| CryptoError::InvalidKey(format!("not a JWK: {e}")))?;
        if jwk.kty != "EC" || jwk.crv != "P-256" {
            return Err(CryptoError::InvalidKey(format!(
                "unsupported key type {}/{}",
                jwk.kty, jwk.crv
            )));
        }

        let x = decode_coordinate(&jwk.x)?;
        let y = decode_coordinate(&jwk.y)?;

        let mut point = Vec::with_capacity(POINT_LEN);
        point.push(0x04);
        point.extend_from_slice(&x);
        point.extend_from_slice(&y);
        Ok(Self { point })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let hash = digest::digest(&digest::SHA256, &self.point);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(hash.as_ref());
        Fingerprint(bytes)
    }

    /// Check an ECDSA P-256/SHA-256 signature (fixed 64-byte r||s form).
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &self.point)
            .verify(message, signature)
            .is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint().short())
    }
}

fn decode_coordinate(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| CryptoError::InvalidKey(format!("bad coordinate encoding: {e}")))?;
    if bytes.len() != COORD_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "coordinate must be {COORD_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Verify `signature` over `message` with `key`.
pub fn verify_signature(key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    key.verify(message, signature)
}

/// SHA-256 over the raw public key. Equality is constant-time.
#[derive(Clone, Copy)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight bytes, for log lines.
    pub fn short(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Fingerprint {}

impl fmt::Display for Fingerprint {
    /// Groups of two bytes separated by spaces, for comparing out of band.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// The local user's signing identity.
pub struct Identity {
    id: String,
    key_pair: EcdsaKeyPair,
    public_key: PublicKey,
    rng: SystemRandom,
}

impl Identity {
    /// Generate a fresh identity for `id`.
    pub fn generate(id: impl Into<String>) -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Zeroizing::new(
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .map_err(|_| CryptoError::KeyGeneration)?
                .as_ref()
                .to_vec(),
        );
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
            .map_err(|e| CryptoError::KeyRejected(e.to_string()))?;
        let public_key = PublicKey::from_sec1(key_pair.public_key().as_ref())?;

        Ok(Self {
            id: id.into(),
            key_pair,
            public_key,
            rng,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign `message` with the private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature = self
            .key_pair
            .sign(&self.rng, message)
            .map_err(|_| CryptoError::Signing)?;
        Ok(signature.as_ref().to_vec())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// A fresh random handshake nonce.
pub fn random_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| CryptoError::Random)?;
    Ok(nonce)
}
