//! Hash & Identity (C1): SHA-256 digests and secp256k1 ECDSA identity,
//! signing, and verification over the canonical byte encoding defined below.
//!
//! # Canonical encoding
//!
//! The canonical byte encoding of a structured value is the UTF-8 encoding
//! of its JSON form with keys sorted lexicographically at every object
//! level, no insignificant whitespace, and integers emitted without a
//! fractional part. `serde_json::Value::Object` is backed by a `BTreeMap`
//! (this crate never enables `preserve_order`), so converting a value to
//! `serde_json::Value` and serializing it compactly already produces this
//! form recursively — implementers MUST NOT introduce a `HashMap`-backed or
//! `preserve_order` serializer here, or signatures computed by this crate
//! will stop matching signatures computed by any other implementation.
//!
//! Floats are forbidden: every field hashed or signed by this crate is an
//! integer, a string, a byte string (hex-encoded), or a nested object/array
//! of those.

use k256::ecdsa::signature::{Signer as _, Verifier as _};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// A 32-byte SHA-256 digest, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// The all-zero digest used as `prev_hash` for the genesis block.
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Wrap raw bytes as a digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes of this digest.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encode this digest for wire/storage forms.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex-encoded digest.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Encoding(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(Error::Encoding("digest must be 32 bytes".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Count of leading zero bits, used by ledger sealing difficulty checks.
    #[must_use]
    pub fn leading_zero_bits(&self) -> u32 {
        let mut bits = 0;
        for byte in self.0 {
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({}...)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Compute the SHA-256 digest of raw bytes.
#[must_use]
pub fn sha256(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Digest(hasher.finalize().into())
}

/// Serialize a value to its canonical byte encoding (see module docs).
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as a `serde_json::Value`
/// (e.g. it contains a non-finite float, which `serde_json` itself rejects).
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let as_value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&as_value)?)
}

/// SHA-256 digest of a value's canonical byte encoding.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<Digest> {
    Ok(sha256(&canonical_bytes(value)?))
}

/// secp256k1 ECDSA public key, serialized in uncompressed SEC1 form.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    key: VerifyingKey,
}

impl PublicKey {
    /// Parse a public key from uncompressed SEC1 bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not encode a valid curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))?;
        Ok(Self { key })
    }

    /// Uncompressed SEC1 encoding of this key.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(false).as_bytes().to_vec()
    }

    /// The hex encoding of the uncompressed public key — this is the sole
    /// `participant_id` used on the wire.
    #[must_use]
    pub fn participant_id(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify a signature over a message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Crypto` if the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.key
            .verify(message, &signature.sig)
            .map_err(|_| Error::Crypto("signature verification failed".into()))
    }
}

impl TryFrom<String> for PublicKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Encoding(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl From<PublicKey> for String {
    fn from(pk: PublicKey) -> Self {
        pk.participant_id()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", &self.participant_id()[..8])
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.participant_id())
    }
}

/// Deterministic-k ECDSA signature (RFC 6979) over secp256k1.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    sig: EcdsaSignature,
}

impl Signature {
    /// Parse a signature from its DER encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid DER-encoded signature.
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        let sig = EcdsaSignature::from_der(bytes)
            .map_err(|e| Error::Crypto(format!("invalid signature: {e}")))?;
        Ok(Self { sig })
    }

    /// DER encoding of this signature.
    #[must_use]
    pub fn to_der(&self) -> Vec<u8> {
        self.sig.to_der().as_bytes().to_vec()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.to_der()))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Signature::from_der(&bytes).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = hex::encode(self.to_der());
        write!(f, "Signature({}...)", &hex[..hex.len().min(8)])
    }
}

/// A secp256k1 keypair: the signing half of a participant's identity.
///
/// The private key is held only in memory and is never included in any
/// serialized form produced by this crate (see C8).
pub struct Identity {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Identity {
    /// Generate a new random identity using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let public_key = PublicKey {
            key: *signing_key.verifying_key(),
        };
        Self {
            signing_key,
            public_key,
        }
    }

    /// Derive an identity deterministically from a 32-byte seed.
    ///
    /// Intended for tests and reproducible scenarios, not production use.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed does not form a valid scalar.
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(seed.into())
            .map_err(|e| Error::Crypto(format!("invalid seed: {e}")))?;
        let public_key = PublicKey {
            key: *signing_key.verifying_key(),
        };
        Ok(Self {
            signing_key,
            public_key,
        })
    }

    /// This identity's public key / `participant_id`.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign a message with deterministic-k ECDSA (RFC 6979).
    #[must_use] 
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig: EcdsaSignature = self.signing_key.sign(message);
        Signature { sig }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity(public={:?})", self.public_key)
    }
}

/// Verify a signature over a message under a public key.
///
/// # Errors
///
/// Returns `Error::Crypto` if the signature does not verify.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    public_key.verify(message, signature)
}
