use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Version byte prepended to the public key hash in an address
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address payload
pub const CHECKSUM_LENGTH: usize = 4;

/// Length of the SHA-256 public key hash carried by an address
pub const PUB_KEY_HASH_LENGTH: usize = 32;

/// Width of one P-256 coordinate or scalar in bytes
const COORDINATE_LENGTH: usize = 32;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Hashes a raw `x || y` public key into the form outputs are locked to
pub fn hash_pub_key(public_key: &[u8]) -> Vec<u8> {
    sha256(&sha256(public_key)).to_vec()
}

/// First four bytes of a double SHA-256 over `payload`
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    sha256(&sha256(payload))[..CHECKSUM_LENGTH].to_vec()
}

/// A Base58Check encoded address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates an address from a raw `x || y` public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self::from_pub_key_hash(&hash_pub_key(public_key))
    }

    /// Creates an address from an already hashed public key
    pub fn from_pub_key_hash(pub_key_hash: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + CHECKSUM_LENGTH);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(pub_key_hash);
        let check = checksum(&payload);
        payload.extend_from_slice(&check);

        Address(bs58::encode(payload).into_string())
    }

    /// Decodes the address and returns the public key hash it locks to.
    ///
    /// Fails if the string is not Base58 or the checksum does not match, and
    /// if the payload is not a version byte followed by a 32-byte hash.
    pub fn pub_key_hash(&self) -> Result<Vec<u8>, CryptoError> {
        let decoded = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if decoded.len() <= 1 + CHECKSUM_LENGTH {
            return Err(CryptoError::InvalidAddress(format!(
                "{} is too short",
                self.0
            )));
        }

        let (versioned, actual) = decoded.split_at(decoded.len() - CHECKSUM_LENGTH);
        if checksum(versioned) != actual {
            return Err(CryptoError::InvalidAddress(format!(
                "{} has a bad checksum",
                self.0
            )));
        }

        let (version, hash) = versioned.split_at(1);
        if version[0] != ADDRESS_VERSION {
            return Err(CryptoError::InvalidAddress(format!(
                "{} has unknown version {:#04x}",
                self.0, version[0]
            )));
        }
        if hash.len() != PUB_KEY_HASH_LENGTH {
            return Err(CryptoError::InvalidAddress(format!(
                "{} carries a {}-byte hash",
                self.0,
                hash.len()
            )));
        }

        Ok(hash.to_vec())
    }

    /// Returns true if the address decodes and its checksum matches
    pub fn is_valid(&self) -> bool {
        self.pub_key_hash().is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        address.pub_key_hash()?;
        Ok(address)
    }
}

/// Curve identifier for persisted keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    P256,
}

/// Persisted form of a key pair: curve tag plus raw scalar and coordinates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub curve: Curve,
    pub secret: Vec<u8>,
    pub public: Vec<u8>,
}

/// An ECDSA P-256 key pair
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    public_key: Vec<u8>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(&self.public_key))
            .finish()
    }
}

impl KeyPair {
    /// Creates a new key pair from the OS random number generator
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let point = signing_key.verifying_key().to_encoded_point(false);
        // Uncompressed SEC1 is 0x04 || x || y
        let public_key = point.as_bytes()[1..].to_vec();

        KeyPair {
            signing_key,
            public_key,
        }
    }

    /// Restores a key pair from a 32-byte secret scalar
    pub fn from_secret_key(secret: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Raw `x || y` public key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn pub_key_hash(&self) -> Vec<u8> {
        hash_pub_key(&self.public_key)
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key)
    }

    /// Signs a 32-byte digest, returning `r || s`
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    pub fn to_stored(&self) -> StoredKey {
        StoredKey {
            curve: Curve::P256,
            secret: self.export_secret_key(),
            public: self.public_key.clone(),
        }
    }

    pub fn from_stored(stored: &StoredKey) -> Result<Self, CryptoError> {
        match stored.curve {
            Curve::P256 => {
                let pair = Self::from_secret_key(&stored.secret)?;
                if pair.public_key != stored.public {
                    return Err(CryptoError::InvalidPublicKey(
                        "stored public key does not match secret".to_string(),
                    ));
                }
                Ok(pair)
            }
        }
    }
}

impl Default for KeyPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Left-pads a big-endian integer to a fixed coordinate width
fn pad_coordinate(bytes: &[u8]) -> Option<[u8; COORDINATE_LENGTH]> {
    if bytes.len() > COORDINATE_LENGTH {
        return None;
    }
    let mut out = [0u8; COORDINATE_LENGTH];
    out[COORDINATE_LENGTH - bytes.len()..].copy_from_slice(bytes);
    Some(out)
}

/// Verifies an `r || s` signature over `digest` against an `x || y` public key.
///
/// Both the signature and the key are split at their midpoint. Malformed
/// input of any kind verifies as false.
pub fn verify_digest(digest: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let (r, s) = signature.split_at(signature.len() / 2);
    let (x, y) = public_key.split_at(public_key.len() / 2);

    let (Some(r), Some(s), Some(x), Some(y)) = (
        pad_coordinate(r),
        pad_coordinate(s),
        pad_coordinate(x),
        pad_coordinate(y),
    ) else {
        return false;
    };

    let mut sec1 = Vec::with_capacity(1 + 2 * COORDINATE_LENGTH);
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&sec1) else {
        return false;
    };

    let mut rs = [0u8; 2 * COORDINATE_LENGTH];
    rs[..COORDINATE_LENGTH].copy_from_slice(&r);
    rs[COORDINATE_LENGTH..].copy_from_slice(&s);
    let Ok(signature) = Signature::from_slice(&rs) else {
        return false;
    };

    verifying_key.verify_prehash(digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_shape() {
        let pair = KeyPair::new();
        assert_eq!(pair.public_key().len(), 64);
        assert_eq!(pair.pub_key_hash().len(), 32);
        assert_eq!(pair.export_secret_key().len(), 32);
    }

    #[test]
    fn test_signing_and_verification() {
        let pair = KeyPair::new();
        let digest = sha256(b"Hello, world!");

        let signature = pair.sign_digest(&digest).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_digest(&digest, &signature, pair.public_key()));

        let wrong = sha256(b"Wrong message");
        assert!(!verify_digest(&wrong, &signature, pair.public_key()));

        let other = KeyPair::new();
        assert!(!verify_digest(&digest, &signature, other.public_key()));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let pair = KeyPair::new();
        let digest = sha256(b"payload");
        assert!(!verify_digest(&digest, &[], pair.public_key()));
        assert!(!verify_digest(&digest, &[0u8; 64], pair.public_key()));
        assert!(!verify_digest(&digest, &[1u8; 200], pair.public_key()));
    }

    #[test]
    fn test_address_round_trip() {
        let pair = KeyPair::new();
        let address = pair.address();

        assert!(address.is_valid());
        assert_eq!(address.pub_key_hash().unwrap(), pair.pub_key_hash());
        assert_eq!(address.0.parse::<Address>().unwrap(), address);
    }

    #[test]
    fn test_address_checksum_mismatch() {
        let pair = KeyPair::new();
        let mut raw = bs58::decode(&pair.address().0).into_vec().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = Address(bs58::encode(raw).into_string());

        assert!(!tampered.is_valid());
        assert!(matches!(
            tampered.pub_key_hash(),
            Err(CryptoError::InvalidAddress(_))
        ));
        assert!("not-base58-0OIl".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_payload_shape() {
        let encode = |payload: &[u8]| {
            let mut full = payload.to_vec();
            full.extend(checksum(payload));
            Address(bs58::encode(full).into_string())
        };
        let hash = KeyPair::new().pub_key_hash();

        let mut valid = vec![ADDRESS_VERSION];
        valid.extend(&hash);
        assert_eq!(encode(&valid).pub_key_hash().unwrap(), hash);

        let mut wrong_version = vec![0x05];
        wrong_version.extend(&hash);
        assert!(!encode(&wrong_version).is_valid());

        let mut short = vec![ADDRESS_VERSION];
        short.extend(&hash[..20]);
        assert!(matches!(
            encode(&short).pub_key_hash(),
            Err(CryptoError::InvalidAddress(_))
        ));

        let mut long = valid.clone();
        long.push(0);
        assert!(!encode(&long).is_valid());
    }

    #[test]
    fn test_stored_key_round_trip() {
        let pair = KeyPair::new();
        let stored = pair.to_stored();
        assert_eq!(stored.curve, Curve::P256);

        let restored = KeyPair::from_stored(&stored).unwrap();
        assert_eq!(restored.public_key(), pair.public_key());
        assert_eq!(restored.address(), pair.address());

        let mut bad = stored.clone();
        bad.public[0] ^= 0xFF;
        assert!(KeyPair::from_stored(&bad).is_err());
    }
}
