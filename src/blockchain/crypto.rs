use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur while decoding keys or signatures
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hashes the UTF-8 bytes of `input` with SHA-256 and returns lower-case hex.
///
/// This is the only digest used by the ledger: transaction ids, Merkle nodes,
/// header hashes and addresses all go through it.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Wallet address: base58 of the SHA-256 of the owner's public key
///
/// Also used for the reserved names `systemWallet` and `balance`, which are
/// not derived from any key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        Address(bs58::encode(Sha256::digest(public_key.as_bytes())).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address(value.to_string())
    }
}

/// Encodes a public key the way it is kept in the public-key registry
pub fn public_key_to_hex(public_key: &VerifyingKey) -> String {
    hex::encode(public_key.as_bytes())
}

/// Decodes a public key taken from the registry
pub fn public_key_from_hex(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes: [u8; 32] = hex::decode(encoded)
        .map_err(|e| CryptoError::DecodingError(e.to_string()))?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".to_string()))?;

    VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Base58 encoded Ed25519 signature over a transaction id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    pub fn encode(signature: &Signature) -> Self {
        DigitalSignature(bs58::encode(signature.to_bytes()).into_string())
    }

    pub fn decode(&self) -> Result<Signature, CryptoError> {
        let bytes: [u8; 64] = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature("signature must be 64 bytes".to_string()))?;

        Ok(Signature::from_bytes(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Key pair of a node and the address derived from it
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    address: Address,
}

impl Wallet {
    /// Generates a fresh key pair
    pub fn new() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restores a wallet from its 32 byte secret key
    pub fn from_secret_key(secret_key: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = secret_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("secret key must be 32 bytes".to_string()))?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    /// Restores a wallet from a hex encoded secret key, as found in node config
    pub fn from_secret_key_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded.trim()).map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        Self::from_secret_key(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address::from_public_key(&signing_key.verifying_key());
        Wallet {
            signing_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        public_key_to_hex(&self.public_key())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> DigitalSignature {
        DigitalSignature::encode(&self.signing_key.sign(message))
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks `signature` over `message`
///
/// Returns `Ok(false)` for a well-formed signature that does not match and an
/// error only if the signature cannot be decoded.
pub fn verify_signature(
    message: &[u8],
    signature: &DigitalSignature,
    public_key: &VerifyingKey,
) -> Result<bool, CryptoError> {
    Ok(public_key.verify(message, &signature.decode()?).is_ok())
}
