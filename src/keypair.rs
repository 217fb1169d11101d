//! P-256 operational keypair.

use anyhow::{Context, Result};
use p256::ecdsa::signature::{Signer, Verifier};

use crate::error::ErrorCode;

pub const P256_PUBLIC_KEY_LEN: usize = 65;
pub const P256_PRIVATE_KEY_LEN: usize = 32;
/// Serialized form is public key followed by private scalar.
pub const SERIALIZED_KEYPAIR_LEN: usize = P256_PUBLIC_KEY_LEN + P256_PRIVATE_KEY_LEN;
pub const P256_SIGNATURE_LEN: usize = 64;

#[derive(Clone)]
pub struct OperationalKeypair {
    secret: p256::SecretKey,
    public: Vec<u8>,
}

impl std::fmt::Debug for OperationalKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationalKeypair")
            .field("public", &hex::encode(&self.public))
            .finish()
    }
}

impl OperationalKeypair {
    pub fn generate() -> Self {
        Self::from_secret(p256::SecretKey::random(&mut rand::thread_rng()))
    }

    pub fn from_secret(secret: p256::SecretKey) -> Self {
        let public = secret.public_key().to_sec1_bytes().to_vec();
        Self { secret, public }
    }

    /// Uncompressed SEC1 encoding.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    pub fn secret_key(&self) -> &p256::SecretKey {
        &self.secret
    }

    /// ECDSA with SHA-256. Returns raw r || s.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        let key = p256::ecdsa::SigningKey::from(&self.secret);
        let sig: p256::ecdsa::Signature = key.sign(msg);
        sig.to_bytes().to_vec()
    }

    pub fn serialize(&self) -> [u8; SERIALIZED_KEYPAIR_LEN] {
        let mut out = [0u8; SERIALIZED_KEYPAIR_LEN];
        out[..P256_PUBLIC_KEY_LEN].copy_from_slice(&self.public);
        out[P256_PUBLIC_KEY_LEN..].copy_from_slice(self.secret.to_bytes().as_slice());
        out
    }

    /// Inverse of [OperationalKeypair::serialize]. The stored public key must belong to the private key.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SERIALIZED_KEYPAIR_LEN {
            return Err(ErrorCode::InvalidArgument)
                .context(format!("serialized keypair has {} bytes", bytes.len()));
        }
        let secret = p256::SecretKey::from_slice(&bytes[P256_PUBLIC_KEY_LEN..])
            .map_err(|_| ErrorCode::InvalidArgument)
            .context("private key scalar out of range")?;
        let kp = Self::from_secret(secret);
        if kp.public[..] != bytes[..P256_PUBLIC_KEY_LEN] {
            return Err(ErrorCode::InvalidArgument).context("public key does not match private key");
        }
        Ok(kp)
    }
}

/// Verify raw r || s ECDSA-SHA256 signature.
pub fn verify_signature(public_key: &[u8], msg: &[u8], signature: &[u8]) -> Result<()> {
    let vk = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| ErrorCode::InvalidArgument)
        .context("public key is not valid p256 point")?;
    let sig = p256::ecdsa::Signature::from_slice(signature)
        .map_err(|_| ErrorCode::InvalidSignature)
        .context("malformed signature")?;
    vk.verify(msg, &sig)
        .map_err(|_| ErrorCode::InvalidSignature)?;
    Ok(())
}
