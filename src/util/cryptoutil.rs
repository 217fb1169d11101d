use anyhow::{Context, Result};

use hmac::Mac;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::ErrorCode;

pub fn hkdf_sha256(salt: &[u8], secret: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; size];
    match hk.expand(info, &mut okm) {
        Ok(()) => Ok(okm),
        Err(e) => Err(anyhow::anyhow!(format!("hkdf error {:?}", e))),
    }
}

pub fn hkdf_sha1(salt: &[u8], secret: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha1>::new(Some(salt), secret);
    let mut okm = vec![0u8; size];
    match hk.expand(info, &mut okm) {
        Ok(()) => Ok(okm),
        Err(e) => Err(anyhow::anyhow!(format!("hkdf error {:?}", e))),
    }
}

pub fn hmac_sha256(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut hm = hmac::Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("can't create hmac with key of {} bytes", key.len()))?;
    hm.update(data);
    Ok(hm.finalize().into_bytes().to_vec())
}

pub fn hmac_sha1(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut hm = hmac::Hmac::<Sha1>::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("can't create hmac with key of {} bytes", key.len()))?;
    hm.update(data);
    Ok(hm.finalize().into_bytes().to_vec())
}

/// Constant time comparison of `expected` against HMAC-SHA256(key, data).
pub fn hmac_sha256_verify(data: &[u8], key: &[u8], expected: &[u8]) -> Result<bool> {
    let mut hm = hmac::Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("can't create hmac with key of {} bytes", key.len()))?;
    hm.update(data);
    Ok(hm.verify_slice(expected).is_ok())
}

pub fn hmac_sha1_verify(data: &[u8], key: &[u8], expected: &[u8]) -> Result<bool> {
    let mut hm = hmac::Hmac::<Sha1>::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("can't create hmac with key of {} bytes", key.len()))?;
    hm.update(data);
    Ok(hm.verify_slice(expected).is_ok())
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}
pub fn sha1_enc(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub const AES128_KEY_LEN: usize = 16;
pub const CCM_NONCE_LEN: usize = 13;
pub const CCM_TAG_LEN: usize = 16;

type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

fn ccm_cipher(key: &[u8], nonce: &[u8]) -> Result<Aes128Ccm> {
    if key.len() != AES128_KEY_LEN || nonce.len() != CCM_NONCE_LEN {
        return Err(ErrorCode::InvalidArgument)
            .context(format!("ccm key {} bytes nonce {} bytes", key.len(), nonce.len()));
    }
    <Aes128Ccm as ccm::KeyInit>::new_from_slice(key)
        .map_err(|e| anyhow::anyhow!("ccm key error {:?}", e))
}

pub fn aes128_ccm_encrypt(key: &[u8], nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = ccm_cipher(key, nonce)?;
    match ccm::aead::Aead::encrypt(
        &cipher,
        ccm::aead::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!("encrypt error {:?}", e)),
    }
}

/// Decrypt and authenticate. A tag mismatch is reported as [ErrorCode::InvalidMessage].
pub fn aes128_ccm_decrypt(key: &[u8], nonce: &[u8], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>> {
    let cipher = ccm_cipher(key, nonce)?;
    match ccm::aead::Aead::decrypt(
        &cipher,
        ccm::aead::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(ErrorCode::InvalidMessage).context(format!("decrypt error {:?}", e)),
    }
}

pub fn read_signing_key_from_pem(fname: &std::path::Path) -> Result<p256::SecretKey> {
    let file_contents = std::fs::read_to_string(fname)
        .with_context(|| format!("can't read {}", fname.display()))?;
    Ok(p256::SecretKey::from_sec1_pem(&file_contents)?)
}

pub fn read_data_from_pem(fname: &std::path::Path) -> Result<Vec<u8>> {
    let file_contents = std::fs::read_to_string(fname)
        .with_context(|| format!("can't read {}", fname.display()))?;
    Ok(pem::parse(file_contents)?.contents().to_vec())
}

pub fn write_pem(tag: &str, data: &[u8], fname: &std::path::Path) -> Result<()> {
    let p = pem::Pem::new(tag, data);
    let enc = pem::encode(&p);
    std::fs::write(fname, enc).with_context(|| format!("can't write {}", fname.display()))?;
    Ok(())
}

/// Encode key as RFC 5915 ECPrivateKey, readable back with `SecretKey::from_sec1_pem`.
pub fn secret_key_to_rfc5915(key: &p256::SecretKey) -> Result<Vec<u8>> {
    let mut enc = crate::util::asn1::Encoder::new();
    enc.start_seq(0x30)?;
    enc.write_int(1)?;
    enc.write_octet_string(key.to_bytes().as_slice())?;
    enc.start_seq(0xa0)?;
    enc.write_oid("1.2.840.10045.3.1.7")?;
    enc.end_seq();
    enc.start_seq(0xa1)?;
    let mut b: Vec<u8> = vec![0];
    b.extend_from_slice(&key.public_key().to_sec1_bytes());
    enc.write_octet_string_with_tag(0x3, &b)?;
    enc.end_seq();
    enc.end_seq();
    Ok(enc.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;

    #[test]
    fn hkdf_rfc5869_case1() -> Result<()> {
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c")?;
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9")?;
        let okm = hkdf_sha256(&salt, &ikm, &info, 42)?;
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
        Ok(())
    }

    #[test]
    fn hmac_verify_is_exact() -> Result<()> {
        let mac = hmac_sha256(b"payload", b"key")?;
        assert!(hmac_sha256_verify(b"payload", b"key", &mac)?);
        let mut bad = mac.clone();
        bad[31] ^= 1;
        assert!(!hmac_sha256_verify(b"payload", b"key", &bad)?);
        let mac1 = hmac_sha1(b"payload", b"key")?;
        assert_eq!(mac1.len(), 20);
        assert!(hmac_sha1_verify(b"payload", b"key", &mac1)?);
        Ok(())
    }

    #[test]
    fn ccm_tamper_detected() -> Result<()> {
        let key = [7u8; 16];
        let nonce = [1u8; 13];
        let ct = aes128_ccm_encrypt(&key, &nonce, b"hdr", b"hello")?;
        assert_eq!(ct.len(), 5 + CCM_TAG_LEN);
        assert_eq!(aes128_ccm_decrypt(&key, &nonce, b"hdr", &ct)?, b"hello");
        let res = aes128_ccm_decrypt(&key, &nonce, b"other", &ct);
        assert!(error::has_code(&res, ErrorCode::InvalidMessage));
        let res = aes128_ccm_encrypt(&key[..8], &nonce, b"", b"x");
        assert!(error::has_code(&res, ErrorCode::InvalidArgument));
        Ok(())
    }

    #[test]
    fn rfc5915_roundtrip() -> Result<()> {
        let key = p256::SecretKey::random(&mut rand::thread_rng());
        let der = secret_key_to_rfc5915(&key)?;
        let pem = pem::encode(&pem::Pem::new("EC PRIVATE KEY", der));
        let back = p256::SecretKey::from_sec1_pem(&pem)?;
        assert_eq!(back.to_bytes(), key.to_bytes());
        Ok(())
    }
}
