//! Handling of x509 certificate compatible with matter
//!
//! The DER produced here is deterministic: the same [TbsFields] always encode to
//! the same bytes. Matter TLV certificates only carry the fields, so verifying
//! one means re-encoding its TBS with [encode_tbs] and checking the signature
//! over that.

use std::time::Duration;

use anyhow::{Context, Result};
use byteorder::WriteBytesExt;
use ecdsa::signature::Signer;

use crate::error::ErrorCode;
use crate::util::asn1;
use crate::util::cryptoutil;

pub(crate) const OID_MATTER_DN_NODE: &str = "1.3.6.1.4.1.37244.1.1";
pub(crate) const OID_MATTER_DN_ICAC: &str = "1.3.6.1.4.1.37244.1.3";
pub(crate) const OID_MATTER_DN_RCAC: &str = "1.3.6.1.4.1.37244.1.4";
pub(crate) const OID_MATTER_DN_FABRIC: &str = "1.3.6.1.4.1.37244.1.5";
pub(crate) const OID_MATTER_DN_CAT: &str = "1.3.6.1.4.1.37244.1.6";

const OID_SIG_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_CURVE_PRIME256V1: &str = "1.2.840.10045.3.1.7";

pub(crate) const OID_CE_SUBJECT_KEY_IDENTIFIER: &str = "2.5.29.14";
pub(crate) const OID_CE_KEY_USAGE: &str = "2.5.29.15";
pub(crate) const OID_CE_BASIC_CONSTRAINTS: &str = "2.5.29.19";
pub(crate) const OID_CE_EXT_KEY_USAGE: &str = "2.5.29.37";
pub(crate) const OID_CE_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

/// Seconds between the unix epoch and the matter epoch (2000-01-01).
pub const MATTER_EPOCH_OFFSET: u64 = 946684800;

/// Matter specific distinguished name attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnAttribute {
    NodeId(u64),
    IcacId(u64),
    RcacId(u64),
    FabricId(u64),
    CaseAuthTag(u32),
}

impl DnAttribute {
    pub fn oid(&self) -> &'static str {
        match self {
            DnAttribute::NodeId(_) => OID_MATTER_DN_NODE,
            DnAttribute::IcacId(_) => OID_MATTER_DN_ICAC,
            DnAttribute::RcacId(_) => OID_MATTER_DN_RCAC,
            DnAttribute::FabricId(_) => OID_MATTER_DN_FABRIC,
            DnAttribute::CaseAuthTag(_) => OID_MATTER_DN_CAT,
        }
    }

    /// Context tag used for this attribute inside matter TLV certificates.
    pub fn matter_tag(&self) -> u8 {
        match self {
            DnAttribute::NodeId(_) => 17,
            DnAttribute::IcacId(_) => 19,
            DnAttribute::RcacId(_) => 20,
            DnAttribute::FabricId(_) => 21,
            DnAttribute::CaseAuthTag(_) => 22,
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            DnAttribute::NodeId(v)
            | DnAttribute::IcacId(v)
            | DnAttribute::RcacId(v)
            | DnAttribute::FabricId(v) => *v,
            DnAttribute::CaseAuthTag(v) => *v as u64,
        }
    }

    pub fn from_matter_tag(tag: u8, value: u64) -> Option<Self> {
        match tag {
            17 => Some(DnAttribute::NodeId(value)),
            19 => Some(DnAttribute::IcacId(value)),
            20 => Some(DnAttribute::RcacId(value)),
            21 => Some(DnAttribute::FabricId(value)),
            22 => u32::try_from(value).ok().map(DnAttribute::CaseAuthTag),
            _ => None,
        }
    }

    /// Parse from x509 attribute: oid plus hex encoded string value.
    pub fn from_oid(oid: &str, value: &str) -> Result<Self> {
        let v = u64::from_str_radix(value, 16)
            .map_err(|_| ErrorCode::InvalidCert)
            .with_context(|| format!("dn value {:?} is not hex", value))?;
        let attr = match oid {
            OID_MATTER_DN_NODE => DnAttribute::NodeId(v),
            OID_MATTER_DN_ICAC => DnAttribute::IcacId(v),
            OID_MATTER_DN_RCAC => DnAttribute::RcacId(v),
            OID_MATTER_DN_FABRIC => DnAttribute::FabricId(v),
            OID_MATTER_DN_CAT => DnAttribute::CaseAuthTag(
                u32::try_from(v).map_err(|_| ErrorCode::InvalidCert)?,
            ),
            _ => {
                return Err(ErrorCode::InvalidCert)
                    .context(format!("unsupported dn attribute {}", oid))
            }
        };
        Ok(attr)
    }

    fn encoded_value(&self) -> String {
        match self {
            DnAttribute::CaseAuthTag(v) => format!("{:0>8X}", v),
            _ => format!("{:0>16X}", self.value()),
        }
    }
}

bitflags::bitflags! {
    /// X.509 key usage bits, numbered as in RFC 5280 (bit 0 = digitalSignature).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyUsage: u16 {
        const DIGITAL_SIGNATURE = 0x0001;
        const NON_REPUDIATION = 0x0002;
        const KEY_ENCIPHERMENT = 0x0004;
        const DATA_ENCIPHERMENT = 0x0008;
        const KEY_AGREEMENT = 0x0010;
        const KEY_CERT_SIGN = 0x0020;
        const CRL_SIGN = 0x0040;
        const ENCIPHER_ONLY = 0x0080;
        const DECIPHER_ONLY = 0x0100;
    }
}

/// Extended key usage purposes, with their matter TLV codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    ServerAuth = 1,
    ClientAuth = 2,
    CodeSigning = 3,
    EmailProtection = 4,
    TimeStamping = 5,
    OcspSigning = 6,
}

impl KeyPurpose {
    pub fn oid(&self) -> &'static str {
        match self {
            KeyPurpose::ServerAuth => "1.3.6.1.5.5.7.3.1",
            KeyPurpose::ClientAuth => "1.3.6.1.5.5.7.3.2",
            KeyPurpose::CodeSigning => "1.3.6.1.5.5.7.3.3",
            KeyPurpose::EmailProtection => "1.3.6.1.5.5.7.3.4",
            KeyPurpose::TimeStamping => "1.3.6.1.5.5.7.3.8",
            KeyPurpose::OcspSigning => "1.3.6.1.5.5.7.3.9",
        }
    }
    pub fn from_oid(oid: &str) -> Option<Self> {
        [
            KeyPurpose::ServerAuth,
            KeyPurpose::ClientAuth,
            KeyPurpose::CodeSigning,
            KeyPurpose::EmailProtection,
            KeyPurpose::TimeStamping,
            KeyPurpose::OcspSigning,
        ]
        .into_iter()
        .find(|p| p.oid() == oid)
    }
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(KeyPurpose::ServerAuth),
            2 => Some(KeyPurpose::ClientAuth),
            3 => Some(KeyPurpose::CodeSigning),
            4 => Some(KeyPurpose::EmailProtection),
            5 => Some(KeyPurpose::TimeStamping),
            6 => Some(KeyPurpose::OcspSigning),
            _ => None,
        }
    }
}

/// Everything that goes into the signed part of a matter certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct TbsFields {
    /// Content octets of the DER INTEGER.
    pub serial: Vec<u8>,
    pub issuer: Vec<DnAttribute>,
    /// Unix seconds.
    pub not_before: u64,
    pub not_after: u64,
    pub subject: Vec<DnAttribute>,
    /// Uncompressed SEC1 point, 65 bytes.
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    pub key_usage: KeyUsage,
    pub key_purposes: Vec<KeyPurpose>,
    pub subject_key_id: Vec<u8>,
    pub authority_key_id: Vec<u8>,
}

fn add_ext(encoder: &mut asn1::Encoder, oid: &str, critical: bool, value: &[u8]) -> Result<()> {
    encoder.start_seq(0x30)?;
    encoder.write_oid(oid)?;
    if critical {
        encoder.write_bool(critical)?;
    }
    encoder.write_octet_string(value)?;
    encoder.end_seq();
    Ok(())
}

fn add_dn(encoder: &mut asn1::Encoder, dn: &[DnAttribute]) -> Result<()> {
    encoder.start_seq(0x30)?;
    for attr in dn {
        encoder.start_seq(0x31)?; //rdn
        encoder.start_seq(0x30)?; //atv
        encoder.write_oid(attr.oid())?;
        encoder.write_string(&attr.encoded_value())?;
        encoder.end_seq();
        encoder.end_seq();
    }
    encoder.end_seq();
    Ok(())
}

fn unix_to_x509_time(secs: u64) -> Result<String> {
    let der_datetime = x509_cert::der::asn1::UtcTime::from_unix_duration(Duration::from_secs(secs))
        .map_err(|_| ErrorCode::InvalidArgument)
        .with_context(|| format!("time {} not representable as UTCTime", secs))?;
    let mut v = Vec::new();
    x509_cert::der::EncodeValue::encode_value(&der_datetime, &mut v)?;
    Ok(std::str::from_utf8(&v)?.to_owned())
}

/// DER BIT STRING (tag, length, unused bits, data) for the key usage extension.
pub fn key_usage_bit_string(ku: KeyUsage) -> Result<Vec<u8>> {
    let bits = ku.bits();
    if bits == 0 {
        return Err(ErrorCode::InvalidArgument).context("empty key usage");
    }
    let highest = 15 - bits.leading_zeros() as usize;
    let mut data = vec![0u8; highest / 8 + 1];
    for i in 0..=highest {
        if bits & (1 << i) != 0 {
            data[i / 8] |= 0x80 >> (i % 8);
        }
    }
    let mut out = vec![0x03, data.len() as u8 + 1, (7 - highest % 8) as u8];
    out.extend_from_slice(&data);
    Ok(out)
}

/// Encode TBSCertificate of matter compatible certificate.
pub fn encode_tbs(f: &TbsFields) -> Result<Vec<u8>> {
    let mut encoder = asn1::Encoder::new();
    encoder.start_seq(0x30)?;

    encoder.start_seq(0xa0)?;
    encoder.write_int(2)?; // version
    encoder.end_seq();

    encoder.write_octet_string_with_tag(0x2, &f.serial)?;

    encoder.start_seq(0x30)?; //signature algorithm
    encoder.write_oid(OID_SIG_ECDSA_WITH_SHA256)?;
    encoder.end_seq();

    add_dn(&mut encoder, &f.issuer)?;

    encoder.start_seq(0x30)?; //validity
    encoder.write_string_with_tag(0x17, &unix_to_x509_time(f.not_before)?)?;
    encoder.write_string_with_tag(0x17, &unix_to_x509_time(f.not_after)?)?;
    encoder.end_seq();

    add_dn(&mut encoder, &f.subject)?;

    encoder.start_seq(0x30)?; //subject key info
    encoder.start_seq(0x30)?; //algorithm
    encoder.write_oid(OID_EC_PUBLIC_KEY)?;
    encoder.write_oid(OID_CURVE_PRIME256V1)?;
    encoder.end_seq();
    let mut pk2 = Vec::new();
    pk2.write_u8(0)?;
    pk2.extend_from_slice(&f.public_key);
    encoder.write_octet_string_with_tag(0x3, &pk2)?;
    encoder.end_seq();

    encoder.start_seq(0xa3)?;
    encoder.start_seq(0x30)?;
    if f.is_ca {
        add_ext(
            &mut encoder,
            OID_CE_BASIC_CONSTRAINTS,
            true,
            &[0x30, 0x03, 0x01, 0x01, 0xFF],
        )?
    } else {
        add_ext(&mut encoder, OID_CE_BASIC_CONSTRAINTS, true, &[0x30, 0x00])?
    }
    add_ext(
        &mut encoder,
        OID_CE_KEY_USAGE,
        true,
        &key_usage_bit_string(f.key_usage)?,
    )?;
    if !f.key_purposes.is_empty() {
        let mut ext_ku_encoder = asn1::Encoder::new();
        ext_ku_encoder.start_seq(0x30)?;
        for p in &f.key_purposes {
            ext_ku_encoder.write_oid(p.oid())?;
        }
        add_ext(
            &mut encoder,
            OID_CE_EXT_KEY_USAGE,
            true,
            &ext_ku_encoder.encode(),
        )?;
    }
    let ski = {
        let mut encoder = asn1::Encoder::new();
        encoder.write_octet_string(&f.subject_key_id)?;
        encoder.encode()
    };
    add_ext(&mut encoder, OID_CE_SUBJECT_KEY_IDENTIFIER, false, &ski)?;
    let akid = {
        let mut encoder = asn1::Encoder::new();
        encoder.start_seq(0x30)?;
        encoder.write_octet_string_with_tag(0x80, &f.authority_key_id)?;
        encoder.encode()
    };
    add_ext(&mut encoder, OID_CE_AUTHORITY_KEY_IDENTIFIER, false, &akid)?;
    encoder.end_seq();
    encoder.end_seq();

    Ok(encoder.encode())
}

/// Wrap TBS and DER encoded ECDSA signature into a Certificate.
pub fn assemble_certificate(tbs: &[u8], der_signature: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = asn1::Encoder::new();
    encoder.start_seq(0x30)?;
    encoder.write_raw(tbs);
    encoder.start_seq(0x30)?; //alg
    encoder.write_oid(OID_SIG_ECDSA_WITH_SHA256)?;
    encoder.end_seq();
    let mut signed_b = vec![0];
    signed_b.extend_from_slice(der_signature);
    encoder.write_octet_string_with_tag(0x3, &signed_b)?;
    Ok(encoder.encode())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertProfile {
    Root,
    Intermediate,
    Node,
}

/// Issuance request for [encode_x509].
#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub profile: CertProfile,
    pub subject: Vec<DnAttribute>,
    /// Ignored for [CertProfile::Root], which is self issued.
    pub issuer: Vec<DnAttribute>,
    pub not_before: u64,
    pub not_after: u64,
}

fn random_serial() -> Vec<u8> {
    let mut serial: [u8; 8] = rand::random();
    // positive and minimal
    serial[0] = (serial[0] & 0x7f) | 0x01;
    serial.to_vec()
}

/// Create matter compatible certificate in x509 format, signed by `issuer_key`.
pub fn encode_x509(
    tmpl: &CertTemplate,
    subject_public_key: &[u8],
    issuer_key: &p256::SecretKey,
) -> Result<Vec<u8>> {
    let issuer_public = issuer_key.public_key().to_sec1_bytes();
    let (is_ca, key_usage, key_purposes) = match tmpl.profile {
        CertProfile::Root | CertProfile::Intermediate => (
            true,
            KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN,
            Vec::new(),
        ),
        CertProfile::Node => (
            false,
            KeyUsage::DIGITAL_SIGNATURE,
            vec![KeyPurpose::ClientAuth, KeyPurpose::ServerAuth],
        ),
    };
    let issuer = match tmpl.profile {
        CertProfile::Root => tmpl.subject.clone(),
        _ => tmpl.issuer.clone(),
    };
    let fields = TbsFields {
        serial: random_serial(),
        issuer,
        not_before: tmpl.not_before,
        not_after: tmpl.not_after,
        subject: tmpl.subject.clone(),
        public_key: subject_public_key.to_vec(),
        is_ca,
        key_usage,
        key_purposes,
        subject_key_id: cryptoutil::sha1_enc(subject_public_key),
        authority_key_id: cryptoutil::sha1_enc(&issuer_public),
    };
    let tbs = encode_tbs(&fields)?;
    let key = ecdsa::SigningKey::from(issuer_key);
    let signature: ecdsa::Signature<p256::NistP256> = key.sign(&tbs);
    assemble_certificate(&tbs, signature.to_der().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Verifier;
    use x509_cert::der::{Decode, Encode};

    #[test]
    fn key_usage_encodings() -> Result<()> {
        assert_eq!(
            key_usage_bit_string(KeyUsage::DIGITAL_SIGNATURE)?,
            vec![0x03, 0x02, 0x07, 0x80]
        );
        assert_eq!(
            key_usage_bit_string(KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN)?,
            vec![0x03, 0x02, 0x01, 0x06]
        );
        assert_eq!(
            key_usage_bit_string(KeyUsage::DIGITAL_SIGNATURE | KeyUsage::DECIPHER_ONLY)?,
            vec![0x03, 0x03, 0x07, 0x80, 0x80]
        );
        assert!(key_usage_bit_string(KeyUsage::empty()).is_err());
        Ok(())
    }

    #[test]
    fn dn_attribute_values() -> Result<()> {
        let a = DnAttribute::from_oid(OID_MATTER_DN_FABRIC, "00000000000004D2")?;
        assert_eq!(a, DnAttribute::FabricId(1234));
        assert_eq!(a.encoded_value(), "00000000000004D2");
        assert_eq!(DnAttribute::CaseAuthTag(0xabcd0001).encoded_value(), "ABCD0001");
        assert!(DnAttribute::from_oid("2.5.4.3", "00").is_err());
        assert!(DnAttribute::from_oid(OID_MATTER_DN_NODE, "xyz").is_err());
        Ok(())
    }

    #[test]
    fn node_certificate_parses_and_verifies() -> Result<()> {
        let ca_key = p256::SecretKey::random(&mut rand::thread_rng());
        let node_key = p256::SecretKey::random(&mut rand::thread_rng());
        let node_pub = node_key.public_key().to_sec1_bytes();
        let tmpl = CertTemplate {
            profile: CertProfile::Node,
            subject: vec![DnAttribute::NodeId(0x1111), DnAttribute::FabricId(1234)],
            issuer: vec![DnAttribute::RcacId(1)],
            not_before: 1700000000,
            not_after: 1800000000,
        };
        let der = encode_x509(&tmpl, &node_pub, &ca_key)?;
        let cert = x509_cert::Certificate::from_der(&der)?;
        assert_eq!(cert.tbs_certificate.subject.0.len(), 2);
        assert_eq!(
            cert.tbs_certificate.validity.not_before.to_unix_duration().as_secs(),
            1700000000
        );

        let tbs = cert.tbs_certificate.to_der()?;
        let sig = p256::ecdsa::Signature::from_der(
            cert.signature.as_bytes().context("signature bits")?,
        )?;
        let vk = p256::ecdsa::VerifyingKey::from_sec1_bytes(&ca_key.public_key().to_sec1_bytes())?;
        vk.verify(&tbs, &sig)?;
        Ok(())
    }

    #[test]
    fn tbs_is_deterministic() -> Result<()> {
        let key = p256::SecretKey::random(&mut rand::thread_rng());
        let public_key = key.public_key().to_sec1_bytes().to_vec();
        let fields = TbsFields {
            serial: vec![0x01, 0x02],
            issuer: vec![DnAttribute::RcacId(7)],
            not_before: 1700000000,
            not_after: 1700000000 + 3600,
            subject: vec![DnAttribute::RcacId(7)],
            subject_key_id: cryptoutil::sha1_enc(&public_key),
            authority_key_id: cryptoutil::sha1_enc(&public_key),
            public_key,
            is_ca: true,
            key_usage: KeyUsage::KEY_CERT_SIGN | KeyUsage::CRL_SIGN,
            key_purposes: vec![],
        };
        assert_eq!(encode_tbs(&fields)?, encode_tbs(&fields.clone())?);
        Ok(())
    }
}
