//! Handling of certificates in Matter format

use anyhow::{Context, Result};
use p256::ecdsa::signature::Verifier;
use x509_cert::der::{Decode, Encode};

use crate::cert_x509::{self, DnAttribute, KeyPurpose, KeyUsage, TbsFields, MATTER_EPOCH_OFFSET};
use crate::error::ErrorCode;
use crate::tlv::{self, TlvItem, TlvItemValue};
use crate::util::cryptoutil;

const SIG_ALGO_ECDSA_WITH_SHA256: u8 = 1;
const PUBKEY_ALGO_EC: u8 = 1;
const CURVE_PRIME256V1: u8 = 1;
const KEY_ID_LEN: usize = 20;
const PUBLIC_KEY_LEN: usize = 65;
const SIGNATURE_LEN: usize = 64;

/// Decoded matter certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct MatterCert {
    pub tbs: TbsFields,
    /// Raw r || s.
    pub signature: Vec<u8>,
}

fn bad(msg: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorCode::InvalidCert).context(msg.to_owned())
}

fn dn_from_matter(item: &TlvItem) -> Result<Vec<DnAttribute>> {
    let mut out = Vec::new();
    for e in item.children() {
        let value = match &e.value {
            TlvItemValue::Int(v) => *v,
            _ => return Err(bad("dn attribute is not integer")),
        };
        out.push(DnAttribute::from_matter_tag(e.tag, value).ok_or_else(|| bad("unsupported dn tag"))?);
    }
    Ok(out)
}

fn dn_from_x509(dn: &x509_cert::name::RdnSequence) -> Result<Vec<DnAttribute>> {
    let mut out = Vec::new();
    for rdn in &dn.0 {
        for atv in rdn.0.as_slice() {
            let value = atv
                .value
                .decode_as::<String>()
                .map_err(|_| bad("dn value is not utf8 string"))?;
            out.push(DnAttribute::from_oid(&atv.oid.to_string(), &value)?);
        }
    }
    Ok(out)
}

fn write_dn(enc: &mut tlv::TlvBuffer, tag: u8, dn: &[DnAttribute]) -> Result<()> {
    enc.write_list(tag)?;
    for a in dn {
        enc.write_uint64(a.matter_tag(), a.value())?;
    }
    enc.write_struct_end()?;
    Ok(())
}

fn unix_to_matter_time(secs: u64) -> Result<u32> {
    let t = secs
        .checked_sub(MATTER_EPOCH_OFFSET)
        .ok_or_else(|| bad("certificate time before 2000"))?;
    u32::try_from(t).map_err(|_| bad("certificate time out of range"))
}

impl MatterCert {
    /// Parse matter TLV certificate. Any structural problem is reported as [ErrorCode::InvalidCert].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let root = tlv::decode_tlv(bytes).map_err(|e| bad(&format!("tlv decode: {}", e)))?;
        if !matches!(root.value, TlvItemValue::List(_)) {
            return Err(bad("certificate is not a structure"));
        }
        let serial = root
            .get_octet_string(&[1])
            .ok_or_else(|| bad("missing serial"))?
            .to_vec();
        if root.get_u8(&[2]) != Some(SIG_ALGO_ECDSA_WITH_SHA256) {
            return Err(bad("unsupported signature algorithm"));
        }
        let issuer = dn_from_matter(root.get_item(&[3]).ok_or_else(|| bad("missing issuer"))?)?;
        let not_before = root.get_u32(&[4]).ok_or_else(|| bad("missing not before"))?;
        let not_after = root.get_u32(&[5]).ok_or_else(|| bad("missing not after"))?;
        let subject = dn_from_matter(root.get_item(&[6]).ok_or_else(|| bad("missing subject"))?)?;
        if root.get_u8(&[7]) != Some(PUBKEY_ALGO_EC) || root.get_u8(&[8]) != Some(CURVE_PRIME256V1) {
            return Err(bad("unsupported public key algorithm"));
        }
        let public_key = root
            .get_octet_string(&[9])
            .filter(|k| k.len() == PUBLIC_KEY_LEN)
            .ok_or_else(|| bad("missing or malformed public key"))?
            .to_vec();

        let is_ca = root.get_bool(&[10, 1, 1]).unwrap_or(false);
        let key_usage = root
            .get_u16(&[10, 2])
            .and_then(KeyUsage::from_bits)
            .ok_or_else(|| bad("missing or malformed key usage"))?;
        let mut key_purposes = Vec::new();
        if let Some(arr) = root.get_item(&[10, 3]) {
            for p in arr.children() {
                let code = match p.value {
                    TlvItemValue::Int(v) => u8::try_from(v).ok(),
                    _ => None,
                };
                key_purposes.push(
                    code.and_then(KeyPurpose::from_u8)
                        .ok_or_else(|| bad("unsupported key purpose"))?,
                );
            }
        }
        let subject_key_id = root
            .get_octet_string(&[10, 4])
            .filter(|k| k.len() == KEY_ID_LEN)
            .ok_or_else(|| bad("missing subject key id"))?
            .to_vec();
        let authority_key_id = root
            .get_octet_string(&[10, 5])
            .filter(|k| k.len() == KEY_ID_LEN)
            .ok_or_else(|| bad("missing authority key id"))?
            .to_vec();
        let signature = root
            .get_octet_string(&[11])
            .filter(|s| s.len() == SIGNATURE_LEN)
            .ok_or_else(|| bad("missing or malformed signature"))?
            .to_vec();

        Ok(Self {
            tbs: TbsFields {
                serial,
                issuer,
                not_before: not_before as u64 + MATTER_EPOCH_OFFSET,
                not_after: not_after as u64 + MATTER_EPOCH_OFFSET,
                subject,
                public_key,
                is_ca,
                key_usage,
                key_purposes,
                subject_key_id,
                authority_key_id,
            },
            signature,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let t = &self.tbs;
        let mut enc = tlv::TlvBuffer::new();
        enc.write_anon_struct()?;
        enc.write_octetstring(1, &t.serial)?;
        enc.write_uint8(2, SIG_ALGO_ECDSA_WITH_SHA256)?;
        write_dn(&mut enc, 3, &t.issuer)?;
        enc.write_uint32(4, unix_to_matter_time(t.not_before)?)?;
        enc.write_uint32(5, unix_to_matter_time(t.not_after)?)?;
        write_dn(&mut enc, 6, &t.subject)?;
        enc.write_uint8(7, PUBKEY_ALGO_EC)?;
        enc.write_uint8(8, CURVE_PRIME256V1)?;
        enc.write_octetstring(9, &t.public_key)?;

        enc.write_list(10)?;
        enc.write_struct(1)?;
        enc.write_bool(1, t.is_ca)?;
        enc.write_struct_end()?;
        let ku = t.key_usage.bits();
        if ku <= 0xff {
            enc.write_uint8(2, ku as u8)?;
        } else {
            enc.write_uint16(2, ku)?;
        }
        if !t.key_purposes.is_empty() {
            enc.write_array(3)?;
            for p in &t.key_purposes {
                enc.write_uint8_notag(*p as u8)?;
            }
            enc.write_struct_end()?;
        }
        enc.write_octetstring(4, &t.subject_key_id)?;
        enc.write_octetstring(5, &t.authority_key_id)?;
        enc.write_struct_end()?;

        enc.write_octetstring(11, &self.signature)?;
        enc.write_struct_end()?;
        Ok(enc.data)
    }

    /// Parse x509 DER certificate using matter certificate profile.
    pub fn from_x509(bytes: &[u8]) -> Result<Self> {
        let cert = x509_cert::Certificate::from_der(bytes).map_err(|e| bad(&format!("x509 decode: {}", e)))?;
        let tbs = &cert.tbs_certificate;

        let public_key = tbs
            .subject_public_key_info
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| bad("can't extract subject public key"))?
            .to_vec();

        let mut is_ca = false;
        let mut key_usage = None;
        let mut key_purposes = Vec::new();
        let mut subject_key_id = None;
        let mut authority_key_id = None;
        for ext in tbs.extensions.as_deref().unwrap_or(&[]) {
            let value = ext.extn_value.as_bytes();
            match ext.extn_id.to_string().as_str() {
                cert_x509::OID_CE_BASIC_CONSTRAINTS => {
                    is_ca = x509_cert::ext::pkix::BasicConstraints::from_der(value)
                        .map_err(|_| bad("basic constraints"))?
                        .ca;
                }
                cert_x509::OID_CE_KEY_USAGE => {
                    let kus = x509_cert::ext::pkix::KeyUsage::from_der(value)
                        .map_err(|_| bad("key usage"))?;
                    key_usage = KeyUsage::from_bits(kus.0.bits());
                }
                cert_x509::OID_CE_EXT_KEY_USAGE => {
                    let extu = x509_cert::ext::pkix::ExtendedKeyUsage::from_der(value)
                        .map_err(|_| bad("extended key usage"))?;
                    for u in extu.0 {
                        key_purposes.push(
                            KeyPurpose::from_oid(&u.to_string())
                                .ok_or_else(|| bad("unsupported oid in extendedKeyUsage"))?,
                        );
                    }
                }
                cert_x509::OID_CE_SUBJECT_KEY_IDENTIFIER => {
                    let ski = x509_cert::ext::pkix::SubjectKeyIdentifier::from_der(value)
                        .map_err(|_| bad("subject key id"))?;
                    subject_key_id = Some(ski.0.as_bytes().to_vec());
                }
                cert_x509::OID_CE_AUTHORITY_KEY_IDENTIFIER => {
                    let akid = x509_cert::ext::pkix::AuthorityKeyIdentifier::from_der(value)
                        .map_err(|_| bad("authority key id"))?;
                    authority_key_id = akid.key_identifier.map(|k| k.as_bytes().to_vec());
                }
                other => return Err(bad(&format!("unsupported extension {}", other))),
            }
        }

        let sig = cert
            .signature
            .as_bytes()
            .ok_or_else(|| bad("can't get signature from x509"))?;
        let sig = p256::ecdsa::Signature::from_der(sig).map_err(|_| bad("malformed signature"))?;

        let out = Self {
            tbs: TbsFields {
                serial: tbs.serial_number.as_bytes().to_vec(),
                issuer: dn_from_x509(&tbs.issuer)?,
                not_before: tbs.validity.not_before.to_unix_duration().as_secs(),
                not_after: tbs.validity.not_after.to_unix_duration().as_secs(),
                subject: dn_from_x509(&tbs.subject)?,
                public_key,
                is_ca,
                key_usage: key_usage.ok_or_else(|| bad("missing key usage"))?,
                key_purposes,
                subject_key_id: subject_key_id.ok_or_else(|| bad("missing subject key id"))?,
                authority_key_id: authority_key_id
                    .ok_or_else(|| bad("missing authority key id"))?,
            },
            signature: sig.to_bytes().to_vec(),
        };

        // signature must stay verifiable after conversion
        if out.tbs_der()? != tbs.to_der()? {
            return Err(bad("x509 encoding is not matter compatible"));
        }
        Ok(out)
    }

    fn dn_value(dn: &[DnAttribute], f: fn(&DnAttribute) -> Option<u64>) -> Option<u64> {
        dn.iter().find_map(f)
    }

    pub fn node_id(&self) -> Option<u64> {
        Self::dn_value(&self.tbs.subject, |a| match a {
            DnAttribute::NodeId(v) => Some(*v),
            _ => None,
        })
    }
    pub fn fabric_id(&self) -> Option<u64> {
        Self::dn_value(&self.tbs.subject, |a| match a {
            DnAttribute::FabricId(v) => Some(*v),
            _ => None,
        })
    }
    pub fn rcac_id(&self) -> Option<u64> {
        Self::dn_value(&self.tbs.subject, |a| match a {
            DnAttribute::RcacId(v) => Some(*v),
            _ => None,
        })
    }
    pub fn icac_id(&self) -> Option<u64> {
        Self::dn_value(&self.tbs.subject, |a| match a {
            DnAttribute::IcacId(v) => Some(*v),
            _ => None,
        })
    }
    pub fn case_auth_tags(&self) -> Vec<u32> {
        self.tbs
            .subject
            .iter()
            .filter_map(|a| match a {
                DnAttribute::CaseAuthTag(v) => Some(*v),
                _ => None,
            })
            .collect()
    }
    pub fn public_key(&self) -> &[u8] {
        &self.tbs.public_key
    }
    pub fn is_ca(&self) -> bool {
        self.tbs.is_ca
    }
    pub fn subject_key_id(&self) -> &[u8] {
        &self.tbs.subject_key_id
    }
    pub fn authority_key_id(&self) -> &[u8] {
        &self.tbs.authority_key_id
    }

    /// DER TBSCertificate the signature was computed over.
    pub fn tbs_der(&self) -> Result<Vec<u8>> {
        cert_x509::encode_tbs(&self.tbs)
    }

    /// Check the signature with issuer public key (65 byte SEC1).
    pub fn verify_signed_by(&self, issuer_public_key: &[u8]) -> Result<()> {
        let vk = p256::ecdsa::VerifyingKey::from_sec1_bytes(issuer_public_key)
            .map_err(|_| bad("issuer public key is not valid p256 point"))?;
        let sig = p256::ecdsa::Signature::from_slice(&self.signature)
            .map_err(|_| bad("malformed signature"))?;
        let tbs = self.tbs_der()?;
        vk.verify(&tbs, &sig)
            .map_err(|_| ErrorCode::InvalidSignature)
            .context("certificate signature check")?;
        Ok(())
    }
}

/// Convert certificate from X509/DER array of bytes to matter format
/// x509 certificate must be compatible with matter
pub fn convert_x509_bytes_to_matter(bytes: &[u8]) -> Result<Vec<u8>> {
    MatterCert::from_x509(bytes)?.encode()
}

/// Convert certificate in PEM file to matter format
pub fn convert_x509_to_matter(fname: &std::path::Path) -> Result<Vec<u8>> {
    let x509_raw = cryptoutil::read_data_from_pem(fname)?;
    convert_x509_bytes_to_matter(&x509_raw).with_context(|| format!("converting {}", fname.display()))
}
