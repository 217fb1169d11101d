//! Operational certificate arrays and chain validation.

use anyhow::{Context, Result};

use crate::cert_matter::MatterCert;
use crate::cert_x509::{KeyPurpose, KeyUsage};
use crate::error::ErrorCode;
use crate::tlv::{self, TlvItemValue};

/// Largest accepted matter TLV certificate.
pub const MAX_CHIP_CERT_LENGTH: usize = 400;
/// NOC + ICAC as TLV array: two long octet strings plus container markers.
pub const MAX_CHIP_OP_CERT_ARRAY_LENGTH: usize = 2 * (MAX_CHIP_CERT_LENGTH + 4);

/// Requirements a leaf (NOC) must meet on top of a valid signature chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub required_key_usage: KeyUsage,
    pub required_key_purpose: Option<KeyPurpose>,
    /// Unix seconds. `None` skips the validity period check, for devices without a clock.
    pub effective_time: Option<u64>,
}

impl ValidationContext {
    /// What a node presenting its NOC during session establishment must satisfy.
    pub fn operational() -> Self {
        Self {
            required_key_usage: KeyUsage::DIGITAL_SIGNATURE,
            required_key_purpose: Some(KeyPurpose::ServerAuth),
            effective_time: None,
        }
    }

    pub fn at_time(mut self, unix_secs: u64) -> Self {
        self.effective_time = Some(unix_secs);
        self
    }
}

/// Pack NOC and optional ICAC (both matter TLV) into one buffer.
pub fn encode_op_cert_array(noc: &[u8], icac: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut tlv = tlv::TlvBuffer::new();
    tlv.write_anon_array()?;
    for cert in std::iter::once(noc).chain(icac) {
        if cert.is_empty() || cert.len() > MAX_CHIP_CERT_LENGTH {
            return Err(ErrorCode::InvalidArgument)
                .context(format!("certificate of {} bytes", cert.len()));
        }
        tlv.write_octetstring_notag(cert)?;
    }
    tlv.write_struct_end()?;
    Ok(tlv.data)
}

/// Split array produced by [encode_op_cert_array] into (NOC, ICAC).
pub fn decode_op_cert_array(bytes: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let item = tlv::decode_tlv(bytes)
        .map_err(|_| ErrorCode::InvalidCert)
        .context("operational certificate array")?;
    let mut certs = Vec::new();
    if !matches!(item.value, TlvItemValue::List(_)) {
        return Err(ErrorCode::InvalidCert).context("certificate array is not a container");
    }
    for c in item.children() {
        match &c.value {
            TlvItemValue::OctetString(o) if o.len() <= MAX_CHIP_CERT_LENGTH => {
                certs.push(o.clone())
            }
            _ => {
                return Err(ErrorCode::InvalidCert)
                    .context("certificate array member is not a certificate")
            }
        }
    }
    let mut it = certs.into_iter();
    match (it.next(), it.next(), it.next()) {
        (Some(noc), icac, None) => Ok((noc, icac)),
        _ => Err(ErrorCode::InvalidCert).context("certificate array must hold one or two entries"),
    }
}

fn check_time(cert: &MatterCert, ctx: &ValidationContext) -> Result<()> {
    if let Some(now) = ctx.effective_time {
        if now < cert.tbs.not_before || now > cert.tbs.not_after {
            return Err(ErrorCode::CertExpired).context(format!(
                "time {} outside {}..{}",
                now, cert.tbs.not_before, cert.tbs.not_after
            ));
        }
    }
    Ok(())
}

fn check_issuer(cert: &MatterCert, issuer: &MatterCert, what: &str) -> Result<()> {
    if !issuer.is_ca() || !issuer.tbs.key_usage.contains(KeyUsage::KEY_CERT_SIGN) {
        return Err(ErrorCode::CertNotTrusted).context(format!("{} issuer is not a CA", what));
    }
    if cert.authority_key_id() != issuer.subject_key_id() {
        return Err(ErrorCode::CertNotTrusted).context(format!("{} not issued by this CA", what));
    }
    cert.verify_signed_by(issuer.public_key())
        .map_err(|e| e.context(ErrorCode::CertNotTrusted))
        .with_context(|| format!("{} signature", what))
}

/// Validate noc -> icac -> root linkage. `root` is the trust anchor and is
/// not itself verified beyond being a CA.
pub fn validate_chain(
    noc: &MatterCert,
    icac: Option<&MatterCert>,
    root: &MatterCert,
    ctx: &ValidationContext,
) -> Result<()> {
    if root.rcac_id().is_none() {
        return Err(ErrorCode::CertNotTrusted).context("trust anchor has no root ca id");
    }
    if let Some(icac) = icac {
        if icac.icac_id().is_none() {
            return Err(ErrorCode::CertNotTrusted).context("intermediate has no icac id");
        }
        check_issuer(icac, root, "icac")?;
        check_issuer(noc, icac, "noc")?;
        check_time(icac, ctx)?;
    } else {
        check_issuer(noc, root, "noc")?;
    }
    check_time(root, ctx)?;
    check_time(noc, ctx)?;

    if noc.is_ca() {
        return Err(ErrorCode::CertUsageNotAllowed).context("leaf certificate is a CA");
    }
    if !noc.tbs.key_usage.contains(ctx.required_key_usage) {
        return Err(ErrorCode::CertUsageNotAllowed).context(format!(
            "key usage {:?} lacks {:?}",
            noc.tbs.key_usage, ctx.required_key_usage
        ));
    }
    if let Some(purpose) = ctx.required_key_purpose {
        if !noc.tbs.key_purposes.contains(&purpose) {
            return Err(ErrorCode::CertUsageNotAllowed)
                .context(format!("key purpose {:?} missing", purpose));
        }
    }
    log::trace!(
        "chain ok for node {:x?} fabric {:x?}",
        noc.node_id(),
        noc.fabric_id()
    );
    Ok(())
}
