//! Certificate authority issuing matter operational credentials.
//!
//! This is the commissioner side of a fabric: it owns the root key (and
//! optionally an intermediate key) and issues NOCs. Which roots a device
//! accepts is decided by whoever hands the resulting certificates to
//! [crate::fabric_table::FabricTable::add_new_fabric].

use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cert_matter;
use crate::cert_x509::{self, CertProfile, CertTemplate, DnAttribute};
use crate::credentials;
use crate::keypair::OperationalKeypair;
use crate::util::cryptoutil;

/// Ten years.
pub const DEFAULT_VALIDITY_SECS: u64 = 60 * 60 * 24 * 365 * 10;

struct Issuer {
    id: u64,
    key: p256::SecretKey,
    x509: Vec<u8>,
    cert: Vec<u8>,
}

/// Credentials for one node, ready to be installed into a fabric slot.
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    pub keypair: OperationalKeypair,
    pub noc: Vec<u8>,
    pub icac: Option<Vec<u8>>,
}

impl NodeCredentials {
    pub fn op_cert_array(&self) -> Result<Vec<u8>> {
        credentials::encode_op_cert_array(&self.noc, self.icac.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CaMetadata {
    fabric_id: u64,
    root_id: u64,
    icac_id: Option<u64>,
    not_before: u64,
    validity_secs: u64,
}

pub struct CertificateAuthority {
    fabric_id: u64,
    not_before: u64,
    validity_secs: u64,
    root: Issuer,
    icac: Option<Issuer>,
}

fn unix_now() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .context("system clock before 1970")?
        .as_secs())
}

impl CertificateAuthority {
    /// Generate root key and self signed root certificate valid from now.
    pub fn new(fabric_id: u64, root_id: u64) -> Result<Self> {
        Self::with_validity(fabric_id, root_id, unix_now()?, DEFAULT_VALIDITY_SECS)
    }

    pub fn with_validity(fabric_id: u64, root_id: u64, not_before: u64, validity_secs: u64) -> Result<Self> {
        let key = p256::SecretKey::random(&mut rand::thread_rng());
        let tmpl = CertTemplate {
            profile: CertProfile::Root,
            subject: vec![DnAttribute::RcacId(root_id)],
            issuer: Vec::new(),
            not_before,
            not_after: not_before + validity_secs,
        };
        let x509 = cert_x509::encode_x509(&tmpl, &key.public_key().to_sec1_bytes(), &key)?;
        let cert = cert_matter::convert_x509_bytes_to_matter(&x509)?;
        log::debug!("created root ca {:x} for fabric {:x}", root_id, fabric_id);
        Ok(Self {
            fabric_id,
            not_before,
            validity_secs,
            root: Issuer {
                id: root_id,
                key,
                x509,
                cert,
            },
            icac: None,
        })
    }

    /// Create intermediate CA. NOCs issued afterwards are signed by it.
    pub fn add_intermediate(&mut self, icac_id: u64) -> Result<()> {
        let key = p256::SecretKey::random(&mut rand::thread_rng());
        let tmpl = CertTemplate {
            profile: CertProfile::Intermediate,
            subject: vec![DnAttribute::IcacId(icac_id), DnAttribute::FabricId(self.fabric_id)],
            issuer: vec![DnAttribute::RcacId(self.root.id)],
            not_before: self.not_before,
            not_after: self.not_before + self.validity_secs,
        };
        let x509 = cert_x509::encode_x509(&tmpl, &key.public_key().to_sec1_bytes(), &self.root.key)?;
        let cert = cert_matter::convert_x509_bytes_to_matter(&x509)?;
        self.icac = Some(Issuer {
            id: icac_id,
            key,
            x509,
            cert,
        });
        Ok(())
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    /// Root certificate in matter TLV format.
    pub fn root_cert(&self) -> &[u8] {
        &self.root.cert
    }

    pub fn root_public_key(&self) -> Vec<u8> {
        self.root.key.public_key().to_sec1_bytes().to_vec()
    }

    pub fn icac_cert(&self) -> Option<&[u8]> {
        self.icac.as_ref().map(|i| i.cert.as_slice())
    }

    /// Issue NOC for `node_public_key`. `fabric_id` is normally [CertificateAuthority::fabric_id].
    pub fn issue_noc(&self, node_id: u64, fabric_id: u64, cats: &[u32], node_public_key: &[u8]) -> Result<Vec<u8>> {
        let signer = self.icac.as_ref().unwrap_or(&self.root);
        let issuer = match &self.icac {
            Some(i) => vec![DnAttribute::IcacId(i.id), DnAttribute::FabricId(self.fabric_id)],
            None => vec![DnAttribute::RcacId(self.root.id)],
        };
        let mut subject = vec![DnAttribute::NodeId(node_id), DnAttribute::FabricId(fabric_id)];
        subject.extend(cats.iter().map(|c| DnAttribute::CaseAuthTag(*c)));
        let tmpl = CertTemplate {
            profile: CertProfile::Node,
            subject,
            issuer,
            not_before: self.not_before,
            not_after: self.not_before + self.validity_secs,
        };
        let x509 = cert_x509::encode_x509(&tmpl, node_public_key, &signer.key)?;
        cert_matter::convert_x509_bytes_to_matter(&x509)
    }

    /// Generate operational key and NOC for a node of this fabric.
    pub fn issue_node(&self, node_id: u64) -> Result<NodeCredentials> {
        let keypair = OperationalKeypair::generate();
        let noc = self.issue_noc(node_id, self.fabric_id, &[], keypair.public_key())?;
        Ok(NodeCredentials {
            keypair,
            noc,
            icac: self.icac_cert().map(|c| c.to_vec()),
        })
    }

    /// Store CA keys and certificates as PEM files into new directory `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir(dir).with_context(|| format!("can't create {}", dir.display()))?;
        let meta = CaMetadata {
            fabric_id: self.fabric_id,
            root_id: self.root.id,
            icac_id: self.icac.as_ref().map(|i| i.id),
            not_before: self.not_before,
            validity_secs: self.validity_secs,
        };
        std::fs::write(dir.join("metadata.json"), serde_json::to_string_pretty(&meta)?)?;
        for (name, issuer) in std::iter::once(("ca", &self.root)).chain(self.icac.as_ref().map(|i| ("icac", i))) {
            cryptoutil::write_pem(
                "EC PRIVATE KEY",
                &cryptoutil::secret_key_to_rfc5915(&issuer.key)?,
                &dir.join(format!("{}-private.pem", name)),
            )?;
            cryptoutil::write_pem("CERTIFICATE", &issuer.x509, &dir.join(format!("{}-cert.pem", name)))?;
        }
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let fname = dir.join("metadata.json");
        let data = std::fs::read_to_string(&fname).with_context(|| format!("can't read from {}", fname.display()))?;
        let meta: CaMetadata = serde_json::from_str(&data).context("parsing metadata.json")?;
        let load_issuer = |name: &str, id: u64| -> Result<Issuer> {
            let cert_fname = dir.join(format!("{}-cert.pem", name));
            Ok(Issuer {
                id,
                key: cryptoutil::read_signing_key_from_pem(&dir.join(format!("{}-private.pem", name)))?,
                x509: cryptoutil::read_data_from_pem(&cert_fname)?,
                cert: cert_matter::convert_x509_to_matter(&cert_fname)?,
            })
        };
        let root = load_issuer("ca", meta.root_id)?;
        let icac = match meta.icac_id {
            Some(id) => Some(load_issuer("icac", id)?),
            None => None,
        };
        Ok(Self {
            fabric_id: meta.fabric_id,
            not_before: meta.not_before,
            validity_secs: meta.validity_secs,
            root,
            icac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_matter::MatterCert;
    use crate::credentials::ValidationContext;

    #[test]
    fn save_and_load() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("fabric-ca-{}", rand::random::<u64>()));
        let mut ca = CertificateAuthority::new(0xFAB, 1)?;
        ca.add_intermediate(2)?;
        ca.save(&dir)?;
        let loaded = CertificateAuthority::load(&dir)?;
        assert_eq!(loaded.fabric_id(), 0xFAB);
        assert_eq!(loaded.root_cert(), ca.root_cert());
        assert_eq!(loaded.icac_cert(), ca.icac_cert());

        // loaded CA keeps issuing under the same chain
        let node = loaded.issue_node(7)?;
        let noc = MatterCert::decode(&node.noc)?;
        let icac = MatterCert::decode(ca.icac_cert().unwrap_or_default())?;
        let root = MatterCert::decode(ca.root_cert())?;
        credentials::validate_chain(&noc, Some(&icac), &root, &ValidationContext::operational())?;
        assert_eq!(icac.fabric_id(), Some(0xFAB));
        assert_eq!(noc.node_id(), Some(7));

        assert!(ca.save(&dir).is_err());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
