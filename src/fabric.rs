//! One fabric's operational identity.
//!
//! A [FabricInfo] holds the root of trust, this node's NOC (+ICAC) and the
//! operational keypair for a single fabric. It verifies peer certificate
//! chains against its root, computes destination ids used to find the fabric
//! during session establishment and (de)serializes itself into a fixed size
//! storage record.

use std::io::{Cursor, Read};

use anyhow::{Context, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::cert_matter::MatterCert;
use crate::credentials::{self, ValidationContext};
use crate::error::ErrorCode;
use crate::keypair::{OperationalKeypair, SERIALIZED_KEYPAIR_LEN};
use crate::storage::PersistentStorage;
use crate::util::cryptoutil;

pub use crate::credentials::{MAX_CHIP_CERT_LENGTH, MAX_CHIP_OP_CERT_ARRAY_LENGTH};

pub type FabricIndex = u8;

/// Index 0 is never used for a fabric.
pub const UNDEFINED_FABRIC_INDEX: FabricIndex = 0;
pub const MIN_VALID_FABRIC_INDEX: FabricIndex = 1;
pub const MAX_VALID_FABRIC_INDEX: FabricIndex = 254;
pub const FABRIC_LABEL_MAX_LEN: usize = 32;

pub const DESTINATION_ID_LEN: usize = 32;
pub const IPK_LEN: usize = 16;
const COMPRESSED_FABRIC_ID_INFO: &[u8] = b"CompressedFabric";
const GROUP_KEY_INFO: &[u8] = b"GroupKey v1.0";

/// node_id, index, vendor, fabric_id, label+NUL, key, root len+buf, op certs len+buf
pub const FABRIC_RECORD_LEN: usize = 8
    + 2
    + 2
    + 8
    + (FABRIC_LABEL_MAX_LEN + 1)
    + SERIALIZED_KEYPAIR_LEN
    + 2
    + MAX_CHIP_CERT_LENGTH
    + 2
    + MAX_CHIP_OP_CERT_ARRAY_LENGTH;

/// Operational identity of a node: compressed fabric id plus node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PeerId {
    pub compressed_fabric_id: u64,
    pub node_id: u64,
}

/// Result of a successful [FabricInfo::verify_credentials].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub peer_id: PeerId,
    /// Fabric id found in the NOC. Callers must compare it with their own.
    pub fabric_id: u64,
    pub noc_public_key: Vec<u8>,
    /// CASE authenticated tags carried in the NOC subject.
    pub case_auth_tags: Vec<u32>,
}

/// Summary used to list fabrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricDescriptor {
    pub fabric_index: FabricIndex,
    pub root_public_key: Vec<u8>,
    pub vendor_id: u16,
    pub fabric_id: u64,
    pub node_id: u64,
    pub label: String,
}

#[derive(Debug, Clone, Default)]
pub struct FabricInfo {
    fabric_index: FabricIndex,
    fabric_id: u64,
    operational_id: PeerId,
    vendor_id: u16,
    label: String,
    root_cert: Vec<u8>,
    root_public_key: Vec<u8>,
    root_key_id: Vec<u8>,
    operational_certs: Vec<u8>,
    operational_key: Option<OperationalKeypair>,
}

/// HKDF-SHA256 over the root public key (without SEC1 prefix), salted with the fabric id.
pub fn compressed_fabric_id(root_public_key: &[u8], fabric_id: u64) -> Result<u64> {
    if root_public_key.len() != crate::keypair::P256_PUBLIC_KEY_LEN {
        return Err(ErrorCode::InvalidArgument).context("root public key length");
    }
    let mut buf_id = Vec::new();
    buf_id.write_u64::<BigEndian>(fabric_id)?;
    let out = cryptoutil::hkdf_sha256(&buf_id, &root_public_key[1..], COMPRESSED_FABRIC_ID_INFO, 8)?;
    Ok(Cursor::new(out).read_u64::<BigEndian>()?)
}

fn storage_key(prefix: &str, index: FabricIndex) -> String {
    format!("{}{:x}", prefix, index)
}

fn bad_record(msg: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorCode::InvalidRecord).context(msg.to_owned())
}

impl FabricInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_index(index: FabricIndex) -> Self {
        Self {
            fabric_index: index,
            ..Default::default()
        }
    }

    /// A slot is in use once it has a root certificate.
    pub fn is_initialized(&self) -> bool {
        !self.root_cert.is_empty()
    }

    pub fn fabric_index(&self) -> FabricIndex {
        self.fabric_index
    }
    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }
    pub fn node_id(&self) -> u64 {
        self.operational_id.node_id
    }
    pub fn peer_id(&self) -> PeerId {
        self.operational_id
    }
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }
    pub fn label(&self) -> &str {
        &self.label
    }
    pub fn root_cert(&self) -> &[u8] {
        &self.root_cert
    }
    pub fn root_public_key(&self) -> &[u8] {
        &self.root_public_key
    }
    pub fn root_key_id(&self) -> &[u8] {
        &self.root_key_id
    }
    pub fn operational_certs(&self) -> &[u8] {
        &self.operational_certs
    }

    pub fn set_vendor_id(&mut self, vendor_id: u16) {
        self.vendor_id = vendor_id;
    }

    pub fn set_label(&mut self, label: &str) -> Result<()> {
        if label.len() > FABRIC_LABEL_MAX_LEN || label.contains('\0') {
            return Err(ErrorCode::InvalidArgument).context(format!("fabric label {:?}", label));
        }
        self.label = label.to_owned();
        Ok(())
    }

    pub fn set_operational_key(&mut self, key: OperationalKeypair) {
        self.operational_key = Some(key);
    }

    pub fn has_operational_key(&self) -> bool {
        self.operational_key.is_some()
    }

    /// Operational keypair, generated on first use.
    pub fn operational_key(&mut self) -> &OperationalKeypair {
        self.operational_key.get_or_insert_with(|| {
            log::debug!("generating operational key for fabric index {}", self.fabric_index);
            OperationalKeypair::generate()
        })
    }

    /// Sign with the operational key. Fails if no key was set or generated.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        match &self.operational_key {
            Some(k) => Ok(k.sign(msg)),
            None => Err(ErrorCode::IncorrectState).context("fabric has no operational key"),
        }
    }

    pub fn operational_public_key(&self) -> Option<&[u8]> {
        self.operational_key.as_ref().map(|k| k.public_key())
    }

    /// Replace the root certificate (matter TLV). Empty input releases it.
    pub fn set_root_cert(&mut self, cert: &[u8]) -> Result<()> {
        if cert.is_empty() {
            self.root_cert.clear();
            self.root_public_key.clear();
            self.root_key_id.clear();
            self.operational_id.compressed_fabric_id = 0;
            return Ok(());
        }
        if cert.len() > MAX_CHIP_CERT_LENGTH {
            return Err(ErrorCode::InvalidArgument)
                .context(format!("root certificate of {} bytes", cert.len()));
        }
        let decoded = MatterCert::decode(cert).context("root certificate")?;
        let compressed = compressed_fabric_id(decoded.public_key(), self.fabric_id)
            .context("compressed fabric id of new root")?;
        self.root_public_key = decoded.public_key().to_vec();
        self.root_key_id = decoded.authority_key_id().to_vec();
        self.root_cert = cert.to_vec();
        self.operational_id.compressed_fabric_id = compressed;
        Ok(())
    }

    /// Replace the NOC (+ICAC) array. Empty input releases it.
    pub fn set_operational_certs_from_cert_array(&mut self, cert_array: &[u8]) -> Result<()> {
        if cert_array.is_empty() {
            self.operational_certs.clear();
            return Ok(());
        }
        if cert_array.len() > MAX_CHIP_OP_CERT_ARRAY_LENGTH {
            return Err(ErrorCode::InvalidArgument)
                .context(format!("certificate array of {} bytes", cert_array.len()));
        }
        let (noc, _) = credentials::decode_op_cert_array(cert_array)?;
        MatterCert::decode(&noc).context("noc")?;
        self.operational_certs = cert_array.to_vec();
        Ok(())
    }

    /// Validate a NOC (+ICAC) array against the root currently stored in this fabric.
    pub fn verify_credentials(&self, op_cert_array: &[u8], ctx: &ValidationContext) -> Result<Credentials> {
        if !self.is_initialized() {
            return Err(ErrorCode::IncorrectState).context("fabric has no root certificate");
        }
        let root = MatterCert::decode(&self.root_cert).context("stored root certificate")?;
        let (noc, icac) = credentials::decode_op_cert_array(op_cert_array)?;
        let noc = MatterCert::decode(&noc).context("noc")?;
        let icac = match icac {
            Some(i) => Some(MatterCert::decode(&i).context("icac")?),
            None => None,
        };
        let node_id = noc.node_id().ok_or_else(|| bad_cert("noc without node id"))?;
        let fabric_id = noc.fabric_id().ok_or_else(|| bad_cert("noc without fabric id"))?;
        if let Some(icac_fabric) = icac.as_ref().and_then(|i| i.fabric_id()) {
            if icac_fabric != fabric_id {
                return Err(ErrorCode::FabricMismatch).context(format!(
                    "icac fabric {:x} noc fabric {:x}",
                    icac_fabric, fabric_id
                ));
            }
        }
        credentials::validate_chain(&noc, icac.as_ref(), &root, ctx)?;
        Ok(Credentials {
            peer_id: PeerId {
                compressed_fabric_id: compressed_fabric_id(&self.root_public_key, fabric_id)?,
                node_id,
            },
            fabric_id,
            noc_public_key: noc.public_key().to_vec(),
            case_auth_tags: noc.case_auth_tags(),
        })
    }

    /// Adopt key, root, certificates, vendor id and label of `candidate`.
    ///
    /// The candidate's certificates are verified against the candidate's root
    /// on a staged copy, so on error `self` is left as it was.
    pub fn set_fabric_info(&mut self, candidate: &mut FabricInfo) -> Result<()> {
        let key = candidate.operational_key().clone();
        let mut staged = FabricInfo::with_index(self.fabric_index);
        staged.set_root_cert(&candidate.root_cert)?;
        let creds = staged.verify_credentials(&candidate.operational_certs, &ValidationContext::operational())?;
        if creds.noc_public_key != key.public_key() {
            return Err(ErrorCode::InvalidArgument).context("noc does not certify the operational key");
        }
        staged.set_operational_key(key);
        staged.fabric_id = creds.fabric_id;
        staged.operational_id = creds.peer_id;
        staged.set_operational_certs_from_cert_array(&candidate.operational_certs)?;
        staged.vendor_id = candidate.vendor_id;
        staged.label = candidate.label.clone();
        *self = staged;
        log::debug!(
            "fabric index {} set: fabric id {:x} node id {:x} compressed fabric id {:016x}",
            self.fabric_index,
            self.fabric_id,
            self.node_id(),
            self.operational_id.compressed_fabric_id
        );
        Ok(())
    }

    fn destination_message(&self, random: &[u8], dest_node_id: u64) -> Result<Vec<u8>> {
        if self.root_public_key.is_empty() {
            return Err(ErrorCode::IncorrectState).context("fabric has no root public key");
        }
        let mut dst = Vec::with_capacity(random.len() + self.root_public_key.len() + 16);
        dst.extend_from_slice(random);
        dst.extend_from_slice(&self.root_public_key);
        dst.write_u64::<LittleEndian>(self.fabric_id)?;
        dst.write_u64::<LittleEndian>(dest_node_id)?;
        Ok(dst)
    }

    /// HMAC-SHA256(ipk, random || root public key || fabric id || node id).
    pub fn generate_destination_id(&self, ipk: &[u8], random: &[u8], dest_node_id: u64) -> Result<[u8; DESTINATION_ID_LEN]> {
        let mac = cryptoutil::hmac_sha256(&self.destination_message(random, dest_node_id)?, ipk)?;
        let mut out = [0u8; DESTINATION_ID_LEN];
        out.copy_from_slice(&mac);
        Ok(out)
    }

    /// Does `target` address this node under any of `ipks`?
    pub fn match_destination_id<K: AsRef<[u8]>>(&self, target: &[u8], random: &[u8], ipks: &[K]) -> Result<()> {
        let msg = self.destination_message(random, self.node_id())?;
        for ipk in ipks {
            if cryptoutil::hmac_sha256_verify(&msg, ipk.as_ref(), target)? {
                return Ok(());
            }
        }
        Err(ErrorCode::CertNotTrusted).context("no ipk matches destination id")
    }

    pub fn compressed_fabric_id(&self) -> Result<u64> {
        if self.root_public_key.is_empty() {
            return Err(ErrorCode::IncorrectState).context("fabric has no root public key");
        }
        compressed_fabric_id(&self.root_public_key, self.fabric_id)
    }

    /// Operational group key derived from an epoch key (IPK when used with the IPK epoch key).
    pub fn derive_operational_ipk(&self, epoch_key: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.compressed_fabric_id()?.to_be_bytes();
        cryptoutil::hkdf_sha256(&compressed, epoch_key, GROUP_KEY_INFO, IPK_LEN)
    }

    pub fn descriptor(&self) -> FabricDescriptor {
        FabricDescriptor {
            fabric_index: self.fabric_index,
            root_public_key: self.root_public_key.clone(),
            vendor_id: self.vendor_id,
            fabric_id: self.fabric_id,
            node_id: self.node_id(),
            label: self.label.clone(),
        }
    }

    /// Drop all state. The slot keeps its index.
    pub fn reset(&mut self) {
        *self = FabricInfo::with_index(self.fabric_index);
    }

    fn encode_record(&self) -> Result<Vec<u8>> {
        let key = self
            .operational_key
            .as_ref()
            .ok_or(ErrorCode::IncorrectState)
            .context("fabric has no operational key")?;
        let mut out = Vec::with_capacity(FABRIC_RECORD_LEN);
        out.write_u64::<LittleEndian>(self.node_id())?;
        out.write_u16::<LittleEndian>(self.fabric_index as u16)?;
        out.write_u16::<LittleEndian>(self.vendor_id)?;
        out.write_u64::<LittleEndian>(self.fabric_id)?;
        let mut label = [0u8; FABRIC_LABEL_MAX_LEN + 1];
        label[..self.label.len()].copy_from_slice(self.label.as_bytes());
        out.extend_from_slice(&label);
        out.extend_from_slice(&key.serialize());
        for (data, cap) in [
            (&self.root_cert, MAX_CHIP_CERT_LENGTH),
            (&self.operational_certs, MAX_CHIP_OP_CERT_ARRAY_LENGTH),
        ] {
            out.write_u16::<LittleEndian>(data.len() as u16)?;
            out.extend_from_slice(data);
            out.resize(out.len() + cap - data.len(), 0);
        }
        Ok(out)
    }

    /// Persist as fixed size record under `"<prefix><index hex>"`.
    pub fn store_into_kvs(&self, storage: &dyn PersistentStorage, prefix: &str) -> Result<()> {
        let record = self.encode_record()?;
        let key = storage_key(prefix, self.fabric_index);
        storage.set(&key, &record).with_context(|| format!("storing fabric record {}", key))
    }

    /// Load the record for `index`. A missing key surfaces as [ErrorCode::KeyNotFound];
    /// on any error `self` is unchanged.
    pub fn fetch_from_kvs(&mut self, storage: &dyn PersistentStorage, prefix: &str, index: FabricIndex) -> Result<()> {
        let key = storage_key(prefix, index);
        let record = storage.get(&key).with_context(|| format!("loading fabric record {}", key))?;
        if record.len() != FABRIC_RECORD_LEN {
            return Err(bad_record(&format!("record {} has {} bytes", key, record.len())));
        }
        let mut cursor = Cursor::new(record.as_slice());
        let node_id = cursor.read_u64::<LittleEndian>()?;
        let stored_index = cursor.read_u16::<LittleEndian>()?;
        if stored_index != index as u16 {
            return Err(bad_record(&format!("record {} holds index {}", key, stored_index)));
        }
        let vendor_id = cursor.read_u16::<LittleEndian>()?;
        let fabric_id = cursor.read_u64::<LittleEndian>()?;
        let mut label = [0u8; FABRIC_LABEL_MAX_LEN + 1];
        cursor.read_exact(&mut label)?;
        let label_len = label.iter().position(|b| *b == 0).ok_or_else(|| bad_record("label not terminated"))?;
        let label = std::str::from_utf8(&label[..label_len]).map_err(|_| bad_record("label not utf8"))?;
        let mut key_bytes = [0u8; SERIALIZED_KEYPAIR_LEN];
        cursor.read_exact(&mut key_bytes)?;
        let keypair = OperationalKeypair::deserialize(&key_bytes).map_err(|e| e.context(ErrorCode::InvalidRecord))?;
        let mut read_blob = |cap: usize| -> Result<Vec<u8>> {
            let len = cursor.read_u16::<LittleEndian>()? as usize;
            if len > cap {
                return Err(bad_record("certificate length exceeds buffer"));
            }
            let mut buf = vec![0u8; cap];
            cursor.read_exact(&mut buf)?;
            buf.truncate(len);
            Ok(buf)
        };
        let root_cert = read_blob(MAX_CHIP_CERT_LENGTH)?;
        let op_certs = read_blob(MAX_CHIP_OP_CERT_ARRAY_LENGTH)?;

        let mut staged = FabricInfo::with_index(index);
        staged.vendor_id = vendor_id;
        staged.fabric_id = fabric_id;
        staged.label = label.to_owned();
        staged.operational_key = Some(keypair);
        staged.operational_id.node_id = node_id;
        staged.set_root_cert(&root_cert)?;
        staged.set_operational_certs_from_cert_array(&op_certs)?;
        *self = staged;
        Ok(())
    }

    pub fn delete_from_kvs(storage: &dyn PersistentStorage, prefix: &str, index: FabricIndex) -> Result<()> {
        storage.delete(&storage_key(prefix, index))
    }
}

fn bad_cert(msg: &str) -> anyhow::Error {
    anyhow::Error::new(ErrorCode::InvalidCert).context(msg.to_owned())
}
