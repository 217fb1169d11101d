//! Helpers shared by the module tests.

use std::sync::Arc;

use anyhow::Result;

use crate::ca::CertificateAuthority;
use crate::config::FabricTableConfig;
use crate::fabric::FabricInfo;
use crate::fabric_table::FabricTable;
use crate::storage::MemoryStorage;

pub const EPOCH_KEY: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb, 0xc, 0xd, 0xe, 0xf];

/// Fixed start of validity so tests can reason about expiry.
pub const NOT_BEFORE: u64 = 1700000000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn ca(fabric_id: u64, with_icac: bool) -> Result<CertificateAuthority> {
    let mut ca = CertificateAuthority::with_validity(fabric_id, 1, NOT_BEFORE, crate::ca::DEFAULT_VALIDITY_SECS)?;
    if with_icac {
        ca.add_intermediate(2)?;
    }
    Ok(ca)
}

/// Fabric candidate as the commissioning flow would hand it to the table.
pub fn candidate(ca: &CertificateAuthority, node_id: u64) -> Result<FabricInfo> {
    let node = ca.issue_node(node_id)?;
    let mut fabric = FabricInfo::new();
    fabric.set_operational_key(node.keypair.clone());
    fabric.set_root_cert(ca.root_cert())?;
    fabric.set_operational_certs_from_cert_array(&node.op_cert_array()?)?;
    fabric.set_vendor_id(0xFFF1);
    Ok(fabric)
}

pub fn table(max_fabrics: u8) -> Result<(Arc<MemoryStorage>, FabricTable)> {
    init_logging();
    let storage = Arc::new(MemoryStorage::new());
    let config = FabricTableConfig {
        max_fabrics,
        ..Default::default()
    };
    let table = FabricTable::init(storage.clone(), &config)?;
    Ok((storage, table))
}
