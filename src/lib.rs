//! Matter fabric and secure session core
//!
//! This library keeps the operational identity of a Matter node on one or more
//! fabrics and establishes certificate authenticated sessions with other nodes.
//! Following are main parts of api:
//! - [FabricInfo](fabric::FabricInfo) - root certificate, NOC/ICAC and operational key of one fabric.
//!                             Verifies peer certificate chains, computes compressed fabric id and
//!                             destination ids and persists itself as fixed size record.
//! - [FabricTable](fabric_table::FabricTable) - fixed number of fabric slots backed by
//!                             [PersistentStorage](storage::PersistentStorage). Adds, updates, deletes and
//!                             lazily loads fabrics and resolves destination ids of incoming requests.
//! - [CaseEngine](case::CaseEngine) - session establishment state machine for initiator and responder.
//! - [SessionKeyStore](session::SessionKeyStore) - established sessions, message counters,
//!                             idle expiry and eviction.
//! - [CoreContext](context::CoreContext) - all of the above plus [CoreConfig](config::CoreConfig) in one value.
//! - [CertificateAuthority](ca::CertificateAuthority) - issues root, intermediate and node certificates,
//!                             as a commissioner would.
//!
//! Example creating a fabric for node 0x10, storing it to a directory:
//! ```no_run
//! # use anyhow::Result;
//! # use std::sync::Arc;
//! # use matter_fabric::{ca, config, context, fabric, storage};
//! # fn main() -> Result<()> {
//! let ca = ca::CertificateAuthority::new(0x1000, 1)?;
//! let node = ca.issue_node(0x10)?;
//!
//! let mut candidate = fabric::FabricInfo::new();
//! candidate.set_operational_key(node.keypair.clone());
//! candidate.set_root_cert(ca.root_cert())?;
//! candidate.set_operational_certs_from_cert_array(&node.op_cert_array()?)?;
//! candidate.set_label("home")?;
//!
//! let storage = Arc::new(storage::FileStorage::new(std::path::Path::new("./kvs"))?);
//! let mut ctx = context::CoreContext::new(config::CoreConfig::default(), storage)?;
//! let index = ctx.fabrics.add_new_fabric(&mut candidate)?;
//! if let Some(fabric) = ctx.fabrics.fabric(index) {
//!     println!("compressed fabric id {:016x}", fabric.compressed_fabric_id()?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod case;
pub mod cert_matter;
pub mod cert_x509;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod fabric;
pub mod fabric_table;
pub mod keypair;
pub mod session;
pub mod storage;
pub mod tlv;
mod util;

#[cfg(test)]
mod testutil;
