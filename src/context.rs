//! The fabric table, session cache and configuration bundled as one value.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::case::CaseEngine;
use crate::config::CoreConfig;
use crate::error::ErrorCode;
use crate::fabric::FabricIndex;
use crate::fabric_table::FabricTable;
use crate::session::{self, Epoch, SessionKeyStore};
use crate::storage::PersistentStorage;

pub struct CoreContext {
    pub config: CoreConfig,
    pub fabrics: FabricTable,
    pub sessions: SessionKeyStore,
}

impl CoreContext {
    pub fn new(config: CoreConfig, storage: Arc<dyn PersistentStorage>) -> Result<Self> {
        Self::with_epoch(config, storage, session::sys_epoch)
    }

    pub fn with_epoch(config: CoreConfig, storage: Arc<dyn PersistentStorage>, epoch: Epoch) -> Result<Self> {
        config.validate()?;
        let fabrics = FabricTable::init(storage, &config.fabric_table)?;
        let sessions = SessionKeyStore::new(&config.session, epoch);
        Ok(Self {
            config,
            fabrics,
            sessions,
        })
    }

    /// Delete a fabric and every session established on it.
    pub fn remove_fabric(&mut self, index: FabricIndex) -> Result<()> {
        self.fabrics.delete(index)?;
        let n = self.sessions.remove_for_fabric(index);
        log::info!("fabric {} removed with {} session(s)", index, n);
        Ok(())
    }

    pub fn case_initiator(&self) -> CaseEngine {
        CaseEngine::initiator(&self.config.case)
    }

    pub fn case_responder(&self) -> CaseEngine {
        CaseEngine::responder(&self.config.case)
    }

    /// Install the session of a completed exchange. The fabric it ran on must still exist.
    pub fn commit_case(&mut self, engine: &mut CaseEngine) -> Result<u16> {
        if self.fabrics.fabric(engine.fabric_index()).is_none() {
            engine.abort();
            return Err(ErrorCode::IncorrectState)
                .context(format!("fabric {} removed during session establishment", engine.fabric_index()));
        }
        engine.commit(&mut self.sessions)
    }

    pub fn sweep_idle_sessions(&mut self) -> usize {
        self.sessions.expire_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::CaseState;
    use crate::error;
    use crate::storage::MemoryStorage;
    use crate::testutil;

    fn context(node_id: u64, ca: &crate::ca::CertificateAuthority) -> Result<(CoreContext, FabricIndex)> {
        testutil::init_logging();
        let storage = Arc::new(MemoryStorage::new());
        let mut ctx = CoreContext::new(CoreConfig::default(), storage)?;
        let index = ctx.fabrics.add_new_fabric(&mut testutil::candidate(ca, node_id)?)?;
        Ok((ctx, index))
    }

    fn ipk(ctx: &CoreContext, index: FabricIndex) -> Result<Vec<u8>> {
        ctx.fabrics
            .fabric(index)
            .context("fabric")?
            .derive_operational_ipk(&testutil::EPOCH_KEY)
    }

    #[test]
    fn establish_then_remove_fabric() -> Result<()> {
        let ca = testutil::ca(0x7777, false)?;
        let (mut a, ia) = context(1, &ca)?;
        let (mut b, ib) = context(2, &ca)?;

        let mut init = a.case_initiator();
        let mut resp = b.case_responder();
        let sid_a = a.sessions.allocate_key_id()?;
        let req = init.begin_request(a.fabrics.fabric(ia).context("a")?, &ipk(&a, ia)?, 2, sid_a)?;
        let sid_b = b.sessions.allocate_key_id()?;
        let b_ipk = ipk(&b, ib)?;
        resp.process_begin_request(&req, &mut b.fabrics, &[&b_ipk], sid_b)?;
        let rsp = resp.begin_response(b.fabrics.fabric(ib).context("b")?)?;
        init.process_begin_response(&rsp, a.fabrics.fabric(ia).context("a")?)?;

        a.commit_case(&mut init)?;
        b.commit_case(&mut resp)?;
        assert_eq!(a.sessions.len(), 1);
        assert_eq!(b.sessions.find(1, sid_b).map(|s| s.fabric_index), Some(ib));
        assert_eq!(a.sweep_idle_sessions(), 0);

        b.remove_fabric(ib)?;
        assert!(b.sessions.is_empty());
        assert_eq!(b.fabrics.fabric_count(), 0);
        Ok(())
    }

    #[test]
    fn commit_after_fabric_removed() -> Result<()> {
        let ca = testutil::ca(0x7777, false)?;
        let (mut a, ia) = context(1, &ca)?;
        let (mut b, ib) = context(2, &ca)?;
        let mut init = a.case_initiator();
        let req = init.begin_request(a.fabrics.fabric(ia).context("a")?, &ipk(&a, ia)?, 2, 5)?;
        let mut resp = b.case_responder();
        let b_ipk = ipk(&b, ib)?;
        resp.process_begin_request(&req, &mut b.fabrics, &[&b_ipk], 6)?;
        resp.begin_response(b.fabrics.fabric(ib).context("b")?)?;
        assert_eq!(resp.state(), CaseState::Complete);

        b.remove_fabric(ib)?;
        assert!(error::has_code(&b.commit_case(&mut resp), ErrorCode::IncorrectState));
        assert_eq!(resp.state(), CaseState::Idle);
        assert!(b.sessions.is_empty());
        Ok(())
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = CoreConfig::default();
        config.session.max_sessions = 0;
        let res = CoreContext::new(config, Arc::new(MemoryStorage::new()));
        assert!(error::has_code(&res, ErrorCode::InvalidArgument));
    }
}
