//! Fixed capacity table of fabrics, backed by persistent storage.

use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::FabricTableConfig;
use crate::error::{code_of, ErrorCode};
use crate::fabric::{FabricIndex, FabricInfo, MAX_VALID_FABRIC_INDEX, MIN_VALID_FABRIC_INDEX};
use crate::storage::PersistentStorage;

/// Observer for fabric lifecycle events. All methods default to doing nothing.
pub trait FabricTableDelegate: Send + Sync {
    fn on_fabric_persisted(&self, _fabric: &FabricInfo) {}
    fn on_fabric_retrieved(&self, _fabric: &FabricInfo) {}
    fn on_fabric_deleted(&self, _index: FabricIndex, _compressed_fabric_id: u64) {}
}

pub struct FabricTable {
    states: Vec<FabricInfo>,
    next_available_index: FabricIndex,
    storage: Arc<dyn PersistentStorage>,
    delegate: Option<Arc<dyn FabricTableDelegate>>,
    key_prefix: String,
}

impl FabricTable {
    /// Create `config.max_fabrics` empty slots and load whatever storage holds for them.
    pub fn init(storage: Arc<dyn PersistentStorage>, config: &FabricTableConfig) -> Result<Self> {
        if config.max_fabrics < MIN_VALID_FABRIC_INDEX || config.max_fabrics > MAX_VALID_FABRIC_INDEX {
            return Err(ErrorCode::InvalidArgument).context(format!("max_fabrics {}", config.max_fabrics));
        }
        let states = (MIN_VALID_FABRIC_INDEX..=config.max_fabrics)
            .map(FabricInfo::with_index)
            .collect();
        let mut table = Self {
            states,
            next_available_index: MIN_VALID_FABRIC_INDEX,
            storage,
            delegate: None,
            key_prefix: config.key_prefix.clone(),
        };
        for index in table.valid_indices() {
            if let Err(e) = table.load_from_storage(index) {
                if code_of(&e) != Some(ErrorCode::KeyNotFound) {
                    log::warn!("can't load fabric {}: {:?}", index, e);
                }
            }
        }
        log::debug!("fabric table ready with {} fabrics", table.fabric_count());
        Ok(table)
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn FabricTableDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn max_fabrics(&self) -> FabricIndex {
        self.states.len() as FabricIndex
    }

    pub fn valid_indices(&self) -> RangeInclusive<FabricIndex> {
        MIN_VALID_FABRIC_INDEX..=self.max_fabrics()
    }

    fn slot(&self, index: FabricIndex) -> Option<usize> {
        if self.valid_indices().contains(&index) {
            Some((index - MIN_VALID_FABRIC_INDEX) as usize)
        } else {
            None
        }
    }

    fn slot_or_err(&self, index: FabricIndex) -> Result<usize> {
        self.slot(index)
            .ok_or(ErrorCode::InvalidArgument)
            .with_context(|| format!("fabric index {} out of range", index))
    }

    /// Read the slot for `index` from storage, replacing what is in memory.
    pub fn load_from_storage(&mut self, index: FabricIndex) -> Result<()> {
        let slot = self.slot_or_err(index)?;
        self.states[slot].fetch_from_kvs(self.storage.as_ref(), &self.key_prefix, index)?;
        log::debug!("fabric {} retrieved from storage", index);
        if let Some(d) = &self.delegate {
            d.on_fabric_retrieved(&self.states[slot]);
        }
        Ok(())
    }

    /// Load the slot if it is not in memory. Returns whether the slot is taken:
    /// either it holds a fabric or storage has a record that could not be read.
    fn ensure_loaded(&mut self, slot: usize) -> bool {
        if self.states[slot].is_initialized() {
            return true;
        }
        let index = self.states[slot].fabric_index();
        match self.load_from_storage(index) {
            Ok(()) => true,
            Err(e) if code_of(&e) == Some(ErrorCode::KeyNotFound) => false,
            Err(e) => {
                log::warn!("lazy load of fabric {} failed: {:?}", index, e);
                true
            }
        }
    }

    fn occupancy(&mut self) -> Vec<bool> {
        (0..self.states.len()).map(|s| self.ensure_loaded(s)).collect()
    }

    /// Bring every slot not yet in memory in from storage. Returns the number of fabrics.
    pub fn load_all(&mut self) -> usize {
        self.occupancy();
        self.fabric_count()
    }

    /// Slot for `index`, loading it from storage if it is not in memory.
    /// The returned slot may be uninitialized; out of range gives `None`.
    pub fn find_fabric_with_index(&mut self, index: FabricIndex) -> Option<&FabricInfo> {
        let slot = self.slot(index)?;
        self.ensure_loaded(slot);
        Some(&self.states[slot])
    }

    pub fn find_fabric_with_index_mut(&mut self, index: FabricIndex) -> Option<&mut FabricInfo> {
        let slot = self.slot(index)?;
        self.ensure_loaded(slot);
        Some(&mut self.states[slot])
    }

    /// Initialized fabric at `index`, without touching storage.
    pub fn fabric(&self, index: FabricIndex) -> Option<&FabricInfo> {
        self.slot(index)
            .map(|s| &self.states[s])
            .filter(|f| f.is_initialized())
    }

    pub fn find_fabric(&mut self, root_public_key: &[u8], fabric_id: u64) -> Option<&FabricInfo> {
        self.load_all();
        self.iter()
            .find(|f| f.root_public_key() == root_public_key && f.fabric_id() == fabric_id)
    }

    /// Fabrics in memory, in index order. See [FabricTable::load_all].
    pub fn iter(&self) -> impl Iterator<Item = &FabricInfo> {
        self.states.iter().filter(|f| f.is_initialized())
    }

    pub fn fabric_count(&self) -> usize {
        self.iter().count()
    }

    /// Verify `candidate` and place it into the next free slot, then persist it.
    ///
    /// The scan starts at the rotating cursor and wraps once around the whole
    /// index range. If persisting fails the slot already holds the new fabric.
    pub fn add_new_fabric(&mut self, candidate: &mut FabricInfo) -> Result<FabricIndex> {
        let occupied = self.occupancy();
        let start = self.next_available_index;
        let index = (start..=self.max_fabrics())
            .chain(MIN_VALID_FABRIC_INDEX..start)
            .find(|i| self.slot(*i).is_some_and(|s| !occupied[s]))
            .ok_or(ErrorCode::NoMemory)
            .context("fabric table full")?;

        let mut staged = FabricInfo::with_index(index);
        staged.set_fabric_info(candidate)?;
        if let Some(existing) = self.find_fabric(staged.root_public_key(), staged.fabric_id()) {
            return Err(ErrorCode::FabricConflict).context(format!(
                "fabric {:x} already present at index {}",
                staged.fabric_id(),
                existing.fabric_index()
            ));
        }
        let slot = self.slot_or_err(index)?;
        self.states[slot] = staged;
        self.store(index)?;

        self.next_available_index = if index >= self.max_fabrics() {
            MIN_VALID_FABRIC_INDEX
        } else {
            index + 1
        };
        log::info!(
            "added fabric {:x} at index {} compressed id {:016x}",
            self.states[slot].fabric_id(),
            index,
            self.states[slot].peer_id().compressed_fabric_id
        );
        Ok(index)
    }

    /// Replace the operational credentials of an existing fabric. Root and
    /// fabric id must stay the same; label is kept.
    pub fn update_fabric(&mut self, index: FabricIndex, candidate: &mut FabricInfo) -> Result<()> {
        let slot = self.slot_or_err(index)?;
        self.ensure_loaded(slot);
        let current = &self.states[slot];
        if !current.is_initialized() {
            return Err(ErrorCode::InvalidArgument).context(format!("fabric {} not in use", index));
        }
        let mut staged = FabricInfo::with_index(index);
        staged.set_fabric_info(candidate)?;
        if staged.root_public_key() != current.root_public_key() || staged.fabric_id() != current.fabric_id() {
            return Err(ErrorCode::FabricMismatch).context("update must keep root and fabric id");
        }
        staged.set_label(current.label())?;
        self.states[slot] = staged;
        self.store(index)
    }

    /// Set label, which must be unique among fabrics when non-empty.
    pub fn set_fabric_label(&mut self, index: FabricIndex, label: &str) -> Result<()> {
        let slot = self.slot_or_err(index)?;
        self.load_all();
        if !self.states[slot].is_initialized() {
            return Err(ErrorCode::InvalidArgument).context(format!("fabric {} not in use", index));
        }
        if !label.is_empty() && self.iter().any(|f| f.fabric_index() != index && f.label() == label) {
            return Err(ErrorCode::LabelConflict).context(format!("label {:?}", label));
        }
        self.states[slot].set_label(label)?;
        self.store(index)
    }

    /// Persist one slot. Failures are logged and returned; memory is not rolled back.
    pub fn store(&self, index: FabricIndex) -> Result<()> {
        let fabric = &self.states[self.slot_or_err(index)?];
        if !fabric.is_initialized() {
            return Err(ErrorCode::InvalidArgument).context(format!("fabric {} not in use", index));
        }
        if let Err(e) = fabric.store_into_kvs(self.storage.as_ref(), &self.key_prefix) {
            log::warn!("storing fabric {} failed: {:?}", index, e);
            return Err(e);
        }
        if let Some(d) = &self.delegate {
            d.on_fabric_persisted(fabric);
        }
        Ok(())
    }

    /// Remove fabric from storage and memory. Deleting an empty slot succeeds.
    pub fn delete(&mut self, index: FabricIndex) -> Result<()> {
        let slot = self.slot_or_err(index)?;
        match FabricInfo::delete_from_kvs(self.storage.as_ref(), &self.key_prefix, index) {
            Ok(()) => {}
            Err(e) if code_of(&e) == Some(ErrorCode::KeyNotFound) => {}
            Err(e) => return Err(e),
        }
        let fabric = &mut self.states[slot];
        let was_initialized = fabric.is_initialized();
        let compressed = fabric.peer_id().compressed_fabric_id;
        fabric.reset();
        if was_initialized {
            log::info!("fabric {} deleted", index);
            if let Some(d) = &self.delegate {
                d.on_fabric_deleted(index, compressed);
            }
        }
        Ok(())
    }

    /// Which fabric, if any, an incoming destination id addresses.
    pub fn find_destination_id_candidate<K: AsRef<[u8]>>(
        &mut self,
        destination_id: &[u8],
        random: &[u8],
        ipks: &[K],
    ) -> Option<FabricIndex> {
        self.load_all();
        self.iter()
            .find(|f| f.match_destination_id(destination_id, random, ipks).is_ok())
            .map(|f| f.fabric_index())
    }

    /// Clear every slot in memory. Storage is left alone.
    pub fn reset(&mut self) {
        for f in &mut self.states {
            f.reset();
        }
        self.next_available_index = MIN_VALID_FABRIC_INDEX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{self, ValidationContext};
    use crate::error;
    use crate::keypair::OperationalKeypair;
    use crate::testutil;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        persisted: AtomicUsize,
        retrieved: AtomicUsize,
        deleted: AtomicUsize,
    }

    impl FabricTableDelegate for Counter {
        fn on_fabric_persisted(&self, _fabric: &FabricInfo) {
            self.persisted.fetch_add(1, Ordering::SeqCst);
        }
        fn on_fabric_retrieved(&self, _fabric: &FabricInfo) {
            self.retrieved.fetch_add(1, Ordering::SeqCst);
        }
        fn on_fabric_deleted(&self, _index: FabricIndex, _compressed: u64) {
            self.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn end_to_end() -> Result<()> {
        const FABRIC_ID: u64 = 0x1111_1111_1111_1111;
        let (_storage, mut table) = testutil::table(4)?;
        let ca = testutil::ca(FABRIC_ID, false)?;
        let index = table.add_new_fabric(&mut testutil::candidate(&ca, 0x55)?)?;
        assert_eq!(index, 1);

        let fabric = table.find_fabric_with_index(index).context("slot")?;
        assert!(fabric.is_initialized());

        // independent derivation of the compressed fabric id
        let root = ca.root_public_key();
        let hk = hkdf::Hkdf::<sha2::Sha256>::new(Some(&FABRIC_ID.to_be_bytes()), &root[1..]);
        let mut expected = [0u8; 8];
        hk.expand(b"CompressedFabric", &mut expected)
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        assert_eq!(fabric.peer_id().compressed_fabric_id, u64::from_be_bytes(expected));
        assert_eq!(fabric.peer_id().node_id, 0x55);

        // same root, NOC for another fabric id: chain is fine, the fabric id is the NOC's
        let kp = OperationalKeypair::generate();
        let noc = ca.issue_noc(0x66, 0x2222, &[], kp.public_key())?;
        let array = credentials::encode_op_cert_array(&noc, None)?;
        let creds = fabric.verify_credentials(&array, &ValidationContext::operational())?;
        assert_eq!(creds.fabric_id, 0x2222);
        assert_ne!(creds.fabric_id, fabric.fabric_id());
        Ok(())
    }

    #[test]
    fn slots_do_not_alias() -> Result<()> {
        let (_storage, mut table) = testutil::table(3)?;
        let mut ptrs = Vec::new();
        for i in table.valid_indices() {
            ptrs.push(table.find_fabric_with_index(i).context("slot")? as *const FabricInfo);
        }
        for (i, a) in ptrs.iter().enumerate() {
            for b in &ptrs[i + 1..] {
                assert!(!std::ptr::eq(*a, *b));
            }
        }
        assert!(table.find_fabric_with_index(0).is_none());
        assert!(table.find_fabric_with_index(4).is_none());
        Ok(())
    }

    #[test]
    fn exhaustion_leaves_table_untouched() -> Result<()> {
        let (storage, mut table) = testutil::table(3)?;
        for f in 0..3u64 {
            let ca = testutil::ca(0x100 + f, false)?;
            table.add_new_fabric(&mut testutil::candidate(&ca, 1)?)?;
        }
        let before: Vec<_> = table.iter().map(|f| f.descriptor()).collect();
        let keys = storage.keys()?;

        let ca = testutil::ca(0x200, false)?;
        let res = table.add_new_fabric(&mut testutil::candidate(&ca, 1)?);
        assert!(error::has_code(&res, ErrorCode::NoMemory));
        let after: Vec<_> = table.iter().map(|f| f.descriptor()).collect();
        assert_eq!(before, after);
        assert_eq!(storage.keys()?, keys);
        Ok(())
    }

    #[test]
    fn delete_is_idempotent_and_notifies_once() -> Result<()> {
        let (storage, mut table) = testutil::table(2)?;
        let counter = Arc::new(Counter::default());
        table.set_delegate(counter.clone());
        let ca = testutil::ca(0x1, false)?;
        let index = table.add_new_fabric(&mut testutil::candidate(&ca, 1)?)?;
        assert_eq!(counter.persisted.load(Ordering::SeqCst), 1);

        table.delete(index)?;
        table.delete(index)?;
        assert_eq!(counter.deleted.load(Ordering::SeqCst), 1);
        assert!(storage.keys()?.is_empty());
        assert!(!table.find_fabric_with_index(index).context("slot")?.is_initialized());
        assert!(error::has_code(&table.delete(9), ErrorCode::InvalidArgument));
        Ok(())
    }

    #[test]
    fn reload_from_storage() -> Result<()> {
        let (storage, mut table) = testutil::table(4)?;
        let ca = testutil::ca(0xAA, true)?;
        let index = table.add_new_fabric(&mut testutil::candidate(&ca, 7)?)?;
        table.set_fabric_label(index, "kitchen")?;
        let original = table.fabric(index).context("fabric")?.descriptor();

        let config = FabricTableConfig {
            max_fabrics: 4,
            ..Default::default()
        };
        let mut second = FabricTable::init(storage.clone(), &config)?;
        assert_eq!(second.fabric(index).context("loaded")?.descriptor(), original);

        // in-memory reset, then lazy load on lookup
        let counter = Arc::new(Counter::default());
        second.set_delegate(counter.clone());
        second.reset();
        assert_eq!(second.fabric_count(), 0);
        let f = second.find_fabric_with_index(index).context("slot")?;
        assert_eq!(f.descriptor(), original);
        assert_eq!(counter.retrieved.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn cursor_rotates() -> Result<()> {
        let (_storage, mut table) = testutil::table(3)?;
        let cas: Vec<_> = (0..4u64).map(|i| testutil::ca(0x10 + i, false)).collect::<Result<_>>()?;
        assert_eq!(table.add_new_fabric(&mut testutil::candidate(&cas[0], 1)?)?, 1);
        assert_eq!(table.add_new_fabric(&mut testutil::candidate(&cas[1], 1)?)?, 2);
        table.delete(1)?;
        assert_eq!(table.add_new_fabric(&mut testutil::candidate(&cas[2], 1)?)?, 3);
        assert_eq!(table.add_new_fabric(&mut testutil::candidate(&cas[3], 1)?)?, 1);
        Ok(())
    }

    #[test]
    fn conflicts() -> Result<()> {
        let (_storage, mut table) = testutil::table(4)?;
        let ca = testutil::ca(0x77, false)?;
        let first = table.add_new_fabric(&mut testutil::candidate(&ca, 1)?)?;
        let res = table.add_new_fabric(&mut testutil::candidate(&ca, 2)?);
        assert!(error::has_code(&res, ErrorCode::FabricConflict));
        assert_eq!(table.fabric_count(), 1);

        let other = testutil::ca(0x78, false)?;
        let second = table.add_new_fabric(&mut testutil::candidate(&other, 1)?)?;
        table.set_fabric_label(first, "home")?;
        let res = table.set_fabric_label(second, "home");
        assert!(error::has_code(&res, ErrorCode::LabelConflict));
        table.set_fabric_label(first, "home")?;
        assert!(table.find_fabric(&ca.root_public_key(), 0x77).is_some());
        assert!(table.find_fabric(&ca.root_public_key(), 0x78).is_none());
        Ok(())
    }

    #[test]
    fn destination_lookup() -> Result<()> {
        let (_storage, mut table) = testutil::table(4)?;
        let a = testutil::ca(0xA, false)?;
        let b = testutil::ca(0xB, false)?;
        table.add_new_fabric(&mut testutil::candidate(&a, 1)?)?;
        let ib = table.add_new_fabric(&mut testutil::candidate(&b, 2)?)?;
        let ipks: Vec<Vec<u8>> = table
            .iter()
            .map(|f| f.derive_operational_ipk(&testutil::EPOCH_KEY))
            .collect::<Result<_>>()?;
        let random: [u8; 32] = rand::random();
        let fb = table.fabric(ib).context("fabric")?;
        let to_node = fb.generate_destination_id(&ipks[1], &random, 2)?;
        let to_stranger = fb.generate_destination_id(&ipks[1], &random, 3)?;
        assert_eq!(table.find_destination_id_candidate(&to_node, &random, &ipks), Some(ib));
        assert_eq!(table.find_destination_id_candidate(&to_stranger, &random, &ipks), None);

        // fabrics only in storage are still found
        table.reset();
        assert_eq!(table.fabric_count(), 0);
        assert_eq!(table.find_destination_id_candidate(&to_node, &random, &ipks), Some(ib));
        assert_eq!(table.fabric_count(), 2);
        Ok(())
    }

    #[test]
    fn add_after_reset_keeps_stored_fabrics() -> Result<()> {
        let (storage, mut table) = testutil::table(4)?;
        let a = testutil::ca(0xA, false)?;
        let b = testutil::ca(0xB, false)?;
        let ia = table.add_new_fabric(&mut testutil::candidate(&a, 1)?)?;
        table.reset();

        let ib = table.add_new_fabric(&mut testutil::candidate(&b, 1)?)?;
        assert_ne!(ia, ib);
        assert_eq!(storage.keys()?.len(), 2);
        // still conflicts with the fabric that was only in storage
        table.reset();
        let res = table.add_new_fabric(&mut testutil::candidate(&a, 2)?);
        assert!(error::has_code(&res, ErrorCode::FabricConflict));

        let config = FabricTableConfig {
            max_fabrics: 4,
            ..Default::default()
        };
        let reloaded = FabricTable::init(storage.clone(), &config)?;
        let ids: Vec<u64> = reloaded.iter().map(|f| f.fabric_id()).collect();
        assert_eq!(ids, vec![0xA, 0xB]);
        Ok(())
    }

    #[test]
    fn unreadable_slot_is_not_reused() -> Result<()> {
        let (storage, mut table) = testutil::table(2)?;
        let a = testutil::ca(0xA, false)?;
        table.add_new_fabric(&mut testutil::candidate(&a, 1)?)?;

        let config = FabricTableConfig {
            max_fabrics: 2,
            ..Default::default()
        };
        storage.set_fail_reads(true);
        let mut second = FabricTable::init(storage.clone(), &config)?;
        assert_eq!(second.fabric_count(), 0);
        let b = testutil::ca(0xB, false)?;
        assert_eq!(second.add_new_fabric(&mut testutil::candidate(&b, 1)?)?, 2);
        let c = testutil::ca(0xC, false)?;
        let res = second.add_new_fabric(&mut testutil::candidate(&c, 1)?);
        assert!(error::has_code(&res, ErrorCode::NoMemory));

        storage.set_fail_reads(false);
        let third = FabricTable::init(storage.clone(), &config)?;
        let ids: Vec<u64> = third.iter().map(|f| f.fabric_id()).collect();
        assert_eq!(ids, vec![0xA, 0xB]);
        Ok(())
    }

    #[test]
    fn store_failure_is_propagated() -> Result<()> {
        let (storage, mut table) = testutil::table(2)?;
        let counter = Arc::new(Counter::default());
        table.set_delegate(counter.clone());
        storage.set_fail_writes(true);
        let ca = testutil::ca(0x5, false)?;
        let res = table.add_new_fabric(&mut testutil::candidate(&ca, 1)?);
        assert!(error::has_code(&res, ErrorCode::StorageIo));
        // memory diverges from storage until the caller decides
        assert_eq!(table.fabric_count(), 1);
        assert_eq!(counter.persisted.load(Ordering::SeqCst), 0);
        storage.set_fail_writes(false);
        table.store(1)?;
        assert_eq!(counter.persisted.load(Ordering::SeqCst), 1);

        storage.set_fail_reads(true);
        assert!(error::has_code(&table.load_from_storage(1), ErrorCode::StorageIo));
        assert!(table.fabric(1).is_some());
        assert!(error::has_code(&table.load_from_storage(2), ErrorCode::StorageIo));
        Ok(())
    }

    #[test]
    fn update_keeps_identity() -> Result<()> {
        let (_storage, mut table) = testutil::table(2)?;
        let ca = testutil::ca(0x9, false)?;
        let index = table.add_new_fabric(&mut testutil::candidate(&ca, 1)?)?;
        table.set_fabric_label(index, "hall")?;
        table.update_fabric(index, &mut testutil::candidate(&ca, 2)?)?;
        let f = table.fabric(index).context("fabric")?;
        assert_eq!(f.node_id(), 2);
        assert_eq!(f.label(), "hall");

        let other = testutil::ca(0x9, false)?;
        let res = table.update_fabric(index, &mut testutil::candidate(&other, 3)?);
        assert!(error::has_code(&res, ErrorCode::FabricMismatch));
        Ok(())
    }
}
