use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;

use crate::{
    nonstandard::IndexedAttestationWrapper,
    primitives::{Epoch, H256},
    store::SlasherStore,
};

// TargetEpoch,AttestationRoot -> IndexedAttestationWrapper
pub struct IndexedAttestations<'store, S: ?Sized> {
    store: &'store S,
    pending: BTreeMap<(Epoch, H256), Arc<IndexedAttestationWrapper>>,
}

impl<'store, S: SlasherStore + ?Sized> IndexedAttestations<'store, S> {
    pub const fn new(store: &'store S) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    pub fn find(
        &self,
        target_epoch: Epoch,
        attestation_root: H256,
    ) -> Result<Option<Arc<IndexedAttestationWrapper>>> {
        if let Some(attestation) = self.pending.get(&(target_epoch, attestation_root)) {
            return Ok(Some(Arc::clone(attestation)));
        }

        Ok(self
            .store
            .load_attestation(target_epoch, attestation_root)?
            .map(Arc::new))
    }

    pub fn insert(&mut self, attestation_root: H256, attestation: &Arc<IndexedAttestationWrapper>) {
        self.pending
            .entry((attestation.target_epoch(), attestation_root))
            .or_insert_with(|| Arc::clone(attestation));
    }

    #[must_use]
    pub fn into_pending(self) -> BTreeMap<(Epoch, H256), Arc<IndexedAttestationWrapper>> {
        self.pending
    }
}
