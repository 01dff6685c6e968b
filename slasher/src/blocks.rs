use std::collections::{btree_map::Entry, BTreeMap};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    containers::ProposerSlashing,
    nonstandard::SignedBlockHeaderWrapper,
    primitives::{Slot, ValidatorIndex, H256},
    status::{ExplainedProposerSlashing, ProposerSlashingReason},
    store::SlasherStore,
};

// Slot,ValidatorIndex -> ProposalRecord
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProposalRecord {
    pub header: SignedBlockHeaderWrapper,
    /// Signing roots already reported as double proposals against `header`.
    pub conflicting: Vec<H256>,
}

impl ProposalRecord {
    #[must_use]
    pub const fn new(header: SignedBlockHeaderWrapper) -> Self {
        Self {
            header,
            conflicting: vec![],
        }
    }

    fn contains(&self, signing_root: H256) -> bool {
        self.header.signing_root == signing_root || self.conflicting.contains(&signing_root)
    }
}

struct CachedProposal {
    record: Option<ProposalRecord>,
    dirty: bool,
}

pub struct Blocks<'store, S: ?Sized> {
    store: &'store S,
    records: BTreeMap<(Slot, ValidatorIndex), CachedProposal>,
}

impl<'store, S: SlasherStore + ?Sized> Blocks<'store, S> {
    pub const fn new(store: &'store S) -> Self {
        Self {
            store,
            records: BTreeMap::new(),
        }
    }

    /// Records `header` and returns a slashing if the proposer already signed a different
    /// header for the same slot.
    pub fn process(
        &mut self,
        header: SignedBlockHeaderWrapper,
    ) -> Result<Option<ExplainedProposerSlashing>> {
        let proposer_index = header.proposer_index();
        let cached = self.cached(proposer_index, header.slot())?;

        let Some(record) = cached.record.as_mut() else {
            cached.record = Some(ProposalRecord::new(header));
            cached.dirty = true;
            return Ok(None);
        };

        if record.contains(header.signing_root) {
            return Ok(None);
        }

        record.conflicting.push(header.signing_root);
        cached.dirty = true;

        let slashing = ProposerSlashing {
            signed_header_1: record.header.signed_header,
            signed_header_2: header.signed_header,
        };

        Ok(Some(ExplainedProposerSlashing {
            offender_index: proposer_index,
            slashing,
            reason: ProposerSlashingReason::DoubleProposal,
        }))
    }

    #[must_use]
    pub fn into_dirty_records(self) -> Vec<((Slot, ValidatorIndex), ProposalRecord)> {
        self.records
            .into_iter()
            .filter(|(_, cached)| cached.dirty)
            .filter_map(|(key, cached)| Some((key, cached.record?)))
            .collect()
    }

    fn cached(
        &mut self,
        proposer_index: ValidatorIndex,
        slot: Slot,
    ) -> Result<&mut CachedProposal> {
        match self.records.entry((slot, proposer_index)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let record = self.store.load_proposal_record(proposer_index, slot)?;

                Ok(entry.insert(CachedProposal {
                    record,
                    dirty: false,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use unwrap_none::UnwrapNone as _;

    use crate::{
        chunk_address::ChunkLayout,
        containers::SignedBeaconBlockHeader,
        store::{SlasherDatabase, StoreBatch},
    };

    use super::*;

    fn build_header(
        proposer_index: ValidatorIndex,
        slot: Slot,
        parent_root: H256,
    ) -> SignedBlockHeaderWrapper {
        let mut signed_header = SignedBeaconBlockHeader::default();
        signed_header.message.slot = slot;
        signed_header.message.proposer_index = proposer_index;
        signed_header.message.parent_root = parent_root;

        SignedBlockHeaderWrapper {
            signed_header,
            signing_root: parent_root,
        }
    }

    fn build_store() -> Result<SlasherDatabase> {
        SlasherDatabase::in_memory(ChunkLayout {
            chunk_size: 4,
            validator_chunk_size: 4,
            history_length: 16,
        })
    }

    #[test]
    fn slasher_blocks_test() -> Result<()> {
        let store = build_store()?;
        let mut blocks = Blocks::new(&store);

        let header_1 = build_header(2, 1, H256::zero());
        let header_2 = build_header(2, 1, H256::repeat_byte(1));
        let header_3 = build_header(2, 1, H256::repeat_byte(2));

        blocks.process(header_1)?.unwrap_none();
        blocks.process(header_1)?.unwrap_none();

        let explained_slashing = blocks
            .process(header_2)?
            .expect("double proposal slashing must be found");

        assert_eq!(explained_slashing.offender_index, 2);
        assert_eq!(
            explained_slashing.reason,
            ProposerSlashingReason::DoubleProposal,
        );
        assert_eq!(
            explained_slashing.slashing.signed_header_1,
            header_1.signed_header,
        );
        assert_eq!(
            explained_slashing.slashing.signed_header_2,
            header_2.signed_header,
        );

        // Reported conflicts are not reported again.
        blocks.process(header_2)?.unwrap_none();

        // Later conflicts still cite the first header.
        let explained_slashing = blocks
            .process(header_3)?
            .expect("double proposal slashing must be found");

        assert_eq!(
            explained_slashing.slashing.signed_header_1,
            header_1.signed_header,
        );

        Ok(())
    }

    #[test]
    fn different_slots_and_proposers_do_not_conflict() -> Result<()> {
        let store = build_store()?;
        let mut blocks = Blocks::new(&store);

        blocks.process(build_header(2, 1, H256::zero()))?.unwrap_none();
        blocks.process(build_header(2, 2, H256::repeat_byte(1)))?.unwrap_none();
        blocks.process(build_header(3, 1, H256::repeat_byte(2)))?.unwrap_none();

        assert_eq!(blocks.into_dirty_records().len(), 3);

        Ok(())
    }

    #[test]
    fn records_survive_a_commit() -> Result<()> {
        let store = build_store()?;

        let mut blocks = Blocks::new(&store);
        blocks.process(build_header(2, 1, H256::zero()))?.unwrap_none();

        store.commit(StoreBatch {
            proposal_records: blocks.into_dirty_records(),
            ..StoreBatch::default()
        })?;

        let mut blocks = Blocks::new(&store);

        assert!(blocks.process(build_header(2, 1, H256::repeat_byte(1)))?.is_some());

        Ok(())
    }
}
