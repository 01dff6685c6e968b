use std::collections::{btree_map::Entry, BTreeMap};

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::{
    primitives::{Epoch, ValidatorIndex, H256},
    store::SlasherStore,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RecordedVote {
    pub signing_root: H256,
    pub attestation_root: H256,
}

// TargetEpoch,ValidatorIndex -> AttestationRecord
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationRecord {
    pub first: RecordedVote,
    /// Votes already reported as double votes against `first`.
    pub conflicting: Vec<RecordedVote>,
}

impl AttestationRecord {
    #[must_use]
    pub const fn new(first: RecordedVote) -> Self {
        Self {
            first,
            conflicting: vec![],
        }
    }

    #[must_use]
    pub fn contains(&self, signing_root: H256) -> bool {
        self.votes().any(|vote| vote.signing_root == signing_root)
    }

    pub fn votes(&self) -> impl Iterator<Item = &RecordedVote> {
        core::iter::once(&self.first).chain(&self.conflicting)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VoteStatus {
    New,
    Replay,
    DoubleVote { existing: RecordedVote },
}

struct CachedRecord {
    record: Option<AttestationRecord>,
    dirty: bool,
}

/// Attestation records of a single validator chunk, read through from the store.
pub struct AttestationVotes<'store, S: ?Sized> {
    store: &'store S,
    records: BTreeMap<(Epoch, ValidatorIndex), CachedRecord>,
}

impl<'store, S: SlasherStore + ?Sized> AttestationVotes<'store, S> {
    pub const fn new(store: &'store S) -> Self {
        Self {
            store,
            records: BTreeMap::new(),
        }
    }

    pub fn find(
        &mut self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<Option<&AttestationRecord>> {
        Ok(self.cached(validator_index, target_epoch)?.record.as_ref())
    }

    pub fn check(
        &mut self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
        vote: RecordedVote,
    ) -> Result<VoteStatus> {
        let status = match self.find(validator_index, target_epoch)? {
            None => VoteStatus::New,
            Some(record) if record.contains(vote.signing_root) => VoteStatus::Replay,
            Some(record) => VoteStatus::DoubleVote {
                existing: record.first,
            },
        };

        Ok(status)
    }

    /// Records `vote` after [`AttestationVotes::check`] returned `status` for it.
    ///
    /// The first vote for a key is never replaced. Conflicting votes are appended so that
    /// resubmitting them is recognized as a replay.
    pub fn insert(
        &mut self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
        vote: RecordedVote,
        status: VoteStatus,
    ) -> Result<()> {
        let cached = self.cached(validator_index, target_epoch)?;

        match status {
            VoteStatus::Replay => return Ok(()),
            VoteStatus::New => {
                ensure!(
                    cached.record.is_none(),
                    "validator {validator_index} already has a record for target epoch {target_epoch}",
                );

                cached.record = Some(AttestationRecord::new(vote));
            }
            VoteStatus::DoubleVote { .. } => {
                let Some(record) = cached.record.as_mut() else {
                    bail!(
                        "validator {validator_index} has no record for target epoch {target_epoch} \
                         to add a conflicting vote to",
                    );
                };

                record.conflicting.push(vote);
            }
        }

        cached.dirty = true;

        Ok(())
    }

    #[must_use]
    pub fn into_dirty_records(self) -> Vec<((Epoch, ValidatorIndex), AttestationRecord)> {
        self.records
            .into_iter()
            .filter(|(_, cached)| cached.dirty)
            .filter_map(|(key, cached)| Some((key, cached.record?)))
            .collect()
    }

    fn cached(
        &mut self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<&mut CachedRecord> {
        match self.records.entry((target_epoch, validator_index)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let record = self
                    .store
                    .load_attestation_record(validator_index, target_epoch)?;

                Ok(entry.insert(CachedRecord {
                    record,
                    dirty: false,
                }))
            }
        }
    }
}
