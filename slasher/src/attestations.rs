use std::{collections::BTreeSet, sync::Arc};

use anyhow::{bail, ensure, Result};
use itertools::Itertools as _;
use log::{debug, warn};

use crate::{
    attestation_votes::{AttestationVotes, RecordedVote, VoteStatus},
    chunk_address::ChunkLayout,
    containers::AttesterSlashing,
    grouping::GroupedAttestation,
    indexed_attestations::IndexedAttestations,
    nonstandard::IndexedAttestationWrapper,
    primitives::{Epoch, ValidatorIndex},
    status::{AttesterSlashingReason, ExplainedAttesterSlashing},
    store::{SlasherStore, StoreBatch},
    targets::Targets,
    watermarks::{EpochRegression, EpochWatermarks, WatermarkStatus},
};

/// Result of processing one validator chunk. Nothing in it is persisted yet.
pub struct GroupOutcome {
    pub slashings: Vec<ExplainedAttesterSlashing>,
    pub regressions: Vec<EpochRegression>,
    pub batch: StoreBatch,
}

/// Processes the attestations of one validator chunk in order.
pub fn process_group<S: SlasherStore + ?Sized>(
    store: &S,
    layout: ChunkLayout,
    validator_chunk_index: u64,
    current_epoch: Epoch,
    group: &[GroupedAttestation],
) -> Result<GroupOutcome> {
    let validator_indices = group
        .iter()
        .flat_map(|grouped| grouped.validator_indices.iter().copied())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect_vec();

    let mut attestations = Attestations::new(
        store,
        layout,
        validator_chunk_index,
        current_epoch,
        &validator_indices,
    )?;

    for grouped in group {
        attestations.process(grouped)?;
    }

    Ok(attestations.finish())
}

struct Attestations<'store, S: ?Sized> {
    layout: ChunkLayout,
    current_epoch: Epoch,
    watermarks: EpochWatermarks,
    attestation_votes: AttestationVotes<'store, S>,
    indexed_attestations: IndexedAttestations<'store, S>,
    targets: Targets<'store, S>,
    slashings: Vec<ExplainedAttesterSlashing>,
}

impl<'store, S: SlasherStore + ?Sized> Attestations<'store, S> {
    fn new(
        store: &'store S,
        layout: ChunkLayout,
        validator_chunk_index: u64,
        current_epoch: Epoch,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Self> {
        let watermarks = EpochWatermarks::load(store, validator_indices, current_epoch)?;
        let mut targets = Targets::new(layout, validator_chunk_index, store);

        // Columns of epochs that entered the window since the last write still hold
        // distances from a full history length ago.
        for (validator_index, status) in watermarks.statuses() {
            if let WatermarkStatus::Advance {
                last_epoch_written: Some(last_epoch_written),
            } = status
            {
                targets.reset_epochs(validator_index, last_epoch_written, current_epoch)?;
            }
        }

        Ok(Self {
            layout,
            current_epoch,
            watermarks,
            attestation_votes: AttestationVotes::new(store),
            indexed_attestations: IndexedAttestations::new(store),
            targets,
            slashings: vec![],
        })
    }

    fn process(&mut self, grouped: &GroupedAttestation) -> Result<()> {
        for validator_index in grouped.validator_indices.iter().copied() {
            self.process_validator(validator_index, grouped)?;
        }

        Ok(())
    }

    fn process_validator(
        &mut self,
        validator_index: ValidatorIndex,
        grouped: &GroupedAttestation,
    ) -> Result<()> {
        let GroupedAttestation {
            attestation,
            attestation_root,
            ..
        } = grouped;

        let source_epoch = attestation.source_epoch();
        let target_epoch = attestation.target_epoch();

        ensure!(
            target_epoch <= self.current_epoch,
            "attestation from a future epoch reached a group \
             (target_epoch: {target_epoch}, current_epoch: {})",
            self.current_epoch,
        );

        let Some(status) = self.watermarks.status(validator_index) else {
            bail!("validator {validator_index} has no watermark in its group");
        };

        let vote = RecordedVote {
            signing_root: attestation.signing_root,
            attestation_root: *attestation_root,
        };

        let vote_status = self
            .attestation_votes
            .check(validator_index, target_epoch, vote)?;

        match vote_status {
            VoteStatus::New => {}
            VoteStatus::Replay => return Ok(()),
            VoteStatus::DoubleVote { existing } => {
                if let Some(existing) = self
                    .indexed_attestations
                    .find(target_epoch, existing.attestation_root)?
                {
                    self.push_slashing(
                        validator_index,
                        &existing,
                        attestation,
                        AttesterSlashingReason::DoubleVote,
                    );
                } else {
                    warn!(
                        "attestation of a recorded vote is missing from the archive \
                         (validator_index: {validator_index}, target_epoch: {target_epoch}, \
                         attestation_root: {:?})",
                        existing.attestation_root,
                    );
                }
            }
        }

        // Records are written for regressed validators too. Only span columns depend on the watermark.
        self.attestation_votes
            .insert(validator_index, target_epoch, vote, vote_status)?;

        self.indexed_attestations
            .insert(*attestation_root, attestation);

        // Span cells hold meaningful data only for epochs the columns were brought forward to.
        let columns_epoch = match status {
            WatermarkStatus::Advance { .. } => self.current_epoch,
            WatermarkStatus::Regressed { last_epoch_written } => last_epoch_written,
        };

        let oldest_epoch = self.layout.oldest_retained_epoch(columns_epoch);

        // Every source counted in the min span of the oldest epoch is later than an older source.
        let source_is_retained = source_epoch >= oldest_epoch;

        if !source_is_retained {
            debug!(
                "source epoch is outside of the span history; checking from the oldest epoch \
                 (validator_index: {validator_index}, source_epoch: {source_epoch}, \
                 oldest_epoch: {oldest_epoch}, target_epoch: {target_epoch})",
            );
        }

        if let Some(existing_target) = self.targets.check_for_surrounding_entry(
            validator_index,
            source_epoch.max(oldest_epoch),
            target_epoch,
        )? {
            let partner = self.find_partner(validator_index, existing_target, |existing| {
                attestation.surrounds(existing)
            })?;

            if let Some(existing) = partner {
                self.push_slashing(
                    validator_index,
                    &existing,
                    attestation,
                    AttesterSlashingReason::Surrounding,
                );
            }
        }

        let surrounded_target = if source_is_retained {
            self.targets
                .check_for_surrounded_entry(validator_index, source_epoch, target_epoch)?
        } else {
            None
        };

        if let Some(existing_target) = surrounded_target {
            let partner = self.find_partner(validator_index, existing_target, |existing| {
                existing.surrounds(attestation)
            })?;

            if let Some(existing) = partner {
                self.push_slashing(
                    validator_index,
                    &existing,
                    attestation,
                    AttesterSlashingReason::Surrounded,
                );
            }
        }

        if status.is_writable() {
            self.targets
                .update(validator_index, source_epoch, target_epoch, self.current_epoch)?;
        }

        Ok(())
    }

    // Looks for an attestation recorded for `target_epoch` that contains `validator_index`
    // and stands in the expected surround relation to the new one.
    fn find_partner(
        &mut self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
        relation: impl Fn(&IndexedAttestationWrapper) -> bool,
    ) -> Result<Option<Arc<IndexedAttestationWrapper>>> {
        let Some(record) = self
            .attestation_votes
            .find(validator_index, target_epoch)?
        else {
            warn!(
                "span points at a target epoch without a record \
                 (validator_index: {validator_index}, target_epoch: {target_epoch})",
            );

            return Ok(None);
        };

        let attestation_roots = record
            .votes()
            .map(|vote| vote.attestation_root)
            .collect_vec();

        for attestation_root in attestation_roots {
            let Some(existing) = self
                .indexed_attestations
                .find(target_epoch, attestation_root)?
            else {
                continue;
            };

            let contains_validator = existing
                .attesting_indices()
                .binary_search(&validator_index)
                .is_ok();

            if contains_validator && relation(existing.as_ref()) {
                return Ok(Some(existing));
            }
        }

        warn!(
            "no recorded attestation matches a detected surround vote \
             (validator_index: {validator_index}, target_epoch: {target_epoch})",
        );

        Ok(None)
    }

    fn push_slashing(
        &mut self,
        offender_index: ValidatorIndex,
        existing: &IndexedAttestationWrapper,
        new: &IndexedAttestationWrapper,
        reason: AttesterSlashingReason,
    ) {
        let slashing = AttesterSlashing {
            attestation_1: existing.indexed_attestation.clone(),
            attestation_2: new.indexed_attestation.clone(),
        };

        self.slashings.push(ExplainedAttesterSlashing {
            offender_index,
            slashing,
            reason,
        });
    }

    fn finish(self) -> GroupOutcome {
        let Self {
            watermarks,
            attestation_votes,
            indexed_attestations,
            targets,
            slashings,
            ..
        } = self;

        let regressions = watermarks.regressions();

        let batch = StoreBatch {
            chunks: targets.into_dirty_chunks(),
            attestation_records: attestation_votes.into_dirty_records(),
            attestations: indexed_attestations.into_pending(),
            last_epochs_written: watermarks.into_updates(),
            proposal_records: vec![],
        };

        GroupOutcome {
            slashings,
            regressions,
            batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{primitives::H256, store::SlasherDatabase};

    use super::*;

    const LAYOUT: ChunkLayout = ChunkLayout {
        chunk_size: 4,
        validator_chunk_size: 4,
        history_length: 32,
    };

    fn build_attestation(source: Epoch, target: Epoch) -> GroupedAttestation {
        build_attestation_with_root(source, target, H256::repeat_byte(1))
    }

    fn build_attestation_with_root(
        source: Epoch,
        target: Epoch,
        beacon_block_root: H256,
    ) -> GroupedAttestation {
        let mut wrapper = IndexedAttestationWrapper::default();
        wrapper.indexed_attestation.attesting_indices = vec![1];
        wrapper.indexed_attestation.data.source.epoch = source;
        wrapper.indexed_attestation.data.target.epoch = target;
        wrapper.indexed_attestation.data.beacon_block_root = beacon_block_root;
        wrapper.signing_root = H256::from_low_u64_be(source * 1000 + target)
            ^ beacon_block_root;

        let attestation_root = wrapper
            .attestation_root()
            .expect("default attestations can be serialized");

        GroupedAttestation {
            attestation: Arc::new(wrapper),
            attestation_root,
            validator_indices: vec![1],
        }
    }

    fn process(
        store: &SlasherDatabase,
        current_epoch: Epoch,
        group: &[GroupedAttestation],
    ) -> Result<GroupOutcome> {
        process_group(store, LAYOUT, 0, current_epoch, group)
    }

    fn process_and_commit(
        store: &SlasherDatabase,
        current_epoch: Epoch,
        group: &[GroupedAttestation],
    ) -> Result<Vec<ExplainedAttesterSlashing>> {
        let outcome = process(store, current_epoch, group)?;
        store.commit(outcome.batch)?;
        Ok(outcome.slashings)
    }

    fn single(slashings: Vec<ExplainedAttesterSlashing>) -> ExplainedAttesterSlashing {
        assert_eq!(slashings.len(), 1, "expected one slashing: {slashings:?}");
        slashings.into_iter().next().expect("length was checked above")
    }

    //       S          T
    //                    S  T
    //   S     T
    // 1 2 3 4 5 6 7 8 9 10 11
    #[test]
    fn slasher_attestation_storage_test() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        // valid attestation data
        let at_1 = build_attestation(2, 5);
        let at_2 = build_attestation(10, 11);
        let at_3 = build_attestation(4, 9);

        // slashing violations
        let at_4 = build_attestation(1, 6);
        let at_5 = build_attestation_with_root(1, 5, H256::repeat_byte(2));
        let at_6 = build_attestation(7, 8);

        // violations are not slashable on empty db
        for attestation in [&at_1, &at_2, &at_3, &at_4, &at_5, &at_6] {
            let outcome = process(&store, 14, core::slice::from_ref(attestation))?;
            assert!(outcome.slashings.is_empty());
        }

        let slashings = process_and_commit(&store, 14, &[at_1.clone(), at_2, at_3.clone()])?;
        assert!(slashings.is_empty());

        // surrounds at_1
        let explained_slashing = single(process(&store, 14, &[at_4.clone()])?.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::Surrounding);
        assert_eq!(explained_slashing.offender_index, 1);
        assert_eq!(explained_slashing.slashing.attestation_1, at_1.attestation.indexed_attestation);
        assert_eq!(explained_slashing.slashing.attestation_2, at_4.attestation.indexed_attestation);
        assert_eq!(explained_slashing.surrounding(), Some(&at_4.attestation.indexed_attestation));
        assert_eq!(explained_slashing.surrounded(), Some(&at_1.attestation.indexed_attestation));

        // double vote
        let explained_slashing = single(process(&store, 14, &[at_5.clone()])?.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::DoubleVote);
        assert_eq!(explained_slashing.slashing.attestation_1, at_1.attestation.indexed_attestation);
        assert_eq!(explained_slashing.slashing.attestation_2, at_5.attestation.indexed_attestation);
        assert_eq!(explained_slashing.surrounding(), None);

        // is surrounded by
        let explained_slashing = single(process(&store, 14, &[at_6.clone()])?.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::Surrounded);
        assert_eq!(explained_slashing.slashing.attestation_1, at_3.attestation.indexed_attestation);
        assert_eq!(explained_slashing.slashing.attestation_2, at_6.attestation.indexed_attestation);
        assert_eq!(explained_slashing.surrounding(), Some(&at_3.attestation.indexed_attestation));

        Ok(())
    }

    #[test]
    fn conflicts_within_one_group_are_detected() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        let surrounded = build_attestation(3, 6);
        let surrounding = build_attestation(2, 8);

        let slashings = process_and_commit(&store, 10, &[surrounded.clone(), surrounding.clone()])?;
        let explained_slashing = single(slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::Surrounding);
        assert_eq!(
            explained_slashing.slashing.attestation_1,
            surrounded.attestation.indexed_attestation,
        );

        // Both attestations are recorded despite the violation.
        let slashings = process_and_commit(&store, 10, &[surrounded, surrounding])?;
        assert!(slashings.is_empty());

        Ok(())
    }

    #[test]
    fn replays_do_not_write() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;
        let group = [build_attestation(2, 5), build_attestation(4, 9)];

        process_and_commit(&store, 14, &group)?;

        let outcome = process(&store, 14, &group)?;

        assert!(outcome.slashings.is_empty());
        assert!(outcome.batch.is_empty());

        Ok(())
    }

    #[test]
    fn regressed_validators_keep_records_but_not_spans() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        process_and_commit(&store, 20, &[build_attestation(2, 8)])?;

        // The batch epoch went back below the last write.
        let outcome = process(&store, 15, &[build_attestation(3, 6)])?;

        let explained_slashing = single(outcome.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::Surrounded);
        assert_eq!(
            outcome.regressions,
            [EpochRegression {
                validator_index: 1,
                last_epoch_written: 20,
                current_epoch: 15,
            }],
        );
        assert!(outcome.batch.chunks.is_empty());
        assert!(outcome.batch.last_epochs_written.is_empty());
        assert_eq!(outcome.batch.attestation_records.len(), 1);
        assert_eq!(outcome.batch.attestations.len(), 1);

        store.commit(outcome.batch)?;

        let outcome = process(&store, 15, &[build_attestation(3, 6)])?;

        assert!(outcome.slashings.is_empty());
        assert!(outcome.batch.is_empty());

        Ok(())
    }

    #[test]
    fn regressed_double_votes_are_reported_once() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        process_and_commit(&store, 20, &[build_attestation(2, 8)])?;
        process_and_commit(&store, 15, &[build_attestation(3, 6)])?;

        let conflicting = build_attestation_with_root(3, 6, H256::repeat_byte(2));

        let reasons = process_and_commit(&store, 15, &[conflicting.clone()])?
            .into_iter()
            .map(|explained_slashing| explained_slashing.reason)
            .collect_vec();

        assert_eq!(
            reasons,
            [AttesterSlashingReason::DoubleVote, AttesterSlashingReason::Surrounded],
        );

        assert!(process_and_commit(&store, 15, &[conflicting])?.is_empty());

        Ok(())
    }

    #[test]
    fn double_votes_are_found_outside_of_the_span_history() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        // The oldest retained epoch at 50 is 19.
        process_and_commit(&store, 50, &[build_attestation(10, 40)])?;

        let conflicting = build_attestation_with_root(10, 40, H256::repeat_byte(2));
        let explained_slashing = single(process(&store, 50, &[conflicting])?.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::DoubleVote);

        Ok(())
    }

    #[test]
    fn old_sources_surround_later_attestations() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;
        let surrounding = build_attestation(10, 40);
        let surrounded = build_attestation(30, 35);

        // Max spans are written from the oldest retained epoch 19 upward.
        process_and_commit(&store, 50, &[surrounding.clone()])?;

        let explained_slashing = single(process(&store, 50, &[surrounded.clone()])?.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::Surrounded);
        assert_eq!(
            explained_slashing.slashing.attestation_1,
            surrounding.attestation.indexed_attestation,
        );
        assert_eq!(
            explained_slashing.slashing.attestation_2,
            surrounded.attestation.indexed_attestation,
        );

        Ok(())
    }

    #[test]
    fn old_sources_are_checked_against_the_oldest_retained_epoch() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;
        let surrounded = build_attestation(25, 30);
        let surrounding = build_attestation(10, 40);

        process_and_commit(&store, 50, &[surrounded.clone()])?;

        let explained_slashing = single(process(&store, 50, &[surrounding.clone()])?.slashings);

        assert_eq!(explained_slashing.reason, AttesterSlashingReason::Surrounding);
        assert_eq!(
            explained_slashing.slashing.attestation_1,
            surrounded.attestation.indexed_attestation,
        );
        assert_eq!(
            explained_slashing.slashing.attestation_2,
            surrounding.attestation.indexed_attestation,
        );

        Ok(())
    }

    #[test]
    fn stale_columns_are_reset_when_the_window_moves() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        // Writes max spans for epochs 3 through 7.
        process_and_commit(&store, 10, &[build_attestation(2, 8)])?;

        // Epoch 37 reuses the cells of epoch 5. Without a reset it would look surrounded.
        let outcome = process(&store, 40, &[build_attestation(37, 38)])?;

        assert!(outcome.slashings.is_empty());
        assert_eq!(outcome.batch.last_epochs_written, [(1, 40)]);
        assert!(!outcome.batch.chunks.is_empty());

        Ok(())
    }

    #[test]
    fn future_attestations_are_refused() -> Result<()> {
        let store = SlasherDatabase::in_memory(LAYOUT)?;

        process(&store, 4, &[build_attestation(2, 5)])
            .err()
            .expect("attestations targeting future epochs should be refused");

        Ok(())
    }
}
