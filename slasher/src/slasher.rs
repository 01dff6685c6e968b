#![allow(
    clippy::multiple_inherent_impl,
    reason = "https://github.com/rust-lang/rust-clippy/issues/13040"
)]

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{Error as AnyhowError, Result};
use bytesize::ByteSize;
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
    stream::StreamExt as _,
};
use itertools::Itertools as _;
use log::{debug, info, warn};
use rayon::{
    iter::{IntoParallelIterator as _, ParallelIterator as _},
    ThreadPool, ThreadPoolBuilder,
};
use thiserror::Error;

use crate::{
    attestations::{self, GroupOutcome},
    blocks::Blocks,
    grouping::{self, GroupedAttestation},
    messages::{SlasherToValidator, ToSlasher},
    nonstandard::{IndexedAttestationWrapper, SignedBlockHeaderWrapper},
    primitives::{Epoch, ValidatorIndex, H256},
    slasher_config::SlasherConfig,
    status::{ExplainedAttesterSlashing, ExplainedProposerSlashing},
    store::{SlasherDatabase, SlasherStore, StoreBatch},
    watermarks::EpochRegression,
};

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum AttestationError {
    #[error("attestation has no attesting indices")]
    EmptyIndices,
    #[error("attesting indices are not sorted or contain duplicates")]
    UnsortedIndices,
    #[error(
        "attestation target is not after its source \
         (source_epoch: {source_epoch}, target_epoch: {target_epoch})"
    )]
    TargetNotAfterSource {
        source_epoch: Epoch,
        target_epoch: Epoch,
    },
    #[error(
        "validator index is out of range \
         (validator_index: {validator_index}, max_validators: {max_validators})"
    )]
    ValidatorOutOfRange {
        validator_index: ValidatorIndex,
        max_validators: u64,
    },
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum BlockHeaderError {
    #[error(
        "proposer index is out of range \
         (proposer_index: {proposer_index}, max_validators: {max_validators})"
    )]
    ProposerOutOfRange {
        proposer_index: ValidatorIndex,
        max_validators: u64,
    },
}

#[derive(Debug)]
pub struct RejectedAttestation {
    pub attestation: IndexedAttestationWrapper,
    pub error: AttestationError,
}

#[derive(Debug)]
pub struct RejectedBlockHeader {
    pub header: SignedBlockHeaderWrapper,
    pub error: BlockHeaderError,
}

/// A validator chunk whose updates could not be committed.
///
/// None of its writes were persisted and its slashings were withheld.
/// Resubmitting `attestations` is safe.
#[derive(Debug)]
pub struct FailedGroup {
    pub validator_chunk_index: u64,
    pub attestations: Vec<IndexedAttestationWrapper>,
    pub error: AnyhowError,
}

#[derive(Debug, Default)]
pub struct AttestationReport {
    pub slashings: Vec<ExplainedAttesterSlashing>,
    pub rejected: Vec<RejectedAttestation>,
    /// Attestations with a target epoch after the current one. Not processed.
    pub deferred: Vec<IndexedAttestationWrapper>,
    pub regressions: Vec<EpochRegression>,
    pub failed_groups: Vec<FailedGroup>,
}

#[derive(Debug, Default)]
pub struct ProposalReport {
    pub slashings: Vec<ExplainedProposerSlashing>,
    pub rejected: Vec<RejectedBlockHeader>,
}

// Attestations that wait for the next batch of the service loop.
#[derive(Default)]
struct PendingAttestations {
    attestations: Vec<IndexedAttestationWrapper>,
    // Consecutive failed submissions of attestations from failed groups, by attestation root.
    failures: HashMap<H256, usize>,
}

impl PendingAttestations {
    fn take(&mut self) -> Vec<IndexedAttestationWrapper> {
        core::mem::take(&mut self.attestations)
    }

    fn requeue(
        &mut self,
        deferred: Vec<IndexedAttestationWrapper>,
        failed_groups: Vec<FailedGroup>,
        max_retries: usize,
    ) -> Result<()> {
        let previous_failures = core::mem::take(&mut self.failures);

        self.attestations.extend(deferred);

        for attestation in failed_groups
            .into_iter()
            .flat_map(|failed_group| failed_group.attestations)
        {
            let attestation_root = attestation.attestation_root()?;

            // An attestation spanning several failed groups is queued once.
            if self.failures.contains_key(&attestation_root) {
                continue;
            }

            let failures = previous_failures
                .get(&attestation_root)
                .copied()
                .unwrap_or_default()
                + 1;

            if failures > max_retries {
                warn!(
                    "dropping attestation after {failures} failed submissions \
                     (attestation_root: {attestation_root:?}, attestation: {attestation:?})",
                );

                continue;
            }

            self.failures.insert(attestation_root, failures);
            self.attestations.push(attestation);
        }

        Ok(())
    }
}

pub struct Slasher<S = SlasherDatabase> {
    config: SlasherConfig,
    store: S,
    thread_pool: ThreadPool,
}

impl Slasher {
    pub fn in_memory(config: SlasherConfig) -> Result<Self> {
        let config = config.validate()?;
        let store = SlasherDatabase::in_memory(config.layout())?;
        Self::new(config, store)
    }

    pub fn persistent(
        config: SlasherConfig,
        directory: impl AsRef<Path>,
        max_size: ByteSize,
    ) -> Result<Self> {
        let config = config.validate()?;
        let store = SlasherDatabase::persistent(directory, max_size, config.layout())?;
        Self::new(config, store)
    }
}

impl<S: SlasherStore> Slasher<S> {
    pub fn new(config: SlasherConfig, store: S) -> Result<Self> {
        let config = config.validate()?;

        let mut builder = ThreadPoolBuilder::new().thread_name(|index| format!("slasher-{index}"));

        if let Some(worker_count) = config.worker_count {
            builder = builder.num_threads(worker_count.get());
        }

        Ok(Self {
            config,
            store,
            thread_pool: builder.build()?,
        })
    }

    #[must_use]
    pub const fn config(&self) -> SlasherConfig {
        self.config
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    pub async fn run(
        self,
        mut rx: UnboundedReceiver<ToSlasher>,
        tx: UnboundedSender<SlasherToValidator>,
    ) -> Result<()> {
        let mut pending = PendingAttestations::default();

        while let Some(message) = rx.next().await {
            match message {
                ToSlasher::Attestations {
                    current_epoch,
                    attestations,
                } => {
                    let attestations = pending
                        .take()
                        .into_iter()
                        .chain(attestations)
                        .collect();

                    let report = self.submit_attestations(current_epoch, attestations)?;

                    for explained_slashing in report.slashings {
                        SlasherToValidator::AttesterSlashing(explained_slashing.slashing)
                            .send(&tx);
                    }

                    pending.requeue(
                        report.deferred,
                        report.failed_groups,
                        self.config.max_group_retries,
                    )?;
                }
                ToSlasher::BlockHeaders(headers) => match self.submit_block_headers(headers) {
                    Ok(report) => {
                        for explained_slashing in report.slashings {
                            SlasherToValidator::ProposerSlashing(explained_slashing.slashing)
                                .send(&tx);
                        }
                    }
                    Err(error) => warn!("failed to process block headers: {error:?}"),
                },
                ToSlasher::Prune(current_epoch) => {
                    if let Err(error) = self.prune(current_epoch) {
                        warn!("failed to prune slasher database: {error:?}");
                    }
                }
                ToSlasher::Stop => break,
            }
        }

        Ok(())
    }

    pub fn submit_attestations(
        &self,
        current_epoch: Epoch,
        attestations: Vec<IndexedAttestationWrapper>,
    ) -> Result<AttestationReport> {
        let mut report = AttestationReport::default();
        let mut accepted = vec![];

        for attestation in attestations {
            if let Err(error) = self.validate_attestation(&attestation) {
                debug!("rejecting attestation (error: {error}, attestation: {attestation:?})");
                report.rejected.push(RejectedAttestation { attestation, error });
                continue;
            }

            if attestation.target_epoch() > current_epoch {
                report.deferred.push(attestation);
                continue;
            }

            let attestation_root = attestation.attestation_root()?;
            accepted.push((Arc::new(attestation), attestation_root));
        }

        let layout = self.config.layout();
        let accepted_count = accepted.len();
        let groups = grouping::group_by_validator_chunk(layout, accepted);

        debug!(
            "processing attestations \
             (current_epoch: {current_epoch}, accepted: {accepted_count}, groups: {}, \
             rejected: {}, deferred: {})",
            groups.len(),
            report.rejected.len(),
            report.deferred.len(),
        );

        let results = self.thread_pool.install(|| {
            groups
                .into_iter()
                .collect_vec()
                .into_par_iter()
                .map(|(validator_chunk_index, group)| {
                    let result = self.process_group(validator_chunk_index, current_epoch, &group);
                    (validator_chunk_index, group, result)
                })
                .collect::<Vec<_>>()
        });

        for (validator_chunk_index, group, result) in results {
            match result {
                Ok((slashings, regressions)) => {
                    for explained_slashing in &slashings {
                        info!("attester slashing constructed: {explained_slashing:?}");
                    }

                    for regression in &regressions {
                        warn!("{regression}");
                    }

                    report.slashings.extend(slashings);
                    report.regressions.extend(regressions);
                }
                Err(error) => {
                    warn!(
                        "failed to process validator chunk {validator_chunk_index} \
                         ({} attestations): {error:?}",
                        group.len(),
                    );

                    let attestations = group
                        .into_iter()
                        .map(|grouped| IndexedAttestationWrapper::clone(&grouped.attestation))
                        .collect();

                    report.failed_groups.push(FailedGroup {
                        validator_chunk_index,
                        attestations,
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    pub fn submit_block_headers(
        &self,
        headers: Vec<SignedBlockHeaderWrapper>,
    ) -> Result<ProposalReport> {
        let mut report = ProposalReport::default();
        let mut blocks = Blocks::new(&self.store);

        for header in headers {
            let proposer_index = header.proposer_index();

            if !self.config.is_known_validator(proposer_index) {
                let error = BlockHeaderError::ProposerOutOfRange {
                    proposer_index,
                    max_validators: self.config.max_validators,
                };

                debug!("rejecting block header (error: {error}, header: {header:?})");
                report.rejected.push(RejectedBlockHeader { header, error });
                continue;
            }

            debug!(
                "processing block header (slot: {}, proposer_index: {proposer_index}, \
                 signing_root: {:?})",
                header.slot(),
                header.signing_root,
            );

            if let Some(explained_slashing) = blocks.process(header)? {
                info!("proposer slashing constructed: {explained_slashing:?}");
                report.slashings.push(explained_slashing);
            }
        }

        self.store.commit(StoreBatch {
            proposal_records: blocks.into_dirty_records(),
            ..StoreBatch::default()
        })?;

        Ok(report)
    }

    /// Deletes records that fell out of the span history at `current_epoch`.
    pub fn prune(&self, current_epoch: Epoch) -> Result<()> {
        let oldest_epoch = self.config.layout().oldest_retained_epoch(current_epoch);
        let oldest_slot = self.config.start_slot_at_epoch(oldest_epoch);

        debug!(
            "pruning slasher database \
             (current_epoch: {current_epoch}, oldest_epoch: {oldest_epoch}, oldest_slot: {oldest_slot})",
        );

        self.store.prune(oldest_epoch, oldest_slot)
    }

    fn validate_attestation(
        &self,
        attestation: &IndexedAttestationWrapper,
    ) -> Result<(), AttestationError> {
        let attesting_indices = attestation.attesting_indices();

        let Some(last_index) = attesting_indices.last().copied() else {
            return Err(AttestationError::EmptyIndices);
        };

        if !attesting_indices
            .iter()
            .tuple_windows()
            .all(|(previous, next)| previous < next)
        {
            return Err(AttestationError::UnsortedIndices);
        }

        let source_epoch = attestation.source_epoch();
        let target_epoch = attestation.target_epoch();

        if target_epoch <= source_epoch {
            return Err(AttestationError::TargetNotAfterSource {
                source_epoch,
                target_epoch,
            });
        }

        if !self.config.is_known_validator(last_index) {
            return Err(AttestationError::ValidatorOutOfRange {
                validator_index: last_index,
                max_validators: self.config.max_validators,
            });
        }

        Ok(())
    }

    fn process_group(
        &self,
        validator_chunk_index: u64,
        current_epoch: Epoch,
        group: &[GroupedAttestation],
    ) -> Result<(Vec<ExplainedAttesterSlashing>, Vec<EpochRegression>)> {
        let GroupOutcome {
            slashings,
            regressions,
            batch,
        } = attestations::process_group(
            &self.store,
            self.config.layout(),
            validator_chunk_index,
            current_epoch,
            group,
        )?;

        self.store.commit(batch)?;

        Ok((slashings, regressions))
    }
}
