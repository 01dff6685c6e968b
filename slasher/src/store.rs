use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::Result;
use bytesize::ByteSize;
use database::{Database, WriteBatch};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    attestation_votes::AttestationRecord,
    blocks::ProposalRecord,
    chunk_address::{ChunkAddress, ChunkLayout},
    nonstandard::IndexedAttestationWrapper,
    primitives::{Epoch, Slot, ValidatorIndex, H256},
    targets::{Chunk, SpanKind},
};

const DATABASE_NAME: &str = "slasher";

const TABLE_SIZE: usize = 1;
const INDEX_SIZE: usize = size_of::<u64>();
const H256_SIZE: usize = size_of::<H256>();

type TableKey = [u8; TABLE_SIZE];
type SingleKey = [u8; TABLE_SIZE + INDEX_SIZE];
type PairKey = [u8; TABLE_SIZE + 2 * INDEX_SIZE];
type RootKey = [u8; TABLE_SIZE + INDEX_SIZE + H256_SIZE];

#[derive(Clone, Copy)]
enum Table {
    // Layout the database was created with.
    Metadata,
    // ValidatorChunkIndex,ChunkIndex -> Vec<u16>
    MinSpans,
    MaxSpans,
    // TargetEpoch,ValidatorIndex -> AttestationRecord
    AttestationRecords,
    // TargetEpoch,AttestationRoot -> IndexedAttestationWrapper
    Attestations,
    // ValidatorIndex -> Epoch
    LastEpochsWritten,
    // Slot,ValidatorIndex -> ProposalRecord
    ProposalRecords,
}

impl Table {
    const fn tag(self) -> u8 {
        match self {
            Self::Metadata => 0,
            Self::MinSpans => 1,
            Self::MaxSpans => 2,
            Self::AttestationRecords => 3,
            Self::Attestations => 4,
            Self::LastEpochsWritten => 5,
            Self::ProposalRecords => 6,
        }
    }

    const fn spans(kind: SpanKind) -> Self {
        match kind {
            SpanKind::Min => Self::MinSpans,
            SpanKind::Max => Self::MaxSpans,
        }
    }

    const fn key(self) -> TableKey {
        [self.tag()]
    }

    fn single_key(self, value: u64) -> SingleKey {
        let mut key = [0; TABLE_SIZE + INDEX_SIZE];
        key[..TABLE_SIZE].copy_from_slice(&self.key());
        key[TABLE_SIZE..].copy_from_slice(&value.to_be_bytes());
        key
    }

    fn pair_key(self, first: u64, second: u64) -> PairKey {
        let mut key = [0; TABLE_SIZE + 2 * INDEX_SIZE];
        key[..TABLE_SIZE + INDEX_SIZE].copy_from_slice(&self.single_key(first));
        key[TABLE_SIZE + INDEX_SIZE..].copy_from_slice(&second.to_be_bytes());
        key
    }

    fn root_key(self, epoch: Epoch, root: H256) -> RootKey {
        let mut key = [0; TABLE_SIZE + INDEX_SIZE + H256_SIZE];
        key[..TABLE_SIZE + INDEX_SIZE].copy_from_slice(&self.single_key(epoch));
        key[TABLE_SIZE + INDEX_SIZE..].copy_from_slice(root.as_bytes());
        key
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error(
        "slasher database was created with a different chunk layout \
         (stored: {stored:?}, configured: {configured:?})"
    )]
    LayoutMismatch {
        stored: ChunkLayout,
        configured: ChunkLayout,
    },
}

/// Writes produced by one unit of work. Committed in a single transaction.
#[derive(Default)]
pub struct StoreBatch {
    pub chunks: Vec<(ChunkAddress, Chunk)>,
    pub attestation_records: Vec<((Epoch, ValidatorIndex), AttestationRecord)>,
    pub attestations: BTreeMap<(Epoch, H256), Arc<IndexedAttestationWrapper>>,
    pub last_epochs_written: Vec<(ValidatorIndex, Epoch)>,
    pub proposal_records: Vec<((Slot, ValidatorIndex), ProposalRecord)>,
}

impl StoreBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let Self {
            chunks,
            attestation_records,
            attestations,
            last_epochs_written,
            proposal_records,
        } = self;

        chunks.is_empty()
            && attestation_records.is_empty()
            && attestations.is_empty()
            && last_epochs_written.is_empty()
            && proposal_records.is_empty()
    }
}

pub trait SlasherStore: Send + Sync {
    fn load_chunk(&self, address: ChunkAddress) -> Result<Option<Vec<u16>>>;

    fn load_attestation_record(
        &self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<Option<AttestationRecord>>;

    fn load_attestation(
        &self,
        target_epoch: Epoch,
        attestation_root: H256,
    ) -> Result<Option<IndexedAttestationWrapper>>;

    fn load_last_epochs_written(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<Option<Epoch>>>;

    fn load_proposal_record(
        &self,
        validator_index: ValidatorIndex,
        slot: Slot,
    ) -> Result<Option<ProposalRecord>>;

    fn commit(&self, batch: StoreBatch) -> Result<()>;

    /// Deletes records and archived attestations for target epochs before `oldest_epoch`
    /// and proposal records for slots before `oldest_slot`.
    fn prune(&self, oldest_epoch: Epoch, oldest_slot: Slot) -> Result<()>;

    fn save_chunks(&self, chunks: Vec<(ChunkAddress, Chunk)>) -> Result<()> {
        self.commit(StoreBatch {
            chunks,
            ..StoreBatch::default()
        })
    }

    fn save_attestation_records(
        &self,
        attestation_records: Vec<((Epoch, ValidatorIndex), AttestationRecord)>,
    ) -> Result<()> {
        self.commit(StoreBatch {
            attestation_records,
            ..StoreBatch::default()
        })
    }

    fn save_last_epochs_written(
        &self,
        last_epochs_written: Vec<(ValidatorIndex, Epoch)>,
    ) -> Result<()> {
        self.commit(StoreBatch {
            last_epochs_written,
            ..StoreBatch::default()
        })
    }
}

/// [`SlasherStore`] backed by a single [`Database`].
///
/// All tables share one keyspace with a one byte prefix per table and big-endian integers,
/// so keys of a table sort by their leading epoch or slot and a batch commits atomically.
pub struct SlasherDatabase {
    database: Database,
}

impl SlasherDatabase {
    pub fn persistent(
        directory: impl AsRef<Path>,
        max_size: ByteSize,
        layout: ChunkLayout,
    ) -> Result<Self> {
        let database = Database::persistent(DATABASE_NAME, directory, max_size)?;

        Self::new(database, layout)
    }

    pub fn in_memory(layout: ChunkLayout) -> Result<Self> {
        Self::new(Database::in_memory(), layout)
    }

    fn new(database: Database, layout: ChunkLayout) -> Result<Self> {
        let metadata_key = Table::Metadata.key();

        if let Some(bytes) = database.get(metadata_key)? {
            let stored = bincode::deserialize(&bytes)?;

            if stored != layout {
                return Err(Error::LayoutMismatch {
                    stored,
                    configured: layout,
                }
                .into());
            }
        } else {
            database.put(metadata_key, bincode::serialize(&layout)?)?;
        }

        Ok(Self { database })
    }

    fn get<T: DeserializeOwned>(&self, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        self.database
            .get(key)?
            .map(|bytes| bincode::deserialize(&bytes))
            .transpose()
            .map_err(Into::into)
    }
}

impl SlasherStore for SlasherDatabase {
    fn load_chunk(&self, address: ChunkAddress) -> Result<Option<Vec<u16>>> {
        let ChunkAddress {
            kind,
            validator_chunk_index,
            chunk_index,
        } = address;

        self.get(Table::spans(kind).pair_key(validator_chunk_index, chunk_index))
    }

    fn load_attestation_record(
        &self,
        validator_index: ValidatorIndex,
        target_epoch: Epoch,
    ) -> Result<Option<AttestationRecord>> {
        self.get(Table::AttestationRecords.pair_key(target_epoch, validator_index))
    }

    fn load_attestation(
        &self,
        target_epoch: Epoch,
        attestation_root: H256,
    ) -> Result<Option<IndexedAttestationWrapper>> {
        self.get(Table::Attestations.root_key(target_epoch, attestation_root))
    }

    fn load_last_epochs_written(
        &self,
        validator_indices: &[ValidatorIndex],
    ) -> Result<Vec<Option<Epoch>>> {
        validator_indices
            .iter()
            .map(|validator_index| self.get(Table::LastEpochsWritten.single_key(*validator_index)))
            .collect()
    }

    fn load_proposal_record(
        &self,
        validator_index: ValidatorIndex,
        slot: Slot,
    ) -> Result<Option<ProposalRecord>> {
        self.get(Table::ProposalRecords.pair_key(slot, validator_index))
    }

    fn commit(&self, batch: StoreBatch) -> Result<()> {
        let StoreBatch {
            chunks,
            attestation_records,
            attestations,
            last_epochs_written,
            proposal_records,
        } = batch;

        let mut write_batch = WriteBatch::new();

        for (address, chunk) in chunks {
            let key = Table::spans(address.kind)
                .pair_key(address.validator_chunk_index, address.chunk_index);

            write_batch.put(key, serialize(chunk.distances())?);
        }

        for ((target_epoch, validator_index), record) in attestation_records {
            let key = Table::AttestationRecords.pair_key(target_epoch, validator_index);
            write_batch.put(key, serialize(&record)?);
        }

        for ((target_epoch, attestation_root), attestation) in attestations {
            let key = Table::Attestations.root_key(target_epoch, attestation_root);
            write_batch.put(key, serialize(attestation.as_ref())?);
        }

        for (validator_index, epoch) in last_epochs_written {
            let key = Table::LastEpochsWritten.single_key(validator_index);
            write_batch.put(key, serialize(&epoch)?);
        }

        for ((slot, validator_index), record) in proposal_records {
            let key = Table::ProposalRecords.pair_key(slot, validator_index);
            write_batch.put(key, serialize(&record)?);
        }

        if write_batch.is_empty() {
            return Ok(());
        }

        debug!("committing {} slasher database writes", write_batch.len());

        self.database.write(write_batch)
    }

    fn prune(&self, oldest_epoch: Epoch, oldest_slot: Slot) -> Result<()> {
        let mut write_batch = WriteBatch::new();

        write_batch.delete_range(
            Table::AttestationRecords.pair_key(0, 0)
                ..Table::AttestationRecords.pair_key(oldest_epoch, 0),
        );

        write_batch.delete_range(
            Table::Attestations.root_key(0, H256::zero())
                ..Table::Attestations.root_key(oldest_epoch, H256::zero()),
        );

        write_batch.delete_range(
            Table::ProposalRecords.pair_key(0, 0)..Table::ProposalRecords.pair_key(oldest_slot, 0),
        );

        self.database.write(write_batch)
    }
}

fn serialize(value: &(impl Serialize + ?Sized)) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(Into::into)
}
