use core::num::NonZeroUsize;

use derivative::Derivative;
use thiserror::Error;

use crate::{
    chunk_address::ChunkLayout,
    primitives::{Epoch, Slot, ValidatorIndex},
};

#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct SlasherConfig {
    /// Epochs per span chunk.
    #[derivative(Default(value = "16"))]
    pub chunk_size: u64,
    /// Validators per span chunk. Also the unit of parallelism when processing a batch.
    #[derivative(Default(value = "256"))]
    pub validator_chunk_size: u64,
    /// Number of epochs kept for surround detection. Span chunks form a ring of this length.
    #[derivative(Default(value = "4096"))]
    pub history_length: u64,
    /// Attestations and blocks from validators at or above this index are rejected.
    #[derivative(Default(value = "1 << 21"))]
    pub max_validators: u64,
    #[derivative(Default(value = "32"))]
    pub slots_per_epoch: u64,
    /// Size of the thread pool that processes validator chunks. `None` means one per CPU.
    pub worker_count: Option<NonZeroUsize>,
    /// Number of times the service resubmits attestations of a validator chunk that failed to commit.
    #[derivative(Default(value = "3"))]
    pub max_group_retries: usize,
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum ConfigError {
    #[error("{name} must be positive")]
    Zero { name: &'static str },
    #[error(
        "history length must be a multiple of chunk size \
         (history_length: {history_length}, chunk_size: {chunk_size})"
    )]
    UnalignedHistory {
        history_length: u64,
        chunk_size: u64,
    },
    #[error("history length must be below {} (history_length: {history_length})", u16::MAX)]
    HistoryTooLong { history_length: u64 },
    #[error(
        "chunk does not fit in memory \
         (validator_chunk_size: {validator_chunk_size}, chunk_size: {chunk_size})"
    )]
    ChunkTooLarge {
        validator_chunk_size: u64,
        chunk_size: u64,
    },
}

impl SlasherConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        let Self {
            chunk_size,
            validator_chunk_size,
            history_length,
            max_validators,
            slots_per_epoch,
            worker_count: _,
            max_group_retries: _,
        } = self;

        for (name, value) in [
            ("chunk_size", chunk_size),
            ("validator_chunk_size", validator_chunk_size),
            ("history_length", history_length),
            ("max_validators", max_validators),
            ("slots_per_epoch", slots_per_epoch),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }

        if history_length % chunk_size != 0 {
            return Err(ConfigError::UnalignedHistory {
                history_length,
                chunk_size,
            });
        }

        // Distances are stored as `u16` with `u16::MAX` reserved for "no attestation".
        if history_length >= u64::from(u16::MAX) {
            return Err(ConfigError::HistoryTooLong { history_length });
        }

        validator_chunk_size
            .checked_mul(chunk_size)
            .and_then(|length| usize::try_from(length).ok())
            .ok_or(ConfigError::ChunkTooLarge {
                validator_chunk_size,
                chunk_size,
            })?;

        Ok(self)
    }

    #[must_use]
    pub const fn layout(self) -> ChunkLayout {
        ChunkLayout {
            chunk_size: self.chunk_size,
            validator_chunk_size: self.validator_chunk_size,
            history_length: self.history_length,
        }
    }

    #[must_use]
    pub const fn is_known_validator(self, validator_index: ValidatorIndex) -> bool {
        validator_index < self.max_validators
    }

    #[must_use]
    pub const fn start_slot_at_epoch(self, epoch: Epoch) -> Slot {
        epoch.saturating_mul(self.slots_per_epoch)
    }
}
