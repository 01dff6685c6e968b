use std::collections::BTreeMap;

use anyhow::{ensure, Result};
use thiserror::Error;

use crate::{
    primitives::{Epoch, ValidatorIndex},
    store::SlasherStore,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WatermarkStatus {
    /// Span columns may be brought forward to the current epoch and written.
    Advance { last_epoch_written: Option<Epoch> },
    /// Span columns were already written for a later epoch. They are only read.
    Regressed { last_epoch_written: Epoch },
}

impl WatermarkStatus {
    #[must_use]
    pub fn classify(last_epoch_written: Option<Epoch>, current_epoch: Epoch) -> Self {
        match last_epoch_written {
            Some(last_epoch_written) if last_epoch_written > current_epoch => {
                Self::Regressed { last_epoch_written }
            }
            _ => Self::Advance { last_epoch_written },
        }
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Advance { .. })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error(
    "span columns of validator {validator_index} were already written for epoch \
     {last_epoch_written}, which is after the batch epoch {current_epoch}"
)]
pub struct EpochRegression {
    pub validator_index: ValidatorIndex,
    pub last_epoch_written: Epoch,
    pub current_epoch: Epoch,
}

/// Last epochs written of the validators touched by one group.
pub struct EpochWatermarks {
    current_epoch: Epoch,
    statuses: BTreeMap<ValidatorIndex, WatermarkStatus>,
}

impl EpochWatermarks {
    pub fn load<S: SlasherStore + ?Sized>(
        store: &S,
        validator_indices: &[ValidatorIndex],
        current_epoch: Epoch,
    ) -> Result<Self> {
        let last_epochs_written = store.load_last_epochs_written(validator_indices)?;

        ensure!(
            last_epochs_written.len() == validator_indices.len(),
            "store returned {} watermarks for {} validators",
            last_epochs_written.len(),
            validator_indices.len(),
        );

        let statuses = validator_indices
            .iter()
            .copied()
            .zip(last_epochs_written)
            .map(|(validator_index, last_epoch_written)| {
                let status = WatermarkStatus::classify(last_epoch_written, current_epoch);
                (validator_index, status)
            })
            .collect();

        Ok(Self {
            current_epoch,
            statuses,
        })
    }

    #[must_use]
    pub fn status(&self, validator_index: ValidatorIndex) -> Option<WatermarkStatus> {
        self.statuses.get(&validator_index).copied()
    }

    pub fn statuses(&self) -> impl Iterator<Item = (ValidatorIndex, WatermarkStatus)> + '_ {
        self.statuses
            .iter()
            .map(|(validator_index, status)| (*validator_index, *status))
    }

    #[must_use]
    pub fn regressions(&self) -> Vec<EpochRegression> {
        self.statuses()
            .filter_map(|(validator_index, status)| match status {
                WatermarkStatus::Advance { .. } => None,
                WatermarkStatus::Regressed { last_epoch_written } => Some(EpochRegression {
                    validator_index,
                    last_epoch_written,
                    current_epoch: self.current_epoch,
                }),
            })
            .collect()
    }

    /// Watermarks that change once the group is committed.
    #[must_use]
    pub fn into_updates(self) -> Vec<(ValidatorIndex, Epoch)> {
        let current_epoch = self.current_epoch;

        self.statuses
            .into_iter()
            .filter(|(_, status)| match status {
                WatermarkStatus::Advance { last_epoch_written } => {
                    *last_epoch_written != Some(current_epoch)
                }
                WatermarkStatus::Regressed { .. } => false,
            })
            .map(|(validator_index, _)| (validator_index, current_epoch))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use crate::{chunk_address::ChunkLayout, store::SlasherDatabase};

    use super::*;

    #[test_case(None, 5 => WatermarkStatus::Advance { last_epoch_written: None })]
    #[test_case(Some(3), 5 => WatermarkStatus::Advance { last_epoch_written: Some(3) })]
    #[test_case(Some(5), 5 => WatermarkStatus::Advance { last_epoch_written: Some(5) })]
    #[test_case(Some(6), 5 => WatermarkStatus::Regressed { last_epoch_written: 6 })]
    fn classify(last_epoch_written: Option<Epoch>, current_epoch: Epoch) -> WatermarkStatus {
        WatermarkStatus::classify(last_epoch_written, current_epoch)
    }

    #[test]
    fn only_changed_watermarks_are_written() -> Result<()> {
        let store = SlasherDatabase::in_memory(ChunkLayout {
            chunk_size: 4,
            validator_chunk_size: 4,
            history_length: 16,
        })?;

        store.save_last_epochs_written(vec![(1, 3), (2, 7), (3, 9)])?;

        let watermarks = EpochWatermarks::load(&store, &[0, 1, 2, 3], 7)?;

        assert_eq!(
            watermarks.regressions(),
            [EpochRegression {
                validator_index: 3,
                last_epoch_written: 9,
                current_epoch: 7,
            }],
        );

        assert_eq!(watermarks.into_updates(), [(0, 7), (1, 7)]);

        Ok(())
    }
}
