use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    primitives::{Epoch, ValidatorIndex},
    targets::SpanKind,
};

/// Geometry of the span tables.
///
/// A chunk holds `validator_chunk_size` rows of `chunk_size` distances. Epochs are taken modulo
/// `history_length`, so the chunks of one validator chunk form a ring over the retained history.
/// All three values are fixed for the lifetime of a database.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkLayout {
    pub chunk_size: u64,
    pub validator_chunk_size: u64,
    pub history_length: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChunkAddress {
    pub kind: SpanKind,
    pub validator_chunk_index: u64,
    pub chunk_index: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CellAddress {
    pub validator_chunk_index: u64,
    pub chunk_index: u64,
    pub offset: usize,
}

impl ChunkLayout {
    #[must_use]
    pub const fn validator_chunk_index(self, validator_index: ValidatorIndex) -> u64 {
        validator_index / self.validator_chunk_size
    }

    #[must_use]
    pub const fn chunk_index(self, epoch: Epoch) -> u64 {
        epoch % self.history_length / self.chunk_size
    }

    pub fn offset(self, validator_index: ValidatorIndex, epoch: Epoch) -> Result<usize> {
        let row = validator_index % self.validator_chunk_size;
        let column = epoch % self.history_length % self.chunk_size;
        Ok(usize::try_from(row * self.chunk_size + column)?)
    }

    pub fn cell(self, validator_index: ValidatorIndex, epoch: Epoch) -> Result<CellAddress> {
        Ok(CellAddress {
            validator_chunk_index: self.validator_chunk_index(validator_index),
            chunk_index: self.chunk_index(epoch),
            offset: self.offset(validator_index, epoch)?,
        })
    }

    pub fn chunk_length(self) -> Result<usize> {
        Ok(usize::try_from(self.validator_chunk_size * self.chunk_size)?)
    }

    /// Oldest epoch whose span cells are still meaningful when the chain is at `current_epoch`.
    #[must_use]
    pub const fn oldest_retained_epoch(self, current_epoch: Epoch) -> Epoch {
        current_epoch.saturating_sub(self.history_length - 1)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;

    use super::*;

    const LAYOUT: ChunkLayout = ChunkLayout {
        chunk_size: 4,
        validator_chunk_size: 3,
        history_length: 16,
    };

    #[test_case(0, 0 => (0, 0, 0))]
    #[test_case(1, 0 => (0, 0, 4))]
    #[test_case(2, 3 => (0, 0, 11))]
    #[test_case(3, 3 => (1, 0, 3))]
    #[test_case(4, 5 => (1, 1, 5))]
    #[test_case(7, 15 => (2, 3, 7))]
    #[test_case(7, 16 => (2, 0, 4); "epochs wrap around the history")]
    #[test_case(7, 21 => (2, 1, 5); "wrapped epoch in second chunk")]
    fn cell_address(validator_index: ValidatorIndex, epoch: Epoch) -> (u64, u64, usize) {
        let cell = LAYOUT
            .cell(validator_index, epoch)
            .expect("offsets of a small layout fit in usize");

        (cell.validator_chunk_index, cell.chunk_index, cell.offset)
    }

    #[test]
    fn addressing_is_injective_within_history() -> Result<()> {
        let mut seen = HashSet::new();

        for validator_index in 0..12 {
            for epoch in 100..100 + LAYOUT.history_length {
                let cell = LAYOUT.cell(validator_index, epoch)?;
                let key = (cell.validator_chunk_index, cell.chunk_index, cell.offset);

                assert!(seen.insert(key), "{key:?} is addressed twice");
                assert!(cell.offset < LAYOUT.chunk_length()?);
            }
        }

        Ok(())
    }

    #[test]
    fn oldest_retained_epoch_saturates() {
        assert_eq!(LAYOUT.oldest_retained_epoch(3), 0);
        assert_eq!(LAYOUT.oldest_retained_epoch(15), 0);
        assert_eq!(LAYOUT.oldest_retained_epoch(16), 1);
        assert_eq!(LAYOUT.oldest_retained_epoch(40), 25);
    }
}
