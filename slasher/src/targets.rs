use std::collections::{btree_map::Entry, BTreeMap};

use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::{
    chunk_address::{ChunkAddress, ChunkLayout},
    primitives::{Epoch, ValidatorIndex},
    store::SlasherStore,
};

// min-max surround detection, see <https://hackmd.io/@sproul/min-max-slasher>.
//
// For validator `v` and epoch `e`:
// - `min_span[v][e]` is the smallest `target - e` over attestations of `v` with `source > e`.
// - `max_span[v][e]` is the largest `target - e` over attestations of `v` with `source < e`.
//
// A new attestation `(s, t)` surrounds an existing one iff `t > s + min_span[v][s]`
// and is surrounded by an existing one iff `t < s + max_span[v][s]`.

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Deserialize, Serialize)]
pub enum SpanKind {
    Min,
    Max,
}

impl SpanKind {
    /// Distance stored in cells no attestation has written to.
    ///
    /// A real max distance is never 0 because it is only written for epochs below the target.
    #[must_use]
    pub const fn neutral(self) -> u16 {
        match self {
            Self::Min => u16::MAX,
            Self::Max => 0,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Chunk {
    kind: SpanKind,
    distances: Vec<u16>,
}

impl Chunk {
    #[must_use]
    pub fn neutral(kind: SpanKind, length: usize) -> Self {
        Self {
            kind,
            distances: vec![kind.neutral(); length],
        }
    }

    pub fn from_distances(kind: SpanKind, distances: Vec<u16>, length: usize) -> Result<Self> {
        ensure!(
            distances.len() == length,
            "stored {kind:?} chunk has {} cells instead of {length}",
            distances.len(),
        );

        Ok(Self { kind, distances })
    }

    #[must_use]
    pub const fn kind(&self) -> SpanKind {
        self.kind
    }

    #[must_use]
    pub fn distances(&self) -> &[u16] {
        &self.distances
    }

    /// Target epoch recorded for the cell at `offset`, or `None` if the cell is neutral.
    fn target(&self, offset: usize, epoch: Epoch) -> Result<Option<Epoch>> {
        let distance = self.distance(offset)?;

        if distance == self.kind.neutral() {
            return Ok(None);
        }

        Ok(Some(epoch + Epoch::from(distance)))
    }

    fn distance(&self, offset: usize) -> Result<u16> {
        self.distances
            .get(offset)
            .copied()
            .ok_or_else(|| anyhow!("offset {offset} is outside of {:?} chunk", self.kind))
    }

    // Returns `true` if the cell changed.
    fn set_distance(&mut self, offset: usize, distance: u16) -> Result<bool> {
        let kind = self.kind;

        let cell = self
            .distances
            .get_mut(offset)
            .ok_or_else(|| anyhow!("offset {offset} is outside of {kind:?} chunk"))?;

        let changed = *cell != distance;
        *cell = distance;
        Ok(changed)
    }
}

struct CachedChunk {
    chunk: Chunk,
    dirty: bool,
}

/// Span chunks of a single validator chunk.
///
/// Chunks are loaded from the store on first use and kept until the owner is consumed by
/// [`Targets::into_dirty_chunks`], so an update that crosses several chunks loads each of them once.
pub struct Targets<'store, S: ?Sized> {
    layout: ChunkLayout,
    validator_chunk_index: u64,
    store: &'store S,
    chunks: BTreeMap<(SpanKind, u64), CachedChunk>,
}

impl<'store, S: SlasherStore + ?Sized> Targets<'store, S> {
    pub const fn new(layout: ChunkLayout, validator_chunk_index: u64, store: &'store S) -> Self {
        Self {
            layout,
            validator_chunk_index,
            store,
            chunks: BTreeMap::new(),
        }
    }

    /// Returns the target epoch of an existing attestation that the new one surrounds.
    pub fn check_for_surrounding_entry(
        &mut self,
        validator_index: ValidatorIndex,
        source_epoch: Epoch,
        target_epoch: Epoch,
    ) -> Result<Option<Epoch>> {
        let min_target = self.target_at(SpanKind::Min, validator_index, source_epoch)?;

        Ok(min_target.filter(|min_target| target_epoch > *min_target))
    }

    /// Returns the target epoch of an existing attestation that surrounds the new one.
    pub fn check_for_surrounded_entry(
        &mut self,
        validator_index: ValidatorIndex,
        source_epoch: Epoch,
        target_epoch: Epoch,
    ) -> Result<Option<Epoch>> {
        let max_target = self.target_at(SpanKind::Max, validator_index, source_epoch)?;

        Ok(max_target.filter(|max_target| target_epoch < *max_target))
    }

    pub fn update(
        &mut self,
        validator_index: ValidatorIndex,
        source_epoch: Epoch,
        target_epoch: Epoch,
        current_epoch: Epoch,
    ) -> Result<()> {
        self.update_min_targets(validator_index, source_epoch, target_epoch, current_epoch)?;
        self.update_max_targets(validator_index, source_epoch, target_epoch, current_epoch)?;

        Ok(())
    }

    /// Neutralizes the cells of epochs that entered the window since `last_epoch_written`.
    ///
    /// Those cells still hold distances recorded `history_length` epochs earlier.
    pub fn reset_epochs(
        &mut self,
        validator_index: ValidatorIndex,
        last_epoch_written: Epoch,
        current_epoch: Epoch,
    ) -> Result<()> {
        let layout = self.layout;
        let oldest_epoch = layout.oldest_retained_epoch(current_epoch);
        let first_epoch = (last_epoch_written + 1).max(oldest_epoch);

        for kind in [SpanKind::Min, SpanKind::Max] {
            let mut epoch = first_epoch;

            while epoch <= current_epoch {
                let chunk_index = layout.chunk_index(epoch);
                let cached = self.chunk_mut(kind, chunk_index)?;

                while epoch <= current_epoch && layout.chunk_index(epoch) == chunk_index {
                    let offset = layout.offset(validator_index, epoch)?;
                    cached.dirty |= cached.chunk.set_distance(offset, kind.neutral())?;
                    epoch += 1;
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn into_dirty_chunks(self) -> Vec<(ChunkAddress, Chunk)> {
        let validator_chunk_index = self.validator_chunk_index;

        self.chunks
            .into_iter()
            .filter(|(_, cached)| cached.dirty)
            .map(|((kind, chunk_index), cached)| {
                let address = ChunkAddress {
                    kind,
                    validator_chunk_index,
                    chunk_index,
                };

                (address, cached.chunk)
            })
            .collect()
    }

    // Walks down from `source_epoch - 1`. Cells below the first one that is already tighter
    // are tighter too, because they cover a superset of sources.
    fn update_min_targets(
        &mut self,
        validator_index: ValidatorIndex,
        source_epoch: Epoch,
        target_epoch: Epoch,
        current_epoch: Epoch,
    ) -> Result<()> {
        let oldest_epoch = self.layout.oldest_retained_epoch(current_epoch);

        if source_epoch <= oldest_epoch {
            return Ok(());
        }

        let mut epoch = source_epoch - 1;

        loop {
            let chunk_index = self.layout.chunk_index(epoch);
            let layout = self.layout;
            let cached = self.chunk_mut(SpanKind::Min, chunk_index)?;

            loop {
                let offset = layout.offset(validator_index, epoch)?;

                if let Some(min_target) = cached.chunk.target(offset, epoch)? {
                    if target_epoch >= min_target {
                        return Ok(());
                    }
                }

                let distance = u16::try_from(target_epoch - epoch)?;
                cached.dirty |= cached.chunk.set_distance(offset, distance)?;

                if epoch == oldest_epoch {
                    return Ok(());
                }

                epoch -= 1;

                if layout.chunk_index(epoch) != chunk_index {
                    break;
                }
            }
        }
    }

    // Walks up from `source_epoch + 1`, or from the oldest retained epoch if the source is older.
    // Stops at the target at the latest since no cell at or above it can hold a larger target.
    fn update_max_targets(
        &mut self,
        validator_index: ValidatorIndex,
        source_epoch: Epoch,
        target_epoch: Epoch,
        current_epoch: Epoch,
    ) -> Result<()> {
        if source_epoch >= current_epoch {
            return Ok(());
        }

        let oldest_epoch = self.layout.oldest_retained_epoch(current_epoch);
        let mut epoch = (source_epoch + 1).max(oldest_epoch);

        loop {
            let chunk_index = self.layout.chunk_index(epoch);
            let layout = self.layout;
            let cached = self.chunk_mut(SpanKind::Max, chunk_index)?;

            loop {
                let offset = layout.offset(validator_index, epoch)?;
                let max_target = cached.chunk.target(offset, epoch)?.unwrap_or(epoch);

                if target_epoch <= max_target {
                    return Ok(());
                }

                let distance = u16::try_from(target_epoch - epoch)?;
                cached.dirty |= cached.chunk.set_distance(offset, distance)?;

                if epoch == current_epoch {
                    return Ok(());
                }

                epoch += 1;

                if layout.chunk_index(epoch) != chunk_index {
                    break;
                }
            }
        }
    }

    fn target_at(
        &mut self,
        kind: SpanKind,
        validator_index: ValidatorIndex,
        epoch: Epoch,
    ) -> Result<Option<Epoch>> {
        let offset = self.layout.offset(validator_index, epoch)?;
        let chunk_index = self.layout.chunk_index(epoch);

        self.chunk_mut(kind, chunk_index)?
            .chunk
            .target(offset, epoch)
    }

    fn chunk_mut(&mut self, kind: SpanKind, chunk_index: u64) -> Result<&mut CachedChunk> {
        match self.chunks.entry((kind, chunk_index)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let address = ChunkAddress {
                    kind,
                    validator_chunk_index: self.validator_chunk_index,
                    chunk_index,
                };

                let length = self.layout.chunk_length()?;

                let chunk = match self.store.load_chunk(address)? {
                    Some(distances) => Chunk::from_distances(kind, distances, length)?,
                    None => Chunk::neutral(kind, length),
                };

                Ok(entry.insert(CachedChunk {
                    chunk,
                    dirty: false,
                }))
            }
        }
    }
}
