use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    containers::{IndexedAttestation, SignedBeaconBlockHeader},
    primitives::{Epoch, Slot, ValidatorIndex, H256},
};

/// An indexed attestation together with the root its attesters signed.
///
/// Committee expansion and signature verification happen before attestations reach the slasher.
#[derive(Clone, PartialEq, Eq, Default, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IndexedAttestationWrapper {
    pub indexed_attestation: IndexedAttestation,
    pub signing_root: H256,
}

impl IndexedAttestationWrapper {
    #[must_use]
    pub const fn source_epoch(&self) -> Epoch {
        self.indexed_attestation.data.source.epoch
    }

    #[must_use]
    pub const fn target_epoch(&self) -> Epoch {
        self.indexed_attestation.data.target.epoch
    }

    #[must_use]
    pub fn attesting_indices(&self) -> &[ValidatorIndex] {
        &self.indexed_attestation.attesting_indices
    }

    /// Digest of the whole wrapper.
    ///
    /// Aggregates with the same signing root but different attesters get different roots.
    pub fn attestation_root(&self) -> Result<H256> {
        let bytes = bincode::serialize(self)?;
        Ok(H256::from_slice(Sha256::digest(bytes).as_slice()))
    }

    /// `true` if `self` strictly surrounds `other`.
    #[must_use]
    pub const fn surrounds(&self, other: &Self) -> bool {
        self.source_epoch() < other.source_epoch() && other.target_epoch() < self.target_epoch()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SignedBlockHeaderWrapper {
    pub signed_header: SignedBeaconBlockHeader,
    pub signing_root: H256,
}

impl SignedBlockHeaderWrapper {
    #[must_use]
    pub const fn slot(&self) -> Slot {
        self.signed_header.message.slot
    }

    #[must_use]
    pub const fn proposer_index(&self) -> ValidatorIndex {
        self.signed_header.message.proposer_index
    }
}
