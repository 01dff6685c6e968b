use crate::{
    containers::{AttesterSlashing, IndexedAttestation, ProposerSlashing},
    primitives::ValidatorIndex,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProposerSlashingReason {
    DoubleProposal,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExplainedProposerSlashing {
    pub offender_index: ValidatorIndex,
    pub slashing: ProposerSlashing,
    pub reason: ProposerSlashingReason,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum AttesterSlashingReason {
    DoubleVote,
    /// The new attestation surrounds the existing one.
    Surrounding,
    /// The new attestation is surrounded by the existing one.
    Surrounded,
}

/// `slashing.attestation_1` is the attestation that was already recorded and
/// `slashing.attestation_2` is the one that revealed the offense.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExplainedAttesterSlashing {
    pub offender_index: ValidatorIndex,
    pub slashing: AttesterSlashing,
    pub reason: AttesterSlashingReason,
}

impl ExplainedAttesterSlashing {
    #[must_use]
    pub const fn surrounding(&self) -> Option<&IndexedAttestation> {
        match self.reason {
            AttesterSlashingReason::DoubleVote => None,
            AttesterSlashingReason::Surrounding => Some(&self.slashing.attestation_2),
            AttesterSlashingReason::Surrounded => Some(&self.slashing.attestation_1),
        }
    }

    #[must_use]
    pub const fn surrounded(&self) -> Option<&IndexedAttestation> {
        match self.reason {
            AttesterSlashingReason::DoubleVote => None,
            AttesterSlashingReason::Surrounding => Some(&self.slashing.attestation_1),
            AttesterSlashingReason::Surrounded => Some(&self.slashing.attestation_2),
        }
    }
}
