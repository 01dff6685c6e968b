pub use crate::{
    attestation_votes::{AttestationRecord, RecordedVote},
    blocks::ProposalRecord,
    chunk_address::{CellAddress, ChunkAddress, ChunkLayout},
    messages::{SlasherToValidator, ToSlasher},
    nonstandard::{IndexedAttestationWrapper, SignedBlockHeaderWrapper},
    slasher::{
        AttestationError, AttestationReport, BlockHeaderError, FailedGroup, ProposalReport,
        RejectedAttestation, RejectedBlockHeader, Slasher,
    },
    slasher_config::{ConfigError, SlasherConfig},
    status::{
        AttesterSlashingReason, ExplainedAttesterSlashing, ExplainedProposerSlashing,
        ProposerSlashingReason,
    },
    store::{SlasherDatabase, SlasherStore, StoreBatch},
    targets::{Chunk, SpanKind},
    watermarks::EpochRegression,
};

pub mod containers;
pub mod primitives;

mod attestation_votes;
mod attestations;
mod blocks;
mod chunk_address;
mod grouping;
mod indexed_attestations;
mod messages;
mod nonstandard;
mod slasher;
mod slasher_config;
mod status;
mod store;
mod targets;
mod watermarks;
