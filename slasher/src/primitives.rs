use fixed_hash::construct_fixed_hash;
use impl_serde::impl_fixed_hash_serde;

pub use ethereum_types::H256;

pub type CommitteeIndex = u64;
pub type Epoch = u64;
pub type Slot = u64;
pub type ValidatorIndex = u64;

construct_fixed_hash! {
    pub struct SignatureBytes(96);
}

impl_fixed_hash_serde!(SignatureBytes, 96);
