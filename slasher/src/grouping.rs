use std::{collections::BTreeMap, sync::Arc};

use itertools::Itertools as _;

use crate::{
    chunk_address::ChunkLayout,
    nonstandard::IndexedAttestationWrapper,
    primitives::{ValidatorIndex, H256},
};

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GroupedAttestation {
    pub attestation: Arc<IndexedAttestationWrapper>,
    pub attestation_root: H256,
    /// Attesting indices that fall into the validator chunk of the group.
    pub validator_indices: Vec<ValidatorIndex>,
}

pub type Groups = BTreeMap<u64, Vec<GroupedAttestation>>;

/// Splits attestations by validator chunk, keeping input order within each group.
///
/// Attesting indices must be sorted.
pub fn group_by_validator_chunk(
    layout: ChunkLayout,
    attestations: impl IntoIterator<Item = (Arc<IndexedAttestationWrapper>, H256)>,
) -> Groups {
    let mut groups = Groups::new();

    for (attestation, attestation_root) in attestations {
        let chunks = attestation
            .attesting_indices()
            .iter()
            .copied()
            .chunk_by(|validator_index| layout.validator_chunk_index(*validator_index));

        for (validator_chunk_index, validator_indices) in &chunks {
            groups
                .entry(validator_chunk_index)
                .or_default()
                .push(GroupedAttestation {
                    attestation: Arc::clone(&attestation),
                    attestation_root,
                    validator_indices: validator_indices.collect(),
                });
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: ChunkLayout = ChunkLayout {
        chunk_size: 4,
        validator_chunk_size: 4,
        history_length: 16,
    };

    fn build_attestation(
        attesting_indices: Vec<ValidatorIndex>,
        target_epoch: u64,
    ) -> (Arc<IndexedAttestationWrapper>, H256) {
        let mut wrapper = IndexedAttestationWrapper::default();
        wrapper.indexed_attestation.attesting_indices = attesting_indices;
        wrapper.indexed_attestation.data.target.epoch = target_epoch;
        (Arc::new(wrapper), H256::from_low_u64_be(target_epoch))
    }

    #[test]
    fn attestations_are_split_by_validator_chunk() {
        let groups = group_by_validator_chunk(
            LAYOUT,
            [
                build_attestation(vec![1, 3, 4, 9], 5),
                build_attestation(vec![10], 6),
                build_attestation(vec![2, 11], 7),
            ],
        );

        let summary = groups
            .iter()
            .map(|(validator_chunk_index, group)| {
                let members = group
                    .iter()
                    .map(|grouped| (grouped.attestation.target_epoch(), grouped.validator_indices.clone()))
                    .collect_vec();

                (*validator_chunk_index, members)
            })
            .collect_vec();

        assert_eq!(
            summary,
            [
                (0, vec![(5, vec![1, 3]), (7, vec![2])]),
                (1, vec![(5, vec![4])]),
                (2, vec![(5, vec![9]), (6, vec![10]), (7, vec![11])]),
            ],
        );
    }

    #[test]
    fn grouped_attestations_share_the_original() {
        let (attestation, root) = build_attestation(vec![0, 8], 5);
        let groups = group_by_validator_chunk(LAYOUT, [(Arc::clone(&attestation), root)]);

        assert_eq!(groups.len(), 2);

        for grouped in groups.values().flatten() {
            assert!(Arc::ptr_eq(&grouped.attestation, &attestation));
            assert_eq!(grouped.attestation_root, root);
        }
    }
}
