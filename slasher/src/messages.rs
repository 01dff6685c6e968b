use futures::channel::mpsc::UnboundedSender;
use log::warn;

use crate::{
    containers::{AttesterSlashing, ProposerSlashing},
    nonstandard::{IndexedAttestationWrapper, SignedBlockHeaderWrapper},
    primitives::Epoch,
};

pub enum ToSlasher {
    Attestations {
        current_epoch: Epoch,
        attestations: Vec<IndexedAttestationWrapper>,
    },
    BlockHeaders(Vec<SignedBlockHeaderWrapper>),
    Prune(Epoch),
    Stop,
}

impl ToSlasher {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to slasher failed because the receiver was dropped");
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum SlasherToValidator {
    AttesterSlashing(AttesterSlashing),
    ProposerSlashing(ProposerSlashing),
}

impl SlasherToValidator {
    pub fn send(self, tx: &UnboundedSender<Self>) {
        if tx.unbounded_send(self).is_err() {
            warn!("send to validator failed because the receiver was dropped");
        }
    }
}
