//! Checks proof-and-data streams against the reader's trust state.
//!
//! A stream is consumed one element at a time, outermost first:
//!
//! ```text
//! AwaitRoot --Root--> AwaitBlocks --Block*--> AwaitData --Data--> Done
//! ```
//!
//! A block may also arrive in `AwaitRoot` when it hangs off a hash that is
//! already trusted. Any failure clears the whole read state and leaves the
//! verifier `Untrusted`.

use crate::shared::crypto::{hash_block, hash_data, Hash, PublicKey};
use crate::shared::dc_repr::ProofElement;
use crate::shared::readstate::ReadState;

use super::DCClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    AwaitRoot,
    AwaitBlocks,
    AwaitData,
    Done,
    Untrusted,
}

pub struct ProofVerifier<'a> {
    read_state: &'a mut ReadState,
    writer_key: &'a PublicKey,
    target: Hash,
    state: VerifyState,
}

impl<'a> ProofVerifier<'a> {
    pub fn new(read_state: &'a mut ReadState, writer_key: &'a PublicKey, target: Hash) -> Self {
        let state = if read_state.contains(&target) {
            VerifyState::AwaitData
        } else {
            VerifyState::AwaitRoot
        };
        Self {
            read_state,
            writer_key,
            target,
            state,
        }
    }

    pub fn state(&self) -> VerifyState {
        self.state
    }

    pub fn accept(&mut self, element: &ProofElement) -> Result<(), DCClientError> {
        let r = self.step(element);
        if r.is_err() {
            self.read_state.clear();
            self.state = VerifyState::Untrusted;
        }
        r
    }

    fn step(&mut self, element: &ProofElement) -> Result<(), DCClientError> {
        match (self.state, element) {
            (VerifyState::AwaitRoot, ProofElement::Root(root)) => {
                if !root.verify(self.writer_key) {
                    return Err(DCClientError::SignatureInvalid);
                }
                self.read_state.add_signed_root(&root.blockhash);
                self.state = VerifyState::AwaitBlocks;
            }
            (VerifyState::AwaitRoot | VerifyState::AwaitBlocks, ProofElement::Block(block)) => {
                if !self.read_state.contains(&hash_block(block)) {
                    return Err(DCClientError::ChainVerificationFailed);
                }
                self.read_state.add_proven_block(block);
                self.state = VerifyState::AwaitBlocks;
            }
            (VerifyState::AwaitData, ProofElement::Data(data)) => {
                if hash_data(data) != self.target || !self.read_state.contains(&self.target) {
                    return Err(DCClientError::ChainVerificationFailed);
                }
                self.state = VerifyState::Done;
                return Ok(());
            }
            _ => return Err(DCClientError::ChainVerificationFailed),
        }
        if self.read_state.contains(&self.target) {
            self.state = VerifyState::AwaitData;
        }
        Ok(())
    }

    /// Verifies a full read stream and returns the (still encrypted) record.
    pub fn verify_read(mut self, elements: &[ProofElement]) -> Result<Vec<u8>, DCClientError> {
        for e in elements {
            self.accept(e)?;
        }
        match (self.state, elements.last()) {
            (VerifyState::Done, Some(ProofElement::Data(data))) => Ok(data.clone()),
            _ => {
                self.read_state.clear();
                Err(DCClientError::ChainVerificationFailed)
            }
        }
    }

    /// Verifies an inclusion proof that carries no data.
    pub fn verify_inclusion(mut self, elements: &[ProofElement]) -> Result<(), DCClientError> {
        for e in elements {
            self.accept(e)?;
        }
        if self.state == VerifyState::AwaitData {
            Ok(())
        } else {
            self.read_state.clear();
            Err(DCClientError::ChainVerificationFailed)
        }
    }
}
