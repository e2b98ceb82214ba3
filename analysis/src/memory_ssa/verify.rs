use alloc::vec::Vec;

use memssa_ir::Function;

use super::{MemoryAccessId, MemoryAccessKind, MemorySsa};
use crate::MemorySsaError;

impl MemorySsa {
    /// Check the internal consistency of the graph against `func`, returning the first violation
    /// found.
    pub fn verify(&self, func: &Function) -> Result<(), MemorySsaError> {
        self.verify_ordering(func)?;
        self.verify_def_uses()?;
        self.verify_domination()?;
        log::trace!(target: "memssa:verify", "memory ssa for '{}' is valid", func.name);
        Ok(())
    }

    /// Like [Self::verify], but panics with the violation
    #[track_caller]
    pub fn assert_valid(&self, func: &Function) {
        if let Err(err) = self.verify(func) {
            panic!("invalid memory ssa for '{}': {err}", func.name);
        }
    }

    /// Check that the access lists of each block match, in order, the accesses of its phi and
    /// instructions, and that the definitions lists are the definitions and phis of those.
    pub fn verify_ordering(&self, func: &Function) -> Result<(), MemorySsaError> {
        for block in func.layout.blocks().iter().copied() {
            let expected = self
                .memory_phi(block)
                .into_iter()
                .chain(
                    func.layout
                        .block_insts(block)
                        .iter()
                        .filter_map(|inst| self.memory_access(*inst)),
                )
                .collect::<Vec<_>>();
            let actual = self.block_accesses(block).unwrap_or_default();
            if actual != expected.as_slice() {
                log::debug!(
                    target: "memssa:verify",
                    "accesses of {block} are {actual:?}, expected {expected:?}"
                );
                return Err(MemorySsaError::OrderingMismatch { block });
            }

            let expected_defs = expected
                .iter()
                .copied()
                .filter(|access| self.access(*access).is_def_or_phi())
                .collect::<Vec<_>>();
            let actual_defs = self.block_defs(block).unwrap_or_default();
            if actual_defs != expected_defs.as_slice() {
                log::debug!(
                    target: "memssa:verify",
                    "definitions of {block} are {actual_defs:?}, expected {expected_defs:?}"
                );
                return Err(MemorySsaError::DefsListMismatch { block });
            }
        }

        Ok(())
    }

    /// Check that every access dominates each of its users
    pub fn verify_domination(&self) -> Result<(), MemorySsaError> {
        for (def, access) in self.accesses() {
            for user in access.users().iter().copied() {
                if !self.dominates_use(def, user) {
                    return Err(MemorySsaError::DominationViolation { def, user });
                }
            }
        }

        Ok(())
    }

    /// Check that every reference from one access to another is mirrored in the users of the
    /// latter, that only live-on-entry lacks a defining access, and that phis have one incoming
    /// value per predecessor of their block.
    pub fn verify_def_uses(&self) -> Result<(), MemorySsaError> {
        for (id, access) in self.accesses() {
            match access.kind() {
                MemoryAccessKind::Def(use_or_def) | MemoryAccessKind::Use(use_or_def) => {
                    match use_or_def.defining_access() {
                        Some(def) => self.verify_operand(def, id)?,
                        None if self.is_live_on_entry_def(id) => (),
                        None => return Err(MemorySsaError::MissingDefiningAccess(id)),
                    }
                }
                MemoryAccessKind::Phi(phi) => {
                    let block = access.block();
                    let preds = self.cfg.predecessors(block);
                    if phi.num_incoming() != preds.len() {
                        return Err(MemorySsaError::IncompletePhi {
                            phi: id,
                            block,
                            incoming: phi.num_incoming(),
                            predecessors: preds.len(),
                        });
                    }
                    for (pred, value) in phi.incoming().iter().copied() {
                        if !preds.contains(&pred) {
                            return Err(MemorySsaError::UnknownPhiPredecessor { phi: id, pred });
                        }
                        self.verify_operand(value, id)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn verify_operand(
        &self,
        def: MemoryAccessId,
        user: MemoryAccessId,
    ) -> Result<(), MemorySsaError> {
        if !self.is_valid_access(def) {
            return Err(MemorySsaError::MissingDefiningAccess(user));
        }
        let def_access = self.access(def);
        if def_access.is_use() {
            return Err(MemorySsaError::UseAsDefinition { use_: def, user });
        }
        if !def_access.users().contains(&user) {
            return Err(MemorySsaError::MissingUser { def, user });
        }
        Ok(())
    }
}
