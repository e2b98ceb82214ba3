use alloc::vec::Vec;

use memssa_ir::{Block, Function, Inst};

use super::{MemoryAccess, MemoryAccessId, MemoryAccessKind, MemorySsa};
use crate::AliasAnalysis;

/// Where to insert an access into the lists of a block
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertionPlace {
    /// Before every other access, but after the phi, unless the access is itself the phi
    Beginning,
    /// After every other access
    End,
}

/// Mutation
///
/// These operations keep the def-use edges of the graph consistent, but it is the caller's
/// responsibility to keep the graph in sync with the function: an access must be placed in the
/// lists of the block containing its instruction, in the order of the instructions.
impl MemorySsa {
    /// Create a phi for `block`, and place it at the start of the block.
    ///
    /// The phi has no incoming values, see [Self::add_incoming].
    ///
    /// # Panics
    ///
    /// Panics if `block` already has a phi.
    pub fn create_memory_phi(&mut self, block: Block) -> MemoryAccessId {
        assert!(
            !self.block_phis.contains_key(&block),
            "a memory phi already exists for {block}"
        );
        let id = self.next_def_id();
        let phi = self.accesses.push(Some(MemoryAccess::new_phi(id, block)));
        self.insert_into_lists_for_block(phi, block, InsertionPlace::Beginning);
        self.block_phis.insert(block, phi);
        phi
    }

    /// Create the access for `inst`, defined by `definition`.
    ///
    /// The new access is registered for `inst` but not placed in any list, which must be done
    /// with [Self::insert_into_lists_for_block] or [Self::insert_into_lists_before].
    ///
    /// # Panics
    ///
    /// Panics if `inst` does not touch memory, is not in the layout, or if `definition` is a use.
    pub fn create_defined_access(
        &mut self,
        func: &Function,
        aa: &dyn AliasAnalysis,
        inst: Inst,
        definition: MemoryAccessId,
    ) -> MemoryAccessId {
        assert!(
            !self.access(definition).is_use(),
            "a memory use cannot be a defining access"
        );
        let block = func
            .layout
            .inst_block(inst)
            .unwrap_or_else(|| panic!("{inst} is not in the layout"));
        let access = self
            .create_new_access(func, aa, inst, block)
            .unwrap_or_else(|| panic!("{inst} does not touch memory"));
        self.set_defining_access(access, definition);
        access
    }

    /// Insert `access` into the lists of `block` at `place`.
    ///
    /// A phi always goes first. Anything else inserted at the beginning goes after the phi.
    /// Inserting a definition or phi drops every cached clobber in the graph.
    pub fn insert_into_lists_for_block(
        &mut self,
        access: MemoryAccessId,
        block: Block,
        place: InsertionPlace,
    ) {
        self.access_mut(access).block = block;
        let is_phi = self.access(access).is_phi();
        let is_use = self.access(access).is_use();

        let phi_end = |accesses: &[MemoryAccessId], mssa: &Self| {
            accesses.iter().position(|id| !mssa.access(*id).is_phi()).unwrap_or(accesses.len())
        };

        match place {
            InsertionPlace::Beginning if is_phi => {
                self.per_block_accesses.entry(block).or_default().insert(0, access);
                self.per_block_defs.entry(block).or_default().insert(0, access);
            }
            InsertionPlace::Beginning => {
                let mut accesses = self.per_block_accesses.remove(&block).unwrap_or_default();
                let index = phi_end(&accesses, self);
                accesses.insert(index, access);
                self.per_block_accesses.insert(block, accesses);
                if !is_use {
                    let mut defs = self.per_block_defs.remove(&block).unwrap_or_default();
                    let index = phi_end(&defs, self);
                    defs.insert(index, access);
                    self.per_block_defs.insert(block, defs);
                }
            }
            InsertionPlace::End => {
                self.per_block_accesses.entry(block).or_default().push(access);
                if !is_use {
                    self.per_block_defs.entry(block).or_default().push(access);
                }
            }
        }

        if !is_use {
            self.reset_all_optimized();
        }
        self.invalidate_block_numbering(block);
    }

    /// Insert `access` into the lists of `block`, immediately before `before`, or at the end of
    /// the block if `before` is `None`.
    ///
    /// # Panics
    ///
    /// Panics if `before` is not in the access list of `block`.
    pub fn insert_into_lists_before(
        &mut self,
        access: MemoryAccessId,
        block: Block,
        before: Option<MemoryAccessId>,
    ) {
        let Some(before) = before else {
            self.insert_into_lists_for_block(access, block, InsertionPlace::End);
            return;
        };

        self.access_mut(access).block = block;
        let mut accesses = self.per_block_accesses.remove(&block).unwrap_or_default();
        let index = accesses
            .iter()
            .position(|id| *id == before)
            .unwrap_or_else(|| panic!("{before} is not an access of {block}"));
        accesses.insert(index, access);

        if !self.access(access).is_use() {
            // The definition following `access` in program order, if any, is where it goes in the
            // definitions list
            let next_def = accesses[index + 1..]
                .iter()
                .copied()
                .find(|id| self.access(*id).is_def_or_phi());
            let defs = self.per_block_defs.entry(block).or_default();
            match next_def.and_then(|next| defs.iter().position(|id| *id == next)) {
                Some(position) => defs.insert(position, access),
                None => defs.push(access),
            }
            self.reset_all_optimized();
        }

        self.per_block_accesses.insert(block, accesses);
        self.invalidate_block_numbering(block);
    }

    /// Move the use or definition `access` to `place` in `block`.
    ///
    /// # Panics
    ///
    /// Panics if `access` is a phi.
    pub fn move_to(&mut self, access: MemoryAccessId, block: Block, place: InsertionPlace) {
        self.prepare_for_move(access);
        self.insert_into_lists_for_block(access, block, place);
    }

    /// Move the use or definition `access` immediately before `before` in `block`, or to the end
    /// of `block` if `before` is `None`.
    ///
    /// # Panics
    ///
    /// Panics if `access` is a phi.
    pub fn move_to_before(
        &mut self,
        access: MemoryAccessId,
        block: Block,
        before: Option<MemoryAccessId>,
    ) {
        self.prepare_for_move(access);
        self.insert_into_lists_before(access, block, before);
    }

    fn prepare_for_move(&mut self, access: MemoryAccessId) {
        assert!(!self.access(access).is_phi(), "memory phis cannot be moved");
        // Whatever clobbered the access at its old position need not at the new one
        self.reset_optimized(access);
        self.remove_from_lists(access);
    }

    /// Remove `access` from the lists of its block, keeping it in the lookup tables
    fn remove_from_lists(&mut self, access: MemoryAccessId) {
        let block = self.access(access).block;
        for lists in [&mut self.per_block_accesses, &mut self.per_block_defs] {
            if let Some(list) = lists.get_mut(&block) {
                list.retain(|id| *id != access);
                if list.is_empty() {
                    lists.remove(&block);
                }
            }
        }
        self.block_numbering.get_mut().remove(&access);
        self.invalidate_block_numbering(block);
    }

    /// Remove `access` from the graph entirely.
    ///
    /// Its own references to other accesses are dropped, as is every cached clobber which refers
    /// to it. The handle becomes invalid.
    ///
    /// # Panics
    ///
    /// Panics if `access` still has users, or is the live-on-entry definition.
    pub fn remove_from_lookups_and_lists(&mut self, access: MemoryAccessId) {
        assert!(
            !self.is_live_on_entry_def(access),
            "the live-on-entry definition cannot be removed"
        );
        assert!(
            !self.access(access).has_users(),
            "tried to remove {access}, which still has users"
        );

        self.remove_from_lists(access);

        for operand in self.access(access).operands() {
            self.remove_user(operand, access);
        }
        self.reset_optimized(access);
        self.reset_optimized_referring_to(access);

        let removed = self.accesses[access].take();
        match removed.as_ref().map(|removed| (removed.inst(), removed.block)) {
            Some((Some(inst), _)) => {
                if self.inst_accesses.get(&inst) == Some(&access) {
                    self.inst_accesses.remove(&inst);
                }
            }
            Some((None, block)) => {
                if self.block_phis.get(&block) == Some(&access) {
                    self.block_phis.remove(&block);
                }
            }
            None => (),
        }
    }

    /// Remove `access`, first pointing each of its users at what it was defined by.
    ///
    /// # Panics
    ///
    /// Panics if `access` is a phi which still has users but does not have a single unique
    /// incoming value to replace it with.
    pub fn remove_memory_access(&mut self, access: MemoryAccessId) {
        assert!(
            !self.is_live_on_entry_def(access),
            "the live-on-entry definition cannot be removed"
        );

        let replacement = match &self.access(access).kind {
            // If every edge carries the same value, it dominates the phi, and so all of its users
            MemoryAccessKind::Phi(phi) => phi.unique_incoming_value(),
            MemoryAccessKind::Def(access) | MemoryAccessKind::Use(access) => access.defining,
        };

        if self.access(access).has_users() {
            let replacement = replacement
                .unwrap_or_else(|| panic!("{access} has users, but no value to replace it with"));
            self.replace_all_uses_with(access, replacement);
        }

        self.remove_from_lookups_and_lists(access);
    }

    /// Make every user of `old` refer to `new` instead.
    ///
    /// The cached clobbers of the affected uses and definitions are reset.
    pub fn replace_all_uses_with(&mut self, old: MemoryAccessId, new: MemoryAccessId) {
        assert!(!self.access(new).is_use(), "a memory use cannot be a defining access");
        if old == new {
            return;
        }

        let mut users: Vec<MemoryAccessId> = self.access(old).users.to_vec();
        users.sort();
        users.dedup();
        for user in users {
            if self.access(user).is_phi() {
                let edges = self
                    .access(user)
                    .as_phi()
                    .map(|phi| phi.incoming.len())
                    .unwrap_or_default();
                for index in 0..edges {
                    let value = self.access(user).as_phi().map(|phi| phi.incoming[index].1);
                    if value == Some(old) {
                        self.set_incoming_value(user, index, new);
                    }
                }
            } else {
                self.set_defining_access(user, new);
            }
        }
    }

    /// Set the defining access of the use or definition `access` to `definition`.
    ///
    /// The cached clobber of `access` is reset. If `access` is a definition, everything below it
    /// may now see different memory, so every cached clobber in the graph is reset.
    ///
    /// # Panics
    ///
    /// Panics if `access` is a phi, or `definition` is a use.
    pub fn set_defining_access(&mut self, access: MemoryAccessId, definition: MemoryAccessId) {
        assert!(
            !self.access(definition).is_use(),
            "a memory use cannot be a defining access"
        );
        let old = self
            .access_mut(access)
            .as_use_or_def_mut()
            .unwrap_or_else(|| panic!("{access} is a phi, and has no single defining access"))
            .defining
            .replace(definition);
        if let Some(old) = old {
            self.remove_user(old, access);
        }
        self.add_user(definition, access);
        if self.access(access).is_use() {
            self.reset_optimized(access);
        } else {
            self.reset_all_optimized();
        }
    }

    /// Append an incoming value to `phi` for the edge from `pred`
    ///
    /// # Panics
    ///
    /// Panics if `phi` is not a phi, or `value` is a use.
    pub fn add_incoming(&mut self, phi: MemoryAccessId, pred: Block, value: MemoryAccessId) {
        assert!(!self.access(value).is_use(), "a memory use cannot be a phi operand");
        self.access_mut(phi)
            .as_phi_mut()
            .unwrap_or_else(|| panic!("{phi} is not a memory phi"))
            .incoming
            .push((pred, value));
        self.add_user(value, phi);
        self.reset_all_optimized();
    }

    /// Replace the value of the `index`th incoming edge of `phi`
    ///
    /// # Panics
    ///
    /// Panics if `phi` is not a phi, `index` is out of bounds, or `value` is a use.
    pub fn set_incoming_value(&mut self, phi: MemoryAccessId, index: usize, value: MemoryAccessId) {
        assert!(!self.access(value).is_use(), "a memory use cannot be a phi operand");
        let old = {
            let incoming = &mut self
                .access_mut(phi)
                .as_phi_mut()
                .unwrap_or_else(|| panic!("{phi} is not a memory phi"))
                .incoming[index];
            core::mem::replace(&mut incoming.1, value)
        };
        self.remove_user(old, phi);
        self.add_user(value, phi);
        self.reset_all_optimized();
    }

    /// Replace the value of every incoming edge of `phi` from `pred`, returning false if there
    /// is no such edge
    pub(crate) fn set_incoming_value_for_block(
        &mut self,
        phi: MemoryAccessId,
        pred: Block,
        value: MemoryAccessId,
    ) -> bool {
        let edges: Vec<usize> = self
            .access(phi)
            .as_phi()
            .map(|phi| {
                phi.incoming
                    .iter()
                    .enumerate()
                    .filter(|(_, (block, _))| *block == pred)
                    .map(|(index, _)| index)
                    .collect()
            })
            .unwrap_or_default();
        for index in edges.iter().copied() {
            self.set_incoming_value(phi, index, value);
        }
        !edges.is_empty()
    }

    /// Returns true if `dominator` dominates `dominatee`.
    ///
    /// Every access dominates itself, and the live-on-entry definition dominates everything.
    pub fn dominates(&self, dominator: MemoryAccessId, dominatee: MemoryAccessId) -> bool {
        if dominator == dominatee {
            return true;
        }
        if self.is_live_on_entry_def(dominatee) {
            return false;
        }
        let dominator_block = self.access(dominator).block;
        let dominatee_block = self.access(dominatee).block;
        if dominator_block != dominatee_block {
            return self.domtree.dominates(dominator_block, dominatee_block);
        }
        self.locally_dominates(dominator, dominatee)
    }

    /// Returns true if `dominator` comes no later than `dominatee` in their common block.
    ///
    /// # Panics
    ///
    /// Panics if the two accesses are in different blocks.
    pub fn locally_dominates(&self, dominator: MemoryAccessId, dominatee: MemoryAccessId) -> bool {
        let block = self.access(dominator).block;
        assert_eq!(
            block,
            self.access(dominatee).block,
            "asking for local domination of accesses in different blocks"
        );

        if dominator == dominatee {
            return true;
        }
        // Nothing comes before the state of memory on entry
        if self.is_live_on_entry_def(dominatee) {
            return false;
        }
        if self.is_live_on_entry_def(dominator) {
            return true;
        }

        if !self.block_numbering_valid.borrow().contains(&block) {
            self.renumber_block(block);
        }
        let numbering = self.block_numbering.borrow();
        let dominator_num = numbering.get(&dominator).copied().unwrap_or_default();
        let dominatee_num = numbering.get(&dominatee).copied().unwrap_or_default();
        assert!(dominator_num != 0 && dominatee_num != 0, "{block} was not numbered properly");
        dominator_num < dominatee_num
    }

    /// Returns true if `def` dominates each of the places where `user` refers to it.
    ///
    /// For a phi, a reference is located at the end of the corresponding incoming block rather
    /// than at the phi itself.
    pub fn dominates_use(&self, def: MemoryAccessId, user: MemoryAccessId) -> bool {
        let Some(phi) = self.access(user).as_phi() else {
            return self.dominates(def, user);
        };

        let def_block = self.access(def).block;
        let mut edges = phi.incoming.iter().filter(|(_, value)| *value == def).peekable();
        if edges.peek().is_none() {
            return self.dominates(def, user);
        }
        edges.all(|(pred, _)| {
            self.is_live_on_entry_def(def)
                || *pred == def_block
                || self.domtree.dominates(def_block, *pred)
        })
    }
}
