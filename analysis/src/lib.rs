#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod alias;
mod config;
mod error;
pub mod memory_ssa;

pub use self::{
    alias::{
        AAResults, AliasAnalysis, AliasResult, BasicAliasAnalysis, LocationSize, MemoryLocation,
        ModRefInfo,
    },
    config::MemorySsaConfig,
    error::MemorySsaError,
    memory_ssa::{
        CachingWalker, DoNothingWalker, InsertionPlace, MemoryAccess, MemoryAccessId,
        MemoryAccessKind, MemoryPhi, MemorySsa, MemorySsaWalker, MemoryUseOrDef,
    },
};
