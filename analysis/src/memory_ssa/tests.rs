use alloc::{format, string::ToString, vec::Vec};

use expect_test::expect;
use memssa_ir::{
    AtomicOrdering, Block, FunctionBuilder, FxHashSet, InstData, IntrinsicId, MemFlags,
    ModRefBehavior, Value,
};
use pretty_assertions::assert_eq;
use proptest::{
    prelude::*,
    test_runner::{Config, TestCaseError, TestError, TestRunner},
};

use super::*;
use crate::{AliasResult, BasicAliasAnalysis, MemoryLocation, MemorySsaConfig};

fn init_logger() {
    let _ = env_logger::Builder::from_env("MEMSSA_TRACE")
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// An oracle which knows that every pair of distinct pointers is disjoint
struct DisjointPointers;

impl AliasAnalysis for DisjointPointers {
    fn alias(&self, _func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        if a.ptr == b.ptr {
            AliasResult::MustAlias
        } else {
            AliasResult::NoAlias
        }
    }
}

/// An oracle which knows nothing at all
struct KnowsNothing;

impl AliasAnalysis for KnowsNothing {
    fn alias(&self, _func: &Function, a: &MemoryLocation, b: &MemoryLocation) -> AliasResult {
        if a.ptr == b.ptr {
            AliasResult::MustAlias
        } else {
            AliasResult::MayAlias
        }
    }
}

fn build(func: &Function) -> MemorySsa {
    let mssa = MemorySsa::build(func, &BasicAliasAnalysis).unwrap();
    mssa.assert_valid(func);
    mssa
}

fn build_unoptimized(func: &Function) -> MemorySsa {
    let mut config = MemorySsaConfig::new();
    config.set_optimize_uses(false);
    let mssa = MemorySsa::build_with_config(func, &BasicAliasAnalysis, config).unwrap();
    mssa.assert_valid(func);
    mssa
}

/// The access of the instruction defining `value`
fn access_of(mssa: &MemorySsa, func: &Function, value: Value) -> MemoryAccessId {
    let inst = func.value_def(value).unwrap();
    mssa.memory_access(inst).unwrap()
}

fn optimized(mssa: &MemorySsa, access: MemoryAccessId) -> Option<MemoryAccessId> {
    mssa.access(access).as_use_or_def().unwrap().optimized()
}

#[test]
fn straight_line_store_then_load() {
    init_logger();

    let mut builder = FunctionBuilder::new("straight_line");
    let entry = builder.create_named_block("entry");
    let b1 = builder.create_named_block("B1");
    let exit = builder.create_named_block("exit");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let v = builder.iconst(1);
    builder.jump(b1);
    builder.switch_to_block(b1);
    let store = builder.store(p, v, 8);
    let loaded = builder.load(p, 8);
    builder.jump(exit);
    builder.switch_to_block(exit);
    builder.ret(None);
    let func = builder.finish().unwrap();

    let mssa = build(&func);
    let live_on_entry = mssa.live_on_entry_def();
    let def = mssa.memory_access(store).unwrap();
    let use_ = access_of(&mssa, &func, loaded);

    assert!(mssa.access(def).is_def());
    assert!(mssa.access(use_).is_use());
    assert_eq!(mssa.access(def).defining_access(), Some(live_on_entry));
    assert_eq!(mssa.access(use_).defining_access(), Some(def));
    assert_eq!(mssa.access(def).users(), &[use_]);
    assert_eq!(mssa.block_accesses(b1), Some([def, use_].as_slice()));
    assert_eq!(mssa.block_defs(b1), Some([def].as_slice()));
    assert_eq!(mssa.block_accesses(entry), None);
    assert_eq!(mssa.memory_phi(exit), None);

    assert_eq!(optimized(&mssa, use_), Some(def));
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), def);
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, def), live_on_entry);
}

/// `entry -> {B1, B2} -> merge`, with a store to the same pointer on both sides
fn diamond() -> (Function, [Inst; 2], Value) {
    let mut builder = FunctionBuilder::new("diamond");
    let entry = builder.create_named_block("entry");
    let b1 = builder.create_named_block("B1");
    let b2 = builder.create_named_block("B2");
    let merge = builder.create_named_block("merge");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let c = builder.iconst(1);
    builder.branch(c, b1, b2);
    builder.switch_to_block(b1);
    let left = builder.store(p, c, 8);
    builder.jump(merge);
    builder.switch_to_block(b2);
    let right = builder.store(p, c, 8);
    builder.jump(merge);
    builder.switch_to_block(merge);
    let loaded = builder.load(p, 8);
    builder.ret(None);
    (builder.finish().unwrap(), [left, right], loaded)
}

#[test]
fn diamond_merges_definitions_with_a_phi() {
    init_logger();

    let (func, [left, right], loaded) = diamond();
    let mssa = build(&func);
    let merge = func.layout.blocks()[3];
    let left = mssa.memory_access(left).unwrap();
    let right = mssa.memory_access(right).unwrap();
    let use_ = access_of(&mssa, &func, loaded);

    let phi = mssa.memory_phi(merge).expect("expected a phi in the merge block");
    let incoming = mssa.access(phi).as_phi().unwrap().incoming().to_vec();
    let b1 = func.layout.blocks()[1];
    let b2 = func.layout.blocks()[2];
    assert_eq!(incoming, [(b1, left), (b2, right)]);
    assert_eq!(mssa.access(use_).defining_access(), Some(phi));
    assert_eq!(mssa.block_accesses(merge), Some([phi, use_].as_slice()));
    assert_eq!(mssa.block_defs(merge), Some([phi].as_slice()));

    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), phi);
    assert_eq!(optimized(&mssa, use_), Some(phi));
    // A phi is its own clobber
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, phi), phi);
}

#[test]
fn print_annotated_function() {
    let (func, _, _) = diamond();
    let mssa = build(&func);

    expect![[r#"
        function diamond() {
        entry:
            v0 = alloca 8
            v1 = iconst 1
            br v1, B1, B2
        B1:
            ; 1 = MemoryDef(liveOnEntry)
            store v0, v1, 8
            jump merge
        B2:
            ; 2 = MemoryDef(liveOnEntry)
            store v0, v1, 8
            jump merge
        merge:
            ; 3 = MemoryPhi({B1,1},{B2,2})
            ; MemoryUse(3)
            v2 = load v0, 8
            ret
        }
    "#]]
    .assert_eq(&mssa.display(&func).to_string());

    let merge = func.layout.blocks()[3];
    let phi = mssa.memory_phi(merge).unwrap();
    assert_eq!(format!("{}", mssa.display_access(&func, phi)), "3 = MemoryPhi({B1,1},{B2,2})");
}

#[test]
fn no_alias_store_is_skipped() {
    init_logger();

    let mut builder = FunctionBuilder::new("no_alias");
    let p = builder.append_param();
    let q = builder.append_param();
    let entry = builder.create_named_block("entry");
    let b1 = builder.create_named_block("B1");
    let b2 = builder.create_named_block("B2");
    builder.switch_to_block(entry);
    builder.jump(b1);
    builder.switch_to_block(b1);
    let store = builder.store(p, q, 8);
    builder.jump(b2);
    builder.switch_to_block(b2);
    let loaded = builder.load(q, 8);
    builder.ret(Some(loaded));
    let func = builder.finish().unwrap();

    // Nothing is known about two parameters in general
    let mssa = MemorySsa::build(&func, &BasicAliasAnalysis).unwrap();
    let def = mssa.memory_access(store).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), def);

    let mssa = MemorySsa::build(&func, &DisjointPointers).unwrap();
    mssa.assert_valid(&func);
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.access(use_).defining_access(), mssa.memory_access(store));
    assert_eq!(mssa.clobbering_access(&func, &DisjointPointers, use_), mssa.live_on_entry_def());
}

#[test]
fn unreachable_block_observes_live_on_entry() {
    init_logger();

    let mut builder = FunctionBuilder::new("dead_load");
    let entry = builder.create_named_block("entry");
    let dead = builder.create_named_block("dead");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let v = builder.iconst(7);
    builder.store(p, v, 8);
    builder.ret(None);
    builder.switch_to_block(dead);
    let loaded = builder.load(p, 8);
    builder.ret(Some(loaded));
    let func = builder.finish().unwrap();

    let mut mssa = build(&func);
    let live_on_entry = mssa.live_on_entry_def();
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.access(use_).defining_access(), Some(live_on_entry));
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), live_on_entry);

    // A phi left behind in a block which became unreachable is deleted, along with its uses
    let phi = mssa.create_memory_phi(dead);
    mssa.set_defining_access(use_, phi);
    mssa.mark_unreachable_as_live_on_entry(dead);
    assert!(!mssa.is_valid_access(phi));
    assert_eq!(mssa.memory_phi(dead), None);
    assert_eq!(mssa.access(use_).defining_access(), Some(live_on_entry));
    assert_eq!(mssa.block_accesses(dead), Some([use_].as_slice()));
    mssa.assert_valid(&func);
}

#[test]
fn unreachable_predecessor_feeds_live_on_entry_to_phi() {
    init_logger();

    let mut builder = FunctionBuilder::new("dead_pred");
    let entry = builder.create_named_block("entry");
    let left = builder.create_named_block("left");
    let merge = builder.create_named_block("merge");
    let dead = builder.create_named_block("dead");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let c = builder.iconst(1);
    builder.store(p, c, 8);
    builder.branch(c, left, merge);
    builder.switch_to_block(left);
    builder.store(p, c, 8);
    builder.jump(merge);
    builder.switch_to_block(dead);
    let dead_store = builder.store(p, c, 8);
    builder.jump(merge);
    builder.switch_to_block(merge);
    let loaded = builder.load(p, 8);
    builder.ret(Some(loaded));
    let func = builder.finish().unwrap();

    let mssa = build(&func);
    let live_on_entry = mssa.live_on_entry_def();
    let phi = mssa.memory_phi(merge).unwrap();
    let phi_data = mssa.access(phi).as_phi().unwrap();
    assert_eq!(phi_data.num_incoming(), 3);
    assert_eq!(phi_data.incoming_value_for_block(dead), Some(live_on_entry));
    let dead_store = mssa.memory_access(dead_store).unwrap();
    assert_eq!(mssa.access(dead_store).defining_access(), Some(live_on_entry));

    // The store in `left` may clobber the load, so the phi cannot be looked through
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), phi);
}

/// `entry -> header <-> body`, `header -> exit`, where `entry` stores to `p`, `header` loads from
/// `p`, and `body` stores to `body_ptr`.
fn simple_loop(store_in_body_aliases: bool) -> (Function, Inst, Value) {
    let mut builder = FunctionBuilder::new("simple_loop");
    let entry = builder.create_named_block("entry");
    let header = builder.create_named_block("header");
    let body = builder.create_named_block("body");
    let exit = builder.create_named_block("exit");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let c = builder.iconst(0);
    let store = builder.store(p, c, 8);
    builder.jump(header);
    builder.switch_to_block(header);
    let loaded = builder.load(p, 8);
    builder.branch(loaded, body, exit);
    builder.switch_to_block(body);
    let body_ptr = if store_in_body_aliases { p } else { q };
    builder.store(body_ptr, c, 8);
    builder.jump(header);
    builder.switch_to_block(exit);
    builder.ret(None);
    (builder.finish().unwrap(), store, loaded)
}

#[test]
fn phi_is_looked_through_when_no_path_clobbers() {
    init_logger();

    let (func, store, loaded) = simple_loop(false);
    let header = func.layout.blocks()[1];

    for mssa in [build(&func), build_unoptimized(&func)] {
        let phi = mssa.memory_phi(header).unwrap();
        let use_ = access_of(&mssa, &func, loaded);
        assert_eq!(mssa.access(use_).defining_access(), Some(phi));
        let def = mssa.memory_access(store).unwrap();
        assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), def);
    }

    let (func, _, loaded) = simple_loop(true);
    let mssa = build_unoptimized(&func);
    let phi = mssa.memory_phi(header).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), phi);
}

#[test]
fn every_memory_instruction_has_exactly_one_access() {
    let mut builder = FunctionBuilder::new("totality");
    let entry = builder.create_named_block("entry");
    let pure = builder.declare_function("pure", ModRefBehavior::DoesNotAccessMemory);
    let reader = builder.declare_function("reader", ModRefBehavior::OnlyReadsMemory);
    let unknown = builder.declare_function("unknown", ModRefBehavior::UnknownModRefBehavior);
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let v = builder.iconst(3);
    let store = builder.store(p, v, 8);
    let loaded = builder.load(p, 8);
    let volatile = builder.load_with(p, 8, MemFlags::VOLATILE, AtomicOrdering::NotAtomic);
    let pure_call = builder.call(pure, &[p]);
    let read_call = builder.call(reader, &[p]);
    let unknown_call = builder.call(unknown, &[]);
    let fence = builder.fence(AtomicOrdering::SequentiallyConsistent);
    let assume = builder.intrinsic(IntrinsicId::Assume, &[v]);
    let lifetime = builder.intrinsic(IntrinsicId::LifetimeStart, &[p]);
    builder.ret(None);
    let func = builder.finish().unwrap();

    let mssa = build(&func);

    let kind_of = |inst: Inst| {
        mssa.memory_access(inst).map(|access| {
            let access = mssa.access(access);
            if access.is_def() { "def" } else { "use" }
        })
    };
    let alloca = func.value_def(p).unwrap();
    let iconst = func.value_def(v).unwrap();
    assert_eq!(kind_of(alloca), None);
    assert_eq!(kind_of(iconst), None);
    assert_eq!(kind_of(store), Some("def"));
    assert_eq!(kind_of(func.value_def(loaded).unwrap()), Some("use"));
    assert_eq!(kind_of(func.value_def(volatile).unwrap()), Some("def"));
    assert_eq!(kind_of(pure_call), None);
    assert_eq!(kind_of(read_call), Some("use"));
    assert_eq!(kind_of(unknown_call), Some("def"));
    assert_eq!(kind_of(fence), Some("def"));
    assert_eq!(kind_of(assume), None);
    assert_eq!(kind_of(lifetime), Some("def"));

    let with_accesses = func
        .layout
        .block_insts(entry)
        .iter()
        .filter(|inst| mssa.memory_access(**inst).is_some())
        .count();
    // Every access except live-on-entry belongs to an instruction
    assert_eq!(mssa.accesses().count(), with_accesses + 1);
    assert_eq!(mssa.block_accesses(entry).map(<[_]>::len), Some(with_accesses));
}

#[test]
fn repeated_queries_agree() {
    init_logger();

    let (func, _, loaded) = simple_loop(false);
    let mssa = build_unoptimized(&func);
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(optimized(&mssa, use_), None);

    let mut walker = mssa.walker(&func, &BasicAliasAnalysis);
    let first = walker.clobbering_access(use_);
    assert_eq!(optimized(&mssa, use_), Some(first));
    let second = walker.clobbering_access(use_);
    assert_eq!(first, second);

    walker.invalidate_info(use_);
    assert_eq!(optimized(&mssa, use_), None);
    assert_eq!(walker.clobbering_access(use_), first);
}

#[test]
fn removing_an_access_drops_cached_clobbers_referring_to_it() {
    init_logger();

    let mut builder = FunctionBuilder::new("removal");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store_p = builder.store(p, v, 8);
    let store_q = builder.store(q, v, 8);
    let loaded = builder.load(p, 8);
    builder.ret(Some(loaded));
    let func = builder.finish().unwrap();

    let mut mssa = build(&func);
    let live_on_entry = mssa.live_on_entry_def();
    let store_p = mssa.memory_access(store_p).unwrap();
    let store_q = mssa.memory_access(store_q).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.access(use_).defining_access(), Some(store_q));
    assert_eq!(optimized(&mssa, use_), Some(store_p));

    mssa.remove_memory_access(store_p);
    assert!(!mssa.is_valid_access(store_p));
    assert_eq!(optimized(&mssa, use_), None);
    assert_eq!(mssa.access(store_q).defining_access(), Some(live_on_entry));
    assert_eq!(mssa.memory_access(func.value_def(loaded).unwrap()), Some(use_));
    mssa.assert_valid(&func);

    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), live_on_entry);
}

#[test]
fn check_limit_leaves_uses_for_the_walker() {
    init_logger();

    let mut builder = FunctionBuilder::new("check_limit");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let v = builder.iconst(3);
    let store_p = builder.store(p, v, 8);
    for _ in 0..4 {
        let q = builder.alloca(8);
        builder.store(q, v, 8);
    }
    let loaded = builder.load(p, 8);
    let reloaded = builder.load(p, 8);
    builder.ret(Some(loaded));
    let func = builder.finish().unwrap();

    let mut config = MemorySsaConfig::new();
    config.set_check_limit(2);
    let mssa = MemorySsa::build_with_config(&func, &BasicAliasAnalysis, config).unwrap();
    mssa.assert_valid(&func);

    let store_p = mssa.memory_access(store_p).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    let reuse = access_of(&mssa, &func, reloaded);
    assert_eq!(optimized(&mssa, use_), None);
    // Whatever the optimizer settled on for the second load is above nothing that clobbers
    if let Some(clobber) = optimized(&mssa, reuse) {
        assert!(mssa.dominates(clobber, reuse));
        assert!(mssa.dominates(store_p, clobber));
    }

    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), store_p);
    assert_eq!(optimized(&mssa, use_), Some(store_p));
}

#[test]
fn load_reorderability() {
    init_logger();

    let mut builder = FunctionBuilder::new("reorder");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let volatile_p = builder.load_with(p, 8, MemFlags::VOLATILE, AtomicOrdering::NotAtomic);
    let plain_p = builder.load(p, 8);
    let plain_q = builder.load(q, 8);
    let acquire_p = builder.load_with(p, 8, MemFlags::empty(), AtomicOrdering::Acquire);
    let after_acquire_q = builder.load(q, 8);
    builder.ret(None);
    let func = builder.finish().unwrap();

    let mssa = build_unoptimized(&func);
    let live_on_entry = mssa.live_on_entry_def();
    let aa = BasicAliasAnalysis;
    let volatile_p = access_of(&mssa, &func, volatile_p);
    let acquire_p = access_of(&mssa, &func, acquire_p);
    assert!(mssa.access(volatile_p).is_def());
    assert!(mssa.access(acquire_p).is_def());

    // A volatile load only orders loads of memory it may alias
    assert_eq!(mssa.clobbering_access(&func, &aa, access_of(&mssa, &func, plain_p)), volatile_p);
    assert_eq!(mssa.clobbering_access(&func, &aa, access_of(&mssa, &func, plain_q)), live_on_entry);
    // Nothing moves above an acquire
    assert_eq!(
        mssa.clobbering_access(&func, &aa, access_of(&mssa, &func, after_acquire_q)),
        acquire_p
    );
    assert!(mssa.def_clobbers_use_or_def(
        &func,
        &aa,
        acquire_p,
        access_of(&mssa, &func, after_acquire_q)
    ));
    assert!(!mssa.def_clobbers_use_or_def(&func, &aa, volatile_p, access_of(&mssa, &func, plain_q)));
}

#[test]
fn lifetime_markers() {
    init_logger();

    let mut builder = FunctionBuilder::new("lifetimes");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store = builder.store(p, v, 8);
    let end_p = builder.intrinsic(IntrinsicId::LifetimeEnd, &[p]);
    let after_end = builder.load(p, 8);
    let start_q = builder.intrinsic(IntrinsicId::LifetimeStart, &[q]);
    let start_p = builder.intrinsic(IntrinsicId::LifetimeStart, &[p]);
    let after_start = builder.load(p, 8);
    builder.ret(None);
    let func = builder.finish().unwrap();
    let aa = BasicAliasAnalysis;

    // The walker does not look at the end of a lifetime
    let mssa = build_unoptimized(&func);
    let store = mssa.memory_access(store).unwrap();
    let end_p = mssa.memory_access(end_p).unwrap();
    assert_eq!(mssa.access(access_of(&mssa, &func, after_end)).defining_access(), Some(end_p));
    assert_eq!(mssa.clobbering_access(&func, &aa, access_of(&mssa, &func, after_end)), store);
    // The start of a lifetime clobbers the memory it starts, and nothing else
    let start_p = mssa.memory_access(start_p).unwrap();
    let start_q = mssa.memory_access(start_q).unwrap();
    assert_eq!(mssa.clobbering_access(&func, &aa, access_of(&mssa, &func, after_start)), start_p);
    assert!(!mssa.def_clobbers_use_or_def(&func, &aa, start_q, access_of(&mssa, &func, after_start)));

    // The use optimizer knows that nothing before the end of a lifetime is observable
    let mssa = build(&func);
    let after_end = access_of(&mssa, &func, after_end);
    assert_eq!(optimized(&mssa, after_end), Some(mssa.live_on_entry_def()));
}

#[test]
fn fences_and_constant_memory() {
    init_logger();

    let mut builder = FunctionBuilder::new("fences");
    let entry = builder.create_named_block("entry");
    let table = builder.declare_global("table", 8, true);
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let t = builder.global_addr(table);
    let v = builder.iconst(3);
    builder.store(p, v, 8);
    let fence = builder.fence(AtomicOrdering::SequentiallyConsistent);
    let after_fence = builder.load(p, 8);
    let constant = builder.load(t, 8);
    let invariant = builder.load_with(p, 8, MemFlags::INVARIANT, AtomicOrdering::NotAtomic);
    builder.ret(None);
    let func = builder.finish().unwrap();
    let aa = BasicAliasAnalysis;

    for mssa in [build(&func), build_unoptimized(&func)] {
        let live_on_entry = mssa.live_on_entry_def();
        let fence = mssa.memory_access(fence).unwrap();
        assert_eq!(mssa.clobbering_access(&func, &aa, fence), fence);
        assert_eq!(mssa.clobbering_access(&func, &aa, access_of(&mssa, &func, after_fence)), fence);

        let constant = access_of(&mssa, &func, constant);
        let invariant = access_of(&mssa, &func, invariant);
        assert_eq!(mssa.access(constant).defining_access(), Some(fence));
        assert_eq!(mssa.clobbering_access(&func, &aa, constant), live_on_entry);
        assert_eq!(mssa.clobbering_access(&func, &aa, invariant), live_on_entry);
        assert_eq!(optimized(&mssa, invariant), Some(live_on_entry));
    }
}

#[test]
fn call_queries() {
    init_logger();

    let mut builder = FunctionBuilder::new("calls");
    let entry = builder.create_named_block("entry");
    let reader = builder.declare_function("reader", ModRefBehavior::OnlyReadsArgumentPointees);
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store_p = builder.store(p, v, 8);
    builder.store(q, v, 8);
    let call = builder.call(reader, &[p]);
    builder.ret(None);
    let func = builder.finish().unwrap();

    for mssa in [build(&func), build_unoptimized(&func)] {
        let call = mssa.memory_access(call).unwrap();
        let store_p = mssa.memory_access(store_p).unwrap();
        assert!(mssa.access(call).is_use());
        assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, call), store_p);
    }
}

#[test]
fn do_nothing_walker_returns_defining_access() {
    let mut builder = FunctionBuilder::new("do_nothing");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store = builder.store(p, v, 8);
    let loaded = builder.load(q, 8);
    builder.ret(None);
    let func = builder.finish().unwrap();

    let mssa = build_unoptimized(&func);
    let def = mssa.memory_access(store).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    let live_on_entry = mssa.live_on_entry_def();

    let mut walker = DoNothingWalker::new(&mssa);
    assert_eq!(walker.clobbering_access(use_), def);
    assert_eq!(walker.clobbering_access(def), live_on_entry);
    assert_eq!(walker.clobbering_access(live_on_entry), live_on_entry);
    let loc = MemoryLocation::precise(q, 8);
    assert_eq!(walker.clobbering_access_for_location(use_, &loc), def);
    assert_eq!(walker.clobbering_access_for_location(def, &loc), def);
    assert_eq!(optimized(&mssa, use_), None);

    assert_eq!(mssa.clobbering_access(&func, &BasicAliasAnalysis, use_), live_on_entry);
}

#[test]
fn clobbers_of_an_explicit_location() {
    init_logger();

    let mut builder = FunctionBuilder::new("explicit_location");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store_p = builder.store(p, v, 8);
    let store_q = builder.store(q, v, 8);
    let loaded = builder.load(q, 8);
    builder.ret(None);
    let func = builder.finish().unwrap();

    let mssa = build(&func);
    let store_p = mssa.memory_access(store_p).unwrap();
    let store_q = mssa.memory_access(store_q).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    let mut walker = mssa.walker(&func, &BasicAliasAnalysis);

    let p_loc = MemoryLocation::precise(p, 8);
    let q_loc = MemoryLocation::precise(q, 8);
    // A definition is a candidate clobber of the location itself
    assert_eq!(walker.clobbering_access_for_location(store_q, &q_loc), store_q);
    assert_eq!(walker.clobbering_access_for_location(store_q, &p_loc), store_p);
    // A use is not, and starts from its defining access
    assert_eq!(walker.clobbering_access_for_location(use_, &p_loc), store_p);
    assert_eq!(walker.clobbering_access_for_location(use_, &q_loc), store_q);
    // Nothing is cached for location queries
    assert_eq!(optimized(&mssa, store_q), None);
}

#[test]
fn mutation_keeps_the_graph_valid() {
    init_logger();

    let mut builder = FunctionBuilder::new("mutation");
    let entry = builder.create_named_block("entry");
    let exit = builder.create_named_block("exit");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store_p = builder.store(p, v, 8);
    let loaded = builder.load(p, 8);
    builder.jump(exit);
    builder.switch_to_block(exit);
    let ret = builder.ret(None);
    let mut func = builder.finish().unwrap();
    let aa = BasicAliasAnalysis;

    let mut mssa = build(&func);
    let store_p = mssa.memory_access(store_p).unwrap();
    let load_inst = func.value_def(loaded).unwrap();
    let use_ = mssa.memory_access(load_inst).unwrap();

    // Insert a store to `q` between the store to `p` and the load
    let store_q = func.make_inst(InstData::Store {
        ptr: q,
        value: v,
        size: 8,
        flags: MemFlags::empty(),
        ordering: AtomicOrdering::NotAtomic,
    });
    func.layout.insert_inst_before(store_q, load_inst);
    let store_q = mssa.create_defined_access(&func, &aa, store_q, store_p);
    mssa.insert_into_lists_before(store_q, entry, Some(use_));
    mssa.set_defining_access(use_, store_q);
    mssa.assert_valid(&func);
    assert_eq!(mssa.block_defs(entry), Some([store_p, store_q].as_slice()));
    assert!(mssa.dominates(store_p, store_q));
    assert!(mssa.locally_dominates(store_q, use_));
    assert!(!mssa.locally_dominates(use_, store_q));
    assert_eq!(mssa.clobbering_access(&func, &aa, use_), store_p);

    // Sink the load into the exit block
    func.layout.move_inst_before(load_inst, ret);
    mssa.move_to(use_, exit, InsertionPlace::Beginning);
    mssa.assert_valid(&func);
    assert_eq!(mssa.block_accesses(exit), Some([use_].as_slice()));
    assert_eq!(mssa.block_accesses(entry), Some([store_p, store_q].as_slice()));
    assert!(mssa.dominates_use(store_q, use_));
    assert_eq!(mssa.clobbering_access(&func, &aa, use_), store_p);

    // Delete the store to `q`, which the load now refers to
    let store_q_inst = mssa.access(store_q).inst().unwrap();
    mssa.remove_memory_access(store_q);
    func.layout.remove_inst(store_q_inst);
    mssa.assert_valid(&func);
    assert_eq!(mssa.access(use_).defining_access(), Some(store_p));
}

fn store_inst(ptr: Value, value: Value) -> InstData {
    InstData::Store {
        ptr,
        value,
        size: 8,
        flags: MemFlags::empty(),
        ordering: AtomicOrdering::NotAtomic,
    }
}

/// The instruction of the clobbering access of the load of `loaded`, in a freshly built graph
fn fresh_clobber(func: &Function, loaded: Value) -> Option<Inst> {
    let mssa = build_unoptimized(func);
    let use_ = access_of(&mssa, func, loaded);
    let clobber = mssa.clobbering_access(func, &BasicAliasAnalysis, use_);
    mssa.access(clobber).inst()
}

#[test]
fn inserting_a_store_resets_cached_clobbers_below_it() {
    init_logger();

    let mut builder = FunctionBuilder::new("insert_store");
    let entry = builder.create_named_block("entry");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let v = builder.iconst(3);
    let store_p = builder.store(p, v, 8);
    let store_q = builder.store(q, v, 8);
    let loaded = builder.load(p, 8);
    builder.ret(Some(loaded));
    let mut func = builder.finish().unwrap();
    let aa = BasicAliasAnalysis;

    let mut mssa = build(&func);
    let store_p = mssa.memory_access(store_p).unwrap();
    let store_q_inst = store_q;
    let store_q = mssa.memory_access(store_q).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.clobbering_access(&func, &aa, use_), store_p);

    // Store to `p` again between the two stores, so the load is two links below it
    let new_store = func.make_inst(store_inst(p, v));
    func.layout.insert_inst_before(new_store, store_q_inst);
    let new_access = mssa.create_defined_access(&func, &aa, new_store, store_p);
    mssa.insert_into_lists_before(new_access, entry, Some(store_q));
    mssa.set_defining_access(store_q, new_access);
    mssa.assert_valid(&func);

    assert_eq!(optimized(&mssa, use_), None);
    assert_eq!(mssa.clobbering_access(&func, &aa, use_), new_access);
    assert_eq!(fresh_clobber(&func, loaded), Some(new_store));
}

#[test]
fn inserting_a_store_behind_a_phi_resets_cached_clobbers() {
    init_logger();

    let mut builder = FunctionBuilder::new("insert_behind_phi");
    let entry = builder.create_named_block("entry");
    let b1 = builder.create_named_block("B1");
    let b2 = builder.create_named_block("B2");
    let merge = builder.create_named_block("merge");
    builder.switch_to_block(entry);
    let p = builder.alloca(8);
    let q = builder.alloca(8);
    let r = builder.alloca(8);
    let v = builder.iconst(1);
    let store_p = builder.store(p, v, 8);
    builder.branch(v, b1, b2);
    builder.switch_to_block(b1);
    let store_q = builder.store(q, v, 8);
    builder.store(r, v, 8);
    builder.jump(merge);
    builder.switch_to_block(b2);
    builder.jump(merge);
    builder.switch_to_block(merge);
    let loaded = builder.load(p, 8);
    builder.ret(Some(loaded));
    let mut func = builder.finish().unwrap();
    let aa = BasicAliasAnalysis;

    let mut mssa = build(&func);
    let store_p = mssa.memory_access(store_p).unwrap();
    let store_q_inst = store_q;
    let store_q = mssa.memory_access(store_q).unwrap();
    let phi = mssa.memory_phi(merge).unwrap();
    let use_ = access_of(&mssa, &func, loaded);
    assert_eq!(mssa.access(use_).defining_access(), Some(phi));
    assert_eq!(optimized(&mssa, use_), Some(store_p));

    // Clobber `p` on one side of the diamond only. The new store does not dominate the load,
    // and is three links above it.
    let new_store = func.make_inst(store_inst(p, v));
    func.layout.insert_inst_before(new_store, store_q_inst);
    let new_access = mssa.create_defined_access(&func, &aa, new_store, store_p);
    mssa.insert_into_lists_before(new_access, b1, Some(store_q));
    mssa.set_defining_access(store_q, new_access);
    mssa.assert_valid(&func);

    assert_eq!(mssa.clobbering_access(&func, &aa, use_), phi);
    assert_eq!(fresh_clobber(&func, loaded), None);

    let fresh = build(&func);
    let fresh_use = access_of(&fresh, &func, loaded);
    assert_eq!(fresh.clobbering_access(&func, &aa, fresh_use), fresh.memory_phi(merge).unwrap());
}

#[test]
fn cached_clobber_index_shrinks_with_the_cache() {
    init_logger();

    let (func, _, loaded) = simple_loop(false);
    let mut mssa = build_unoptimized(&func);
    let use_ = access_of(&mssa, &func, loaded);
    let defining = mssa.access(use_).defining_access().unwrap();
    let indexed = |mssa: &MemorySsa| -> usize {
        mssa.optimized_by.borrow().values().map(|dependents| dependents.len()).sum()
    };

    for _ in 0..3 {
        let clobber = mssa.clobbering_access(&func, &BasicAliasAnalysis, use_);
        assert_eq!(optimized(&mssa, use_), Some(clobber));
        assert_eq!(indexed(&mssa), 1);

        mssa.set_defining_access(use_, defining);
        assert_eq!(optimized(&mssa, use_), None);
        assert_eq!(indexed(&mssa), 0);
    }
}

#[test]
fn auto_reset_frees_walker_scratch() {
    init_logger();

    let (func, _, loaded) = simple_loop(false);

    let mssa = build_unoptimized(&func);
    let use_ = access_of(&mssa, &func, loaded);
    let mut walker = mssa.walker(&func, &BasicAliasAnalysis);
    assert!(walker.auto_reset());
    walker.clobbering_access(use_);
    assert!(!walker.holds_scratch());

    let mssa = build_unoptimized(&func);
    let use_ = access_of(&mssa, &func, loaded);
    let mut walker = mssa.walker(&func, &BasicAliasAnalysis);
    walker.set_auto_reset(false);
    let kept = walker.clobbering_access(use_);
    assert!(walker.holds_scratch());
    walker.reset_clobber_walker();
    assert!(!walker.holds_scratch());

    walker.invalidate_info(use_);
    assert_eq!(walker.clobbering_access(use_), kept);
}

#[test]
fn verify_reports_inconsistencies() {
    let (func, _, loaded) = diamond();
    let mut mssa = build(&func);
    let entry = func.layout.blocks()[0];
    let b1 = func.layout.blocks()[1];

    // A phi without incoming values in a block with a predecessor
    let phi = mssa.create_memory_phi(b1);
    assert_eq!(
        mssa.verify(&func),
        Err(MemorySsaError::IncompletePhi {
            phi,
            block: b1,
            incoming: 0,
            predecessors: 1,
        })
    );
    mssa.add_incoming(phi, entry, mssa.live_on_entry_def());
    assert_eq!(mssa.verify(&func), Ok(()));

    // The load disappears from the function, but not from the graph
    let mut func = func;
    func.layout.remove_inst(func.value_def(loaded).unwrap());
    let merge = func.layout.blocks()[3];
    assert_eq!(mssa.verify_ordering(&func), Err(MemorySsaError::OrderingMismatch { block: merge }));
}

/// The shape of one block of a randomly generated function
#[derive(Debug, Clone)]
struct BlockShape {
    /// `(kind, slot)` pairs, see [random_function]
    ops: Vec<(u8, usize)>,
    successors: Vec<usize>,
}

fn block_shape() -> impl Strategy<Value = BlockShape> {
    (
        prop::collection::vec((0u8..6, 0usize..4), 0..4),
        prop::collection::vec(0usize..8, 0..3),
    )
        .prop_map(|(ops, successors)| BlockShape { ops, successors })
}

/// Build a function with one block per shape, the first being the entry.
///
/// There are four memory slots: three distinct stack slots, and one overlapping the first.
/// Successors never include the entry block, and every other block may be the target of any
/// block, loops and unreachable blocks included.
fn random_function(shapes: &[BlockShape]) -> Function {
    let mut builder = FunctionBuilder::new("random");
    let unknown = builder.declare_function("unknown", ModRefBehavior::UnknownModRefBehavior);
    let reader = builder.declare_function("reader", ModRefBehavior::OnlyReadsArgumentPointees);
    let blocks = shapes.iter().map(|_| builder.create_block()).collect::<Vec<Block>>();

    builder.switch_to_block(blocks[0]);
    let a = builder.alloca(16);
    let b = builder.alloca(8);
    let c = builder.alloca(8);
    let a4 = builder.ptr_offset(a, 4);
    let slots = [a, b, c, a4];
    let value = builder.iconst(1);

    for (block, shape) in blocks.iter().copied().zip(shapes) {
        builder.switch_to_block(block);
        for (kind, slot) in shape.ops.iter().copied() {
            let ptr = slots[slot];
            match kind {
                0 => {
                    builder.store(ptr, value, 8);
                }
                1 => {
                    builder.load(ptr, 8);
                }
                2 => {
                    builder.call(unknown, &[]);
                }
                3 => {
                    builder.call(reader, &[ptr]);
                }
                4 => {
                    builder.load_with(ptr, 8, MemFlags::VOLATILE, AtomicOrdering::NotAtomic);
                }
                _ => {
                    builder.fence(AtomicOrdering::Release);
                }
            }
        }

        let mut successors = Vec::<Block>::new();
        if blocks.len() > 1 {
            for succ in shape.successors.iter().copied() {
                let succ = blocks[1 + succ % (blocks.len() - 1)];
                if !successors.contains(&succ) {
                    successors.push(succ);
                }
            }
        }
        match successors.as_slice() {
            [] => {
                builder.ret(None);
            }
            [dest] => {
                builder.jump(*dest);
            }
            [then_dest, else_dest, ..] => {
                builder.branch(value, *then_dest, *else_dest);
            }
        }
    }

    builder.finish().unwrap()
}

/// Check that `clobber` is a sound clobbering access for `access`: it dominates `access`, and no
/// definition on any path between the two may clobber `access`.
fn check_clobber(
    mssa: &MemorySsa,
    func: &Function,
    aa: &dyn AliasAnalysis,
    access: MemoryAccessId,
    clobber: MemoryAccessId,
) -> Result<(), TestCaseError> {
    prop_assert!(mssa.dominates(clobber, access), "{clobber} does not dominate {access}");
    if clobber == access || mssa.access(access).is_phi() {
        return Ok(());
    }

    let mut visited = FxHashSet::default();
    let mut worklist = Vec::from_iter(mssa.access(access).defining_access());
    while let Some(current) = worklist.pop() {
        if current == clobber || !visited.insert(current) {
            continue;
        }
        prop_assert!(
            !mssa.is_live_on_entry_def(current),
            "reached live-on-entry above {access} without passing {clobber}"
        );
        match mssa.access(current).kind() {
            MemoryAccessKind::Def(def) => {
                prop_assert!(
                    !mssa.def_clobbers_use_or_def(func, aa, current, access),
                    "{current} clobbers {access}, but is below {clobber}"
                );
                worklist.extend(def.defining_access());
            }
            MemoryAccessKind::Use(_) => {
                return Err(TestCaseError::fail(format!("{current} is a use on a def chain")));
            }
            MemoryAccessKind::Phi(phi) => {
                worklist.extend(
                    phi.incoming()
                        .iter()
                        .filter(|(pred, _)| mssa.domtree().is_reachable_from_entry(*pred))
                        .map(|(_, value)| *value),
                );
            }
        }
    }

    Ok(())
}

fn check_random_function(
    shapes: &[BlockShape],
    aa: &dyn AliasAnalysis,
) -> Result<(), TestCaseError> {
    let func = random_function(shapes);

    let mut unoptimized = MemorySsaConfig::new();
    unoptimized.set_optimize_uses(false);
    let mut limited = MemorySsaConfig::new();
    limited.set_check_limit(1);

    for config in [MemorySsaConfig::new(), unoptimized, limited] {
        let mssa = MemorySsa::build_with_config(&func, aa, config).unwrap();
        if let Err(err) = mssa.verify(&func) {
            return Err(TestCaseError::fail(format!("{err}\n{}", mssa.display(&func))));
        }

        // Every phi has one incoming value per predecessor
        for (id, access) in mssa.accesses() {
            if let Some(phi) = access.as_phi() {
                prop_assert_eq!(phi.num_incoming(), mssa.cfg().num_predecessors(access.block()));
                prop_assert!(mssa.domtree().is_reachable_from_entry(access.block()), "{id}");
            }
        }

        let ids = mssa.accesses().map(|(id, _)| id).collect::<Vec<_>>();
        for id in ids.iter().copied() {
            if let Some(clobber) = mssa.access(id).as_use_or_def().and_then(|a| a.optimized()) {
                check_clobber(&mssa, &func, aa, id, clobber)?;
            }
        }

        let mut walker = mssa.walker(&func, aa);
        for id in ids.iter().copied() {
            let clobber = walker.clobbering_access(id);
            check_clobber(&mssa, &func, aa, id, clobber)?;
            prop_assert_eq!(walker.clobbering_access(id), clobber);
        }
    }

    Ok(())
}

#[test]
fn clobbers_are_sound_on_random_functions() {
    init_logger();

    let strategy = (prop::collection::vec(block_shape(), 1..7), any::<bool>());
    let res = TestRunner::new(Config::with_cases(128)).run(&strategy, |(shapes, precise)| {
        if precise {
            check_random_function(&shapes, &BasicAliasAnalysis)
        } else {
            check_random_function(&shapes, &KnowsNothing)
        }
    });

    match res {
        Err(TestError::Fail(reason, value)) => {
            panic!("found minimal failing case: {value:#?}\n{reason}");
        }
        Ok(_) => (),
        _ => panic!("unexpected test result: {res:?}"),
    }
}
