//! Integration tests for the registered allocators.
//!
//! Every allocator here gets a unique name and frees what it allocates, so
//! deregistration never trips the leak check.

#![allow(unsafe_code)]

use std::env::temp_dir;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::time::{SystemTime, UNIX_EPOCH};

use ember_core::memory::{
    self, config_cache, current_allocator, registry, scope_depth, AllocationScope,
    AllocatorHandle, AllocatorKind, InlineAllocator, MultiPoolAllocator, MultiPoolConfigCache,
    MultiPoolSettings, PoolAllocator, PoolConfig, StackAllocator, ThreadSafeMultiPoolAllocator,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn uncached() -> MultiPoolSettings {
    MultiPoolSettings {
        use_config_cache: false,
        ..MultiPoolSettings::default()
    }
}

#[test]
fn test_pool_hundred_by_hundred() {
    let pool = PoolAllocator::new("it::pool100", 100, 100).unwrap();
    let handle = pool.handle();

    let blocks: Vec<NonNull<u8>> = (0..100).map(|_| pool.allocate(100).unwrap()).collect();
    for block in &blocks {
        assert_eq!(registry().size_of_allocation(handle, *block), Some(100));
    }
    assert_eq!(pool.number_of_free_blocks(), 0);

    // The 101st request falls back to the parent.
    let extra = pool.allocate(100).unwrap();
    assert_eq!(pool.fallback_count(), 1);
    unsafe { pool.deallocate(extra, 100) };

    for block in blocks {
        unsafe { pool.deallocate(block, 100) };
    }
    assert_eq!(pool.number_of_free_blocks(), 100);
    assert_eq!(pool.free_list_len(), 100);
}

#[test]
fn test_stack_reverse_order_always_returns_to_zero() {
    let stack = StackAllocator::new("it::stack-reverse", 64 * 1024).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..20 {
        let sizes: Vec<usize> = (0..rng.gen_range(1..50)).map(|_| rng.gen_range(1..200)).collect();
        let ptrs: Vec<_> = sizes.iter().map(|&s| stack.allocate(s).unwrap()).collect();
        for (ptr, size) in ptrs.into_iter().zip(sizes).rev() {
            unsafe { stack.deallocate(ptr, size) };
        }
        assert_eq!(stack.usage(), 0);
    }
    assert_eq!(stack.fallback_count(), 0);
}

#[test]
fn test_stack_random_free_order_eventually_reclaims() {
    let stack = StackAllocator::new("it::stack-shuffle", 64 * 1024).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let mut live: Vec<_> = (0..64)
        .map(|_| {
            let size = rng.gen_range(1..300);
            (stack.allocate(size).unwrap(), size)
        })
        .collect();
    while !live.is_empty() {
        let (ptr, size) = live.swap_remove(rng.gen_range(0..live.len()));
        unsafe { stack.deallocate(ptr, size) };
        assert!(stack.usage() <= stack.capacity());
    }
    assert_eq!(stack.usage(), 0);
}

#[test]
fn test_multi_pool_serves_within_twice_or_grows_once() {
    let multi = MultiPoolAllocator::new("it::multi-rule", uncached()).unwrap();
    let handle = multi.handle();
    let mut rng = StdRng::seed_from_u64(3);
    let mut live = Vec::new();

    for _ in 0..2_000 {
        let size = rng.gen_range(1..=4096);
        let banks_before = multi.bank_count();
        let ptr = multi.allocate(size).unwrap();
        let block = registry().size_of_allocation(handle, ptr).unwrap();
        let wanted = size.max(16);
        assert!(block >= wanted && block <= 2 * wanted, "{size} served by {block}");
        assert!(multi.bank_count() - banks_before <= 1);
        live.push((ptr, size));
    }

    let configs = multi.bank_configs();
    assert!(configs.windows(2).all(|w| w[0].block_size < w[1].block_size));

    for (ptr, size) in live {
        unsafe { multi.deallocate(ptr, size) };
    }
    assert_eq!(multi.stats().live_bytes, 0);
}

#[test]
fn test_scopes_nest_and_survive_early_exit() {
    fn nest(depth: usize, fail_at: usize) -> Result<(), String> {
        let _scope = AllocationScope::new(AllocatorHandle::from_raw(depth as u32 + 100));
        if depth == fail_at {
            return Err(format!("failed at {depth}"));
        }
        nest(depth + 1, fail_at)
    }

    let before = current_allocator();
    assert!(nest(0, 7).is_err());
    assert_eq!(current_allocator(), before);
    assert_eq!(scope_depth(), 0);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _a = AllocationScope::new(AllocatorHandle::from_raw(200));
        let _b = AllocationScope::new(AllocatorHandle::from_raw(201));
        panic!("unwinding through two scopes");
    }));
    assert!(result.is_err());
    assert_eq!(current_allocator(), before);
}

#[test]
fn test_nested_allocators_fall_back_through_parents() {
    let outer = StackAllocator::new("it::outer", 4096).unwrap();
    let _outer_scope = outer.scope();

    let inner = PoolAllocator::new("it::inner", 32, 2).unwrap();
    let a = inner.allocate(32).unwrap();
    let b = inner.allocate(32).unwrap();
    let c = inner.allocate(32).unwrap();
    assert_eq!(inner.fallback_count(), 1);
    assert!(outer.usage() > 0);

    unsafe {
        inner.deallocate(c, 32);
        inner.deallocate(b, 32);
        inner.deallocate(a, 32);
    }
    assert_eq!(outer.usage(), 0);
}

#[test]
fn test_module_allocate_routes_to_current() {
    let inline = InlineAllocator::<1024>::new("it::inline").unwrap();
    let before = registry().stats(inline.handle()).unwrap().snapshot();
    {
        let _scope = inline.scope();
        let ptr = memory::allocate(64).unwrap();
        unsafe { memory::deallocate(ptr, 64) };
    }
    let after = registry().stats(inline.handle()).unwrap().snapshot();
    assert_eq!(after.allocations, before.allocations + 1);
    assert_eq!(after.live_bytes, 0);
}

#[test]
fn test_report_includes_live_allocators() {
    let pool = PoolAllocator::new("it::reported-pool", 16, 8).unwrap();
    let report = registry().report();
    let entry = report.iter().find(|r| r.handle == pool.handle()).unwrap();
    assert_eq!(entry.name, "it::reported-pool");
    assert_eq!(entry.kind, AllocatorKind::Pool);
    assert!(report.iter().any(|r| r.handle == AllocatorHandle::SYSTEM));
}

#[test]
fn test_thread_safe_multi_pool_shared_between_threads() {
    let multi = std::sync::Arc::new(
        ThreadSafeMultiPoolAllocator::new("it::shared-multi", uncached()).unwrap(),
    );
    let threads: Vec<_> = (0..8u64)
        .map(|seed| {
            let multi = std::sync::Arc::clone(&multi);
            std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut live = Vec::new();
                for _ in 0..500 {
                    let size = rng.gen_range(1..1024);
                    live.push((multi.allocate(size).unwrap(), size));
                    if live.len() > 16 {
                        let (ptr, size) = live.swap_remove(0);
                        unsafe { multi.deallocate(ptr, size) };
                    }
                }
                for (ptr, size) in live {
                    unsafe { multi.deallocate(ptr, size) };
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(multi.stats().live_bytes, 0);
}

#[test]
fn test_config_cache_persists_across_allocator_lifetimes() {
    let name = "it::persisted-multi";
    {
        let multi = MultiPoolAllocator::new(name, MultiPoolSettings::default()).unwrap();
        let ptrs: Vec<_> = [24, 200, 900].iter().map(|&s| (multi.allocate(s).unwrap(), s)).collect();
        for (ptr, size) in ptrs {
            unsafe { multi.deallocate(ptr, size) };
        }
    }

    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let path = temp_dir().join(format!("ember_it_cache_{nanos}.dat"));
    config_cache().lock().save(&path).unwrap();

    let loaded = MultiPoolConfigCache::load(&path).unwrap();
    assert_eq!(
        loaded.get(name).unwrap(),
        &[PoolConfig::new(32, 2048), PoolConfig::new(256, 256), PoolConfig::new(1024, 64)]
    );
    std::fs::remove_file(&path).ok();
}
