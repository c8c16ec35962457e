//! # Multi-Pool Allocator
//!
//! A growing set of [`PoolArena`] banks, one block size per bank, sorted
//! ascending so the first fitting bank is also the tightest.
//!
//! ## Bank Selection
//!
//! ```text
//!   request 40 B  ->  wanted = max(40, min_block) = 40
//!
//!   banks:  [16 B]  [32 B]  [64 B]  [256 B]
//!             no      no     yes      no (> 2 x 40)
//!                            ^ served here if it has a free block
//! ```
//!
//! When no bank qualifies a new one is grown: its block size is the next
//! power-of-two multiple of `min_block_size`, its count fills
//! `bank_budget_bytes`. Growth is counted as a fallback so hot paths that
//! keep growing show up in the allocator report.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};
use crate::memory::allocator::{Allocator, AllocatorKind};
use crate::memory::config_cache::{config_cache, PoolConfig};
use crate::memory::pool::PoolArena;
use crate::memory::registry::{
    registry, AllocatorDesc, AllocatorHandle, AllocatorStats, Registration, StatsSnapshot,
};
use crate::memory::scope::{current_allocator, AllocationScope};

/// Growth policy of a multi-pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiPoolSettings {
    /// Smallest block size; every bank is a power-of-two multiple of it.
    pub min_block_size: usize,
    /// Target bytes per grown bank.
    pub bank_budget_bytes: usize,
    /// Lower bound on blocks per bank for blocks below
    /// `large_block_threshold`.
    pub min_blocks_per_bank: usize,
    /// Block size from which a bank may hold a single block.
    pub large_block_threshold: usize,
    /// Pre-create banks from, and record banks into, the config cache.
    pub use_config_cache: bool,
}

impl Default for MultiPoolSettings {
    fn default() -> Self {
        Self {
            min_block_size: 16,
            bank_budget_bytes: 64 * 1024,
            min_blocks_per_bank: 32,
            large_block_threshold: 1024 * 1024,
            use_config_cache: true,
        }
    }
}

impl MultiPoolSettings {
    /// Checks the policy for values banks cannot be built from.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.min_block_size < 4 || !self.min_block_size.is_power_of_two() {
            return Err(MemoryError::InvalidConfig(format!(
                "min_block_size must be a power of two >= 4, got {}",
                self.min_block_size
            )));
        }
        if self.bank_budget_bytes == 0 {
            return Err(MemoryError::InvalidConfig("bank_budget_bytes must be non-zero".into()));
        }
        if self.min_blocks_per_bank == 0 {
            return Err(MemoryError::InvalidConfig("min_blocks_per_bank must be non-zero".into()));
        }
        Ok(())
    }
}

/// Shape of the bank grown for a `size`-byte request.
///
/// `None` if the block size or count does not fit a `u32`.
#[must_use]
pub fn grown_bank_config(size: usize, settings: &MultiPoolSettings) -> Option<PoolConfig> {
    let min_block = settings.min_block_size.max(1);
    let multiples = size.max(1).div_ceil(min_block);
    let block_size = min_block.checked_mul(multiples.checked_next_power_of_two()?)?;

    let floor = if block_size >= settings.large_block_threshold {
        1
    } else {
        settings.min_blocks_per_bank.max(1)
    };
    let block_count = settings.bank_budget_bytes.div_ceil(block_size).max(floor);

    PoolConfig::from_sizes(block_size, block_count)
}

/// Size-sorted pool banks.
///
/// Not synchronised; the thread-safe allocator keeps it behind a mutex and
/// the single-owner one behind an owner-thread check.
pub struct MultiPool {
    settings: MultiPoolSettings,
    banks: Vec<PoolArena>,
}

impl MultiPool {
    /// Creates a multi-pool without banks.
    #[must_use]
    pub fn new(settings: MultiPoolSettings) -> Self {
        Self { settings, banks: Vec::new() }
    }

    /// Creates a multi-pool with one bank per config.
    ///
    /// Configs that cannot be built are skipped with a warning; the bank
    /// grows again on demand.
    #[must_use]
    pub fn with_configs(settings: MultiPoolSettings, configs: &[PoolConfig]) -> Self {
        let mut pool = Self::new(settings);
        for config in configs {
            match PoolArena::new(config.block_size as usize, config.block_count as usize) {
                Ok(bank) => {
                    pool.insert(bank);
                }
                Err(error) => tracing::warn!(
                    block_size = config.block_size,
                    block_count = config.block_count,
                    %error,
                    "skipping cached bank"
                ),
            }
        }
        pool
    }

    /// Growth policy.
    #[must_use]
    pub fn settings(&self) -> &MultiPoolSettings {
        &self.settings
    }

    /// Banks in ascending block size.
    #[must_use]
    pub fn banks(&self) -> &[PoolArena] {
        &self.banks
    }

    /// Number of banks.
    #[must_use]
    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Free blocks across every bank.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.banks.iter().map(PoolArena::number_of_free_blocks).sum()
    }

    fn insert(&mut self, bank: PoolArena) -> usize {
        // Equivalent to append + stable sort by block size.
        let index = self.banks.partition_point(|b| b.block_size() <= bank.block_size());
        self.banks.insert(index, bank);
        index
    }

    /// Index of the bank that should serve `size`, if any qualifies.
    #[must_use]
    pub fn bank_index(&self, size: usize) -> Option<usize> {
        let wanted = size.max(self.settings.min_block_size);
        let limit = wanted.saturating_mul(2);
        self.banks
            .iter()
            .take_while(|bank| bank.block_size() <= limit)
            .position(|bank| bank.block_size() >= wanted && bank.has_free_block())
    }

    /// Takes a block from bank `index`.
    pub fn allocate_in(&mut self, index: usize) -> Option<NonNull<u8>> {
        self.banks.get_mut(index)?.allocate()
    }

    /// Serves `size` from an existing bank, without growing.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let index = self.bank_index(size)?;
        self.allocate_in(index)
    }

    /// Grows a bank suited to `size` and returns its index.
    ///
    /// # Errors
    ///
    /// Fails if the bank shape is not representable or its buffer cannot
    /// be reserved.
    pub fn grow(&mut self, size: usize) -> MemoryResult<usize> {
        let config = grown_bank_config(size, &self.settings).ok_or(MemoryError::OutOfMemory { size })?;
        let bank = PoolArena::new(config.block_size as usize, config.block_count as usize)?;
        Ok(self.insert(bank))
    }

    /// Returns true if some bank owns `ptr`.
    #[must_use]
    pub fn is_mine(&self, ptr: NonNull<u8>) -> bool {
        self.banks.iter().any(|bank| bank.is_mine(ptr))
    }

    /// Block size of the bank owning `ptr`.
    #[must_use]
    pub fn size_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.banks.iter().find(|bank| bank.is_mine(ptr)).map(PoolArena::block_size)
    }

    /// Returns the block at `ptr` to its bank; false if no bank owns it.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> bool {
        match self.banks.iter_mut().find(|bank| bank.is_mine(ptr)) {
            Some(bank) => bank.deallocate(ptr),
            None => false,
        }
    }

    /// Current bank shapes, counts of equal-size banks summed.
    #[must_use]
    pub fn bank_configs(&self) -> Vec<PoolConfig> {
        let mut configs: Vec<PoolConfig> = Vec::with_capacity(self.banks.len());
        for bank in &self.banks {
            let Some(config) = bank.config() else {
                tracing::warn!(
                    block_size = bank.block_size(),
                    block_count = bank.block_count(),
                    "bank too large to record, skipped"
                );
                continue;
            };
            match configs.last_mut() {
                Some(last) if last.block_size == config.block_size => {
                    last.block_count = last.block_count.saturating_add(config.block_count);
                }
                _ => configs.push(config),
            }
        }
        configs
    }
}

impl fmt::Debug for MultiPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiPool")
            .field("banks", &self.bank_configs())
            .field("free_blocks", &self.free_blocks())
            .finish()
    }
}

struct MultiPoolState {
    pool: MultiPool,
    // Addresses the parent served because no bank could be created.
    parent_blocks: HashSet<usize>,
}

/// How a backend reaches its [`MultiPoolState`].
trait StateAccess: Send + Sync + Sized {
    fn new(state: MultiPoolState) -> Self;

    /// Runs `f` on the state. `None` when the calling thread may not touch it.
    fn with<R>(&self, f: impl FnOnce(&mut MultiPoolState) -> R) -> Option<R>;
}

/// Mutex-guarded state shared by every thread.
struct LockedState(Mutex<MultiPoolState>);

impl StateAccess for LockedState {
    fn new(state: MultiPoolState) -> Self {
        Self(Mutex::new(state))
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut MultiPoolState) -> R) -> Option<R> {
        Some(f(&mut self.0.lock()))
    }
}

/// Unsynchronised state bound to the thread that created it.
struct OwnedState {
    owner: ThreadId,
    cell: RefCell<MultiPoolState>,
}

// SAFETY: `cell` is only reached through `with`, which refuses every thread
// except `owner`. Thread ids are never reused, so the non-atomic borrow flag
// and the state behind it are only ever touched by one thread.
unsafe impl Sync for OwnedState {}

impl StateAccess for OwnedState {
    fn new(state: MultiPoolState) -> Self {
        Self {
            owner: thread::current().id(),
            cell: RefCell::new(state),
        }
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut MultiPoolState) -> R) -> Option<R> {
        if thread::current().id() != self.owner {
            verification_failure!("single-owner multi-pool touched from a foreign thread");
            return None;
        }
        let Ok(mut state) = self.cell.try_borrow_mut() else {
            verification_failure!("reentrant access to a single-owner multi-pool");
            return None;
        };
        Some(f(&mut state))
    }
}

/// Where a freed pointer went.
enum Release {
    Bank,
    Parent,
    Unknown,
}

struct MultiPoolBackend<S> {
    name: String,
    kind: AllocatorKind,
    state: S,
    parent: AllocatorHandle,
    stats: Arc<AllocatorStats>,
}

impl<S: StateAccess + 'static> MultiPoolBackend<S> {
    fn build(
        name: String,
        kind: AllocatorKind,
        settings: MultiPoolSettings,
        owned: bool,
    ) -> MemoryResult<(Registration, Arc<Self>)> {
        settings.validate()?;

        let cached = if settings.use_config_cache {
            config_cache().lock().get(&name).map(<[PoolConfig]>::to_vec)
        } else {
            None
        };
        let pool = match cached {
            Some(configs) => {
                tracing::debug!(allocator = %name, banks = configs.len(), "pre-creating banks from config cache");
                MultiPool::with_configs(settings, &configs)
            }
            None => MultiPool::new(settings),
        };

        let stats = Arc::new(AllocatorStats::new());
        let backend = Arc::new(Self {
            name: name.clone(),
            kind,
            state: S::new(MultiPoolState {
                pool,
                parent_blocks: HashSet::new(),
            }),
            parent: current_allocator(),
            stats: Arc::clone(&stats),
        });

        let mut desc = AllocatorDesc::new(name).with_stats(stats);
        if owned {
            desc = desc.owned_by_current_thread();
        }
        let registration = Registration::register(backend.clone(), desc)?;
        Ok((registration, backend))
    }

    fn record_into_cache(&self) {
        let configs = self.state.with(|state| {
            if state.pool.settings().use_config_cache {
                state.pool.bank_configs()
            } else {
                Vec::new()
            }
        });
        if let Some(configs) = configs.filter(|configs| !configs.is_empty()) {
            config_cache().lock().record(&self.name, &configs);
        }
    }

    fn grow_and_allocate(&self, state: &mut MultiPoolState, size: usize) -> Option<NonNull<u8>> {
        self.stats.record_fallback();
        match state.pool.grow(size) {
            Ok(index) => {
                let bank = &state.pool.banks()[index];
                tracing::debug!(
                    allocator = %self.name,
                    size,
                    block_size = bank.block_size(),
                    block_count = bank.block_count(),
                    "multi-pool bank grown"
                );
                state.pool.allocate_in(index)
            }
            Err(error) => {
                tracing::warn!(allocator = %self.name, size, %error, "bank growth failed, using parent");
                None
            }
        }
    }
}

impl<S: StateAccess + 'static> Allocator for MultiPoolBackend<S> {
    fn kind(&self) -> AllocatorKind {
        self.kind
    }

    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let served = self.state.with(|state| {
            state
                .pool
                .allocate(size)
                .or_else(|| self.grow_and_allocate(state, size))
        })?;
        if served.is_some() {
            return served;
        }

        // The parent may be another allocator on this thread; never hold the state across it.
        let ptr = registry().allocate(self.parent, size)?;
        let tracked = self
            .state
            .with(|state| state.parent_blocks.insert(ptr.as_ptr() as usize));
        if tracked.is_none() {
            // SAFETY: `ptr` was just served by the parent for `size` bytes.
            unsafe { registry().deallocate(self.parent, ptr, size) };
            return None;
        }
        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        let released = self.state.with(|state| {
            if state.pool.deallocate(ptr) {
                Release::Bank
            } else if state.parent_blocks.remove(&(ptr.as_ptr() as usize)) {
                Release::Parent
            } else {
                Release::Unknown
            }
        });
        match released {
            Some(Release::Parent) => registry().deallocate(self.parent, ptr, size),
            Some(Release::Unknown) => {
                verification_failure!("pointer {:p} is not owned by multi-pool '{}'", ptr, self.name);
            }
            Some(Release::Bank) | None => {}
        }
    }

    fn size_of_allocation(&self, ptr: NonNull<u8>) -> Option<usize> {
        let (own, from_parent) = self.state.with(|state| {
            let own = state.pool.size_of(ptr);
            let from_parent = own.is_none() && state.parent_blocks.contains(&(ptr.as_ptr() as usize));
            (own, from_parent)
        })?;
        if own.is_some() {
            own
        } else if from_parent {
            registry().size_of_allocation(self.parent, ptr)
        } else {
            None
        }
    }
}

macro_rules! multi_pool_api {
    ($ty:ident) => {
        impl $ty {
            /// Registry handle.
            #[inline]
            #[must_use]
            pub fn handle(&self) -> AllocatorHandle {
                self.registration.handle()
            }

            /// Diagnostic name, also the config cache key.
            #[must_use]
            pub fn name(&self) -> &str {
                &self.backend.name
            }

            /// Allocates through the registry.
            #[must_use]
            pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
                registry().allocate(self.handle(), size)
            }

            /// Frees through the registry.
            ///
            /// # Safety
            ///
            /// `ptr` must come from `allocate` on this allocator with the
            /// same `size` and not have been freed.
            pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
                registry().deallocate(self.handle(), ptr, size);
            }

            /// Current bank shapes, ascending, counts of equal sizes summed.
            #[must_use]
            pub fn bank_configs(&self) -> Vec<PoolConfig> {
                self.backend
                    .state
                    .with(|state| state.pool.bank_configs())
                    .unwrap_or_default()
            }

            /// Number of banks.
            #[must_use]
            pub fn bank_count(&self) -> usize {
                self.backend
                    .state
                    .with(|state| state.pool.bank_count())
                    .unwrap_or_default()
            }

            /// Bank grows plus parent-served requests.
            #[must_use]
            pub fn fallback_count(&self) -> u64 {
                self.backend.stats.fallbacks()
            }

            /// Usage counters.
            #[must_use]
            pub fn stats(&self) -> StatsSnapshot {
                self.backend.stats.snapshot()
            }

            /// Makes this allocator the thread's current allocator.
            pub fn scope(&self) -> AllocationScope {
                AllocationScope::new(self.handle())
            }
        }

        impl Drop for $ty {
            fn drop(&mut self) {
                self.backend.record_into_cache();
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    .field("name", &self.backend.name)
                    .field("handle", &self.handle())
                    .field("banks", &self.bank_configs())
                    .finish()
            }
        }
    };
}

/// Multi-pool confined to the thread that created it.
///
/// One per task stream; the registry rejects use from other threads.
pub struct MultiPoolAllocator {
    registration: Registration,
    backend: Arc<MultiPoolBackend<OwnedState>>,
    _not_send: PhantomData<*const ()>,
}

impl MultiPoolAllocator {
    /// Creates and registers a multi-pool owned by the calling thread.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings or a full registry.
    pub fn new(name: impl Into<String>, settings: MultiPoolSettings) -> MemoryResult<Self> {
        let (registration, backend) =
            MultiPoolBackend::build(name.into(), AllocatorKind::MultiPool, settings, true)?;
        Ok(Self {
            registration,
            backend,
            _not_send: PhantomData,
        })
    }
}

multi_pool_api!(MultiPoolAllocator);

/// Multi-pool serialised behind one mutex, usable from any thread.
///
/// Bank growth and allocation are mutually exclusive.
pub struct ThreadSafeMultiPoolAllocator {
    registration: Registration,
    backend: Arc<MultiPoolBackend<LockedState>>,
}

impl ThreadSafeMultiPoolAllocator {
    /// Creates and registers a thread-safe multi-pool.
    ///
    /// # Errors
    ///
    /// Fails on invalid settings or a full registry.
    pub fn new(name: impl Into<String>, settings: MultiPoolSettings) -> MemoryResult<Self> {
        let (registration, backend) = MultiPoolBackend::build(
            name.into(),
            AllocatorKind::ThreadSafeMultiPool,
            settings,
            false,
        )?;
        Ok(Self { registration, backend })
    }
}

multi_pool_api!(ThreadSafeMultiPoolAllocator);

#[cfg(test)]
mod tests {
    use super::*;

    fn uncached() -> MultiPoolSettings {
        MultiPoolSettings {
            use_config_cache: false,
            ..MultiPoolSettings::default()
        }
    }

    #[test]
    fn test_grown_bank_shape() {
        let settings = MultiPoolSettings::default();
        assert_eq!(grown_bank_config(1, &settings), Some(PoolConfig::new(16, 4096)));
        assert_eq!(grown_bank_config(16, &settings), Some(PoolConfig::new(16, 4096)));
        assert_eq!(grown_bank_config(17, &settings), Some(PoolConfig::new(32, 2048)));
        assert_eq!(grown_bank_config(40, &settings), Some(PoolConfig::new(64, 1024)));
        // 4 KiB blocks: 16 fill the budget, floored to 32.
        assert_eq!(grown_bank_config(4000, &settings), Some(PoolConfig::new(4096, 32)));
        // Large blocks may stand alone.
        assert_eq!(
            grown_bank_config(3 * 1024 * 1024, &settings),
            Some(PoolConfig::new(4 * 1024 * 1024, 1))
        );
    }

    #[test]
    fn test_banks_stay_sorted() {
        let mut pool = MultiPool::new(uncached());
        pool.grow(500).unwrap();
        pool.grow(10).unwrap();
        pool.grow(100).unwrap();
        let sizes: Vec<_> = pool.banks().iter().map(PoolArena::block_size).collect();
        assert_eq!(sizes, vec![16, 128, 512]);
    }

    #[test]
    fn test_bank_index_respects_twice_rule() {
        let mut pool = MultiPool::new(uncached());
        let big = pool.grow(256).unwrap();
        assert_eq!(pool.banks()[big].block_size(), 256);

        // 256 > 2 * 100, so a 100-byte request must not use it.
        assert_eq!(pool.bank_index(100), None);
        assert_eq!(pool.bank_index(200), Some(0));
        assert_eq!(pool.bank_index(257), None);
    }

    #[test]
    fn test_served_block_is_within_twice_request() {
        let mut pool = MultiPool::new(uncached());
        for size in [1, 7, 16, 17, 33, 100, 250, 1000, 5000] {
            let ptr = match pool.allocate(size) {
                Some(ptr) => ptr,
                None => {
                    let index = pool.grow(size).unwrap();
                    pool.allocate_in(index).unwrap()
                }
            };
            let block = pool.size_of(ptr).unwrap();
            let wanted = size.max(16);
            assert!(block >= wanted && block <= 2 * wanted, "{size} -> {block}");
            assert!(pool.deallocate(ptr));
        }
    }

    #[test]
    fn test_bank_configs_sum_equal_sizes() {
        let mut pool = MultiPool::new(uncached());
        pool.grow(16).unwrap();
        pool.grow(16).unwrap();
        pool.grow(64).unwrap();
        assert_eq!(
            pool.bank_configs(),
            vec![PoolConfig::new(16, 8192), PoolConfig::new(64, 1024)]
        );
    }

    #[test]
    fn test_allocator_grows_and_counts_fallbacks() {
        let multi = MultiPoolAllocator::new("multi::grow", uncached()).unwrap();
        let a = multi.allocate(24).unwrap();
        let b = multi.allocate(24).unwrap();
        assert_eq!(multi.bank_count(), 1);
        assert_eq!(multi.fallback_count(), 1);

        unsafe {
            multi.deallocate(a, 24);
            multi.deallocate(b, 24);
        }
        assert_eq!(multi.stats().live_bytes, 0);
    }

    #[test]
    fn test_thread_safe_variant_across_threads() {
        let multi = Arc::new(ThreadSafeMultiPoolAllocator::new("multi::shared", uncached()).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|t| {
                let multi = Arc::clone(&multi);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let size = 8 + (t * 37 + i) % 300;
                        let ptr = multi.allocate(size).unwrap();
                        unsafe { multi.deallocate(ptr, size) };
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(multi.stats().live_bytes, 0);
    }

    #[test]
    fn test_variants_register_with_their_ownership() {
        let owned = MultiPoolAllocator::new("multi::owned-kind", uncached()).unwrap();
        let shared = ThreadSafeMultiPoolAllocator::new("multi::shared-kind", uncached()).unwrap();

        let owned_entry = registry().entry(owned.handle()).unwrap();
        assert_eq!(owned_entry.kind(), AllocatorKind::MultiPool);
        assert_eq!(owned_entry.owner(), Some(thread::current().id()));

        let shared_entry = registry().entry(shared.handle()).unwrap();
        assert_eq!(shared_entry.kind(), AllocatorKind::ThreadSafeMultiPool);
        assert_eq!(shared_entry.owner(), None);
    }

    #[test]
    fn test_owned_state_refuses_foreign_thread() {
        let state = OwnedState::new(MultiPoolState {
            pool: MultiPool::new(uncached()),
            parent_blocks: HashSet::new(),
        });
        assert_eq!(state.with(|s| s.pool.bank_count()), Some(0));

        let foreign = thread::scope(|scope| {
            scope
                .spawn(|| {
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        state.with(|s| s.pool.grow(16).is_ok())
                    }))
                })
                .join()
                .unwrap()
        });
        if cfg!(debug_assertions) {
            assert!(foreign.is_err());
        } else {
            assert_eq!(foreign.ok(), Some(None));
        }
        // The refused call never reached the pool.
        assert_eq!(state.with(|s| s.pool.bank_count()), Some(0));
    }

    #[test]
    #[cfg(debug_assertions)]
    fn test_unowned_pointer_is_fatal_in_debug() {
        let multi = MultiPoolAllocator::new("multi::unowned", uncached()).unwrap();
        let foreign = crate::memory::SystemAllocator.allocate(32).unwrap();
        let handle = multi.handle();
        let result = std::panic::catch_unwind(|| unsafe {
            registry().deallocate(handle, foreign, 32);
        });
        assert!(result.is_err());
        unsafe { crate::memory::SystemAllocator.deallocate(foreign, 32) };
    }

    #[test]
    fn test_drop_records_bank_configs_in_cache() {
        let settings = MultiPoolSettings::default();
        {
            let multi = MultiPoolAllocator::new("multi::cache-record", settings.clone()).unwrap();
            let ptr = multi.allocate(100).unwrap();
            unsafe { multi.deallocate(ptr, 100) };
        }
        let recorded = config_cache().lock().get("multi::cache-record").map(<[PoolConfig]>::to_vec);
        assert_eq!(recorded, Some(vec![PoolConfig::new(128, 512)]));

        let again = MultiPoolAllocator::new("multi::cache-record", settings).unwrap();
        assert_eq!(again.bank_count(), 1);
        let ptr = again.allocate(100).unwrap();
        assert_eq!(again.fallback_count(), 0);
        unsafe { again.deallocate(ptr, 100) };
    }
}
