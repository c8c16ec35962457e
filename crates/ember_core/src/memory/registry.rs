//! # Allocator Registry
//!
//! A fixed-capacity table of registered allocators, addressed by opaque
//! [`AllocatorHandle`]s.
//!
//! ## Layout
//!
//! ```text
//!   slot:   0        1        2        3             MAX_ALLOCATORS-1
//!         ┌────────┬────────┬────────┬────────┬─────┬────────┐
//!  valid  │   1    │   1    │   0    │   1    │ ... │   0    │  AtomicBool (CAS claim)
//!  entry  │ System │ Stack  │   -    │ Stream │     │   -    │  RwLock<Option<Arc<Entry>>>
//!         └────────┴────────┴────────┴────────┴─────┴────────┘
//! ```
//!
//! Registration claims the first slot whose `valid` flag flips
//! `false -> true` with a compare-and-swap, so concurrent registrations
//! never block each other. The entry itself is published under the slot's
//! own lock, which is uncontended outside of that slot's lifecycle.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use parking_lot::RwLock;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::allocator::{Allocator, AllocatorKind};
use crate::memory::scope::current_allocator;
use crate::memory::system::SystemAllocator;

/// Number of slots in the global registry, slot 0 included.
pub const MAX_ALLOCATORS: usize = 256;

/// Opaque reference to a registered allocator.
///
/// Unique among live registrations; recycled once its allocator
/// deregisters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocatorHandle(u32);

impl AllocatorHandle {
    /// The system allocator, always registered in slot 0.
    pub const SYSTEM: Self = Self(0);

    /// Sentinel that never names an allocator.
    pub const INVALID: Self = Self(u32::MAX);

    /// Wraps a raw slot index.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw slot index.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot index as `usize`.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns false for [`AllocatorHandle::INVALID`].
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for AllocatorHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for AllocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "AllocatorHandle({})", self.0)
        } else {
            f.write_str("AllocatorHandle(INVALID)")
        }
    }
}

impl fmt::Display for AllocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Usage counters for one allocator.
///
/// Shared between the allocator (which bumps `fallbacks`) and the registry
/// (which accounts every dispatched allocation).
#[derive(Debug, Default)]
pub struct AllocatorStats {
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    fallbacks: AtomicU64,
}

impl AllocatorStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts an allocation of `size` bytes.
    #[inline]
    pub fn record_allocation(&self, size: usize) {
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts a release of `size` bytes.
    #[inline]
    pub fn record_deallocation(&self, size: usize) {
        saturating_sub(&self.live_bytes, size);
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts a request served by a fallback path.
    #[inline]
    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes currently outstanding.
    #[inline]
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Highest `live_bytes` ever observed.
    #[inline]
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Requests that needed a fallback.
    #[inline]
    #[must_use]
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Copies all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            live_bytes: self.live_bytes(),
            peak_bytes: self.peak_bytes(),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
            fallbacks: self.fallbacks(),
        }
    }
}

fn saturating_sub(counter: &AtomicUsize, amount: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(amount))
    });
}

/// Point-in-time copy of [`AllocatorStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Bytes currently outstanding.
    pub live_bytes: usize,
    /// Highest live byte count seen.
    pub peak_bytes: usize,
    /// Successful allocations.
    pub allocations: u64,
    /// Releases.
    pub deallocations: u64,
    /// Requests that needed a fallback.
    pub fallbacks: u64,
}

/// How an allocator wants to be registered.
#[derive(Clone, Debug)]
pub struct AllocatorDesc {
    /// Diagnostic name, also the config cache key for multi-pools.
    pub name: String,
    /// True when the allocator's buffer is embedded in the allocator object.
    pub is_inline: bool,
    /// Capacity in bytes (0 when unbounded or unknown).
    pub capacity: usize,
    /// Thread allowed to use and deregister the allocator; `None` for
    /// thread-safe allocators.
    pub owner: Option<ThreadId>,
    /// Usage counters; `None` disables accounting (and leak detection).
    pub stats: Option<Arc<AllocatorStats>>,
}

impl AllocatorDesc {
    /// A thread-safe, accounted, non-inline description.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_inline: false,
            capacity: 0,
            owner: None,
            stats: Some(Arc::new(AllocatorStats::new())),
        }
    }

    /// Sets the capacity in bytes.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Marks the buffer as embedded in the allocator object.
    #[must_use]
    pub fn inline(mut self) -> Self {
        self.is_inline = true;
        self
    }

    /// Restricts use to the calling thread.
    #[must_use]
    pub fn owned_by_current_thread(mut self) -> Self {
        self.owner = Some(thread::current().id());
        self
    }

    /// Shares existing counters with the registry.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<AllocatorStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Disables usage accounting.
    #[must_use]
    pub fn without_stats(mut self) -> Self {
        self.stats = None;
        self
    }
}

/// One occupied registry slot.
pub struct RegistryEntry {
    name: String,
    kind: AllocatorKind,
    allocator: Arc<dyn Allocator>,
    stats: Option<Arc<AllocatorStats>>,
    owner: Option<ThreadId>,
    is_inline: bool,
    capacity: usize,
}

impl RegistryEntry {
    fn new(allocator: Arc<dyn Allocator>, desc: AllocatorDesc) -> Self {
        Self {
            kind: allocator.kind(),
            name: desc.name,
            allocator,
            stats: desc.stats,
            owner: desc.owner,
            is_inline: desc.is_inline,
            capacity: desc.capacity,
        }
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocation strategy.
    #[must_use]
    pub fn kind(&self) -> AllocatorKind {
        self.kind
    }

    /// Usage counters, if accounted.
    #[must_use]
    pub fn stats(&self) -> Option<&Arc<AllocatorStats>> {
        self.stats.as_ref()
    }

    /// Owning thread of a single-owner allocator.
    #[must_use]
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// True for inline-buffer allocators.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.is_inline
    }

    /// Capacity in bytes (0 when unbounded).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn verify_owner(&self) {
        if let Some(owner) = self.owner {
            if owner != thread::current().id() {
                verification_failure!(
                    "allocator '{}' used from a thread that does not own it",
                    self.name
                );
            }
        }
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("is_inline", &self.is_inline)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Diagnostic snapshot of one registration.
#[derive(Clone, Debug)]
pub struct AllocatorReport {
    /// Handle of the allocator.
    pub handle: AllocatorHandle,
    /// Diagnostic name.
    pub name: String,
    /// Allocation strategy.
    pub kind: AllocatorKind,
    /// Inline buffer flag.
    pub is_inline: bool,
    /// Capacity in bytes.
    pub capacity: usize,
    /// Counters, when accounted.
    pub stats: Option<StatsSnapshot>,
}

struct Slot {
    valid: AtomicBool,
    entry: RwLock<Option<Arc<RegistryEntry>>>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            valid: AtomicBool::new(false),
            entry: RwLock::new(None),
        }
    }
}

/// The allocator table.
///
/// One process-wide instance lives behind [`registry()`]; standalone
/// instances are only useful for tests and tools.
pub struct AllocatorRegistry {
    slots: Box<[Slot]>,
    system: Arc<RegistryEntry>,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    allocations: AtomicU64,
}

impl AllocatorRegistry {
    /// Creates a registry with [`MAX_ALLOCATORS`] slots.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MAX_ALLOCATORS)
    }

    /// Creates a registry with `capacity` slots (at least 1).
    ///
    /// Slot 0 is always the [`SystemAllocator`].
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let slots: Box<[Slot]> = (0..capacity.max(1)).map(|_| Slot::empty()).collect();
        let system = Arc::new(RegistryEntry::new(
            Arc::new(SystemAllocator),
            AllocatorDesc::new("System"),
        ));
        slots[0].valid.store(true, Ordering::Release);
        *slots[0].entry.write() = Some(Arc::clone(&system));

        Self {
            slots,
            system,
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    /// Number of slots, slot 0 included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots, slot 0 included.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.valid.load(Ordering::Acquire))
            .count()
    }

    /// Registers an allocator and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::RegistryFull`] if no slot is free.
    pub fn register(
        &self,
        allocator: Arc<dyn Allocator>,
        desc: AllocatorDesc,
    ) -> MemoryResult<AllocatorHandle> {
        for (index, slot) in self.slots.iter().enumerate().skip(1) {
            if slot
                .valid
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let entry = RegistryEntry::new(allocator, desc);
                tracing::debug!(
                    allocator = %entry.name,
                    kind = entry.kind.as_str(),
                    slot = index,
                    "allocator registered"
                );
                *slot.entry.write() = Some(Arc::new(entry));
                return Ok(AllocatorHandle(index as u32));
            }
        }

        tracing::error!(allocator = %desc.name, "allocator registry is full");
        Err(MemoryError::RegistryFull { capacity: self.slots.len() })
    }

    /// Removes an allocator from the table.
    ///
    /// The calling thread must be the registering owner (single-owner
    /// allocators) and the allocator must have no outstanding bytes;
    /// violations are logged and abort debug builds.
    pub fn deregister(&self, handle: AllocatorHandle) {
        if handle == AllocatorHandle::SYSTEM || handle.index() >= self.slots.len() {
            verification_failure!("cannot deregister allocator handle {handle:?}");
            return;
        }

        let slot = &self.slots[handle.index()];
        let Some(entry) = slot.entry.read().clone() else {
            verification_failure!("deregistering allocator handle {handle:?} that is not registered");
            return;
        };

        if let Some(owner) = entry.owner {
            if owner != thread::current().id() {
                verification_failure!(
                    "allocator '{}' deregistered from a thread that does not own it",
                    entry.name
                );
            }
        }

        if let Some(stats) = &entry.stats {
            let live = stats.live_bytes();
            if live != 0 {
                verification_failure!("allocator '{}' leaked {} bytes", entry.name, live);
            }
        }

        *slot.entry.write() = None;
        slot.valid.store(false, Ordering::Release);
        tracing::debug!(allocator = %entry.name, slot = handle.index(), "allocator deregistered");
    }

    /// Looks up a live registration without any fallback.
    #[must_use]
    pub fn entry(&self, handle: AllocatorHandle) -> Option<Arc<RegistryEntry>> {
        let slot = self.slots.get(handle.index())?;
        if !slot.valid.load(Ordering::Acquire) {
            return None;
        }
        slot.entry.read().clone()
    }

    /// Returns true if `handle` names a live registration.
    #[must_use]
    pub fn is_registered(&self, handle: AllocatorHandle) -> bool {
        self.entry(handle).is_some()
    }

    /// Counters of a registered allocator.
    #[must_use]
    pub fn stats(&self, handle: AllocatorHandle) -> Option<Arc<AllocatorStats>> {
        self.entry(handle)?.stats.clone()
    }

    fn resolve(&self, handle: AllocatorHandle) -> Arc<RegistryEntry> {
        if let Some(entry) = self.entry(handle) {
            return entry;
        }
        verification_failure!(
            "invalid allocator handle {handle:?}, falling back to the system allocator"
        );
        Arc::clone(&self.system)
    }

    /// Allocates `size` bytes from the allocator named by `handle`.
    ///
    /// An unknown handle resolves to the system allocator (fatal in debug
    /// builds).
    #[must_use]
    pub fn allocate(&self, handle: AllocatorHandle, size: usize) -> Option<NonNull<u8>> {
        let entry = self.resolve(handle);
        entry.verify_owner();

        let ptr = entry.allocator.allocate(size);
        if ptr.is_some() {
            if let Some(stats) = &entry.stats {
                stats.record_allocation(size);
            }
            let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
            self.peak_bytes.fetch_max(live, Ordering::Relaxed);
            self.allocations.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::error!(allocator = %entry.name, size, "allocation failed");
        }
        ptr
    }

    /// Releases `size` bytes at `ptr` to the allocator named by `handle`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`AllocatorRegistry::allocate`] for
    /// the same handle and size, and not released since.
    pub unsafe fn deallocate(&self, handle: AllocatorHandle, ptr: NonNull<u8>, size: usize) {
        let entry = self.resolve(handle);
        entry.verify_owner();

        entry.allocator.deallocate(ptr, size);
        if let Some(stats) = &entry.stats {
            stats.record_deallocation(size);
        }
        saturating_sub(&self.live_bytes, size);
    }

    /// Size of the allocation at `ptr`, when the allocator tracks it.
    #[must_use]
    pub fn size_of_allocation(&self, handle: AllocatorHandle, ptr: NonNull<u8>) -> Option<usize> {
        self.resolve(handle).allocator.size_of_allocation(ptr)
    }

    /// Allocates from the thread's current allocator.
    #[must_use]
    pub fn allocate_current(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate(current_allocator(), size)
    }

    /// Releases to the thread's current allocator.
    ///
    /// # Safety
    ///
    /// Same contract as [`AllocatorRegistry::deallocate`] for the current
    /// handle.
    pub unsafe fn deallocate_current(&self, ptr: NonNull<u8>, size: usize) {
        self.deallocate(current_allocator(), ptr, size);
    }

    /// Bytes outstanding across every registration.
    ///
    /// A request one allocator forwards to its parent is counted at both.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Highest [`AllocatorRegistry::live_bytes`] observed.
    #[must_use]
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Successful allocations dispatched through the registry.
    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Snapshot of every live registration.
    #[must_use]
    pub fn report(&self) -> Vec<AllocatorReport> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.read().clone()?;
                Some(AllocatorReport {
                    handle: AllocatorHandle(index as u32),
                    name: entry.name.clone(),
                    kind: entry.kind,
                    is_inline: entry.is_inline,
                    capacity: entry.capacity,
                    stats: entry.stats.as_ref().map(|s| s.snapshot()),
                })
            })
            .collect()
    }

    /// Emits [`AllocatorRegistry::report`] through `tracing`.
    pub fn log_report(&self) {
        for report in self.report() {
            let stats = report.stats.unwrap_or_default();
            tracing::info!(
                handle = report.handle.raw(),
                allocator = %report.name,
                kind = report.kind.as_str(),
                live_bytes = stats.live_bytes,
                peak_bytes = stats.peak_bytes,
                fallbacks = stats.fallbacks,
                "allocator usage"
            );
        }
    }
}

impl Default for AllocatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorRegistry")
            .field("capacity", &self.capacity())
            .field("registered", &self.registered_count())
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}

/// The process-wide registry.
pub fn registry() -> &'static AllocatorRegistry {
    static REGISTRY: OnceLock<AllocatorRegistry> = OnceLock::new();
    REGISTRY.get_or_init(AllocatorRegistry::new)
}

/// Keeps an allocator registered in the global registry while it lives.
#[derive(Debug)]
pub(crate) struct Registration {
    handle: AllocatorHandle,
}

impl Registration {
    pub(crate) fn register(allocator: Arc<dyn Allocator>, desc: AllocatorDesc) -> MemoryResult<Self> {
        registry().register(allocator, desc).map(|handle| Self { handle })
    }

    #[inline]
    pub(crate) fn handle(&self) -> AllocatorHandle {
        self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        registry().deregister(self.handle);
    }
}

/// Serves a request an allocator could not satisfy from its parent.
pub(crate) fn fall_back(
    name: &str,
    parent: AllocatorHandle,
    stats: &AllocatorStats,
    size: usize,
) -> Option<NonNull<u8>> {
    stats.record_fallback();
    tracing::debug!(allocator = %name, parent = parent.raw(), size, "falling back to parent allocator");
    registry().allocate(parent, size)
}
