//! Hierarchical pools
//!
//! A [`Pool`] is a region: memory handed out by it is never freed
//! individually, only all at once when the pool is cleared or destroyed.
//! Pools form a tree. Tearing a pool down tears down its whole subtree
//! first, then runs its cleanups, then reaps its subprocesses, then drops
//! its user data, and finally gives its memory back to the allocator.
//!
//! # Handles
//!
//! `Pool` is a cheap, clonable handle. Destroying a pool invalidates every
//! handle to it: later calls return a `LogicError` instead of touching
//! freed memory. Memory returned by [`Pool::allocate`] and strings returned
//! by [`Pool::format`] are raw; dereferencing them after the pool was
//! cleared or destroyed is undefined behavior, as with any arena.
//!
//! ## Locking
//!
//! Pool state sits behind an internal mutex that is never held while user
//! callbacks run, so cleanups may use the pool they are registered on. A
//! caller-supplied re-entrant mutex ([`Pool::set_mutex`]) is held for the
//! whole of each public operation, teardown included.
//!
//! Locks nest in one order only: a pool's caller mutex, then its state,
//! then the allocator's caller mutex, then the allocator's free lists.
//! Linking and unlinking children takes the parent's state lock alone.

mod chain;
mod cleanup;
mod format;
mod storage;
mod tracked;
mod tree;

use std::any::Any;
use std::fmt;
use std::mem;
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub use cleanup::{CleanupFn, noop_cleanup};
pub use format::PoolStr;

use crate::allocator::{Allocator, PoolMutex};
use crate::core::{PoolConfig, PoolMode};
use crate::error::{MemoryError, MemoryResult};
use crate::process::{self, KillPolicy, KillTiming, Subprocess, SubprocessRecord};
use cleanup::{CleanupEntry, CleanupKey, CleanupRegistry, bind};
use storage::{BlockStore, open_store};
use tree::{ChildList, UNLINKED};

/// Called with the error whenever a pool fails to obtain memory
pub type AbortHook = Arc<dyn Fn(&MemoryError) + Send + Sync>;

/// Value stored under a user-data key
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Unique identifier for pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u64);

impl PoolId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}", self.0)
    }
}

/// Allocation counters of one pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Allocations since the last clear
    pub allocations: u64,
    /// Allocations over the pool's lifetime
    pub total_allocations: u64,
    /// Times the pool was cleared
    pub clears: u64,
}

impl PoolStats {
    fn record_allocation(&mut self) {
        self.allocations += 1;
        self.total_allocations += 1;
    }
}

struct PoolState {
    store: Box<dyn BlockStore>,
    children: ChildList,
    cleanups: CleanupRegistry,
    subprocesses: Vec<SubprocessRecord>,
    user_data: HashMap<String, UserData>,
    stats: PoolStats,
    tearing_down: bool,
}

impl PoolState {
    fn new(store: Box<dyn BlockStore>) -> Self {
        Self {
            store,
            children: ChildList::default(),
            cleanups: CleanupRegistry::default(),
            subprocesses: Vec::new(),
            user_data: HashMap::new(),
            stats: PoolStats::default(),
            tearing_down: false,
        }
    }
}

pub(crate) struct PoolInner {
    id: PoolId,
    allocator: Arc<Allocator>,
    parent: Weak<PoolInner>,
    config: PoolConfig,
    owner_thread: ThreadId,
    slot: AtomicUsize,
    mutex: RwLock<Option<PoolMutex>>,
    abort_hook: RwLock<Option<AbortHook>>,
    tag: RwLock<Option<Arc<str>>>,
    joined: RwLock<Weak<PoolInner>>,
    state: Mutex<Option<PoolState>>,
}

/// Handle on a region in the pool tree
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

// ============================================================================
// Creation
// ============================================================================

impl Pool {
    /// Parentless pool
    ///
    /// Without an allocator there is nothing to draw memory from, so `None`
    /// is rejected with `InvalidArgument`.
    pub fn new_root(
        allocator: Option<Arc<Allocator>>,
        abort_hook: Option<AbortHook>,
        config: PoolConfig,
    ) -> MemoryResult<Pool> {
        Self::create_with(None, abort_hook, allocator, Some(config))
    }

    /// Pool under `parent`
    ///
    /// The abort hook and the allocator default to the parent's. A pool
    /// with neither a parent nor an allocator is an `InvalidArgument`.
    pub fn create(
        parent: Option<&Pool>,
        abort_hook: Option<AbortHook>,
        allocator: Option<Arc<Allocator>>,
    ) -> MemoryResult<Pool> {
        Self::create_with(parent, abort_hook, allocator, None)
    }

    /// Child sharing this pool's allocator and abort hook
    pub fn create_child(&self) -> MemoryResult<Pool> {
        Self::create_with(Some(self), None, None, None)
    }

    fn create_with(
        parent: Option<&Pool>,
        abort_hook: Option<AbortHook>,
        allocator: Option<Arc<Allocator>>,
        config: Option<PoolConfig>,
    ) -> MemoryResult<Pool> {
        if let Some(parent) = parent {
            parent.inner.check_thread()?;
        }
        let abort_hook = abort_hook.or_else(|| parent.and_then(Pool::abort_hook));

        let Some(allocator) = allocator.or_else(|| parent.map(|p| Arc::clone(&p.inner.allocator)))
        else {
            let err = MemoryError::invalid_argument("a pool needs a parent or an allocator");
            notify(abort_hook.as_ref(), &err);
            return Err(err);
        };

        let config = config
            .or_else(|| parent.map(|p| p.inner.config.clone()))
            .unwrap_or_default();
        config.validate()?;

        let store = match open_store(config.mode, &allocator, config.poison_byte) {
            Ok(store) => store,
            Err(err) => {
                notify(abort_hook.as_ref(), &err);
                return Err(err);
            }
        };

        let pool = Pool {
            inner: Arc::new(PoolInner {
                id: PoolId::next(),
                allocator,
                parent: parent.map_or_else(Weak::new, |p| Arc::downgrade(&p.inner)),
                config,
                owner_thread: thread::current().id(),
                slot: AtomicUsize::new(UNLINKED),
                mutex: RwLock::new(None),
                abort_hook: RwLock::new(abort_hook),
                tag: RwLock::new(None),
                joined: RwLock::new(Weak::new()),
                state: Mutex::new(Some(PoolState::new(store))),
            }),
        };

        if let Some(parent) = parent
            && let Err(err) = parent.inner.adopt(&pool)
        {
            pool.inner.discard();
            return Err(err);
        }

        pool.inner.log_event("pool created");
        Ok(pool)
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<PoolInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn is(&self, inner: *const PoolInner) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), inner)
    }

    /// Whether both handles refer to the same pool
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// Allocation
// ============================================================================

impl Pool {
    /// `size` bytes, 8-byte aligned, valid until the pool is cleared
    ///
    /// On failure to obtain memory the abort hook runs before the error is
    /// returned.
    pub fn allocate(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        let result = self.inner.with_state(|state| {
            let ptr = state.store.allocate(&self.inner.allocator, size)?;
            state.stats.record_allocation();
            Ok(ptr)
        });
        self.inner.report(result)
    }

    /// Like [`Pool::allocate`], with the bytes zeroed
    pub fn allocate_zeroed(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        // SAFETY: the allocation spans at least `size` writable bytes
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Format into pool memory; see [`crate::pformat!`]
    pub fn format(&self, args: fmt::Arguments<'_>) -> MemoryResult<PoolStr> {
        let result = self.inner.with_state(|state| {
            let text = state.store.format(&self.inner.allocator, args)?;
            state.stats.record_allocation();
            Ok(text)
        });
        self.inner.report(result)
    }

    /// Copy `text` into pool memory with a terminator
    pub fn copy_str(&self, text: &str) -> MemoryResult<PoolStr> {
        self.format(format_args!("{text}"))
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Pool {
    /// Tear down children, cleanups, subprocesses and user data, and give
    /// back all memory except the pool's initial block
    ///
    /// The pool stays usable. Clearing an already clear pool does nothing
    /// observable beyond bumping the clear counter.
    pub fn clear(&self) -> MemoryResult<()> {
        self.inner.check_thread()?;
        self.inner.clear()
    }

    /// Everything [`Pool::clear`] does, then unlink from the parent and
    /// give back all memory
    ///
    /// If this pool owns its allocator, the allocator is destroyed too.
    /// Destroying twice, or destroying a pool joined to another, is a
    /// `LogicError`.
    pub fn destroy(&self) -> MemoryResult<()> {
        self.inner.check_thread()?;
        if self.inner.joined.read().strong_count() > 0 {
            return Err(MemoryError::logic(&format!(
                "{} is joined to another pool and cannot be destroyed directly",
                self.inner.id
            )));
        }
        self.inner.destroy()
    }

    pub(crate) fn destroy_unchecked(&self) -> MemoryResult<()> {
        self.inner.destroy()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().is_none()
    }
}

// ============================================================================
// Cleanups
// ============================================================================

impl Pool {
    /// Run `cleanup(&data)` when this pool is cleared or destroyed, and
    /// `child_cleanup(&data)` in a forked child before it execs
    ///
    /// Cleanups run most recently registered first.
    pub fn register_cleanup<T>(
        &self,
        data: &Arc<T>,
        cleanup: CleanupFn<T>,
        child_cleanup: CleanupFn<T>,
    ) -> MemoryResult<()>
    where
        T: Send + Sync + 'static,
    {
        let entry = CleanupEntry::new(
            CleanupKey::new(data, cleanup),
            bind(data, cleanup),
            bind(data, child_cleanup),
        );
        self.inner.with_state(|state| {
            state.cleanups.register(entry);
            Ok(())
        })
    }

    /// Replace the fork-child callback of a registered cleanup
    pub fn set_child_cleanup<T>(
        &self,
        data: &Arc<T>,
        cleanup: CleanupFn<T>,
        child_cleanup: CleanupFn<T>,
    ) -> MemoryResult<()>
    where
        T: Send + Sync + 'static,
    {
        let key = CleanupKey::new(data, cleanup);
        let callback = bind(data, child_cleanup);
        self.inner.with_state(|state| {
            if state.cleanups.replace_fork_child(key, callback) {
                Ok(())
            } else {
                Err(MemoryError::cleanup_not_registered())
            }
        })
    }

    /// Unregister without running
    pub fn cancel_cleanup<T>(&self, data: &Arc<T>, cleanup: CleanupFn<T>) -> MemoryResult<()> {
        match self.remove_cleanup(data, cleanup)? {
            Some(_) => Ok(()),
            None => Err(MemoryError::cleanup_not_registered()),
        }
    }

    /// Unregister if registered, then run `cleanup(&data)` right away
    pub fn run_cleanup_now<T>(&self, data: &Arc<T>, cleanup: CleanupFn<T>) -> MemoryResult<()> {
        // The removed entry holds its own reference to `data`; drop it first
        drop(self.remove_cleanup(data, cleanup)?);
        cleanup(data)
    }

    fn remove_cleanup<T>(
        &self,
        data: &Arc<T>,
        cleanup: CleanupFn<T>,
    ) -> MemoryResult<Option<CleanupEntry>> {
        let key = CleanupKey::new(data, cleanup);
        self.inner.with_state(|state| Ok(state.cleanups.remove(key)))
    }

    /// Run the fork-child callbacks of this pool and its whole subtree
    ///
    /// Meant for the child side of a fork, before exec. Parents run before
    /// their children; each callback runs once.
    pub fn run_fork_cleanups(&self) {
        loop {
            let entry = match self.inner.state.lock().as_mut() {
                Some(state) => state.cleanups.pop_front(),
                None => None,
            };
            let Some(entry) = entry else { break };
            if let Err(err) = entry.run_fork_child() {
                warn!(pool = %self.inner.id, error = %err, "fork cleanup failed");
            }
        }
        for child in self.children() {
            child.run_fork_cleanups();
        }
    }

    /// Registered cleanups that have not run yet
    pub fn pending_cleanups(&self) -> usize {
        self.inner
            .state
            .lock()
            .as_ref()
            .map_or(0, |state| state.cleanups.len())
    }
}

// ============================================================================
// User Data, Subprocesses, Metadata
// ============================================================================

impl Pool {
    /// Store `value` under `key`, replacing any previous value
    ///
    /// With `cleanup`, the callback is registered for both normal and
    /// fork-child teardown.
    pub fn set_user_data<T>(
        &self,
        key: &str,
        value: Arc<T>,
        cleanup: Option<CleanupFn<T>>,
    ) -> MemoryResult<()>
    where
        T: Send + Sync + 'static,
    {
        let entry = cleanup.map(|cleanup| {
            CleanupEntry::new(
                CleanupKey::new(&value, cleanup),
                bind(&value, cleanup),
                bind(&value, cleanup),
            )
        });
        let replaced = self.inner.with_state(|state| {
            if let Some(entry) = entry {
                state.cleanups.register(entry);
            }
            Ok(state.user_data.insert(key.to_owned(), value as UserData))
        })?;
        drop(replaced);
        Ok(())
    }

    /// Value under `key`, if present and of type `T`
    pub fn user_data<T>(&self, key: &str) -> MemoryResult<Option<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        let value = self
            .inner
            .with_state(|state| Ok(state.user_data.get(key).cloned()))?;
        Ok(value.and_then(|value| value.downcast::<T>().ok()))
    }

    /// Reap `process` by `policy` when this pool is torn down
    pub fn note_subprocess(
        &self,
        process: Arc<dyn Subprocess>,
        policy: KillPolicy,
    ) -> MemoryResult<()> {
        self.inner.with_state(|state| {
            state.subprocesses.push(SubprocessRecord { process, policy });
            Ok(())
        })
    }

    pub fn set_tag(&self, tag: Option<&str>) {
        *self.inner.tag.write() = tag.map(Arc::from);
    }

    pub fn tag(&self) -> Option<Arc<str>> {
        self.inner.tag.read().clone()
    }

    pub fn set_abort_hook(&self, hook: Option<AbortHook>) {
        *self.inner.abort_hook.write() = hook;
    }

    pub fn abort_hook(&self) -> Option<AbortHook> {
        self.inner.abort_hook.read().clone()
    }

    /// Attach a re-entrant mutex held across every operation on this pool
    ///
    /// It must not be the allocator's mutex: teardown holds it while taking
    /// the state locks of child pools, which themselves lock the allocator.
    pub fn set_mutex(&self, mutex: Option<PoolMutex>) {
        *self.inner.mutex.write() = mutex;
    }

    pub fn mutex(&self) -> Option<PoolMutex> {
        self.inner.mutex.read().clone()
    }

    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    pub fn mode(&self) -> PoolMode {
        self.inner.config.mode
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.inner.allocator
    }

    pub fn parent(&self) -> Option<Pool> {
        self.inner.parent.upgrade().map(Pool::from_inner)
    }

    pub fn stats(&self) -> MemoryResult<PoolStats> {
        self.inner.with_state(|state| Ok(state.stats))
    }
}

// ============================================================================
// Tree Queries
// ============================================================================

impl Pool {
    /// Whether `ancestor` is `pool` or one of its ancestors
    ///
    /// `None` stands for the implicit root above every tree and is an
    /// ancestor of everything. Joins are followed on the ancestor side.
    pub fn is_ancestor(ancestor: Option<&Pool>, pool: &Pool) -> bool {
        let Some(ancestor) = ancestor else {
            return true;
        };
        let mut ancestor = Arc::clone(&ancestor.inner);
        loop {
            let joined = ancestor.joined.read().upgrade();
            match joined {
                Some(joined) => ancestor = joined,
                None => break,
            }
        }

        let mut current = Some(Arc::clone(&pool.inner));
        while let Some(inner) = current {
            if Arc::ptr_eq(&inner, &ancestor) {
                return true;
            }
            current = inner.parent.upgrade();
        }
        false
    }

    /// Whether this pool is `other` or one of its ancestors
    pub fn is_ancestor_of(&self, other: &Pool) -> bool {
        Self::is_ancestor(Some(self), other)
    }

    /// Declare that `sub`, a direct child, lives exactly as long as this pool
    pub fn join(&self, sub: &Pool) -> MemoryResult<()> {
        let is_child = sub
            .inner
            .parent
            .upgrade()
            .is_some_and(|parent| Arc::ptr_eq(&parent, &self.inner));
        if !is_child {
            return Err(MemoryError::logic(&format!(
                "{} is not a direct child of {}",
                sub.inner.id, self.inner.id
            )));
        }
        *sub.inner.joined.write() = Arc::downgrade(&self.inner);
        Ok(())
    }

    /// Current children, newest first
    pub fn children(&self) -> Vec<Pool> {
        self.inner
            .state
            .lock()
            .as_ref()
            .map(|state| state.children.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Visit this pool and then its subtree, depth first, newest child first
    pub fn walk_tree(&self, visit: &mut dyn FnMut(&Pool) -> ControlFlow<()>) -> ControlFlow<()> {
        visit(self)?;
        for child in self.children() {
            child.walk_tree(visit)?;
        }
        ControlFlow::Continue(())
    }

    /// Number of children
    pub fn child_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .as_ref()
            .map_or(0, |state| state.children.len())
    }

    /// Blocks held: nodes for the bump backend, allocations for the
    /// instrumented one
    pub fn block_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .as_ref()
            .map_or(0, |state| state.store.block_count())
    }

    /// Bytes handed out by this pool, or by its whole subtree
    pub fn num_bytes(&self, recurse: bool) -> usize {
        if !recurse {
            return self.inner.bytes_in_use();
        }
        let mut total = 0;
        let _ = self.walk_tree(&mut |pool| {
            total += pool.inner.bytes_in_use();
            ControlFlow::Continue(())
        });
        total
    }

    /// Whether `ptr` points into memory this pool handed out
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.inner
            .state
            .lock()
            .as_ref()
            .is_some_and(|state| state.store.contains(ptr))
    }

    /// The pool in this subtree that handed out `ptr`
    pub fn find(&self, ptr: *const u8) -> Option<Pool> {
        let mut found = None;
        let _ = self.walk_tree(&mut |pool| {
            if pool.contains(ptr) {
                found = Some(pool.clone());
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        found
    }
}

impl PartialEq for Pool {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Pool {}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("tag", &self.tag())
            .field("mode", &self.inner.config.mode)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Internals
// ============================================================================

fn notify(hook: Option<&AbortHook>, err: &MemoryError) {
    if let Some(hook) = hook {
        hook(err);
    }
}

impl PoolInner {
    fn check_thread(&self) -> MemoryResult<()> {
        if self.config.verify_owner_thread && thread::current().id() != self.owner_thread {
            return Err(MemoryError::wrong_thread(self.id));
        }
        Ok(())
    }

    fn serial(&self) -> Option<PoolMutex> {
        self.mutex.read().clone()
    }

    fn with_state<R>(
        &self,
        f: impl FnOnce(&mut PoolState) -> MemoryResult<R>,
    ) -> MemoryResult<R> {
        self.check_thread()?;
        let mutex = self.serial();
        let _serial = mutex.as_ref().map(|m| m.lock());
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| MemoryError::pool_destroyed(self.id))?;
        f(state)
    }

    /// Run the abort hook for memory failures, after every lock is released
    fn report<T>(&self, result: MemoryResult<T>) -> MemoryResult<T> {
        if let Err(err) = &result
            && err.is_out_of_memory()
        {
            error!(pool = %self.id, error = %err, "pool allocation failed");
            let hook = self.abort_hook.read().clone();
            notify(hook.as_ref(), err);
        }
        result
    }

    fn log_event(&self, event: &str) {
        let tag = self.tag.read().clone();
        if self.config.log_events {
            info!(pool = %self.id, tag = ?tag, mode = %self.config.mode, "{event}");
        } else {
            debug!(pool = %self.id, tag = ?tag, mode = %self.config.mode, "{event}");
        }
    }

    fn kill_timing(&self) -> KillTiming {
        KillTiming {
            timeout: self.config.kill_timeout,
            poll_interval: self.config.kill_poll_interval,
        }
    }

    fn bytes_in_use(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |state| state.store.bytes_in_use())
    }

    /// Link `child` in front of this pool's children
    ///
    /// Only the state lock is taken: the allocator mutex always nests inside
    /// it, never around it.
    fn adopt(&self, child: &Pool) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| MemoryError::pool_destroyed(self.id))?;
        let slot = state.children.push_front(child.clone());
        child.inner.slot.store(slot, Ordering::Release);
        Ok(())
    }

    fn unlink_child(&self, child: *const PoolInner, slot: usize) -> Option<Pool> {
        self.state
            .lock()
            .as_mut()
            .and_then(|state| state.children.remove(slot, child))
    }

    fn detach_from_parent(&self) {
        let slot = self.slot.swap(UNLINKED, Ordering::AcqRel);
        if slot == UNLINKED {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            let removed = parent.unlink_child(self, slot);
            drop(removed);
        }
    }

    /// Give back the memory of a pool that never became visible
    fn discard(&self) {
        let state = self.state.lock().take();
        if let Some(state) = state {
            state.store.release(&self.allocator);
        }
    }

    fn begin_teardown(&self) -> MemoryResult<()> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| MemoryError::pool_destroyed(self.id))?;
        if state.tearing_down {
            return Err(MemoryError::logic(&format!(
                "{} is already being torn down",
                self.id
            )));
        }
        state.tearing_down = true;
        Ok(())
    }

    fn destroy_children(&self) {
        loop {
            let child = match self.state.lock().as_ref() {
                Some(state) => state.children.first(),
                None => None,
            };
            let Some(child) = child else { break };
            // Unlinked up front: the parent may already be unreachable by
            // upgrade when this runs from `Drop`
            let slot = child.inner.slot.swap(UNLINKED, Ordering::AcqRel);
            let removed = self.unlink_child(Arc::as_ptr(&child.inner), slot);
            drop(removed);
            if let Err(err) = child.inner.destroy() {
                warn!(pool = %self.id, child = %child.inner.id, error = %err, "child teardown failed");
            }
        }
    }

    fn run_cleanups(&self) {
        loop {
            let entry = match self.state.lock().as_mut() {
                Some(state) => state.cleanups.pop_front(),
                None => None,
            };
            let Some(entry) = entry else { break };
            if let Err(err) = entry.run() {
                warn!(pool = %self.id, error = %err, "cleanup failed");
            }
        }
    }

    /// Children, cleanups, then subprocesses
    fn drain(&self) {
        self.destroy_children();
        self.run_cleanups();

        // Cleanups may have created pools under this one
        let late = self
            .state
            .lock()
            .as_ref()
            .map_or(0, |state| state.children.len());
        if late > 0 {
            warn!(pool = %self.id, children = late, "cleanups created child pools during teardown");
            self.destroy_children();
        }

        let subprocesses = match self.state.lock().as_mut() {
            Some(state) => mem::take(&mut state.subprocesses),
            None => Vec::new(),
        };
        process::reap(subprocesses, self.kill_timing());
    }

    fn clear(&self) -> MemoryResult<()> {
        let mutex = self.serial();
        let _serial = mutex.as_ref().map(|m| m.lock());
        self.begin_teardown()?;
        self.drain();

        let user_data = {
            let mut guard = self.state.lock();
            let state = guard
                .as_mut()
                .ok_or_else(|| MemoryError::pool_destroyed(self.id))?;
            state.cleanups.clear();
            state.store.reset(&self.allocator);
            state.stats.allocations = 0;
            state.stats.clears += 1;
            state.tearing_down = false;
            mem::take(&mut state.user_data)
        };
        drop(user_data);

        self.log_event("pool cleared");
        Ok(())
    }

    fn destroy(&self) -> MemoryResult<()> {
        let mutex = self.serial();
        let _serial = mutex.as_ref().map(|m| m.lock());
        self.begin_teardown()?;
        self.drain();
        self.detach_from_parent();

        let state = self
            .state
            .lock()
            .take()
            .ok_or_else(|| MemoryError::pool_destroyed(self.id))?;
        let PoolState {
            store, user_data, ..
        } = state;
        drop(user_data);
        store.release(&self.allocator);

        if self.allocator.is_owned_by(self) {
            self.allocator.destroy();
        }
        self.log_event("pool destroyed");
        Ok(())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if self.state.get_mut().is_some()
            && let Err(err) = self.destroy()
        {
            warn!(pool = %self.id, error = %err, "teardown on drop failed");
        }
    }
}
