//! Process-wide root pool
//!
//! [`PoolSystem::init`] creates the root pool and its allocator on first
//! use and hands out shared handles afterwards. The root is destroyed when
//! the last handle goes away, and a later `init` starts from scratch.
//!
//! Independent systems can be built with [`PoolSystem::with_config`]; they
//! are never registered process-wide.

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{info, warn};

use crate::allocator::Allocator;
use crate::core::SystemConfig;
use crate::core::types::GLOBAL_POOL_TAG;
use crate::error::MemoryResult;
use crate::pool::{AbortHook, Pool};

static PROCESS_SYSTEM: Mutex<Weak<SystemInner>> = Mutex::new(Weak::new());

struct SystemInner {
    root: Pool,
    allocator: Arc<Allocator>,
}

impl Drop for SystemInner {
    fn drop(&mut self) {
        if let Err(err) = self.root.destroy_unchecked() {
            warn!(error = %err, "root pool teardown failed");
        }
        info!(allocator = %self.allocator.id(), "pool system terminated");
    }
}

/// Shared handle on a root pool and the allocator that backs it
#[derive(Clone)]
pub struct PoolSystem {
    inner: Arc<SystemInner>,
}

impl PoolSystem {
    /// Process-wide system, configured from the environment on first call
    ///
    /// Nested calls share one root. It is torn down when every handle has
    /// been dropped or passed to [`PoolSystem::terminate`].
    pub fn init() -> MemoryResult<Self> {
        let mut slot = PROCESS_SYSTEM.lock();
        if let Some(inner) = slot.upgrade() {
            return Ok(Self { inner });
        }
        let system = Self::with_config(SystemConfig::from_env()?)?;
        *slot = Arc::downgrade(&system.inner);
        Ok(system)
    }

    /// Standalone system
    ///
    /// The allocator gets a re-entrant mutex and is owned by the root pool,
    /// so it is destroyed together with the root.
    pub fn with_config(config: SystemConfig) -> MemoryResult<Self> {
        config.validate()?;
        let allocator = Allocator::with_config(config.allocator)?;
        allocator.set_mutex(Some(Arc::new(ReentrantMutex::new(()))));

        let root = Pool::new_root(Some(Arc::clone(&allocator)), None, config.pool)?;
        root.set_tag(Some(GLOBAL_POOL_TAG));
        allocator.set_owner(Some(&root));

        info!(root = %root.id(), mode = %root.mode(), "pool system initialized");
        Ok(Self {
            inner: Arc::new(SystemInner { root, allocator }),
        })
    }

    pub fn root(&self) -> &Pool {
        &self.inner.root
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.inner.allocator
    }

    /// Pool under `parent`, or under the root when `parent` is `None`
    pub fn create_pool(
        &self,
        parent: Option<&Pool>,
        abort_hook: Option<AbortHook>,
        allocator: Option<Arc<Allocator>>,
    ) -> MemoryResult<Pool> {
        Pool::create(Some(parent.unwrap_or(&self.inner.root)), abort_hook, allocator)
    }

    /// Run fork-child cleanups across the whole tree
    pub fn cleanup_for_exec(&self) {
        self.inner.root.run_fork_cleanups();
    }

    /// The pool that handed out `ptr`
    pub fn find(&self, ptr: *const u8) -> Option<Pool> {
        self.inner.root.find(ptr)
    }

    /// Visit every pool, root first
    pub fn walk(&self, visit: &mut dyn FnMut(&Pool) -> ControlFlow<()>) -> ControlFlow<()> {
        self.inner.root.walk_tree(visit)
    }

    /// Whether both handles share one root
    pub fn same_system(&self, other: &PoolSystem) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Give up this handle; the last one destroys the root
    pub fn terminate(self) {
        drop(self);
    }
}

impl std::fmt::Debug for PoolSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSystem")
            .field("root", &self.inner.root)
            .field("allocator", &self.inner.allocator.id())
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}
