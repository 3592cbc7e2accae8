//! # nebula-region
//!
//! Hierarchical region allocation for the Nebula workflow automation ecosystem.
//!
//! Memory is handed out by pools and never freed one allocation at a time.
//! A pool gives everything back at once when it is cleared or destroyed,
//! and pools nest: destroying a pool destroys its whole subtree first.
//!
//! This crate provides:
//! - A size-classed block [`Allocator`] that recycles freed blocks
//! - [`Pool`] trees with bump allocation inside each block
//! - Cleanup callbacks run at teardown, most recent first
//! - Formatting straight into pool memory via [`pformat!`]
//! - Subprocess teardown when the owning pool goes away
//! - A process-wide root pool through [`PoolSystem`]
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use nebula_region::prelude::*;
//!
//! # fn main() -> MemoryResult<()> {
//! let root = Pool::new_root(Some(Allocator::new()), None, PoolConfig::production())?;
//! let request = root.create_child()?;
//!
//! let buffer = request.allocate(256)?;
//! let greeting = pformat!(request, "hello {}", "world")?;
//!
//! let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
//! request.register_cleanup(
//!     &closed,
//!     |flag| {
//!         flag.store(true, std::sync::atomic::Ordering::SeqCst);
//!         Ok(())
//!     },
//!     noop_cleanup,
//! )?;
//! # let _ = (buffer, greeting);
//!
//! // The child, its memory and its cleanups go with the root
//! root.destroy()?;
//! assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
//! assert!(request.allocate(8).is_err());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `std` (default): [`ChildProcess`], subprocess teardown for real
//!   [`std::process::Child`] handles
//! - `debug-pools`: Make the instrumented backend the default [`PoolMode`]
//!
//! ## Architecture
//!
//! - [`allocator`]: blocks of whole 4 KiB units, kept in free lists by size
//! - [`pool`]: the pool tree, its backends and its cleanup registry
//! - [`process`]: how subprocesses are signalled and reaped at teardown
//! - [`system`]: the process-wide root pool
//! - Configuration in [`core`], read from `NEBULA_REGION_*` variables by
//!   the `from_env` constructors
//! - Structured logging through `tracing`

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::perf)]
#![warn(clippy::pedantic)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_lines)]
// Size classes are u32 and block sizes usize; conversions are bounded per-site
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::double_must_use)]
#![allow(clippy::return_self_not_must_use)]

// Error types
pub mod error;

// Core modules
pub mod allocator;
pub mod core;
pub mod pool;
pub mod process;
pub mod system;
pub mod utils;

mod macros;

// Re-export core types for convenience
pub use crate::allocator::{Allocator, AllocatorId, AllocatorStats, MemoryNode, PoolMutex};
pub use crate::core::{AllocatorConfig, PoolConfig, PoolMode, SystemConfig};
pub use crate::error::{ErrorKind, MemoryError, MemoryResult};
pub use crate::pool::{AbortHook, Pool, PoolId, PoolStats, PoolStr};
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub use crate::process::ChildProcess;
pub use crate::process::{KillPolicy, Subprocess};
pub use crate::system::PoolSystem;

// Public API exports
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::core::{AllocatorConfig, PoolConfig, PoolMode, SystemConfig};

    pub use crate::error::{MemoryError, MemoryResult};

    pub use crate::allocator::{Allocator, BoundedHeap, GlobalHeap, SystemHeap};

    pub use crate::pool::{AbortHook, CleanupFn, Pool, PoolStr, noop_cleanup};

    #[cfg(feature = "std")]
    pub use crate::process::ChildProcess;
    pub use crate::process::{KillPolicy, Subprocess};

    pub use crate::system::PoolSystem;

    pub use crate::pformat;
}

/// Initialize the process-wide pool system.
///
/// Configuration comes from the environment on the first call; nested calls
/// share the same root. See [`PoolSystem::init`].
///
/// # Examples
///
/// ```rust
/// fn main() -> nebula_region::MemoryResult<()> {
///     let system = nebula_region::init()?;
///     let pool = system.create_pool(None, None, None)?;
///     pool.allocate(64)?;
///     system.terminate();
///     Ok(())
/// }
/// ```
pub fn init() -> MemoryResult<PoolSystem> {
    PoolSystem::init()
}
