//! Public macros for nebula-region

/// Format into pool memory, like `format!` but backed by a [`Pool`]
///
/// Expands to [`Pool::format`] with the arguments captured by
/// [`core::format_args!`], so nothing is rendered on the heap first.
///
/// # Examples
/// ```
/// use nebula_region::{Allocator, Pool, PoolConfig, pformat};
///
/// let pool = Pool::new_root(Some(Allocator::new()), None, PoolConfig::production()).unwrap();
/// let text = pformat!(pool, "{}-{}", "node", 42).unwrap();
/// // SAFETY: the pool is alive and has not been cleared
/// assert_eq!(unsafe { text.as_str() }, "node-42");
/// ```
///
/// [`Pool`]: crate::Pool
/// [`Pool::format`]: crate::Pool::format
#[macro_export]
macro_rules! pformat {
    ($pool:expr, $($arg:tt)*) => {
        $pool.format(::core::format_args!($($arg)*))
    };
}

/// Build a [`PoolConfig`] from field overrides on top of the defaults
///
/// # Examples
/// ```
/// use nebula_region::{PoolMode, pool_config};
///
/// let config = pool_config! {
///     mode: PoolMode::Debug,
///     log_events: true,
/// };
/// assert!(config.log_events);
/// ```
///
/// [`PoolConfig`]: crate::PoolConfig
#[macro_export]
macro_rules! pool_config {
    ($($field:ident: $value:expr),* $(,)?) => {{
        $crate::PoolConfig {
            $($field: $value,)*
            ..::core::default::Default::default()
        }
    }};
}
