//! Strings formatted into pool memory.

use std::fmt;

use nebula_region::core::boundary::BOUNDARY_SIZE;
use nebula_region::{Allocator, MemoryError, Pool, PoolConfig, PoolMode, pformat};
use pretty_assertions::assert_eq;
use rstest::rstest;

fn root(mode: PoolMode) -> Pool {
    Pool::new_root(
        Some(Allocator::new()),
        None,
        PoolConfig::default().with_mode(mode),
    )
    .unwrap()
}

#[rstest]
#[case::bump(PoolMode::Bump)]
#[case::debug(PoolMode::Debug)]
fn formatted_text_is_terminated(#[case] mode: PoolMode) {
    let pool = root(mode);
    let text = pformat!(pool, "{}:{:04}", "job", 7).unwrap();

    assert_eq!(text.len(), 8);
    assert_eq!(unsafe { text.as_str() }, "job:0007");
    assert_eq!(unsafe { text.as_c_str() }.to_str().unwrap(), "job:0007");
    assert!(pool.contains(text.as_ptr()));
}

#[rstest]
#[case::bump(PoolMode::Bump)]
#[case::debug(PoolMode::Debug)]
fn strings_stay_valid_across_later_allocations(#[case] mode: PoolMode) {
    let pool = root(mode);
    let texts: Vec<_> = (0..500)
        .map(|i| pformat!(pool, "entry-{i}").unwrap())
        .collect();
    pool.allocate(3 * BOUNDARY_SIZE).unwrap();

    for (i, text) in texts.iter().enumerate() {
        assert_eq!(unsafe { text.as_str() }, format!("entry-{i}"));
    }
}

#[rstest]
#[case::bump(PoolMode::Bump)]
#[case::debug(PoolMode::Debug)]
fn long_text_spans_past_one_block(#[case] mode: PoolMode) {
    let pool = root(mode);
    pool.allocate(100).unwrap();
    let body = "abcdefgh".repeat(5_000);
    let text = pformat!(pool, "<{body}>").unwrap();

    assert_eq!(text.len(), body.len() + 2);
    let rendered = unsafe { text.as_str() };
    assert!(rendered.starts_with("<abcdefgh"));
    assert!(rendered.ends_with("abcdefgh>"));
    assert!(pool.contains(text.as_ptr()));
}

#[test]
fn copy_str_duplicates_the_input() {
    let pool = root(PoolMode::Bump);
    let source = String::from("configuration");
    let copy = pool.copy_str(&source).unwrap();
    drop(source);
    assert_eq!(unsafe { copy.as_str() }, "configuration");
}

#[test]
fn empty_format_is_an_empty_string() {
    let pool = root(PoolMode::Bump);
    let text = pformat!(pool, "").unwrap();
    assert!(text.is_empty());
    assert_eq!(unsafe { text.as_c_str() }.to_bytes(), b"");
}

#[test]
fn format_counts_as_an_allocation() {
    let pool = root(PoolMode::Bump);
    pformat!(pool, "{}", 1).unwrap();
    pool.copy_str("two").unwrap();
    assert_eq!(pool.stats().unwrap().allocations, 2);
}

struct Broken;

impl fmt::Display for Broken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("partial")?;
        Err(fmt::Error)
    }
}

#[rstest]
#[case::bump(PoolMode::Bump)]
#[case::debug(PoolMode::Debug)]
fn failing_display_leaves_the_pool_untouched(#[case] mode: PoolMode) {
    let pool = root(mode);
    let before = pool.num_bytes(false);

    let err = pformat!(pool, "{}", Broken).unwrap_err();
    assert!(matches!(err, MemoryError::InvalidArgument { .. }));
    assert_eq!(pool.num_bytes(false), before);

    let text = pformat!(pool, "ok").unwrap();
    assert_eq!(unsafe { text.as_str() }, "ok");
}
