//! End-to-end pool scenarios: sharing, dedup, eviction during use, and
//! malformed input. Descriptor accounting has its own test binary.

mod common;

use std::fs;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use objfile::{BuildId, Pool, PoolError, RcError};

const NEVER: Duration = Duration::from_secs(3600);

#[test]
fn test_clone_outlives_original() {
    let fixture = common::write_elf(Some(&[0x01, 0x02, 0x03]));
    let pool = Pool::new(NEVER);

    let ref1 = pool.open(fixture.path()).unwrap();
    let ref2 = ref1.try_clone().unwrap();
    ref1.release().unwrap();

    assert!(ref2.value().has_text_section());
    ref2.release().unwrap();
    pool.close();
}

#[test]
fn test_dedup_by_build_id() {
    let id = [0xde, 0xad, 0xbe, 0xef];
    let copy_a = common::write_elf(Some(&id));
    let copy_b = common::write_raw(&fs::read(copy_a.path()).unwrap());
    assert_ne!(copy_a.path(), copy_b.path());

    let pool = Pool::new(NEVER);
    let a = pool.open(copy_a.path()).unwrap();
    let b = pool.open(copy_b.path()).unwrap();

    // One cache key for the shared build-id; the second open shared the
    // first entry, so both handles report the first-opened path.
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.stats().hits, 1);
    assert_eq!(a.value().info(), b.value().info());
    assert_eq!(b.value().info().path, copy_a.path());

    a.release().unwrap();
    b.release().unwrap();
    pool.close();
    assert_eq!(pool.len(), 0);
}

#[test]
fn test_eviction_during_use_keeps_entry_usable() {
    let fixture = common::write_elf(Some(&[0x42; 8]));
    let pool = Pool::new(Duration::ZERO);

    let reference = pool.open(fixture.path()).unwrap();
    pool.evict_expired();
    assert_eq!(pool.len(), 0);
    assert_eq!(pool.stats().evictions, 1);

    // The outstanding reference keeps the descriptor usable.
    assert!(reference.value().has_text_section());
    {
        let mut reader = reference.value().reader().unwrap();
        let mut magic = [0_u8; 4];
        reader.read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"\x7fELF");
    }
    reference.release().unwrap();
}

#[test]
fn test_double_release_is_safe() {
    let fixture = common::write_elf(Some(&[0x77]));
    let pool = Pool::new(NEVER);

    let reference = pool.open(fixture.path()).unwrap();
    reference.release().unwrap();
    assert!(matches!(reference.release(), Err(RcError::Released)));
    pool.close();
}

#[test]
fn test_dev_null_is_unrecognized() {
    let pool = Pool::new(NEVER);
    let err = pool.open("/dev/null").unwrap_err();
    assert!(matches!(err, PoolError::UnrecognizedFormat(_)));
}

#[test]
fn test_zero_length_input_is_unrecognized() {
    let empty = common::write_raw(b"");
    let pool = Pool::new(NEVER);

    let err = pool.open(empty.path()).unwrap_err();
    assert!(matches!(err, PoolError::UnrecognizedFormat(_)));
}

#[test]
fn test_get_returns_cached_entry() {
    let fixture = common::write_elf(Some(&[0x09, 0x08]));
    let pool = Pool::new(NEVER);

    let opened = pool.open(fixture.path()).unwrap();
    let fetched = pool.get(&BuildId::new("0908")).unwrap();
    assert_eq!(opened.value().info(), fetched.value().info());

    assert!(matches!(pool.get(&BuildId::new("ffff")), Err(PoolError::NotFound(_))));

    opened.release().unwrap();
    fetched.release().unwrap();
    pool.close();
}

#[test]
fn test_pool_close_is_idempotent() {
    let fixture = common::write_elf(Some(&[0x31, 0x41]));
    let pool = Pool::new(NEVER);

    let reference = pool.open(fixture.path()).unwrap();
    reference.release().unwrap();

    pool.close();
    assert_eq!(pool.len(), 0);
    pool.close();
    assert_eq!(pool.len(), 0);
}

#[test]
fn test_concurrent_opens_share_one_entry() {
    let fixture = common::write_elf(Some(&[0x12, 0x34, 0x56]));
    let pool = Arc::new(Pool::new(NEVER));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        let path = fixture.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let reference = pool.open(&path).unwrap();
            assert!(reference.value().has_text_section());
            reference.release().unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.len(), 1);
    pool.close();
}

#[test]
fn test_debug_file_lives_and_dies_with_owner() {
    let main = common::write_elf(Some(&[0x0a]));
    let debug = common::write_elf(Some(&[0x0b]));
    let pool = Pool::new(NEVER);

    let main_ref = pool.open(main.path()).unwrap();
    let debug_ref = pool.open(debug.path()).unwrap();
    main_ref.value().set_debug_file(debug_ref.try_clone().unwrap());
    debug_ref.release().unwrap();

    // The pool's own references go away, but the owner still pins the
    // debug entry through its association.
    pool.close();
    let held = main_ref.value().debug_file().unwrap();
    assert!(held.value().has_text_section());
    held.release().unwrap();

    // Releasing the owner releases the debug reference with it.
    main_ref.release().unwrap();
}
