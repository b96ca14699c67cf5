//! Pre-transaction `errno = 5`; a transaction saves and then perturbs
//! `errno` to simulate a wrapped syscall, conflicts on its first attempt,
//! and restarts. On entry to the retry, `errno` must already be back to 5
//! — the errno module's undo ran during the abort this restart triggered.

fn set_errno(value: i32) {
    // SAFETY: valid for the calling thread's lifetime.
    unsafe {
        *libc::__errno_location() = value;
    }
}

#[test]
fn errno_is_restored_before_the_retry_runs() {
    picotm_harness::init_test_tracing();
    set_errno(5);

    let mut attempt = 0u32;
    picotm::atomically(|| {
        attempt += 1;
        if attempt == 2 {
            assert_eq!(
                picotm::errno::current_errno(),
                5,
                "errno must be restored by the prior restart before this attempt runs"
            );
        }

        picotm::errno::save()?;
        set_errno(42);

        if attempt == 1 {
            Err(picotm::PicotmError::conflicting(None))
        } else {
            Ok(())
        }
    })
    .unwrap();

    assert_eq!(attempt, 2);
}

#[test]
fn save_is_idempotent_across_repeated_calls_in_one_transaction() {
    picotm_harness::init_test_tracing();
    set_errno(7);

    picotm::atomically(|| {
        picotm::errno::save()?;
        set_errno(99);
        picotm::errno::save()?; // no-op: a transaction saves errno at most once
        assert_eq!(picotm::errno::current_errno(), 99);
        Ok(())
    })
    .unwrap();
}
