//! `add_int_tx(INT_MAX, 1)` inside a transaction surfaces as
//! `Errno(ERANGE)` on exit from the commit phase — the overflow is
//! non-recoverable (not a conflict), so `atomically` propagates it
//! immediately rather than retrying.

#[test]
fn signed_overflow_surfaces_as_erange_without_retry() {
    picotm_harness::init_test_tracing();

    let mut attempts = 0u32;
    let result = picotm::atomically(|| {
        attempts += 1;
        picotm::numeric::i32_ops::add_tx(i32::MAX, 1)
    });

    let err = result.unwrap_err();
    assert_eq!(picotm::error_as_errno(&err), Some(libc::ERANGE));
    assert_eq!(attempts, 1, "a non-conflicting error must not be retried");
}

#[test]
fn division_by_zero_surfaces_as_edom() {
    picotm_harness::init_test_tracing();

    let result = picotm::atomically(|| picotm::numeric::i64_ops::div_tx(10, 0));
    let err = result.unwrap_err();
    assert_eq!(picotm::error_as_errno(&err), Some(libc::EDOM));
}
