//! At most one transaction is irrevocable at any instant, process-wide,
//! even when several threads race to acquire it. Each thread's
//! `atomically` retries until it wins the token; the test measures the
//! peak number of threads simultaneously inside the irrevocable-protected
//! section, which must never exceed one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn irrevocable_mode_never_admits_two_threads_at_once() {
    picotm_harness::init_test_tracing();

    let active = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let active = Arc::clone(&active);
            let max_concurrent = Arc::clone(&max_concurrent);
            std::thread::spawn(move || {
                picotm::atomically(|| {
                    picotm::go_irrevocable()?;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(15));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), picotm::PicotmError>(())
                })
                .unwrap();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    assert!(!picotm::is_irrevocable());
}
