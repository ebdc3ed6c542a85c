use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{KeyedRateLimiter, KeylatchError, ManualClock, RateLimiterOptions};

fn limiter(permits: u64, period: Duration) -> (KeyedRateLimiter<&'static str, ManualClock>, ManualClock) {
    let clock = ManualClock::new();
    let options = RateLimiterOptions::try_new(permits, period).unwrap();
    (KeyedRateLimiter::with_clock(options, clock.clone()), clock)
}

#[test]
fn derives_capacity_and_refill_rate() {
    let (limiter, _clock) = limiter(10, Duration::from_secs(5));

    assert_eq!(limiter.capacity(), 10);
    assert_eq!(limiter.refill_rate(), 2.0);
}

#[test]
fn try_new_rejects_invalid_configuration() {
    assert!(matches!(
        KeyedRateLimiter::<u64>::try_new(0, Duration::from_secs(1)),
        Err(KeylatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        KeyedRateLimiter::<u64>::try_new(1, Duration::ZERO),
        Err(KeylatchError::InvalidArgument(_))
    ));
}

#[test]
fn fresh_key_allows_burst_up_to_capacity() {
    let (limiter, _clock) = limiter(2, Duration::from_secs(1));

    assert!(limiter.try_acquire(&"k"));
    assert!(limiter.try_acquire(&"k"));
    assert!(!limiter.try_acquire(&"k"));
}

#[test]
fn refills_continuously_after_exhaustion() {
    let (limiter, clock) = limiter(2, Duration::from_secs(1));

    assert!(limiter.try_acquire(&"k"));
    assert!(limiter.try_acquire(&"k"));
    assert!(!limiter.try_acquire(&"k"));

    clock.advance(Duration::from_millis(500));
    assert!(limiter.try_acquire(&"k"));
    assert!(!limiter.try_acquire(&"k"));

    // Half a token is not enough.
    clock.advance(Duration::from_millis(250));
    assert!(!limiter.try_acquire(&"k"));

    clock.advance(Duration::from_millis(250));
    assert!(limiter.try_acquire(&"k"));
}

#[test]
fn polling_client_is_admitted_after_exactly_one_period() {
    let (limiter, clock) = limiter(1, Duration::from_secs(1));

    assert!(limiter.try_acquire(&"k"));

    let mut admitted_at = None;
    for step in 1..=12_u64 {
        clock.advance(Duration::from_millis(100));

        if admitted_at.is_none() && limiter.try_acquire(&"k") {
            admitted_at = Some(step * 100);
        }
    }

    assert_eq!(admitted_at, Some(1000));
}

#[test]
fn interleaved_reads_do_not_delay_admission() {
    let (limiter, clock) = limiter(1, Duration::from_secs(1));

    assert!(limiter.try_acquire(&"k"));

    for _ in 0..10 {
        clock.advance(Duration::from_millis(100));
        limiter.available(&"k");
        limiter.estimate_wait(&"k", 1).unwrap();
    }

    assert_eq!(limiter.available(&"k"), 1.0);
    assert_eq!(limiter.estimate_wait(&"k", 1).unwrap(), Duration::ZERO);
    assert!(limiter.try_acquire(&"k"));
}

#[test]
fn frequent_reads_match_a_single_read() {
    let (touched, touched_clock) = limiter(10, Duration::from_secs(1));
    let (quiet, quiet_clock) = limiter(10, Duration::from_secs(1));

    assert!(touched.try_acquire_n(&"k", 10).unwrap());
    assert!(quiet.try_acquire_n(&"k", 10).unwrap());

    for _ in 0..10 {
        touched_clock.advance(Duration::from_millis(10));
        touched.available(&"k");
    }
    quiet_clock.advance(Duration::from_millis(100));

    assert_eq!(touched.estimate_wait(&"k", 1).unwrap(), Duration::ZERO);
    assert_eq!(
        touched.estimate_wait(&"k", 2).unwrap(),
        quiet.estimate_wait(&"k", 2).unwrap()
    );
    assert_eq!(touched.available(&"k"), quiet.available(&"k"));
}

#[test]
fn tokens_never_exceed_capacity() {
    let (limiter, clock) = limiter(3, Duration::from_secs(1));

    assert!(limiter.try_acquire(&"k"));
    clock.advance(Duration::from_secs(3600));

    assert_eq!(limiter.available(&"k"), 3.0);

    assert!(limiter.try_acquire_n(&"k", 3).unwrap());
    assert!(!limiter.try_acquire(&"k"));
}

#[test]
fn rejected_acquire_leaves_tokens_unchanged() {
    let (limiter, _clock) = limiter(5, Duration::from_secs(1));

    assert!(limiter.try_acquire_n(&"k", 3).unwrap());
    assert!(!limiter.try_acquire_n(&"k", 3).unwrap());
    assert_eq!(limiter.available(&"k"), 2.0);
    assert!(limiter.try_acquire_n(&"k", 2).unwrap());
}

#[test]
fn zero_permits_is_invalid() {
    let (limiter, _clock) = limiter(5, Duration::from_secs(1));

    assert!(matches!(
        limiter.try_acquire_n(&"k", 0),
        Err(KeylatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        limiter.estimate_wait(&"k", 0),
        Err(KeylatchError::InvalidArgument(_))
    ));
    assert_eq!(limiter.size(), 0);
}

#[test]
fn more_permits_than_capacity_never_succeed() {
    let (limiter, clock) = limiter(2, Duration::from_secs(1));

    assert!(!limiter.try_acquire_n(&"k", 3).unwrap());
    clock.advance(Duration::from_secs(60));
    assert!(!limiter.try_acquire_n(&"k", 3).unwrap());

    assert_eq!(
        limiter.estimate_wait(&"k", 3).unwrap_err(),
        KeylatchError::ExceedsCapacity {
            requested: 3,
            capacity: 2
        }
    );
}

#[test]
fn estimate_wait_is_zero_when_satisfiable() {
    let (limiter, _clock) = limiter(2, Duration::from_secs(1));

    assert_eq!(limiter.estimate_wait(&"k", 2).unwrap(), Duration::ZERO);

    assert!(limiter.try_acquire(&"k"));
    assert_eq!(limiter.estimate_wait(&"k", 1).unwrap(), Duration::ZERO);
}

#[test]
fn estimate_wait_reports_time_to_refill_deficit() {
    let (limiter, clock) = limiter(2, Duration::from_secs(1));

    assert!(limiter.try_acquire_n(&"k", 2).unwrap());

    assert_eq!(
        limiter.estimate_wait(&"k", 1).unwrap(),
        Duration::from_millis(500)
    );
    assert_eq!(limiter.estimate_wait(&"k", 2).unwrap(), Duration::from_secs(1));

    clock.advance(Duration::from_millis(200));
    assert_eq!(
        limiter.estimate_wait(&"k", 1).unwrap(),
        Duration::from_millis(300)
    );

    // Waiting the estimate is enough.
    clock.advance(Duration::from_millis(300));
    assert!(limiter.try_acquire(&"k"));
}

#[test]
fn estimate_wait_rounds_up() {
    // 3 tokens per second: one token takes 333_333_333.33..ns.
    let (limiter, clock) = limiter(3, Duration::from_secs(1));

    assert!(limiter.try_acquire_n(&"k", 3).unwrap());

    let wait = limiter.estimate_wait(&"k", 1).unwrap();
    assert_eq!(wait, Duration::from_nanos(333_333_334));

    clock.advance(wait);
    assert!(limiter.try_acquire(&"k"));
}

#[test]
fn read_only_queries_do_not_track_keys() {
    let (limiter, _clock) = limiter(2, Duration::from_secs(1));

    assert_eq!(limiter.available(&"k"), 2.0);
    assert_eq!(limiter.estimate_wait(&"k", 1).unwrap(), Duration::ZERO);
    assert_eq!(limiter.size(), 0);

    assert!(limiter.try_acquire(&"k"));
    assert_eq!(limiter.size(), 1);
}

#[test]
fn reset_restores_full_bucket() {
    let (limiter, _clock) = limiter(2, Duration::from_secs(1));

    assert!(limiter.try_acquire_n(&"k", 2).unwrap());
    assert!(!limiter.try_acquire(&"k"));

    limiter.reset(&"k");
    assert_eq!(limiter.size(), 0);

    assert!(limiter.try_acquire_n(&"k", 2).unwrap());
}

#[test]
fn per_key_buckets_are_independent() {
    let (limiter, _clock) = limiter(1, Duration::from_secs(1));

    assert!(limiter.try_acquire(&"a"));
    assert!(!limiter.try_acquire(&"a"));
    assert!(limiter.try_acquire(&"b"));

    assert_eq!(limiter.size(), 2);
}

#[test]
fn prune_full_removes_only_refilled_buckets() {
    let (limiter, clock) = limiter(4, Duration::from_secs(4));

    assert!(limiter.try_acquire_n(&"light", 1).unwrap());
    assert!(limiter.try_acquire_n(&"heavy", 4).unwrap());

    // One token per second: "light" is full again, "heavy" holds 1 of 4.
    clock.advance(Duration::from_secs(1));

    assert_eq!(limiter.prune_full(), 1);
    assert_eq!(limiter.size(), 1);
    assert!(limiter.buckets().contains_key("heavy"));

    assert_eq!(limiter.available(&"light"), 4.0);
    assert_eq!(limiter.available(&"heavy"), 1.0);
}

#[test]
fn concurrent_acquire_never_overspends() {
    let clock = ManualClock::new();
    let options = RateLimiterOptions::try_new(100, Duration::from_secs(60)).unwrap();
    let limiter = Arc::new(KeyedRateLimiter::<u64, ManualClock>::with_clock(options, clock));

    let admitted = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles = (0..threads)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let admitted = Arc::clone(&admitted);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                for _ in 0..50 {
                    if limiter.try_acquire(&1) {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        handle.join().unwrap();
    }

    // Time is frozen, so exactly the initial burst is admitted.
    assert_eq!(admitted.load(Ordering::Relaxed), 100);
    assert_eq!(limiter.available(&1), 0.0);
}
