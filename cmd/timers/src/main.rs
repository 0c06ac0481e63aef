//! Timer example
//!
//! Three one-shot timers firing out of registration order, a periodic
//! ticker, and a shared common-timeout bucket, all ended by loopexit.

use revent::{Base, EventMask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("=== revent timer example ===\n");

    let base = Base::new().expect("failed to create base");
    println!("backend: {}\n", base.backend_name());

    let start = Instant::now();

    // One-shot timers, registered out of order
    let mut oneshots = Vec::new();
    for ms in [300u64, 100, 200] {
        let ev = base.timer_event(EventMask::empty(), move |_, _| {
            println!("[{:>4} ms] one-shot {} ms fired", elapsed_ms(), ms);
        });
        ev.add(Some(Duration::from_millis(ms))).unwrap();
        oneshots.push(ev);
    }

    // A periodic ticker
    let ticks = Arc::new(AtomicUsize::new(0));
    let t2 = ticks.clone();
    let ticker = base.timer_event(EventMask::PERSIST, move |_, _| {
        let n = t2.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[{:>4} ms] tick {}", elapsed_ms(), n);
    });
    ticker.add(Some(Duration::from_millis(80))).unwrap();

    // Many events sharing one relative timeout cost a single heap slot
    let bucket = base.common_timeout(Duration::from_millis(250));
    let mut shared = Vec::new();
    for i in 0..3 {
        let ev = base.timer_event(EventMask::empty(), move |_, _| {
            println!("[{:>4} ms] shared-timeout event {} fired", elapsed_ms(), i);
        });
        ev.add_common(bucket).unwrap();
        shared.push(ev);
    }

    base.loopexit(Some(Duration::from_millis(500))).unwrap();
    base.dispatch().unwrap();

    println!(
        "\ndone after {:?}: {} ticks, exited via loopexit: {}",
        start.elapsed(),
        ticks.load(Ordering::SeqCst),
        base.got_exit()
    );

    let stats = base.stats();
    println!(
        "stats: {} backend waits, {} callbacks, {} backend changes",
        stats.dispatches, stats.callbacks, stats.changes_applied
    );
}

fn elapsed_ms() -> u128 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis()
}
