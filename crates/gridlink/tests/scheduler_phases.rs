// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Scheduler fairness and phase cadence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gridlink::broker::Broker;

#[test]
fn three_modules_share_the_cycle_fairly() {
    // (50, 50, 50) phases, 100 jobs queued into module 1; modules 2
    // and 3 still get their airtime and module 1 is not starved across
    // cycles.
    let mut broker = Broker::new().expect("broker");
    for name in ["m1", "m2", "m3"] {
        broker.register_module(name, Duration::from_millis(50), None);
    }
    let handle = broker.handle();

    let m1_done = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let done = m1_done.clone();
        handle.schedule("m1", move || {
            // Each job costs ~2 ms, so one 50 ms phase cannot drain all
            // 100.
            std::thread::sleep(Duration::from_millis(2));
            done.fetch_add(1, Ordering::SeqCst);
        });
    }

    // Probes record how much of m1's backlog was done when they ran.
    let m2_saw = Arc::new(AtomicUsize::new(usize::MAX));
    let m3_saw = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let done = m1_done.clone();
        let saw = m2_saw.clone();
        handle.schedule("m2", move || {
            saw.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
        });
    }
    {
        let done = m1_done.clone();
        let saw = m3_saw.clone();
        handle.schedule("m3", move || {
            saw.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
        });
    }

    // Stop once the backlog is done (checked from a watchdog system
    // timer), or give up after 5 s.
    let stopper = handle.clone();
    let done = m1_done.clone();
    fn watch(
        handle: gridlink::broker::BrokerHandle,
        done: Arc<AtomicUsize>,
        started: Instant,
    ) {
        if done.load(Ordering::SeqCst) >= 100 || started.elapsed() > Duration::from_secs(5) {
            handle.stop(0);
            return;
        }
        let again = handle.clone();
        handle.schedule_system(Duration::from_millis(20), move || {
            watch(again, done, started);
        });
    }
    handle.schedule_system(Duration::from_millis(20), {
        let started = Instant::now();
        move || watch(stopper, done, started)
    });

    broker.run(None);

    let m2 = m2_saw.load(Ordering::SeqCst);
    let m3 = m3_saw.load(Ordering::SeqCst);
    assert!(m2 != usize::MAX, "m2 never got a phase");
    assert!(m3 != usize::MAX, "m3 never got a phase");
    assert!(
        m2 < 100,
        "m2 only ran after m1's whole backlog ({} done)",
        m2
    );
    assert!(
        m3 < 100,
        "m3 only ran after m1's whole backlog ({} done)",
        m3
    );
    assert_eq!(
        m1_done.load(Ordering::SeqCst),
        100,
        "m1 starved across cycles"
    );
}

#[test]
fn phase_entries_track_the_cycle_length() {
    // Over consecutive cycles, the wall time between entries into one
    // module's phase stays near the cycle duration.
    let mut broker = Broker::new().expect("broker");
    broker.register_module("a", Duration::from_millis(30), None);
    broker.register_module("b", Duration::from_millis(30), None);
    broker.register_module("c", Duration::from_millis(30), None);
    let handle = broker.handle();

    let entries: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let timer = handle.allocate_timer("a");

    fn record(
        handle: gridlink::broker::BrokerHandle,
        timer: gridlink::broker::TimerHandle,
        entries: Arc<Mutex<Vec<Instant>>>,
    ) {
        let mine = entries.clone();
        let again = handle.clone();
        handle.schedule_next_round(timer, move || {
            mine.lock().expect("entries lock").push(Instant::now());
            record(again, timer, mine);
        });
    }
    record(handle.clone(), timer, entries.clone());

    let stopper = handle.clone();
    handle.schedule_system(Duration::from_millis(600), move || stopper.stop(0));
    broker.run(None);

    let entries = entries.lock().expect("entries lock");
    assert!(
        entries.len() >= 3,
        "expected several cycle entries, got {}",
        entries.len()
    );
    for pair in entries.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        // Nominal cycle is 90 ms; allow generous scheduling slack but
        // reject runaway drift.
        assert!(
            gap >= Duration::from_millis(55) && gap <= Duration::from_millis(400),
            "cycle gap {:?} outside tolerance",
            gap
        );
    }
}

#[test]
fn long_job_overruns_but_is_not_preempted() {
    let mut broker = Broker::new().expect("broker");
    broker.register_module("slow", Duration::from_millis(10), None);
    broker.register_module("other", Duration::from_millis(10), None);
    let handle = broker.handle();

    let finished = Arc::new(AtomicUsize::new(0));
    {
        let finished = finished.clone();
        handle.schedule("slow", move || {
            // Three times the phase budget.
            std::thread::sleep(Duration::from_millis(30));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }
    // A second job in the same queue must wait for slow's next phase, not
    // run in the overrun.
    let second_ran_at = Arc::new(Mutex::new(None::<Instant>));
    {
        let slot = second_ran_at.clone();
        handle.schedule("slow", move || {
            *slot.lock().expect("slot lock") = Some(Instant::now());
        });
    }

    let started = Instant::now();
    let stopper = handle.clone();
    handle.schedule_system(Duration::from_millis(300), move || stopper.stop(0));
    broker.run(None);

    assert_eq!(finished.load(Ordering::SeqCst), 1, "long job ran once");
    let second = second_ran_at
        .lock()
        .expect("slot lock")
        .expect("second job ran");
    // The long job held the worker for 30 ms; the second job had to wait
    // for a later phase of its module.
    assert!(
        second.duration_since(started) >= Duration::from_millis(35),
        "second job ran inside the overrun window"
    );
}
