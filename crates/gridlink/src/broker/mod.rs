// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 gridlink.dev

//! Cooperative phase scheduler and event loop.
//!
//! One loop per peer process. Algorithm modules register once with a fixed
//! phase duration and the loop grants each module its phase in round-robin
//! order; zero module code ever runs concurrently with another module's
//! code. All I/O, timers and handler invocations execute on this loop.
//!
//! ```text
//! +---------+      +---------+      +---------+
//! | phase 0 | ---> | phase 1 | ---> | phase 2 | --+
//! +---------+      +---------+      +---------+   |
//!      ^                                          |
//!      +------------------------------------------+
//!                  (realigned every ALIGNMENT_DURATION)
//! ```
//!
//! Scheduling contract:
//! - `schedule(module, job)` appends to that module's ready queue; the job
//!   runs during the module's phase, FIFO.
//! - Module timers run their job inline when the owner's phase is current,
//!   otherwise the job joins the owner's ready queue. Armed timers that are
//!   not marked carry-into-next-round are cancelled when their owner's
//!   phase ends; carry timers fire when the owner's phase next begins.
//! - The worker runs one job to completion, then re-checks the phase
//!   deadline: a long job may overrun its phase but no second job starts
//!   after the deadline.
//! - `stop()` runs each module's quit hook in registration order, cancels
//!   all timers and exits the loop.
//!
//! Cross-thread access goes through a cloneable [`BrokerHandle`] (command
//! channel plus a loop waker); the loop owns everything else.

mod signal;
mod timer;

pub use signal::{install as install_signal_watch, take as take_signal};
pub use timer::TimerQueue;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use mio::{Events, Poll, Token, Waker};

use crate::config::ALIGNMENT_DURATION_MS;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::net::{ConnectionRegistry, Listener, RetransmitRequest, RetransmitScheduler};

/// Poll token of the UDP listener socket.
pub const LISTENER_TOKEN: Token = Token(0);
/// Poll token of the loop waker.
pub const WAKER_TOKEN: Token = Token(1);

/// Upper bound on one poll sleep, so pending signals are noticed promptly.
const MAX_POLL: Duration = Duration::from_millis(100);

/// A unit of module work, run to completion on the loop.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Hook run once at shutdown, in module registration order.
pub type QuitHook = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of an allocated module timer.
pub type TimerHandle = u32;

struct Module {
    id: String,
    phase: Duration,
}

struct ArmedTimer {
    job: Job,
    carry: bool,
    epoch: u64,
}

enum TimerEvent {
    PhaseChange,
    ModuleTimer { handle: TimerHandle, epoch: u64 },
    Retransmit(String),
    System(u64),
}

enum Command {
    Schedule {
        module: String,
        job: Job,
    },
    AllocTimer {
        handle: TimerHandle,
        module: String,
    },
    ScheduleTimer {
        handle: TimerHandle,
        delay: Duration,
        job: Job,
        carry: bool,
    },
    ScheduleSystem {
        delay: Duration,
        job: Job,
    },
    CancelTimer {
        module: String,
    },
    RegisterModule {
        id: String,
        phase: Duration,
        quit: Option<QuitHook>,
    },
    Stop {
        signum: i32,
    },
}

/// Shared scheduler snapshot readable from any thread.
struct PhaseView {
    anchor: Instant,
    phase_ends_us: AtomicU64,
    stopping: AtomicBool,
    handle_counter: AtomicU32,
}

impl PhaseView {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
            phase_ends_us: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            handle_counter: AtomicU32::new(1),
        }
    }

    fn store_phase_end(&self, ends: Instant) {
        let us = ends
            .saturating_duration_since(self.anchor)
            .as_micros() as u64;
        self.phase_ends_us.store(us, Ordering::Relaxed);
    }

    fn time_remaining(&self) -> Duration {
        let ends = self.phase_ends_us.load(Ordering::Relaxed);
        let now = self.anchor.elapsed().as_micros() as u64;
        Duration::from_micros(ends.saturating_sub(now))
    }
}

/// Cloneable cross-thread interface to the broker loop.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
    view: Arc<PhaseView>,
}

impl BrokerHandle {
    /// Append a job to a module's ready queue and wake the worker.
    pub fn schedule<F>(&self, module: &str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_with(module, job, true);
    }

    /// Append a job to a module's ready queue. With `start_worker` false
    /// the loop is not woken; the job waits for the next wake-up or timer.
    pub fn schedule_with<F>(&self, module: &str, job: F, start_worker: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        let command = Command::Schedule {
            module: module.to_string(),
            job: Box::new(job),
        };
        if start_worker {
            self.post(command);
        } else if self.tx.send(command).is_err() {
            log::debug!("[broker] schedule after loop teardown");
        }
    }

    /// Allocate a timer owned by the given module.
    pub fn allocate_timer(&self, module: &str) -> TimerHandle {
        let handle = self.view.handle_counter.fetch_add(1, Ordering::Relaxed);
        self.post(Command::AllocTimer {
            handle,
            module: module.to_string(),
        });
        handle
    }

    /// Arm a timer. On expiry the job runs inline when the owner's phase is
    /// current, otherwise it joins the owner's ready queue.
    pub fn schedule_timer<F>(&self, handle: TimerHandle, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Command::ScheduleTimer {
            handle,
            delay,
            job: Box::new(job),
            carry: false,
        });
    }

    /// Arm a carry-into-next-round timer: the job runs when the owner's
    /// phase next begins, and a phase change does not cancel it.
    pub fn schedule_next_round<F>(&self, handle: TimerHandle, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Command::ScheduleTimer {
            handle,
            delay: Duration::ZERO,
            job: Box::new(job),
            carry: true,
        });
    }

    /// Arm a system timer outside the phase system; the job runs inline
    /// when it fires.
    pub fn schedule_system<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post(Command::ScheduleSystem {
            delay,
            job: Box::new(job),
        });
    }

    /// Best-effort cancel of all of a module's armed timers. A timer whose
    /// job already joined the ready queue still runs; such jobs observe
    /// [`BrokerHandle::stopping`] and should return early when it is set.
    pub fn cancel_timer(&self, module: &str) {
        self.post(Command::CancelTimer {
            module: module.to_string(),
        });
    }

    /// Register a module after the loop has started; takes effect at the
    /// next full-cycle alignment.
    pub fn register_module(&self, id: &str, phase: Duration, quit: Option<QuitHook>) {
        self.post(Command::RegisterModule {
            id: id.to_string(),
            phase,
            quit,
        });
    }

    /// Post a stop marker through the loop.
    pub fn stop(&self, signum: i32) {
        self.post(Command::Stop { signum });
    }

    /// Time left in the current phase. Meaningful to the currently running
    /// module; any other caller sees the same clamped value.
    pub fn time_remaining(&self) -> Duration {
        self.view.time_remaining()
    }

    /// True once shutdown has begun.
    pub fn stopping(&self) -> bool {
        self.view.stopping.load(Ordering::Relaxed)
    }

    fn post(&self, command: Command) {
        if self.tx.send(command).is_ok() {
            if let Err(err) = self.waker.wake() {
                log::warn!("[broker] wake failed: {}", err);
            }
        }
    }
}

/// Borrowed I/O surface driven by the loop.
pub struct BrokerIo<'a> {
    pub listener: &'a mut Listener,
    pub registry: &'a ConnectionRegistry,
    pub dispatcher: &'a Dispatcher,
}

/// The event loop and phase scheduler.
pub struct Broker {
    poll: Poll,
    waker: Arc<Waker>,
    cmd_tx: Sender<Command>,
    cmd_rx: Receiver<Command>,
    retransmit_tx: Sender<RetransmitRequest>,
    retransmit_rx: Receiver<RetransmitRequest>,
    timers: TimerQueue<TimerEvent>,
    alignment: Duration,

    modules: Vec<Module>,
    pending_modules: Vec<Module>,
    quit_hooks: Vec<(String, QuitHook)>,
    ready: HashMap<String, VecDeque<Job>>,
    owners: HashMap<TimerHandle, String>,
    armed: HashMap<TimerHandle, ArmedTimer>,
    /// Carry timers waiting for their owner's phase to begin.
    carry_waiting: Vec<TimerHandle>,
    epochs: HashMap<TimerHandle, u64>,
    system_jobs: HashMap<u64, Job>,
    next_system: u64,

    phase: usize,
    phase_ends: Instant,
    last_alignment: Instant,
    view: Arc<PhaseView>,
    stopping: bool,
    stop_signum: i32,
    phase_listeners: Vec<Box<dyn Fn(bool) + Send>>,
}

impl Broker {
    pub fn new() -> Result<Self> {
        Self::with_alignment(Duration::from_millis(ALIGNMENT_DURATION_MS))
    }

    /// Constructor with an explicit realignment interval.
    pub fn with_alignment(alignment: Duration) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = unbounded();
        let (retransmit_tx, retransmit_rx) = unbounded();
        let now = Instant::now();
        Ok(Self {
            poll,
            waker,
            cmd_tx,
            cmd_rx,
            retransmit_tx,
            retransmit_rx,
            timers: TimerQueue::new(),
            alignment,
            modules: Vec::new(),
            pending_modules: Vec::new(),
            quit_hooks: Vec::new(),
            ready: HashMap::new(),
            owners: HashMap::new(),
            armed: HashMap::new(),
            carry_waiting: Vec::new(),
            epochs: HashMap::new(),
            system_jobs: HashMap::new(),
            next_system: 0,
            phase: 0,
            phase_ends: now,
            last_alignment: now,
            view: Arc::new(PhaseView::new()),
            stopping: false,
            stop_signum: 0,
            phase_listeners: Vec::new(),
        })
    }

    /// Cross-thread handle to this loop.
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            tx: self.cmd_tx.clone(),
            waker: self.waker.clone(),
            view: self.view.clone(),
        }
    }

    /// Scheduler handle channels hand to the registry.
    pub fn retransmit_scheduler(&self) -> RetransmitScheduler {
        RetransmitScheduler::new(self.retransmit_tx.clone(), self.waker.clone())
    }

    /// The poll registry, for registering the listener socket.
    pub fn mio_registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Register a module before the loop starts. The cycle is exactly the
    /// registration sequence.
    pub fn register_module(&mut self, id: &str, phase: Duration, quit: Option<QuitHook>) {
        log::info!("[broker] module {} registered, phase {:?}", id, phase);
        self.modules.push(Module {
            id: id.to_string(),
            phase,
        });
        self.ready.entry(id.to_string()).or_default();
        if let Some(hook) = quit {
            self.quit_hooks.push((id.to_string(), hook));
        }
    }

    /// Observe phase changes (the argument is true when a new full round
    /// begins). Used to forward round boundaries to protocol channels.
    pub fn add_phase_listener<F>(&mut self, listener: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        self.phase_listeners.push(Box::new(listener));
    }

    /// Run the loop until stopped; returns the stop signal number.
    pub fn run(&mut self, mut io: Option<BrokerIo<'_>>) -> i32 {
        let now = Instant::now();
        self.last_alignment = now;
        if self.modules.is_empty() {
            log::warn!("[broker] no modules registered; scheduler idles");
        } else {
            self.phase = 0;
            self.enter_phase(now, true);
        }

        let mut events = Events::with_capacity(64);
        while !self.stopping {
            if let Some(signum) = signal::take() {
                log::info!("[broker] caught signal {}", signum);
                self.begin_stop(signum);
                break;
            }

            self.drain_commands();
            self.drain_retransmit_requests();
            self.fire_due_timers(&mut io);
            if self.stopping {
                break;
            }
            self.run_worker();
            if self.stopping {
                break;
            }

            let now = Instant::now();
            let timeout = match self.timers.next_deadline() {
                Some(deadline) => deadline.saturating_duration_since(now).min(MAX_POLL),
                None => MAX_POLL,
            };
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[broker] poll failed: {}", err);
                self.begin_stop(0);
                break;
            }
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    if let Some(io) = io.as_mut() {
                        io.listener.drain(io.registry, io.dispatcher);
                    }
                }
            }
        }

        self.shutdown();
        self.stop_signum
    }

    // ===== Loop internals =====

    fn begin_stop(&mut self, signum: i32) {
        if !self.stopping {
            self.stopping = true;
            self.stop_signum = signum;
            self.view.stopping.store(true, Ordering::Relaxed);
        }
    }

    fn shutdown(&mut self) {
        for (module, hook) in std::mem::take(&mut self.quit_hooks) {
            log::info!("[broker] running quit hook for {}", module);
            hook();
        }
        self.timers.clear();
        self.armed.clear();
        self.carry_waiting.clear();
        self.system_jobs.clear();
        log::info!("[broker] loop exited");
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.cmd_rx.try_recv() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Schedule { module, job } => {
                self.ready.entry(module).or_default().push_back(job);
            }
            Command::AllocTimer { handle, module } => {
                self.owners.insert(handle, module);
            }
            Command::ScheduleTimer {
                handle,
                delay,
                job,
                carry,
            } => {
                if !self.owners.contains_key(&handle) {
                    log::warn!("[broker] timer {} armed before allocation", handle);
                    return;
                }
                let epoch = self.epochs.entry(handle).or_insert(0);
                *epoch += 1;
                let epoch = *epoch;
                self.armed.insert(handle, ArmedTimer { job, carry, epoch });
                if carry {
                    self.carry_waiting.push(handle);
                } else {
                    self.timers.arm(
                        Instant::now() + delay,
                        TimerEvent::ModuleTimer { handle, epoch },
                    );
                }
            }
            Command::ScheduleSystem { delay, job } => {
                let id = self.next_system;
                self.next_system += 1;
                self.system_jobs.insert(id, job);
                self.timers.arm(Instant::now() + delay, TimerEvent::System(id));
            }
            Command::CancelTimer { module } => {
                let owners = &self.owners;
                self.armed.retain(|handle, _| {
                    let cancel = owners.get(handle).is_some_and(|m| *m == module);
                    if cancel {
                        log::debug!("[broker] cancelled timer {} of {}", handle, module);
                    }
                    !cancel
                });
                let armed = &self.armed;
                self.carry_waiting.retain(|handle| armed.contains_key(handle));
            }
            Command::RegisterModule { id, phase, quit } => {
                log::info!(
                    "[broker] module {} registration deferred to next alignment",
                    id
                );
                self.pending_modules.push(Module { id: id.clone(), phase });
                self.ready.entry(id.clone()).or_default();
                if let Some(hook) = quit {
                    self.quit_hooks.push((id, hook));
                }
            }
            Command::Stop { signum } => {
                self.begin_stop(signum);
            }
        }
    }

    fn drain_retransmit_requests(&mut self) {
        while let Ok(request) = self.retransmit_rx.try_recv() {
            self.timers
                .arm(request.deadline, TimerEvent::Retransmit(request.peer));
        }
    }

    fn fire_due_timers(&mut self, io: &mut Option<BrokerIo<'_>>) {
        loop {
            let now = Instant::now();
            let Some(event) = self.timers.pop_due(now) else {
                return;
            };
            match event {
                TimerEvent::PhaseChange => self.change_phase(now),
                TimerEvent::ModuleTimer { handle, epoch } => {
                    self.fire_module_timer(handle, epoch);
                }
                TimerEvent::Retransmit(peer) => {
                    let Some(io) = io.as_ref() else { continue };
                    let Some(channel) = io.registry.get(&peer) else {
                        continue;
                    };
                    if let Some(delay) = channel.handle_resend() {
                        self.timers
                            .arm(Instant::now() + delay, TimerEvent::Retransmit(peer));
                    }
                }
                TimerEvent::System(id) => {
                    if let Some(job) = self.system_jobs.remove(&id) {
                        if !self.stopping {
                            job();
                        }
                    }
                }
            }
            if self.stopping {
                return;
            }
        }
    }

    fn fire_module_timer(&mut self, handle: TimerHandle, epoch: u64) {
        let current = self.armed.get(&handle).map(|t| t.epoch);
        if current != Some(epoch) {
            // Cancelled or re-armed since this heap entry was created.
            return;
        }
        let Some(timer) = self.armed.remove(&handle) else {
            return;
        };
        let Some(owner) = self.owners.get(&handle).cloned() else {
            return;
        };
        let active = self
            .modules
            .get(self.phase)
            .is_some_and(|m| m.id == owner);
        if active && !self.stopping {
            (timer.job)();
        } else {
            self.ready.entry(owner).or_default().push_back(timer.job);
        }
    }

    /// Advance the round-robin phase and arm the next deadline.
    fn change_phase(&mut self, now: Instant) {
        if self.modules.is_empty() {
            return;
        }

        // Armed non-carry timers of the ending module are cancelled; jobs
        // already queued stay queued.
        let ending = self.modules[self.phase].id.clone();
        let owners = &self.owners;
        self.armed.retain(|handle, timer| {
            let cancel = !timer.carry && owners.get(handle).is_some_and(|m| *m == ending);
            if cancel {
                log::debug!(
                    "[broker] timer {} of {} lapsed at phase end",
                    handle,
                    ending
                );
            }
            !cancel
        });

        self.phase = (self.phase + 1) % self.modules.len();

        if now.duration_since(self.last_alignment) >= self.alignment {
            self.phase = 0;
            self.last_alignment = now;
            for module in self.pending_modules.drain(..) {
                log::info!("[broker] module {} joins the cycle", module.id);
                self.modules.push(module);
            }
        }

        self.enter_phase(now, self.phase == 0);
    }

    fn enter_phase(&mut self, now: Instant, new_round: bool) {
        let module = &self.modules[self.phase];
        let id = module.id.clone();
        self.phase_ends = now + module.phase;
        self.view.store_phase_end(self.phase_ends);
        log::debug!(
            "[broker] phase -> {} until {:?} (new_round={})",
            id,
            module.phase,
            new_round
        );

        for listener in &self.phase_listeners {
            listener(new_round);
        }

        // Release carry timers owned by the module whose phase begins.
        let owners = &self.owners;
        let mut released = Vec::new();
        self.carry_waiting.retain(|handle| {
            if owners.get(handle).is_some_and(|m| *m == id) {
                released.push(*handle);
                false
            } else {
                true
            }
        });
        for handle in released {
            if let Some(timer) = self.armed.remove(&handle) {
                self.ready.entry(id.clone()).or_default().push_back(timer.job);
            }
        }

        self.timers.arm(self.phase_ends, TimerEvent::PhaseChange);
    }

    /// Drain the active module's ready queue: one job at a time, re-checking
    /// the deadline between jobs. A long job is never preempted, but no new
    /// job starts after the deadline.
    fn run_worker(&mut self) {
        loop {
            if self.stopping {
                return;
            }
            self.drain_commands();
            if self.stopping {
                return;
            }
            let Some(module) = self.modules.get(self.phase).map(|m| m.id.clone()) else {
                return;
            };
            if Instant::now() >= self.phase_ends {
                return;
            }
            let job = self.ready.get_mut(&module).and_then(VecDeque::pop_front);
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("modules", &self.modules.len())
            .field("phase", &self.phase)
            .field("stopping", &self.stopping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn spin_run(broker: &mut Broker) -> i32 {
        broker.run(None)
    }

    #[test]
    fn test_jobs_run_fifo_within_phase() {
        let mut broker = Broker::new().expect("broker");
        broker.register_module("m1", Duration::from_millis(30), None);
        let handle = broker.handle();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            handle.schedule("m1", move || order.lock().push(i));
        }
        let stopper = handle.clone();
        handle.schedule("m1", move || stopper.stop(0));
        spin_run(&mut broker);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_job_for_inactive_module_waits_its_phase() {
        let mut broker = Broker::with_alignment(Duration::from_secs(10)).expect("broker");
        broker.register_module("m1", Duration::from_millis(20), None);
        broker.register_module("m2", Duration::from_millis(20), None);
        let handle = broker.handle();
        let ran_during = Arc::new(Mutex::new(None::<Duration>));

        let started = Instant::now();
        let slot = ran_during.clone();
        let stopper = handle.clone();
        handle.schedule("m2", move || {
            *slot.lock() = Some(started.elapsed());
            stopper.stop(0);
        });
        spin_run(&mut broker);

        let elapsed = ran_during.lock().expect("m2 job ran");
        assert!(
            elapsed >= Duration::from_millis(18),
            "m2 job ran during m1's phase ({:?})",
            elapsed
        );
    }

    #[test]
    fn test_timer_fires_inline_during_owner_phase() {
        let mut broker = Broker::new().expect("broker");
        broker.register_module("m1", Duration::from_millis(100), None);
        let handle = broker.handle();
        let timer = handle.allocate_timer("m1");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let stopper = handle.clone();
        handle.schedule_timer(timer, Duration::from_millis(10), move || {
            f.store(true, Ordering::SeqCst);
            stopper.stop(0);
        });
        spin_run(&mut broker);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let mut broker = Broker::new().expect("broker");
        broker.register_module("m1", Duration::from_millis(200), None);
        let handle = broker.handle();
        let timer = handle.allocate_timer("m1");
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        handle.schedule_timer(timer, Duration::from_millis(30), move || {
            f.store(true, Ordering::SeqCst);
        });
        handle.cancel_timer("m1");
        let stopper = handle.clone();
        handle.schedule_system(Duration::from_millis(60), move || stopper.stop(0));
        spin_run(&mut broker);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rearm_replaces_previous_schedule() {
        let mut broker = Broker::new().expect("broker");
        broker.register_module("m1", Duration::from_millis(200), None);
        let handle = broker.handle();
        let timer = handle.allocate_timer("m1");
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        handle.schedule_timer(timer, Duration::from_millis(10), move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        handle.schedule_timer(timer, Duration::from_millis(20), move || {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        let stopper = handle.clone();
        handle.schedule_system(Duration::from_millis(60), move || stopper.stop(0));
        spin_run(&mut broker);
        assert_eq!(count.load(Ordering::SeqCst), 10, "only the re-armed job ran");
    }

    #[test]
    fn test_quit_hooks_run_in_registration_order() {
        let mut broker = Broker::new().expect("broker");
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = order.clone();
            broker.register_module(
                name,
                Duration::from_millis(10),
                Some(Box::new(move || order.lock().push(name))),
            );
        }
        let handle = broker.handle();
        handle.stop(15);
        let signum = spin_run(&mut broker);
        assert_eq!(signum, 15);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_time_remaining_clamped_at_zero() {
        let broker = Broker::new().expect("broker");
        let handle = broker.handle();
        assert_eq!(handle.time_remaining(), Duration::ZERO);
    }

    #[test]
    fn test_system_timer_runs_without_modules_phase() {
        let mut broker = Broker::new().expect("broker");
        broker.register_module("m1", Duration::from_millis(10), None);
        let handle = broker.handle();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let stopper = handle.clone();
        handle.schedule_system(Duration::from_millis(5), move || {
            f.store(true, Ordering::SeqCst);
            stopper.stop(0);
        });
        spin_run(&mut broker);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_late_registration_joins_at_alignment() {
        let mut broker = Broker::with_alignment(Duration::from_millis(40)).expect("broker");
        broker.register_module("m1", Duration::from_millis(10), None);
        let handle = broker.handle();
        handle.register_module("late", Duration::from_millis(10), None);

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let stopper = handle.clone();
        handle.schedule("late", move || {
            f.store(true, Ordering::SeqCst);
            stopper.stop(0);
        });
        // Safety stop in case the late module never joins.
        let stopper = handle.clone();
        handle.schedule_system(Duration::from_millis(500), move || stopper.stop(99));

        let signum = spin_run(&mut broker);
        assert_eq!(signum, 0);
        assert!(fired.load(Ordering::SeqCst));
    }
}
