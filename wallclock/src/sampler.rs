//! Sampler lifecycle and the control thread that paces signal delivery.

use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::context::ModuleMap;
use crate::interval::{adjust_interval, MIN_INTERVAL_NS, THREADS_PER_CYCLE};
use crate::os::{self, ThreadId};
use crate::recorder::Recorder;
use crate::signal::{self, HandlerShared};
use crate::threads::{thread_state, ThreadFilter, ThreadList};
use crate::{SamplerConfig, StartError, ThreadState};

/// One sampler per process: the notification handler and its shared block
/// are process-wide.
static ACTIVE: AtomicBool = AtomicBool::new(false);

struct RunState {
    /// Lifecycle flag; the true→false transition shuts the loop down.
    running: AtomicBool,
    /// Pause/resume without tearing down the control thread.
    enabled: AtomicBool,
}

/// Handle to a running wall-clock sampler. Dropping it stops sampling.
pub struct Sampler {
    run_state: Arc<RunState>,
    handle: Option<JoinHandle<()>>,
    shared: &'static HandlerShared,
    signal: libc::c_int,
    notify_prev: libc::sigaction,
    wakeup_prev: libc::sigaction,
}

impl Sampler {
    /// Install the notification hook and spawn the control thread.
    ///
    /// The engine keeps a reference to `recorder` for the remainder of the
    /// process (the signal handler may observe it at any time, so it is
    /// never released). At most one sampler can be active per process;
    /// a second concurrent `start` is rejected.
    pub fn start(
        config: SamplerConfig,
        recorder: Arc<dyn Recorder>,
        filter: Option<Arc<dyn ThreadFilter>>,
    ) -> Result<Self, StartError> {
        if ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StartError::AlreadyRunning);
        }
        match Self::start_active(config, recorder, filter) {
            Ok(sampler) => Ok(sampler),
            Err(e) => {
                ACTIVE.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn start_active(
        config: SamplerConfig,
        recorder: Arc<dyn Recorder>,
        filter: Option<Arc<dyn ThreadFilter>>,
    ) -> Result<Self, StartError> {
        let signal = resolve_signal(config.signal);
        let interval_ns = config.interval_ns.max(MIN_INTERVAL_NS);
        let sample_idle_threads = config.sample_idle_threads;

        info!(
            "starting wall-clock sampler: interval {interval_ns}ns, signal {signal}, idle threads {}",
            if sample_idle_threads { "included" } else { "excluded" }
        );

        let shared = signal::attach(HandlerShared {
            recorder,
            modules: ModuleMap::snapshot(),
            sample_idle_threads,
            suppressed: AtomicU64::new(0),
        });

        let notify_prev = match os::install_handler(signal, signal::deliver, true) {
            Ok(prev) => prev,
            Err(e) => {
                signal::detach();
                return Err(StartError::Handler(e));
            }
        };
        let wakeup_prev = match os::install_handler(os::WAKEUP_SIGNAL, signal::wakeup, false) {
            Ok(prev) => prev,
            Err(e) => {
                let _ = os::restore_handler(signal, &notify_prev);
                signal::detach();
                return Err(StartError::Handler(e));
            }
        };

        let run_state = Arc::new(RunState {
            running: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        });

        let task = SamplerLoop {
            run_state: Arc::clone(&run_state),
            filter,
            interval_ns,
            signal,
            sample_idle_threads,
        };
        let handle = match thread::Builder::new()
            .name("wallclock-sampler".into())
            .spawn(move || task.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                // Nothing has been signaled yet, so reverting both
                // dispositions is safe here.
                let _ = os::restore_handler(signal, &notify_prev);
                let _ = os::restore_handler(os::WAKEUP_SIGNAL, &wakeup_prev);
                signal::detach();
                return Err(StartError::Spawn(e));
            }
        };

        Ok(Self {
            run_state,
            handle: Some(handle),
            shared,
            signal,
            notify_prev,
            wakeup_prev,
        })
    }

    /// Stop sampling: end the control loop, break it out of any pacing
    /// sleep, and join the control thread. Equivalent to dropping the
    /// handle.
    pub fn stop(self) {}

    /// Pause target selection without tearing down the control thread.
    pub fn pause(&self) {
        self.run_state.enabled.store(false, Ordering::Release);
    }

    /// Resume a paused sampler.
    pub fn resume(&self) {
        self.run_state.enabled.store(true, Ordering::Release);
    }

    /// The resolved notification signal in use; embedders must keep this
    /// signal free for the sampler.
    pub fn notification_signal(&self) -> libc::c_int {
        self.signal
    }

    /// Samples suppressed because they landed on the recorder's writer
    /// thread.
    pub fn suppressed_samples(&self) -> u64 {
        self.shared.suppressed.load(Ordering::Relaxed)
    }

    /// Disposition the notification signal had before `start`. `stop`
    /// leaves the engine's (by then inert) handler installed, because a
    /// delivery from the final cycle can still be in flight and the old
    /// disposition might be fatal to it; an embedder that knows better can
    /// reinstate this action.
    pub fn previous_notification_action(&self) -> libc::sigaction {
        self.notify_prev
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.run_state.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // Knock the control thread out of its pacing sleep; worst case
            // it is between sleeps and exits at the next loop check.
            unsafe {
                libc::pthread_kill(handle.as_pthread_t(), os::WAKEUP_SIGNAL);
            }
            let _ = handle.join();
        }
        signal::detach();
        // No further wake-ups can be pending once the control thread is
        // joined; the notification disposition stays as documented on
        // `previous_notification_action`.
        let _ = os::restore_handler(os::WAKEUP_SIGNAL, &self.wakeup_prev);
        ACTIVE.store(false, Ordering::Release);
        debug!("wall-clock sampler stopped");
    }
}

/// Notification signal for a configured request: 0 means the engine
/// default, and a value with a non-zero high byte carries the base signal
/// in that byte (callers that pack two signal numbers into one integer).
fn resolve_signal(requested: i32) -> libc::c_int {
    if requested == 0 {
        os::DEFAULT_SIGNAL
    } else if requested >> 8 > 0 {
        requested >> 8
    } else {
        requested
    }
}

struct SamplerLoop {
    run_state: Arc<RunState>,
    filter: Option<Arc<dyn ThreadFilter>>,
    interval_ns: u64,
    signal: libc::c_int,
    sample_idle_threads: bool,
}

impl SamplerLoop {
    fn run(self) {
        let self_tid = os::thread_id();
        let mut threads = match ThreadList::capture() {
            Ok(threads) => threads,
            Err(e) => {
                warn!("cannot enumerate threads, sampler loop exiting: {e}");
                return;
            }
        };

        let mut next_cycle_ns = os::now_ns();
        while self.run_state.running.load(Ordering::Acquire) {
            if !self.run_state.enabled.load(Ordering::Acquire) {
                os::sleep_ns(self.interval_ns);
                continue;
            }

            if self.sample_idle_threads {
                // Pace against an absolute target so the wall-clock cadence
                // stays stable regardless of how many threads share the
                // cycle budget.
                let estimated = self
                    .filter
                    .as_ref()
                    .map(|f| f.size())
                    .unwrap_or_else(|| threads.size());
                next_cycle_ns =
                    next_cycle_ns.saturating_add(adjust_interval(self.interval_ns, estimated));
            }

            run_cycle(
                &mut threads,
                self_tid,
                self.filter.as_deref(),
                self.sample_idle_threads,
                thread_state,
                |tid| os::send_signal(tid, self.signal),
            );

            if self.sample_idle_threads {
                let now = os::now_ns();
                let slack = next_cycle_ns.saturating_sub(now);
                if slack > MIN_INTERVAL_NS {
                    os::sleep_ns(slack);
                } else {
                    // Fell behind: re-anchor to now and pace at the floor.
                    next_cycle_ns = now + MIN_INTERVAL_NS;
                    os::sleep_ns(MIN_INTERVAL_NS);
                }
            } else {
                os::sleep_ns(self.interval_ns);
            }
        }
        debug!("sampler control loop exited");
    }
}

/// One selection cycle: pull thread ids round-robin until the per-cycle
/// budget of successful deliveries is spent or the sweep is exhausted.
/// Failed deliveries (vanished threads) do not consume budget and are not
/// retried.
fn run_cycle(
    threads: &mut ThreadList,
    self_tid: ThreadId,
    filter: Option<&dyn ThreadFilter>,
    sample_idle_threads: bool,
    state_of: impl Fn(ThreadId) -> ThreadState,
    mut deliver: impl FnMut(ThreadId) -> bool,
) {
    let mut delivered = 0;
    while delivered < THREADS_PER_CYCLE {
        let Some(tid) = threads.next() else {
            // Sweep exhausted: repopulate for the next cycle, no second
            // sweep within this one.
            threads.refresh();
            break;
        };
        if tid == self_tid {
            continue;
        }
        if let Some(filter) = filter {
            if !filter.accept(tid) {
                continue;
            }
        }
        if sample_idle_threads || state_of(tid) == ThreadState::Running {
            if deliver(tid) {
                delivered += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::context::ThreadContext;
    use crate::recorder::{Notification, SampleKind};

    fn collect_cycle(
        threads: &mut ThreadList,
        self_tid: ThreadId,
        filter: Option<&dyn ThreadFilter>,
        sample_idle_threads: bool,
        state_of: impl Fn(ThreadId) -> ThreadState,
    ) -> Vec<ThreadId> {
        let mut sent = Vec::new();
        run_cycle(threads, self_tid, filter, sample_idle_threads, state_of, |tid| {
            sent.push(tid);
            true
        });
        sent
    }

    #[test]
    fn cycle_respects_budget_and_sweep_position() {
        let mut threads = ThreadList::from_tids((1..=20).collect());
        let sent = collect_cycle(&mut threads, 0, None, true, |_| ThreadState::Running);
        assert_eq!(sent, (1..=8).collect::<Vec<_>>());
        // The next cycle continues the sweep instead of restarting it.
        let sent = collect_cycle(&mut threads, 0, None, true, |_| ThreadState::Running);
        assert_eq!(sent, (9..=16).collect::<Vec<_>>());
    }

    #[test]
    fn cycle_excludes_control_thread() {
        let mut threads = ThreadList::from_tids(vec![1, 2, 3]);
        let sent = collect_cycle(&mut threads, 2, None, true, |_| ThreadState::Running);
        assert_eq!(sent, vec![1, 3]);
    }

    #[test]
    fn exhaustion_ends_cycle_without_restarting_sweep() {
        let mut threads = ThreadList::from_tids(vec![1, 2, 3]);
        let sent = collect_cycle(&mut threads, 0, None, true, |_| ThreadState::Running);
        assert_eq!(sent, vec![1, 2, 3]);
        // The refresh rewound the list for the following cycle.
        let sent = collect_cycle(&mut threads, 0, None, true, |_| ThreadState::Running);
        assert_eq!(sent, vec![1, 2, 3]);
    }

    #[test]
    fn failed_delivery_is_skipped_without_retry_or_budget() {
        let mut threads = ThreadList::from_tids((1..=10).collect());
        let mut attempts = Vec::new();
        run_cycle(
            &mut threads,
            0,
            None,
            true,
            |_| ThreadState::Running,
            |tid| {
                attempts.push(tid);
                tid != 3 // tid 3 vanished
            },
        );
        // Eight successes plus the one failure; 3 is never retried.
        assert_eq!(attempts, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn filter_narrows_selection() {
        struct OddOnly;
        impl ThreadFilter for OddOnly {
            fn accept(&self, tid: ThreadId) -> bool {
                tid % 2 == 1
            }
            fn size(&self) -> usize {
                5
            }
        }
        let mut threads = ThreadList::from_tids((1..=10).collect());
        let sent = collect_cycle(&mut threads, 0, Some(&OddOnly), true, |_| ThreadState::Running);
        assert_eq!(sent, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn sleeping_threads_skipped_when_idle_sampling_off() {
        let mut threads = ThreadList::from_tids((1..=6).collect());
        let sent = collect_cycle(&mut threads, 0, None, false, |tid| {
            if tid <= 2 {
                ThreadState::Running
            } else {
                ThreadState::Sleeping
            }
        });
        assert_eq!(sent, vec![1, 2]);
    }

    // The lifecycle tests below install the real process-wide handler and
    // send real signals; they must not overlap.
    static LIFECYCLE: Mutex<()> = Mutex::new(());

    struct CountingRecorder {
        samples: AtomicU64,
    }

    impl CountingRecorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                samples: AtomicU64::new(0),
            })
        }
    }

    impl Recorder for CountingRecorder {
        fn record_sample(
            &self,
            _context: &ThreadContext,
            _weight: u64,
            _kind: SampleKind,
            _notification: &Notification,
        ) {
            self.samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn stop_returns_promptly_even_mid_sleep() {
        let _guard = LIFECYCLE.lock().unwrap();
        let sampler = Sampler::start(
            SamplerConfig {
                interval_ns: 1_000_000_000,
                ..SamplerConfig::default()
            },
            CountingRecorder::new(),
            None,
        )
        .unwrap();
        // Give the control thread time to settle into its 1s pacing sleep.
        thread::sleep(Duration::from_millis(50));
        let begin = Instant::now();
        sampler.stop();
        assert!(begin.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn second_start_is_rejected_while_active() {
        let _guard = LIFECYCLE.lock().unwrap();
        let sampler =
            Sampler::start(SamplerConfig::default(), CountingRecorder::new(), None).unwrap();
        match Sampler::start(SamplerConfig::default(), CountingRecorder::new(), None) {
            Ok(_) => panic!("second start must be rejected"),
            Err(e) => assert!(matches!(e, StartError::AlreadyRunning)),
        }
        sampler.stop();
        // A fresh instance may start once the previous one has stopped.
        Sampler::start(SamplerConfig::default(), CountingRecorder::new(), None)
            .unwrap()
            .stop();
    }

    #[test]
    fn samples_spinning_threads() {
        let _guard = LIFECYCLE.lock().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        for _ in 0..2 {
            let stop = Arc::clone(&stop);
            workers.push(thread::spawn(move || {
                let mut x = 1u64;
                while !stop.load(Ordering::Relaxed) {
                    x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    std::hint::black_box(x);
                }
            }));
        }

        let recorder = CountingRecorder::new();
        let sampler = Sampler::start(
            SamplerConfig {
                interval_ns: 1_000_000,
                ..SamplerConfig::default()
            },
            Arc::clone(&recorder) as Arc<dyn Recorder>,
            None,
        )
        .unwrap();
        thread::sleep(Duration::from_millis(400));
        sampler.stop();

        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(recorder.samples.load(Ordering::Relaxed) > 0);
    }
}
