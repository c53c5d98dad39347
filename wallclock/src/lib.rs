//! Wall-clock sampling engine: periodically interrupts this process's
//! threads with a POSIX signal and notifies a recorder from inside each
//! interrupted thread, with no dependency on hardware or kernel performance
//! counters.
//!
//! [`Sampler::start`] installs the notification hook and spawns a control
//! thread that selects up to a fixed number of threads per cycle, adapting
//! the cadence to the live thread count so the aggregate sampling rate
//! stays stable. The delivered signal runs an async-signal-safe callback
//! that timestamps the interrupt, classifies the saved context as running
//! or blocked in a syscall, and hands both to the [`Recorder`].

use std::io;

use thiserror::Error;

#[cfg(not(target_os = "linux"))]
compile_error!("wallclock relies on Linux signal and /proc semantics");

mod arch;
pub mod context;
pub mod interval;
mod os;
pub mod recorder;
mod sampler;
mod signal;
pub mod threads;

pub use context::{classify, ModuleMap, ThreadContext};
pub use os::{now_ns, thread_id, ThreadId};
pub use recorder::{Notification, Recorder, SampleKind};
pub use sampler::Sampler;
pub use threads::{thread_state, ThreadFilter, ThreadList};

/// Event name for reporting and configuration surfaces.
pub const EVENT_NAME: &str = "wall";

/// Sample unit label; wall-clock samples carry no unit.
pub const EVENT_UNITS: &str = "N/A";

/// Classification of a thread at the moment it was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing application code.
    Running,
    /// Blocked in (entering, executing or just leaving) a system call.
    Sleeping,
}

/// Sampler configuration, immutable once [`Sampler::start`] has accepted
/// it.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Base pacing interval in nanoseconds, clamped up to
    /// [`interval::MIN_INTERVAL_NS`].
    pub interval_ns: u64,
    /// Notification signal request. 0 selects the engine default
    /// (`SIGPROF`); a value with a non-zero high byte carries the signal
    /// number in that byte.
    pub signal: i32,
    /// Also sample threads blocked in syscalls. This is what makes the
    /// engine a wall-clock profiler; with it disabled only on-CPU threads
    /// are interrupted.
    pub sample_idle_threads: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ns: 10_000_000,
            signal: 0,
            sample_idle_threads: true,
        }
    }
}

/// Failure starting the sampler. Once `start` returns `Ok`, the engine has
/// no error surface other than producing no samples.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("a sampler is already running in this process")]
    AlreadyRunning,
    #[error("unable to install signal handler")]
    Handler(#[source] io::Error),
    #[error("unable to create timer thread")]
    Spawn(#[source] io::Error),
}
