//! Cadence control: keep the aggregate wall-clock sampling rate roughly
//! constant no matter how many threads have to be multiplexed through the
//! fixed per-cycle signal budget.

/// Upper bound on threads signaled in a single scheduler cycle. Throttles
/// profiling overhead for applications with many threads and keeps
/// contention low inside the recorder, which assumes only a handful of
/// interrupted threads at a time.
pub const THREADS_PER_CYCLE: usize = 8;

/// Hard floor for the pacing sleep, in nanoseconds. Shorter intervals are
/// unusable in practice: the signal storm costs more than the samples are
/// worth.
pub const MIN_INTERVAL_NS: u64 = 100_000;

/// Effective per-cycle delay for `thread_count` live threads.
///
/// With more threads than fit in one cycle, a full sweep takes
/// `ceil(thread_count / THREADS_PER_CYCLE)` cycles; dividing the base
/// interval by that factor keeps the per-thread sampling period stable.
pub fn adjust_interval(interval: u64, thread_count: usize) -> u64 {
    if thread_count > THREADS_PER_CYCLE {
        interval / thread_count.div_ceil(THREADS_PER_CYCLE) as u64
    } else {
        interval
    }
}
