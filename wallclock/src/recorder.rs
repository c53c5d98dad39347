//! Interface to the external recording subsystem. The engine decides when
//! and which thread to interrupt; everything that happens to a sample after
//! the notification is the recorder's business.

use crate::context::ThreadContext;
use crate::ThreadState;

/// Tag forwarded with every notification so a recorder shared between
/// several engines can tell sample sources apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Execution snapshot taken by the wall-clock sampler.
    Execution,
}

/// Ephemeral record describing one sampling interrupt. Built inside the
/// interrupted thread and passed to the recorder by reference; the engine
/// does not retain it past the call.
#[derive(Debug, Clone, Copy)]
pub struct Notification {
    /// Monotonic timestamp of the interrupt, in nanoseconds.
    pub timestamp_ns: u64,
    /// Classification of the interrupted context. Always
    /// [`ThreadState::Running`] when idle threads are not being sampled.
    pub thread_state: ThreadState,
}

/// Downstream sample sink.
///
/// `record_sample` runs inside the interrupted thread, in signal-handler
/// context: that path must be async-signal-safe, so it cannot allocate,
/// block, or take a non-reentrant lock. The sampler holds a reference to
/// the recorder for the remainder of the process lifetime (see
/// [`Sampler::start`](crate::Sampler::start)).
pub trait Recorder: Send + Sync + 'static {
    /// Consume one sample. `context` is the interrupted thread's saved
    /// machine state, valid only for the duration of the call.
    fn record_sample(
        &self,
        context: &ThreadContext,
        weight: u64,
        kind: SampleKind,
        notification: &Notification,
    );

    /// Whether the calling thread is the recorder's own event-writer
    /// thread. Samples on that thread are suppressed so the recorder is
    /// never re-entered inside its own critical section.
    fn is_writer_thread(&self) -> bool {
        false
    }
}
