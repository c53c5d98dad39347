//! The asynchronous side of the engine: state shared with the signal
//! handlers and the notification callback that runs inside interrupted
//! threads.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::{classify, ModuleMap, ThreadContext};
use crate::os;
use crate::recorder::{Notification, Recorder, SampleKind};
use crate::ThreadState;

/// Everything the notification handler needs, published before the handler
/// is installed. Must stay at a stable address for as long as any thread
/// could still be inside the handler, so the block is leaked rather than
/// freed (see [`detach`]).
pub(crate) struct HandlerShared {
    pub(crate) recorder: Arc<dyn Recorder>,
    pub(crate) modules: ModuleMap,
    pub(crate) sample_idle_threads: bool,
    pub(crate) suppressed: AtomicU64,
}

static SHARED: AtomicPtr<HandlerShared> = AtomicPtr::new(ptr::null_mut());

/// Publish `shared` for the handler. The returned borrow is valid for the
/// rest of the process.
pub(crate) fn attach(shared: HandlerShared) -> &'static HandlerShared {
    let leaked: &'static HandlerShared = Box::leak(Box::new(shared));
    // A handler on some thread may still hold the previous pointer, so the
    // old block cannot be reclaimed; one abandoned block per sampler
    // lifetime.
    let _ = SHARED.swap(leaked as *const HandlerShared as *mut _, Ordering::AcqRel);
    leaked
}

/// Make the handler inert. The current block stays allocated: a delivery
/// already past the null check may still be reading it.
pub(crate) fn detach() {
    SHARED.store(ptr::null_mut(), Ordering::Release);
}

/// Notification callback, executed inside the interrupted target thread.
///
/// Async-signal-safe path: atomic loads, saved-register reads, validated
/// instruction loads and the recorder's record path. errno is preserved for
/// the interrupted code.
pub(crate) extern "C" fn deliver(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let shared = SHARED.load(Ordering::Acquire);
    if shared.is_null() || ucontext.is_null() {
        return;
    }
    let shared = unsafe { &*shared };

    if shared.recorder.is_writer_thread() {
        // Recording here would re-enter the writer's critical section.
        shared.suppressed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let errno = unsafe { *libc::__errno_location() };

    // Safety: `ucontext` is the live context pointer of this handler
    // invocation.
    let context = unsafe { ThreadContext::from_ucontext(ucontext) };
    let thread_state = if shared.sample_idle_threads {
        classify(&context, &shared.modules)
    } else {
        ThreadState::Running
    };
    let notification = Notification {
        timestamp_ns: os::now_ns(),
        thread_state,
    };
    shared
        .recorder
        .record_sample(&context, 1, SampleKind::Execution, &notification);

    unsafe { *libc::__errno_location() = errno };
}

/// Handler for the wake-up signal. Nothing to do: delivery alone makes the
/// control thread's `nanosleep` return `EINTR`.
pub(crate) extern "C" fn wakeup(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
}
