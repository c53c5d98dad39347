//! Execution-context inspection: decide whether a thread interrupted by the
//! sampling signal was doing useful work or sitting in a blocking syscall.

use std::ops::Range;

use log::warn;

use crate::arch;
use crate::ThreadState;

/// Saved machine state of an interrupted thread, as handed to a signal
/// handler.
pub struct ThreadContext {
    uc: *mut libc::c_void,
}

impl ThreadContext {
    /// Wrap the `ucontext_t` pointer a `SA_SIGINFO` handler receives.
    ///
    /// # Safety
    /// `uc` must be the ucontext pointer passed to the currently running
    /// signal handler; it stays valid only until the handler returns.
    pub(crate) unsafe fn from_ucontext(uc: *mut libc::c_void) -> Self {
        Self { uc }
    }

    /// Raw ucontext pointer, for recorders that unwind the stack.
    pub fn as_ptr(&self) -> *mut libc::c_void {
        self.uc
    }

    /// Saved program counter.
    pub fn pc(&self) -> usize {
        unsafe { arch::program_counter(self.uc.cast()) }
    }

    /// True when the context shows a syscall that was broken off by signal
    /// delivery: the return-value register holds `-EINTR`.
    fn interrupted_syscall(&self) -> bool {
        unsafe { arch::syscall_result(self.uc.cast()) == -(libc::EINTR as i64) }
    }
}

/// Snapshot of the executable memory mappings of this process, taken at
/// sampler start. Lookups are read-only and allocation-free, so the signal
/// handler may use them.
pub struct ModuleMap {
    ranges: Vec<Range<usize>>,
}

impl ModuleMap {
    /// Capture the current executable mappings from `/proc`.
    ///
    /// On failure the map is empty and derived reads outside the faulting
    /// page are refused, which only costs classification precision.
    pub fn snapshot() -> Self {
        let mut ranges: Vec<Range<usize>> = Vec::new();
        match proc_maps::get_process_maps(std::process::id() as proc_maps::Pid) {
            Ok(maps) => {
                for map in maps {
                    if map.is_exec() {
                        ranges.push(map.start()..map.start() + map.size());
                    }
                }
            }
            Err(e) => warn!("could not snapshot process maps: {e}"),
        }
        Self::from_ranges(ranges)
    }

    pub fn from_ranges(mut ranges: Vec<Range<usize>>) -> Self {
        ranges.sort_by_key(|r| r.start);
        Self { ranges }
    }

    /// Whether `addr` lies inside a known executable mapping.
    pub fn contains(&self, addr: usize) -> bool {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        idx > 0 && self.ranges[idx - 1].end > addr
    }
}

/// Validated access to instruction bytes near an interrupt location. Every
/// read of a derived address goes through here, after proof that the
/// address is in mapped memory; there is no unchecked dereference path.
struct CodeReader<'a> {
    modules: &'a ModuleMap,
}

impl<'a> CodeReader<'a> {
    fn new(modules: &'a ModuleMap) -> Self {
        Self { modules }
    }

    /// Opcode at the interrupted pc. The thread was executing at `pc` when
    /// it was suspended, so that mapping is still present.
    fn opcode_at_pc(&self, pc: usize) -> [u8; arch::SYSCALL_WIDTH] {
        unsafe { (pc as *const [u8; arch::SYSCALL_WIDTH]).read_unaligned() }
    }

    /// Opcode one syscall-width before `pc`, or `None` when that address
    /// cannot be proven readable: it must share pc's 4 KiB page or fall
    /// inside a known executable mapping.
    fn opcode_before(&self, pc: usize) -> Option<[u8; arch::SYSCALL_WIDTH]> {
        let prev = pc.checked_sub(arch::SYSCALL_WIDTH)?;
        if (pc & 0xfff) >= arch::SYSCALL_WIDTH || self.modules.contains(prev) {
            Some(unsafe { (prev as *const [u8; arch::SYSCALL_WIDTH]).read_unaligned() })
        } else {
            None
        }
    }
}

/// Classify an interrupted context as running or sleeping.
///
/// A thread stopped in the middle of a blocking syscall shows up in one of
/// two shapes: the saved pc still points at the syscall instruction (about
/// to execute, or rewound for restart), or the pc sits just past a syscall
/// instruction whose return register carries `-EINTR`. Both are sleeping;
/// everything else counts as running.
pub fn classify(context: &ThreadContext, modules: &ModuleMap) -> ThreadState {
    classify_pc(
        context.pc(),
        context.interrupted_syscall(),
        &CodeReader::new(modules),
    )
}

fn classify_pc(pc: usize, interrupted_syscall: bool, code: &CodeReader<'_>) -> ThreadState {
    // The zero page is never mapped; a context this corrupt is not worth
    // inspecting.
    if pc < 0x1000 {
        return ThreadState::Running;
    }
    if arch::is_syscall(&code.opcode_at_pc(pc)) {
        return ThreadState::Sleeping;
    }
    match code.opcode_before(pc) {
        Some(op) if arch::is_syscall(&op) && interrupted_syscall => ThreadState::Sleeping,
        _ => ThreadState::Running,
    }
}
