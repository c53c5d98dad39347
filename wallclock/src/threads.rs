//! Enumeration, filtering and state of the threads eligible for sampling.

use log::debug;
use procfs::process::Process;
use procfs::ProcResult;

use crate::os::ThreadId;
use crate::ThreadState;

/// Cyclically iterable set of thread ids: an arena refreshed from `/proc`
/// plus a cursor that persists across scheduler cycles, so threads beyond
/// the per-cycle budget get their turn on later cycles (round-robin over
/// time, not within one cycle).
pub struct ThreadList {
    tids: Vec<ThreadId>,
    cursor: usize,
    live: bool,
}

impl ThreadList {
    /// Capture the threads of this process from `/proc/self/task`.
    pub fn capture() -> ProcResult<Self> {
        Ok(Self {
            tids: read_tids()?,
            cursor: 0,
            live: true,
        })
    }

    /// Fixed membership, for callers that manage the arena themselves.
    pub fn from_tids(tids: Vec<ThreadId>) -> Self {
        Self {
            tids,
            cursor: 0,
            live: false,
        }
    }

    /// Next thread id, or `None` once the current sweep is exhausted.
    pub fn next(&mut self) -> Option<ThreadId> {
        let tid = self.tids.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(tid)
    }

    /// Restart the sweep over the current arena.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Restart the sweep, re-reading `/proc` first on captured lists so
    /// threads started or exited since the last sweep are picked up. A
    /// failed re-read keeps the previous arena.
    pub fn refresh(&mut self) {
        if self.live {
            match read_tids() {
                Ok(tids) => self.tids = tids,
                Err(e) => debug!("thread list refresh failed: {e}"),
            }
        }
        self.cursor = 0;
    }

    pub fn size(&self) -> usize {
        self.tids.len()
    }
}

fn read_tids() -> ProcResult<Vec<ThreadId>> {
    let me = Process::myself()?;
    let mut tids = Vec::new();
    for task in me.tasks()? {
        tids.push(task?.tid);
    }
    Ok(tids)
}

/// Predicate narrowing which threads get sampled, plus a cardinality
/// estimate feeding cadence adjustment. Passing no filter to the sampler
/// means every thread is eligible and the estimate falls back to the thread
/// list size.
pub trait ThreadFilter: Send + Sync + 'static {
    fn accept(&self, tid: ThreadId) -> bool;

    /// Estimated number of accepted threads.
    fn size(&self) -> usize;
}

/// Scheduling state of `tid` right now, read from `/proc`. A thread that
/// cannot be read (vanished between enumeration and query) counts as
/// sleeping and is left alone.
pub fn thread_state(tid: ThreadId) -> ThreadState {
    let state = Process::myself()
        .and_then(|p| p.task_from_tid(tid))
        .and_then(|t| t.stat())
        .map(|s| s.state);
    match state {
        Ok('R') => ThreadState::Running,
        _ => ThreadState::Sleeping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;

    #[test]
    fn sweep_ends_with_sentinel_and_rewinds_to_first() {
        let mut list = ThreadList::from_tids(vec![11, 22, 33]);
        assert_eq!(list.next(), Some(11));
        assert_eq!(list.next(), Some(22));
        assert_eq!(list.next(), Some(33));
        assert_eq!(list.next(), None);
        list.rewind();
        assert_eq!(list.next(), Some(11));
    }

    #[test]
    fn cursor_persists_between_pulls() {
        let mut list = ThreadList::from_tids(vec![1, 2, 3, 4]);
        assert_eq!(list.next(), Some(1));
        assert_eq!(list.next(), Some(2));
        // A new cycle continues where the previous one left off.
        assert_eq!(list.next(), Some(3));
        assert_eq!(list.size(), 4);
    }

    #[test]
    fn refresh_of_fixed_list_only_rewinds() {
        let mut list = ThreadList::from_tids(vec![5, 6]);
        assert_eq!(list.next(), Some(5));
        list.refresh();
        assert_eq!(list.next(), Some(5));
        assert_eq!(list.size(), 2);
    }

    #[test]
    fn capture_includes_calling_thread() {
        let mut list = ThreadList::capture().unwrap();
        let me = os::thread_id();
        let mut seen = Vec::new();
        while let Some(tid) = list.next() {
            seen.push(tid);
        }
        assert!(seen.contains(&me));
        assert_eq!(seen.len(), list.size());
    }

    #[test]
    fn current_thread_reads_as_running() {
        // This thread is on a CPU while it reads its own stat file.
        assert_eq!(thread_state(os::thread_id()), ThreadState::Running);
    }

    #[test]
    fn vanished_thread_reads_as_sleeping() {
        assert_eq!(thread_state(i32::MAX), ThreadState::Sleeping);
    }
}
