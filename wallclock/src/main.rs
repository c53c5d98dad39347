use std::cmp::Reverse;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::info;
use serde::Serialize;

use wallclock::{
    now_ns, thread_id, Notification, Recorder, SampleKind, Sampler, SamplerConfig, ThreadContext,
    ThreadState,
};

/// Demonstration harness: spawns busy and sleeping threads in this process,
/// samples them for a while and prints where the wall-clock time went.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Sampling interval in microseconds.
    #[arg(short, long, value_name = "MICROS", default_value_t = 10_000)]
    interval: u64,

    /// How long to sample, in milliseconds.
    #[arg(short, long, value_name = "MILLIS", default_value_t = 3_000)]
    duration: u64,

    /// Only interrupt threads that are on-CPU.
    #[arg(long)]
    running_only: bool,

    /// Notification signal number (0 = engine default).
    #[arg(long, value_name = "SIGNO", default_value_t = 0)]
    signal: i32,

    /// Number of spinning demo threads.
    #[arg(long, value_name = "N", default_value_t = 3)]
    busy: usize,

    /// Number of sleeping demo threads.
    #[arg(long, value_name = "N", default_value_t = 3)]
    idle: usize,

    /// Write a JSON summary to this file.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

const TALLY_SLOTS: usize = 256;

/// Per-thread sample tally. A fixed open-addressed table of atomics: the
/// record path runs in signal context and must not allocate or lock.
struct TallyRecorder {
    tids: [AtomicI32; TALLY_SLOTS],
    counts: [AtomicU64; TALLY_SLOTS],
    running: AtomicU64,
    sleeping: AtomicU64,
    dropped: AtomicU64,
}

impl TallyRecorder {
    fn new() -> Self {
        Self {
            tids: [const { AtomicI32::new(0) }; TALLY_SLOTS],
            counts: [const { AtomicU64::new(0) }; TALLY_SLOTS],
            running: AtomicU64::new(0),
            sleeping: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn bump(&self, tid: i32, weight: u64) {
        let mut slot = (tid as usize).wrapping_mul(0x9e37_79b9) % TALLY_SLOTS;
        for _ in 0..TALLY_SLOTS {
            match self.tids[slot].compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire) {
                Err(existing) if existing != tid => {
                    slot = (slot + 1) % TALLY_SLOTS;
                    continue;
                }
                // Claimed the slot, or it was already ours.
                _ => {}
            }
            self.counts[slot].fetch_add(weight, Ordering::Relaxed);
            return;
        }
        self.dropped.fetch_add(weight, Ordering::Relaxed);
    }

    /// (tid, samples) pairs, busiest first.
    fn entries(&self) -> Vec<(i32, u64)> {
        let mut out = Vec::new();
        for (tid, count) in self.tids.iter().zip(&self.counts) {
            let tid = tid.load(Ordering::Acquire);
            if tid != 0 {
                out.push((tid, count.load(Ordering::Relaxed)));
            }
        }
        out.sort_by_key(|&(_, count)| Reverse(count));
        out
    }
}

impl Recorder for TallyRecorder {
    fn record_sample(
        &self,
        _context: &ThreadContext,
        weight: u64,
        _kind: SampleKind,
        notification: &Notification,
    ) {
        match notification.thread_state {
            ThreadState::Running => self.running.fetch_add(weight, Ordering::Relaxed),
            ThreadState::Sleeping => self.sleeping.fetch_add(weight, Ordering::Relaxed),
        };
        self.bump(thread_id(), weight);
    }
}

#[derive(Serialize)]
struct Summary {
    event: &'static str,
    interval_ns: u64,
    duration_ns: u64,
    total_samples: u64,
    running_samples: u64,
    sleeping_samples: u64,
    suppressed_samples: u64,
    dropped_samples: u64,
    threads: Vec<ThreadSummary>,
}

#[derive(Serialize)]
struct ThreadSummary {
    tid: i32,
    samples: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for i in 0..args.busy {
        workers.push(spawn_busy(i, Arc::clone(&stop))?);
    }
    for i in 0..args.idle {
        workers.push(spawn_idle(i, Arc::clone(&stop))?);
    }

    let recorder = Arc::new(TallyRecorder::new());
    let config = SamplerConfig {
        interval_ns: args.interval * 1_000,
        signal: args.signal,
        sample_idle_threads: !args.running_only,
    };
    let interval_ns = config.interval_ns;

    let started_ns = now_ns();
    let sampler = Sampler::start(config, Arc::clone(&recorder) as Arc<dyn Recorder>, None)?;
    thread::sleep(Duration::from_millis(args.duration));
    let suppressed_samples = sampler.suppressed_samples();
    sampler.stop();
    let duration_ns = now_ns() - started_ns;

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        let _ = worker.join();
    }

    let entries = recorder.entries();
    let summary = Summary {
        event: wallclock::EVENT_NAME,
        interval_ns,
        duration_ns,
        total_samples: entries.iter().map(|&(_, n)| n).sum(),
        running_samples: recorder.running.load(Ordering::Relaxed),
        sleeping_samples: recorder.sleeping.load(Ordering::Relaxed),
        suppressed_samples,
        dropped_samples: recorder.dropped.load(Ordering::Relaxed),
        threads: entries
            .into_iter()
            .map(|(tid, samples)| ThreadSummary { tid, samples })
            .collect(),
    };

    println!(
        "{} samples over {}ms ({} running, {} sleeping)",
        summary.total_samples,
        summary.duration_ns / 1_000_000,
        summary.running_samples,
        summary.sleeping_samples
    );
    for t in &summary.threads {
        println!("  tid {:>7}  {:>6} samples", t.tid, t.samples);
    }

    if let Some(path) = args.output {
        let file = File::create(&path)?;
        serde_json::to_writer(BufWriter::new(file), &summary)?;
        info!("summary written to {}", path.display());
    }

    Ok(())
}

fn spawn_busy(i: usize, stop: Arc<AtomicBool>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(format!("busy-{i}")).spawn(move || {
        let mut x = 0x243f_6a88_85a3_08d3u64;
        while !stop.load(Ordering::Relaxed) {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            std::hint::black_box(x);
        }
    })
}

fn spawn_idle(i: usize, stop: Arc<AtomicBool>) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(format!("idle-{i}")).spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(20));
        }
    })
}
