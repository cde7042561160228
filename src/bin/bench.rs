//! Compares per-CPU increment strategies: restartable sequences against
//! contended and per-CPU atomics, locks, and a thread-local baseline.

use std::process::exit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use urseq::{CpuLocal, Value};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    LongCriticalSection,
    ContendedAtomics,
    ContendedLocks,
    Rseq,
    Atomics,
    AtomicsCachedCpu,
    Locks,
    LocksCachedCpu,
    ThreadLocal,
}

impl Mode {
    const ALL: [Mode; 9] = [
        Mode::LongCriticalSection,
        Mode::ContendedAtomics,
        Mode::ContendedLocks,
        Mode::Rseq,
        Mode::Atomics,
        Mode::AtomicsCachedCpu,
        Mode::Locks,
        Mode::LocksCachedCpu,
        Mode::ThreadLocal,
    ];

    fn parse(name: &str) -> Option<Mode> {
        Some(match name {
            "longCriticalSection" => Mode::LongCriticalSection,
            "contendedAtomics" => Mode::ContendedAtomics,
            "contendedLocks" => Mode::ContendedLocks,
            "rseq" => Mode::Rseq,
            "atomics" => Mode::Atomics,
            "atomicsCachedCpu" => Mode::AtomicsCachedCpu,
            "locks" => Mode::Locks,
            "locksCachedCpu" => Mode::LocksCachedCpu,
            "threadLocal" => Mode::ThreadLocal,
            _ => return None,
        })
    }

    fn label(self) -> &'static str {
        match self {
            Mode::LongCriticalSection => "Long critical section",
            Mode::ContendedAtomics => "Contended atomics",
            Mode::ContendedLocks => "Contended locks",
            Mode::Rseq => "Per-cpu restartable sequences",
            Mode::Atomics => "Per-cpu atomics",
            Mode::AtomicsCachedCpu => "Per-cpu atomics (with cached sched_getcpu calls)",
            Mode::Locks => "Per-cpu locks",
            Mode::LocksCachedCpu => "Per-cpu locks (with cached sched_getcpu calls)",
            Mode::ThreadLocal => "Thread-local operations only (no sharing)",
        }
    }
}

#[derive(Default)]
struct PercpuCounter {
    atomic: AtomicU64,
    seq: Value<u64>,
    mu: Mutex<()>,
}

struct BenchState {
    counters: CpuLocal<PercpuCounter>,
    contended: CachePadded<AtomicU64>,
    contended_mu: CachePadded<Mutex<()>>,
}

impl BenchState {
    fn new() -> Self {
        Self {
            counters: CpuLocal::new(),
            contended: CachePadded::new(AtomicU64::new(0)),
            contended_mu: CachePadded::new(Mutex::new(())),
        }
    }

    fn reset(&self) {
        self.contended.store(0, Ordering::SeqCst);
        for counter in self.counters.iter() {
            counter.atomic.store(0, Ordering::SeqCst);
            counter.seq.store(0, Ordering::SeqCst);
        }
    }

    fn total(&self) -> u64 {
        let mut total = self.contended.load(Ordering::SeqCst);
        for counter in self.counters.iter() {
            total += counter.atomic.load(Ordering::SeqCst);
            total += counter.seq.load(Ordering::SeqCst);
        }
        total
    }
}

fn long_critical_section(state: &BenchState, increments: u64) {
    let _guard = state.contended_mu.lock();
    for _ in 0..increments {
        let seen = state.contended.load(Ordering::Relaxed);
        state.contended.store(seen + 1, Ordering::Relaxed);
    }
}

fn contended_atomics(state: &BenchState, increments: u64) {
    for _ in 0..increments {
        let mut seen = state.contended.load(Ordering::SeqCst);
        loop {
            match state.contended.compare_exchange_weak(
                seen,
                seen + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => seen = actual,
            }
        }
    }
}

fn contended_locks(state: &BenchState, increments: u64) {
    for _ in 0..increments {
        let _guard = state.contended_mu.lock();
        let seen = state.contended.load(Ordering::Relaxed);
        state.contended.store(seen + 1, Ordering::Relaxed);
    }
}

fn rseq(state: &BenchState, increments: u64) {
    for _ in 0..increments {
        loop {
            let cpu = urseq::begin();
            let counter = &state.counters.for_cpu(cpu).seq;
            let seen = counter.load(Ordering::Relaxed);
            if urseq::store(counter, seen + 1) {
                break;
            }
        }
    }
}

fn atomics(state: &BenchState, increments: u64) {
    for _ in 0..increments {
        loop {
            let cpu = urseq::current_cpu() as usize;
            let counter = &state.counters.for_cpu(cpu).atomic;
            let seen = counter.load(Ordering::SeqCst);
            if counter
                .compare_exchange_weak(seen, seen + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
    }
}

fn atomics_cached_cpu(state: &BenchState, increments: u64) {
    let mut done = 0;
    while done < increments {
        let cpu = urseq::current_cpu() as usize;
        let counter = &state.counters.for_cpu(cpu).atomic;
        for _ in 0..100 {
            if done >= increments {
                break;
            }
            let seen = counter.load(Ordering::SeqCst);
            if counter
                .compare_exchange_weak(seen, seen + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
            done += 1;
        }
    }
}

fn locks(state: &BenchState, increments: u64) {
    for _ in 0..increments {
        let cpu = urseq::current_cpu() as usize;
        let counter = state.counters.for_cpu(cpu);
        let _guard = counter.mu.lock();
        let seen = counter.atomic.load(Ordering::Relaxed);
        counter.atomic.store(seen + 1, Ordering::Relaxed);
    }
}

fn locks_cached_cpu(state: &BenchState, increments: u64) {
    let mut done = 0;
    while done < increments {
        let cpu = urseq::current_cpu() as usize;
        let counter = state.counters.for_cpu(cpu);
        for _ in 0..100 {
            if done >= increments {
                break;
            }
            let _guard = counter.mu.lock();
            let seen = counter.atomic.load(Ordering::Relaxed);
            counter.atomic.store(seen + 1, Ordering::Relaxed);
            done += 1;
        }
    }
}

fn thread_local_only(state: &BenchState, increments: u64) {
    let mut local = 0u64;
    for _ in 0..increments {
        local = std::hint::black_box(local + 1);
    }
    state.counters.for_cpu(0).atomic.fetch_add(local, Ordering::SeqCst);
}

fn rdtscp() -> u64 {
    let mut aux = 0u32;
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) }
}

fn run(state: &Arc<BenchState>, mode: Mode, num_threads: u64, increments: u64) {
    state.reset();

    let body: fn(&BenchState, u64) = match mode {
        Mode::LongCriticalSection => long_critical_section,
        Mode::ContendedAtomics => contended_atomics,
        Mode::ContendedLocks => contended_locks,
        Mode::Rseq => rseq,
        Mode::Atomics => atomics,
        Mode::AtomicsCachedCpu => atomics_cached_cpu,
        Mode::Locks => locks,
        Mode::LocksCachedCpu => locks_cached_cpu,
        Mode::ThreadLocal => thread_local_only,
    };

    println!("===========================================================");
    println!("Benchmarking {}", mode.label());

    let begin_time = Instant::now();
    let begin_cycles = rdtscp();
    let threads: Vec<_> = (0..num_threads)
        .map(|_| {
            let state = Arc::clone(state);
            std::thread::spawn(move || body(&state, increments))
        })
        .collect();
    for thread in threads {
        thread.join().expect("benchmark thread panicked");
    }
    let end_cycles = rdtscp();
    let elapsed = begin_time.elapsed();

    let expected = num_threads * increments;
    let actual = state.total();
    if expected != actual {
        println!(
            "Error: actual increment count {actual} does not match expected \
             increment count {expected}."
        );
    }

    let cycles = end_cycles - begin_cycles;
    let per_increment = cycles as f64 / actual as f64;
    println!("Increments: {actual}");
    println!("Seconds: {:.6}", elapsed.as_secs_f64());
    println!("TSC ticks: {cycles}");
    println!("Single-CPU TSC ticks per increment: {per_increment:.6}");
    println!(
        "Global TSC ticks per increment: {:.6}",
        urseq::num_cpus() as f64 * per_increment
    );
    println!("===========================================================");
}

/// Compares per-CPU increment strategies.
#[derive(Debug, Parser)]
#[command(name = "urseq-bench")]
struct Args {
    /// `all`, or a comma-separated list drawn from: longCriticalSection,
    /// contendedAtomics, contendedLocks, rseq, atomics, atomicsCachedCpu,
    /// locks, locksCachedCpu, threadLocal
    benchmarks: String,

    /// Number of worker threads per benchmark.
    num_threads: u64,

    /// Increments each thread performs.
    increments_per_thread: u64,
}

fn parse_modes(names: &str) -> Vec<Mode> {
    if names == "all" {
        return Mode::ALL.to_vec();
    }
    names
        .split(',')
        .map(|name| {
            Mode::parse(name).unwrap_or_else(|| {
                eprintln!("Error: unknown benchmark type \"{name}\"");
                exit(1);
            })
        })
        .collect()
}

fn main() {
    let args = Args::parse();
    let modes = parse_modes(&args.benchmarks);

    let state = Arc::new(BenchState::new());
    for mode in modes {
        run(&state, mode, args.num_threads, args.increments_per_thread);
    }
}
