//! Dispatch under a writer thread: an `if` on an atomic flag against a
//! patched trampoline.
//!
//! Calls on the main thread race with the writer's patches here, the
//! hazard `share` documents.

mod pricing;

use pricing::{MarketData, OptionPricing, binomial_european, black_scholes_european};
use semistatic::{BranchChanger, BranchResult, Switch};
use serde::Serialize;
use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ARITH_ITERATIONS: usize = 20_000_000;
const PRICING_ITERATIONS: usize = 1_000_000;
const FLIP_PERIOD: Duration = Duration::from_micros(100);

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    iterations: usize,
    branch_secs: f64,
    branchless_secs: f64,
    branch_flips: u64,
    branchless_flips: u64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    flip_period_micros: u128,
    results: Vec<BenchmarkResult>,
}

fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

fn sub(a: i32, b: i32) -> i32 {
    a.wrapping_sub(b)
}

fn div(a: u32, b: u32) -> u32 {
    a / b
}

fn mul(a: u32, b: u32) -> u32 {
    a.wrapping_mul(b)
}

fn rem(a: u32, b: u32) -> u32 {
    a % b
}

/// Run `flip` every [`FLIP_PERIOD`] until `stop` is set or `flip` fails.
fn spawn_writer<F>(stop: Arc<AtomicBool>, mut flip: F) -> JoinHandle<BranchResult<u64>>
where
    F: FnMut() -> BranchResult<()> + Send + 'static,
{
    thread::spawn(move || {
        let mut flips = 0;
        while !stop.load(Ordering::Acquire) {
            flip()?;
            flips += 1;
            thread::sleep(FLIP_PERIOD);
        }
        Ok(flips)
    })
}

/// Time `body` while `flip` runs on a writer thread.
fn timed<F, B>(flip: F, body: B) -> BranchResult<(f64, u64)>
where
    F: FnMut() -> BranchResult<()> + Send + 'static,
    B: FnOnce(),
{
    let stop = Arc::new(AtomicBool::new(false));
    let writer = spawn_writer(Arc::clone(&stop), flip);
    let start = Instant::now();
    body();
    let elapsed = start.elapsed().as_secs_f64();
    stop.store(true, Ordering::Release);
    let flips = writer
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
    Ok((elapsed, flips))
}

fn bench_add_sub() -> BranchResult<BenchmarkResult> {
    let flag = Arc::new(AtomicBool::new(true));
    let (branch_secs, branch_flips) = timed(
        {
            let flag = Arc::clone(&flag);
            move || {
                flag.fetch_xor(true, Ordering::Relaxed);
                Ok(())
            }
        },
        || {
            let mut acc = 0i32;
            for i in 0..ARITH_ITERATIONS as i32 {
                acc = if flag.load(Ordering::Relaxed) {
                    add(acc, i)
                } else {
                    sub(acc, i)
                };
            }
            black_box(acc);
        },
    )?;

    let mut switch = Switch::<fn(i32, i32) -> i32>::new(add, sub)?;
    // SAFETY: the race with the writer is what is being measured.
    let entry = unsafe { switch.share() };
    let mut direction = true;
    let (branchless_secs, branchless_flips) = timed(
        move || {
            switch.set_direction(!direction)?;
            direction = !direction;
            Ok(())
        },
        || {
            let mut acc = 0i32;
            for i in 0..ARITH_ITERATIONS as i32 {
                acc = entry.branch(acc, i);
            }
            black_box(acc);
        },
    )?;

    Ok(BenchmarkResult {
        name: "add_sub".to_string(),
        iterations: ARITH_ITERATIONS,
        branch_secs,
        branchless_secs,
        branch_flips,
        branchless_flips,
    })
}

fn bench_div_mul_rem() -> BranchResult<BenchmarkResult> {
    let flag = Arc::new(AtomicUsize::new(0));
    let (branch_secs, branch_flips) = timed(
        {
            let flag = Arc::clone(&flag);
            move || {
                let next = (flag.load(Ordering::Relaxed) + 1) % 3;
                flag.store(next, Ordering::Relaxed);
                Ok(())
            }
        },
        || {
            let mut acc = 0u32;
            for i in 1..=ARITH_ITERATIONS as u32 {
                acc ^= match flag.load(Ordering::Relaxed) {
                    0 => div(i, 7),
                    1 => mul(i, 7),
                    _ => rem(i, 7),
                };
            }
            black_box(acc);
        },
    )?;

    let mut changer = BranchChanger::<fn(u32, u32) -> u32>::new(&[div, mul, rem])?;
    // SAFETY: the race with the writer is what is being measured.
    let entry = unsafe { changer.share() };
    let (branchless_secs, branchless_flips) = timed(
        move || {
            let next = (changer.direction() + 1) % changer.len();
            changer.set_direction(next)
        },
        || {
            let mut acc = 0u32;
            for i in 1..=ARITH_ITERATIONS as u32 {
                acc ^= entry.branch(i, 7);
            }
            black_box(acc);
        },
    )?;

    Ok(BenchmarkResult {
        name: "div_mul_rem".to_string(),
        iterations: ARITH_ITERATIONS,
        branch_secs,
        branchless_secs,
        branch_flips,
        branchless_flips,
    })
}

fn bench_pricing() -> BranchResult<BenchmarkResult> {
    let inputs: Vec<OptionPricing> = {
        let mut market = MarketData::new(0x5eed);
        (0..PRICING_ITERATIONS).map(|_| market.next_option()).collect()
    };

    let flag = Arc::new(AtomicBool::new(true));
    let (branch_secs, branch_flips) = timed(
        {
            let flag = Arc::clone(&flag);
            move || {
                flag.fetch_xor(true, Ordering::Relaxed);
                Ok(())
            }
        },
        || {
            let mut total = 0.0;
            for data in &inputs {
                total += if flag.load(Ordering::Relaxed) {
                    black_scholes_european(data)
                } else {
                    binomial_european(data)
                };
            }
            black_box(total);
        },
    )?;

    let mut switch =
        Switch::<fn(&OptionPricing) -> f64>::new(black_scholes_european, binomial_european)?;
    // SAFETY: the race with the writer is what is being measured.
    let entry = unsafe { switch.share() };
    let mut direction = true;
    let (branchless_secs, branchless_flips) = timed(
        move || {
            switch.set_direction(!direction)?;
            direction = !direction;
            Ok(())
        },
        || {
            let mut total = 0.0;
            for data in &inputs {
                total += entry.branch(data);
            }
            black_box(total);
        },
    )?;

    Ok(BenchmarkResult {
        name: "pricing".to_string(),
        iterations: PRICING_ITERATIONS,
        branch_secs,
        branchless_secs,
        branch_flips,
        branchless_flips,
    })
}

fn main() -> std::process::ExitCode {
    let mut results = Vec::new();
    for bench in [bench_add_sub, bench_div_mul_rem, bench_pricing] {
        match bench() {
            Ok(result) => results.push(result),
            Err(e) => {
                eprintln!("error: {} ({})", e, e.kind().describe());
                return std::process::ExitCode::FAILURE;
            }
        }
    }

    let output = BenchmarkOutput {
        flip_period_micros: FLIP_PERIOD.as_micros(),
        results,
    };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("error: {}", e);
            return std::process::ExitCode::FAILURE;
        }
    }
    std::process::ExitCode::SUCCESS
}
