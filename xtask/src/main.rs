use std::path::Path;
use std::process::{exit, Command, ExitStatus};

use clap::{Parser, Subcommand, ValueEnum};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "xtask",
    about = "Task runner for the territorial dispatch workspace",
    long_about = "A unified CLI for running dispatch simulations, benchmarks,\n\
                  load tests and CI checks in the dispatch workspace."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic dispatch simulation over the sample catalog
    Simulate {
        #[arg(long, default_value_t = 50)]
        drivers: usize,
        #[arg(long, default_value_t = 200)]
        rides: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Territory catalog (JSON); the built-in sample when omitted
        #[arg(long)]
        territories: Option<String>,
    },
    /// Resolve a few sample coordinates and estimate fees for each tier
    Demo,
    /// Run Criterion benchmarks
    Bench,
    /// Compare benchmarks: stash changes, create baseline, restore, compare
    BenchCompare,
    /// Run CI checks (fmt, clippy, tests, demo, benchmarks)
    Ci {
        /// Job to run
        #[arg(value_enum, default_value_t = CiJob::Check)]
        job: CiJob,
    },
    /// Run load tests (ignored tests in dispatch_core)
    LoadTest,
}

#[derive(Clone, ValueEnum)]
enum CiJob {
    /// Formatting, clippy, and tests
    Check,
    /// Run the CLI demo and a short simulation
    Demo,
    /// Run benchmarks
    Bench,
    /// Run check + demo + bench
    All,
}

const BENCH: [&str; 5] = ["bench", "--package", "dispatch_core", "--bench", "performance"];

// ── helpers ────────────────────────────────────────────────────────

fn step(label: &str) {
    eprintln!("\n=== {label} ===");
}

fn cargo(args: &[&str]) -> ExitStatus {
    eprintln!("+ cargo {}", args.join(" "));
    Command::new("cargo")
        .args(args)
        .status()
        .expect("failed to execute cargo")
}

fn git(args: &[&str]) -> ExitStatus {
    eprintln!("+ git {}", args.join(" "));
    Command::new("git")
        .args(args)
        .status()
        .expect("failed to execute git")
}

fn run_cargo(args: &[&str]) {
    let status = cargo(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

fn run_git(args: &[&str]) {
    let status = git(args);
    if !status.success() {
        exit(status.code().unwrap_or(1));
    }
}

/// `cargo run -p dispatch_cli --release -- <args>`
fn run_cli(args: &[&str]) {
    let mut cargo_args = vec!["run", "-p", "dispatch_cli", "--release", "--"];
    cargo_args.extend_from_slice(args);
    run_cargo(&cargo_args);
}

fn bench_with(extra: &[&str]) {
    let mut args = BENCH.to_vec();
    if !extra.is_empty() {
        args.push("--");
        args.extend_from_slice(extra);
    }
    run_cargo(&args);
}

fn demo() {
    step("Resolve: nested polygon (Centro Histórico inside Centro)");
    run_cli(&["resolve", "--lat", "4.605", "--lng", "-74.075"]);

    step("Resolve: fallback circle (Usme)");
    run_cli(&["resolve", "--lat", "4.503", "--lng", "-74.100"]);

    step("Estimate fee: same neighborhood");
    run_cli(&[
        "estimate-fee",
        "--home",
        "1",
        "--pickup-lat",
        "4.602",
        "--pickup-lng",
        "-74.078",
        "--dropoff-lat",
        "4.608",
        "--dropoff-lng",
        "-74.072",
    ]);

    step("Estimate fee: adjacent neighborhood");
    run_cli(&[
        "estimate-fee",
        "--home",
        "3",
        "--pickup-lat",
        "4.602",
        "--pickup-lng",
        "-74.078",
        "--dropoff-lat",
        "4.645",
        "--dropoff-lng",
        "-74.065",
    ]);

    step("Estimate fee: outside fence");
    run_cli(&[
        "estimate-fee",
        "--pickup-lat",
        "4.602",
        "--pickup-lng",
        "-74.078",
        "--dropoff-lat",
        "4.503",
        "--dropoff-lng",
        "-74.100",
        "--fare",
        "20",
    ]);
}

// ── CI jobs ────────────────────────────────────────────────────────

fn ci_check() {
    step("Check formatting");
    run_cargo(&["fmt", "--all", "--", "--check"]);

    step("Clippy");
    run_cargo(&[
        "clippy",
        "--all-targets",
        "--all-features",
        "--",
        "-D",
        "warnings",
    ]);

    step("Test dispatch_core");
    run_cargo(&["test", "-p", "dispatch_core"]);

    step("Test dispatch_cli");
    run_cargo(&["test", "-p", "dispatch_cli"]);
}

fn ci_demo() {
    demo();

    step("Short simulation (20 drivers, 100 rides)");
    run_cli(&["simulate", "--drivers", "20", "--rides", "100"]);
}

fn ci_bench() {
    step("Run benchmarks");
    bench_with(&[]);
}

// ── main ───────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            drivers,
            rides,
            seed,
            territories,
        } => {
            let drivers = drivers.to_string();
            let rides = rides.to_string();
            let seed = seed.to_string();
            let mut args = vec![];
            if let Some(path) = territories.as_deref() {
                args.extend(["--territories", path]);
            }
            args.extend([
                "simulate",
                "--drivers",
                &drivers,
                "--rides",
                &rides,
                "--seed",
                &seed,
            ]);
            run_cli(&args);
        }
        Commands::Demo => demo(),
        Commands::Bench => bench_with(&[]),
        Commands::BenchCompare => {
            let baseline_dir = Path::new("target/criterion");
            if baseline_dir.exists() {
                step("Removing existing benchmark data");
                std::fs::remove_dir_all(baseline_dir).expect("failed to remove target/criterion");
            }

            step("Stashing current changes");
            run_git(&[
                "stash",
                "push",
                "-m",
                "Temporary stash for benchmark comparison",
            ]);

            step("Running benchmark to create baseline");
            bench_with(&["--save-baseline", "main"]);

            step("Reapplying changes");
            run_git(&["stash", "pop"]);

            step("Running benchmark comparing against baseline");
            bench_with(&["--baseline", "main"]);

            eprintln!("\nDone! Check the output above to see performance comparison.");
        }
        Commands::Ci { job } => {
            match job {
                CiJob::Check => ci_check(),
                CiJob::Demo => ci_demo(),
                CiJob::Bench => ci_bench(),
                CiJob::All => {
                    ci_check();
                    ci_demo();
                    ci_bench();
                }
            }
            eprintln!("\nCI job passed.");
        }
        Commands::LoadTest => {
            run_cargo(&[
                "test",
                "-p",
                "dispatch_core",
                "--test",
                "load_tests",
                "--",
                "--ignored",
            ]);
        }
    }
}
