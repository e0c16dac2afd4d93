//! Substate replay command-line tool.
//!
//! Re-executes recorded transaction substates over an inclusive block range
//! and checks output consistency against the recordings. Sibling commands
//! reuse the same task pool to compute address usage statistics and flat
//! storage dumps from the recorded allocations.

use std::{
    collections::HashMap,
    path::PathBuf,
    process,
    sync::{Arc, atomic::Ordering},
};

use alloy_primitives::Address;
use clap::{Args, Parser, Subcommand};
use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use replay_core::{
    chain,
    interpreter::InterpreterRegistry,
    pool::{TaskPool, TaskPoolConfig},
    replay::{ReplayConfig, ReplayError, replay_task},
    store::SubstateDb,
};

/// Database filename inside the substate directory.
const SUBSTATE_DB_FILENAME: &str = "substates.redb";

#[derive(Parser, Debug)]
#[clap(name = "substate-replay", version, about = "Substate transaction replay harness")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Executes full state transitions and checks output consistency.
    Replay(ReplayArgs),
    /// Computes usage statistics of addresses.
    AddressStats(RangeArgs),
    /// Prints the storage of recorded output accounts in flat data format.
    StorageFlat(RangeArgs),
}

/// Arguments shared by every range-driven command.
#[derive(Args, Debug)]
struct RangeArgs {
    /// First block of the inclusive range.
    first_block: u64,

    /// Last block of the inclusive range.
    last_block: u64,

    /// Chain id of the recorded network.
    #[clap(long = "chainid", default_value_t = chain::OPERA_CHAIN_ID)]
    chain_id: u64,

    /// Number of worker threads.
    #[clap(long, default_value_t = num_cpus::get())]
    workers: usize,

    /// Directory containing the substate database.
    #[clap(long = "substatedir", env = "SUBSTATE_DIR", default_value = "substate")]
    substate_dir: PathBuf,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[clap(flatten)]
    range: RangeArgs,

    /// Interpreter implementation to be used.
    #[clap(long, default_value = "")]
    interpreter: String,

    /// Only runs transactions that have been successful.
    #[clap(long)]
    only_successful: bool,

    /// Enables the faster in-memory StateDB implementation.
    #[clap(long = "faststatedb")]
    fast_state_db: bool,

    /// File name to write a CPU profile of the evaluation step to.
    #[clap(long = "cpuprofile")]
    cpu_profile: Option<PathBuf>,

    /// Enables profiling of interpreter calls.
    #[clap(long = "profiling-call")]
    profiling_call: bool,

    /// Enables profiling of interpreter opcodes.
    #[clap(long = "profiling-opcode")]
    profiling_opcode: bool,

    /// Skips value-transfer transactions.
    #[clap(long)]
    skip_transfer_txs: bool,

    /// Skips contract-call transactions.
    #[clap(long)]
    skip_call_txs: bool,

    /// Skips contract-creation transactions.
    #[clap(long)]
    skip_create_txs: bool,
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("SUBSTATE_REPLAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap's default usage-error code collides with the mismatch
            // exit code; remap to the argument-error code.
            let _ = err.print();
            process::exit(if err.use_stderr() { 1 } else { 0 });
        }
    };

    if let Err(err) = run(cli) {
        let code = err
            .downcast_ref::<ReplayError>()
            .map(ReplayError::exit_code)
            .unwrap_or(3);
        error!("[Main] {err:#}");
        process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Replay(args) => run_replay(args),
        Command::AddressStats(args) => run_address_stats(args),
        Command::StorageFlat(args) => run_storage_flat(args),
    }
}

fn check_range(args: &RangeArgs) -> Result<()> {
    if args.first_block > args.last_block {
        return Err(ReplayError::Argument(format!(
            "first block {} has larger number than last block {}",
            args.first_block, args.last_block
        ))
        .into());
    }
    Ok(())
}

fn open_store(args: &RangeArgs) -> Result<Arc<SubstateDb>> {
    let path = args.substate_dir.join(SUBSTATE_DB_FILENAME);
    let db = SubstateDb::open_read_only(&path).map_err(ReplayError::from)?;
    Ok(Arc::new(db))
}

/// Writes the CPU profile on drop, covering every exit path of the replay
/// action.
struct CpuProfile {
    guard: pprof::ProfilerGuard<'static>,
    path: PathBuf,
}

impl CpuProfile {
    fn start(path: PathBuf) -> Result<Self> {
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(100)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()
            .wrap_err("failed to start CPU profiler")?;
        Ok(Self { guard, path })
    }
}

impl Drop for CpuProfile {
    fn drop(&mut self) {
        let report = match self.guard.report().build() {
            Ok(report) => report,
            Err(err) => {
                warn!("[Profile] failed to build CPU profile: {err}");
                return;
            }
        };
        match std::fs::File::create(&self.path) {
            Ok(file) => {
                if let Err(err) = report.flamegraph(file) {
                    warn!("[Profile] failed to write flamegraph: {err}");
                } else {
                    info!("[Profile] CPU profile written to {}", self.path.display());
                }
            }
            Err(err) => warn!("[Profile] failed to create {}: {err}", self.path.display()),
        }
    }
}

fn run_replay(args: ReplayArgs) -> Result<()> {
    check_range(&args.range)?;
    info!("[Replay] chain-id: {}", args.range.chain_id);

    let registry = InterpreterRegistry::with_builtins();
    let interpreter = registry.resolve(&args.interpreter).ok_or_else(|| {
        ReplayError::Argument(format!(
            "unknown interpreter {:?} (available: {})",
            args.interpreter,
            registry.names().join(", ")
        ))
    })?;

    let _profile = match args.cpu_profile.clone() {
        Some(path) => Some(CpuProfile::start(path)?),
        None => None,
    };

    let db = open_store(&args.range)?;
    let config = ReplayConfig {
        chain_id: args.range.chain_id,
        interpreter: args.interpreter.clone(),
        only_successful: args.only_successful,
        use_in_memory_state_db: args.fast_state_db,
        profile_calls: args.profiling_call,
        profile_opcodes: args.profiling_opcode,
    };

    let pool = TaskPool::new(
        "substate-replay replay",
        Box::new(move |block, tx, substate, vm_time| {
            replay_task(&config, interpreter.as_ref(), block, tx, substate, vm_time)
        }),
        args.range.first_block,
        args.range.last_block,
        db,
        TaskPoolConfig {
            workers: args.range.workers,
            skip_transfer_txs: args.skip_transfer_txs,
            skip_call_txs: args.skip_call_txs,
            skip_create_txs: args.skip_create_txs,
            ..TaskPoolConfig::default()
        },
    );

    let interrupt = pool.interrupt_handle();
    ctrlc::set_handler(move || interrupt.store(true, Ordering::SeqCst))
        .wrap_err("failed to register SIGINT handler")?;

    let result = pool.execute();
    info!("[Replay] net VM time: {:?}", pool.vm_duration());
    result.map_err(Into::into)
}

fn run_address_stats(args: RangeArgs) -> Result<()> {
    check_range(&args)?;
    info!("[AddressStats] chain-id: {}", args.chain_id);

    let db = open_store(&args)?;
    let counts: Arc<Mutex<HashMap<Address, u64>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = counts.clone();

    let pool = TaskPool::new(
        "substate-replay address-stats",
        Box::new(move |_block, _tx, substate, _vm_time| {
            let mut counts = sink.lock();
            for address in substate
                .input_alloc
                .addresses()
                .chain(substate.output_alloc.addresses())
            {
                *counts.entry(*address).or_default() += 1;
            }
            Ok(())
        }),
        args.first_block,
        args.last_block,
        db,
        TaskPoolConfig {
            workers: args.workers,
            ..TaskPoolConfig::default()
        },
    );
    pool.execute()?;

    let counts = counts.lock();
    let mut by_count: Vec<(&Address, &u64)> = counts.iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

    println!("address-stats: {} unique addresses", counts.len());
    for (address, count) in by_count.iter().take(25) {
        println!("address-stats: {address} accessed {count} times");
    }
    Ok(())
}

fn run_storage_flat(args: RangeArgs) -> Result<()> {
    check_range(&args)?;
    info!("[StorageFlat] chain-id: {}", args.chain_id);

    let db = open_store(&args)?;
    let pool = TaskPool::new(
        "substate-replay storage-flat",
        Box::new(|block, tx, substate, _vm_time| {
            let timestamp = substate.env.timestamp;
            let mut out = String::new();
            for (address, account) in substate.output_alloc.iter() {
                for (slot, value) in &account.storage {
                    out.push_str(&format!(
                        "metric: {block},{timestamp},{tx},{address},{slot},{value}\n"
                    ));
                }
            }
            // One contiguous write per task keeps workers from interleaving.
            print!("{out}");
            Ok(())
        }),
        args.first_block,
        args.last_block,
        db,
        TaskPoolConfig {
            workers: args.workers,
            ..TaskPoolConfig::default()
        },
    );
    pool.execute().map_err(Into::into)
}
