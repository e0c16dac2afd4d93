//! The replay task: one recorded substate re-executed and verified.
//!
//! A task builds a fresh state database from the recorded input allocation,
//! drives the selected interpreter through the recorded message under the
//! resolved chain rules, derives the resulting receipt and post-allocation,
//! and compares both against the recording. Tasks are purely functional:
//! they share nothing but the substate store handle and the atomic VM-time
//! counter.

use std::{
    cell::Cell,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use alloy_primitives::B256;
use thiserror::Error;

use crate::{
    chain, diff,
    interpreter::{BlockContext, GasPool, Interpreter, InterpreterError, TxContext, VmConfig},
    state::{InMemoryStateDb, OffTheChainStateDb, StateDb},
    store::StoreError,
    substate::{Receipt, ReceiptStatus, Substate, logs_bloom},
};

/// Synthetic block hash handed to `prepare`. Comparison is structural, so
/// no real hash is ever needed; the sentinel is fixed because emitted logs
/// are inspected by tests.
pub const SENTINEL_BLOCK_HASH: B256 = B256::repeat_byte(0x01);

/// Synthetic transaction hash handed to `prepare`.
pub const SENTINEL_TX_HASH: B256 = B256::repeat_byte(0x02);

/// Per-run replay settings, assembled from the command line.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub chain_id: u64,
    /// Interpreter name; resolved through the registry before the pool
    /// starts.
    pub interpreter: String,
    /// Skip transactions whose recorded receipt is failed.
    pub only_successful: bool,
    /// Select the in-memory state database instead of the read-through one.
    pub use_in_memory_state_db: bool,
    pub profile_calls: bool,
    pub profile_opcodes: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            chain_id: chain::OPERA_CHAIN_ID,
            interpreter: String::new(),
            only_successful: false,
            use_in_memory_state_db: false,
            profile_calls: false,
            profile_opcodes: false,
        }
    }
}

/// Faults of the replay machinery itself. The state is undefined when one
/// of these surfaces, so no diff is produced.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("getHash({0}) invoked, blockhash for that block not provided")]
    MissingBlockHash(u64),

    #[error("message carries an access list before the Berlin fork (block {0})")]
    PreBerlinAccessList(u64),

    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
}

/// Replay failure kinds. Every kind permits the next task; the pool latches
/// the first one and drains.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("block {block} tx {tx}: {source}")]
    Engine {
        block: u64,
        tx: u32,
        #[source]
        source: EngineError,
    },

    #[error("block {block} tx {tx}: inconsistent output")]
    Mismatch {
        block: u64,
        tx: u32,
        /// Finished diff report; printed by the pool as one contiguous
        /// write.
        report: String,
    },

    #[error("interrupted, dispatch stopped")]
    Cancelled,
}

impl ReplayError {
    /// Process exit code the binary maps this error to.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReplayError::Argument(_) => 1,
            ReplayError::Mismatch { .. } => 2,
            ReplayError::Store(_) | ReplayError::Engine { .. } | ReplayError::Cancelled => 3,
        }
    }
}

fn engine(block: u64, tx: u32, source: EngineError) -> ReplayError {
    ReplayError::Engine { block, tx, source }
}

/// Replays one recorded substate and verifies the produced receipt and
/// post-allocation against the recording.
pub fn replay_task(
    config: &ReplayConfig,
    interpreter: &dyn Interpreter,
    block: u64,
    tx: u32,
    recording: &Substate,
    vm_duration_nanos: &AtomicU64,
) -> Result<(), ReplayError> {
    // If requested, skip transactions that failed when recorded.
    if config.only_successful && recording.output_result.status != ReceiptStatus::Success {
        return Ok(());
    }

    let rules = chain::resolve(config.chain_id);
    let env = &recording.env;
    let message = &recording.message;

    // The corpus is not assumed to contain pre-Berlin access-list
    // transactions; refusing beats misreading their semantics.
    if !rules.is_berlin(env.number) && !message.access_list.is_empty() {
        return Err(engine(block, tx, EngineError::PreBerlinAccessList(env.number)));
    }

    let mut statedb: Box<dyn StateDb> = if config.use_in_memory_state_db {
        Box::new(InMemoryStateDb::new(&recording.input_alloc))
    } else {
        Box::new(OffTheChainStateDb::new(recording.input_alloc.clone()))
    };
    statedb.prepare(SENTINEL_TX_HASH, tx);

    // A missing block hash is latched and surfaced only after the message
    // completes, keeping the state machine consistent.
    let missing_hash = Cell::new(None::<u64>);
    let get_hash = |number: u64| -> B256 {
        match env.block_hashes.get(&number) {
            Some(hash) => *hash,
            None => {
                if missing_hash.get().is_none() {
                    missing_hash.set(Some(number));
                }
                B256::ZERO
            }
        }
    };

    let block_ctx = BlockContext {
        coinbase: env.coinbase,
        number: env.number,
        timestamp: env.timestamp,
        difficulty: env.difficulty,
        gas_limit: env.gas_limit,
        base_fee: env.base_fee,
        get_hash: &get_hash,
    };
    let tx_ctx = TxContext {
        origin: message.from,
        gas_price: message.gas_price,
    };
    let vm_config = VmConfig {
        interpreter: config.interpreter.clone(),
        no_base_fee: rules.no_base_fee,
        profile_calls: config.profile_calls,
        profile_opcodes: config.profile_opcodes,
    };

    let mut gas_pool = GasPool::new(env.gas_limit);
    let snapshot = statedb.snapshot();

    let started = Instant::now();
    let executed = interpreter.apply_message(
        &block_ctx,
        &tx_ctx,
        message,
        statedb.as_mut(),
        &rules,
        &mut gas_pool,
        &vm_config,
    );
    vm_duration_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

    let executed = match executed {
        Ok(result) => result,
        Err(err) => {
            statedb.revert_to_snapshot(snapshot);
            return Err(engine(block, tx, err.into()));
        }
    };

    if let Some(number) = missing_hash.get() {
        return Err(engine(block, tx, EngineError::MissingBlockHash(number)));
    }

    if rules.is_byzantium(env.number) {
        statedb.finalise(true);
    } else {
        statedb.intermediate_root(rules.is_eip158(env.number));
    }

    let logs = statedb.get_logs(SENTINEL_TX_HASH, SENTINEL_BLOCK_HASH);
    let receipt = Receipt {
        status: if executed.failed {
            ReceiptStatus::Failed
        } else {
            ReceiptStatus::Success
        },
        gas_used: executed.gas_used,
        bloom: logs_bloom(&logs),
        contract_address: message
            .to
            .is_none()
            .then(|| message.from.create(message.nonce)),
        logs,
    };

    let evm_alloc = statedb.get_substate_post_alloc();

    let result_matches = recording.output_result == receipt;
    let alloc_matches = recording.output_alloc == evm_alloc;
    if result_matches && alloc_matches {
        return Ok(());
    }

    let mut report = String::new();
    report.push_str(&format!("block: {block} Transaction: {tx}\n"));
    if !result_matches {
        report.push_str("inconsistent output: result\n");
        diff::write_result_diff(&mut report, &recording.output_result, &receipt);
    }
    if !alloc_matches {
        report.push_str("inconsistent output: alloc\n");
        diff::write_alloc_diff(&mut report, &recording.output_alloc, &evm_alloc);
    }
    Err(ReplayError::Mismatch { block, tx, report })
}
