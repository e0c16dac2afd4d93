//! Substate Replay Core
//!
//! This library re-executes recorded transaction substates against a fresh,
//! minimal state image and verifies that the produced receipt and
//! post-state match the recording bit for bit. It is the oracle used to
//! qualify alternate interpreter implementations and state-database
//! backends against a known-good ledger.
//!
//! ## Modules
//!
//! - [`substate`]: the record data model and its binary codec
//! - [`store`]: the redb-backed substate database and its range cursor
//! - [`state`]: the state-database contract and its two implementations
//! - [`chain`]: protocol-rules resolution (fork schedule as data)
//! - [`interpreter`]: the execution-engine boundary and built-in baseline
//! - [`replay`]: the per-transaction replay task and error kinds
//! - [`diff`]: structured receipt/allocation comparison reports
//! - [`pool`]: the parallel block-range task pool
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replay_core::{
//!     interpreter::InterpreterRegistry,
//!     pool::{TaskPool, TaskPoolConfig},
//!     replay::{ReplayConfig, replay_task},
//!     store::SubstateDb,
//! };
//!
//! let db = Arc::new(SubstateDb::open_read_only("substate/substates.redb")?);
//! let registry = InterpreterRegistry::with_builtins();
//! let interpreter = registry.resolve("").expect("default interpreter");
//! let config = ReplayConfig::default();
//!
//! let pool = TaskPool::new(
//!     "replay",
//!     Box::new(move |block, tx, substate, vm_time| {
//!         replay_task(&config, interpreter.as_ref(), block, tx, substate, vm_time)
//!     }),
//!     46_000_000,
//!     46_100_000,
//!     db,
//!     TaskPoolConfig::default(),
//! );
//! pool.execute()?;
//! # Ok::<(), replay_core::replay::ReplayError>(())
//! ```

pub mod chain;
pub mod diff;
pub mod interpreter;
pub mod pool;
pub mod replay;
pub mod state;
pub mod store;
pub mod substate;

pub use replay::{ReplayConfig, ReplayError, replay_task};
pub use store::SubstateDb;
pub use substate::Substate;
