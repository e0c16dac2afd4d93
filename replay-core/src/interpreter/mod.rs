//! Execution-engine boundary.
//!
//! The replay engine drives an external interpreter through the
//! [`Interpreter`] trait: one call applies one recorded message against a
//! [`StateDb`] under the resolved chain rules. Implementations are selected
//! by name through the [`InterpreterRegistry`]; the crate ships a single
//! built-in, [`BaselineInterpreter`], which covers the small execution
//! subset its own test corpus needs. Production oracles register their own
//! engines.

use std::{collections::HashMap, sync::Arc};

use alloy_primitives::{Address, B256, U256};
use thiserror::Error;

use crate::{chain::ChainRules, state::StateDb, substate::Message};

pub mod baseline;

pub use baseline::BaselineInterpreter;

/// Block-level execution context assembled from the recorded environment.
pub struct BlockContext<'a> {
    pub coinbase: Address,
    pub number: u64,
    pub timestamp: u64,
    pub difficulty: U256,
    pub gas_limit: u64,
    /// Recorded verbatim; never enforced during replay.
    pub base_fee: Option<U256>,
    /// BLOCKHASH lookup. A missing entry is latched by the replay task and
    /// surfaced only after the message completes, so the callback itself
    /// always yields a hash.
    pub get_hash: &'a dyn Fn(u64) -> B256,
}

/// Transaction-level execution context.
pub struct TxContext {
    pub origin: Address,
    pub gas_price: U256,
}

/// Interpreter tuning knobs forwarded from the command line.
#[derive(Debug, Clone, Default)]
pub struct VmConfig {
    /// Interpreter name selected on the command line; resolved through the
    /// registry before the pool starts.
    pub interpreter: String,
    pub no_base_fee: bool,
    pub profile_calls: bool,
    pub profile_opcodes: bool,
}

/// Outcome of applying one message. A reverted or otherwise failed message
/// is a regular outcome with `failed` set; only engine-level faults are
/// reported as [`InterpreterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub gas_used: u64,
    pub failed: bool,
}

/// Engine-level execution faults. Any of these aborts the replay task; none
/// of them produces a receipt.
#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("nonce mismatch: address has {expected}, tx has {got}")]
    NonceMismatch { expected: u64, got: u64 },

    #[error("insufficient funds for gas * price + value: address {0}")]
    InsufficientFunds(Address),

    #[error("intrinsic gas too low: have {have}, want {want}")]
    IntrinsicGas { have: u64, want: u64 },

    #[error("gas limit reached in block gas pool")]
    GasPoolExhausted,

    #[error("unsupported opcode 0x{0:02x}")]
    UnsupportedOpcode(u8),
}

/// Remaining block gas, initialized from the recorded block gas limit.
#[derive(Debug, Clone, Copy)]
pub struct GasPool {
    gas: u64,
}

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self { gas }
    }

    pub fn gas(&self) -> u64 {
        self.gas
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.gas += amount;
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), InterpreterError> {
        if self.gas < amount {
            return Err(InterpreterError::GasPoolExhausted);
        }
        self.gas -= amount;
        Ok(())
    }
}

/// One external execution engine.
pub trait Interpreter: Send + Sync {
    /// Applies the recorded message to `state` and reports gas usage and
    /// failure status. State mutations flow exclusively through the
    /// [`StateDb`] contract.
    #[allow(clippy::too_many_arguments)]
    fn apply_message(
        &self,
        block: &BlockContext<'_>,
        tx: &TxContext,
        message: &Message,
        state: &mut dyn StateDb,
        rules: &ChainRules,
        gas_pool: &mut GasPool,
        config: &VmConfig,
    ) -> Result<ExecutionResult, InterpreterError>;
}

/// Name-keyed set of available interpreters.
pub struct InterpreterRegistry {
    entries: HashMap<String, Arc<dyn Interpreter>>,
    default_name: String,
}

impl InterpreterRegistry {
    /// An empty registry with no default.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            default_name: String::new(),
        }
    }

    /// The registry with the built-in interpreters registered; the baseline
    /// engine is the default selection.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("baseline", Arc::new(BaselineInterpreter));
        registry.default_name = "baseline".to_string();
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, interpreter: Arc<dyn Interpreter>) {
        self.entries.insert(name.into(), interpreter);
    }

    /// Looks an interpreter up by name; the empty string selects the
    /// default.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Interpreter>> {
        let name = if name.is_empty() {
            self.default_name.as_str()
        } else {
            name
        };
        self.entries.get(name).cloned()
    }

    /// Registered names, sorted, for diagnostics.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for InterpreterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_pool_accounting() {
        let mut pool = GasPool::new(100);
        pool.sub_gas(60).unwrap();
        assert_eq!(pool.gas(), 40);
        pool.add_gas(10);
        assert_eq!(pool.gas(), 50);
        assert!(matches!(
            pool.sub_gas(51),
            Err(InterpreterError::GasPoolExhausted)
        ));
    }

    #[test]
    fn registry_resolves_default_and_names() {
        let registry = InterpreterRegistry::with_builtins();
        assert!(registry.resolve("").is_some());
        assert!(registry.resolve("baseline").is_some());
        assert!(registry.resolve("no-such-engine").is_none());
        assert_eq!(registry.names(), vec!["baseline"]);
    }
}
