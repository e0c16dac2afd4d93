//! Built-in reference interpreter.
//!
//! A deliberately small message processor: gas purchase, intrinsic gas,
//! nonce and value handling, refund and fee settlement, and a bytecode loop
//! over the opcode subset the harness's own corpus exercises. Anything
//! outside that subset is refused with
//! [`InterpreterError::UnsupportedOpcode`] — an oracle must not guess.
//! EVM-defined failure modes (REVERT, out-of-gas, INVALID, stack underflow)
//! produce a failed outcome instead, never an error.

use alloy_primitives::{Address, B256, Bytes, Log, LogData, U256};

use crate::{
    chain::ChainRules,
    interpreter::{
        BlockContext, ExecutionResult, GasPool, Interpreter, InterpreterError, TxContext, VmConfig,
    },
    state::StateDb,
    substate::Message,
};

pub const TX_GAS: u64 = 21_000;
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NONZERO_GAS: u64 = 16;
pub const TX_ACCESS_LIST_ADDRESS_GAS: u64 = 2_400;
pub const TX_ACCESS_LIST_STORAGE_KEY_GAS: u64 = 1_900;

/// Per-byte cost of depositing created contract code.
pub const CREATE_DATA_GAS: u64 = 200;

pub const GAS_QUICK_STEP: u64 = 2;
pub const GAS_FASTEST_STEP: u64 = 3;
pub const BLOCKHASH_GAS: u64 = 20;
pub const WARM_STORAGE_READ_GAS: u64 = 100;
pub const COLD_SLOAD_GAS: u64 = 2_100;
pub const SLOAD_GAS_PRE_BERLIN: u64 = 800;
pub const SSTORE_SET_GAS: u64 = 20_000;
pub const SSTORE_RESET_GAS: u64 = 5_000;
pub const SSTORE_CLEARS_REFUND: u64 = 15_000;
pub const SSTORE_CLEARS_REFUND_LONDON: u64 = 4_800;
pub const LOG_GAS: u64 = 375;
pub const LOG_TOPIC_GAS: u64 = 375;
pub const LOG_DATA_GAS: u64 = 8;
pub const SELFDESTRUCT_GAS: u64 = 5_000;
pub const MEMORY_WORD_GAS: u64 = 3;

/// Hard cap on addressable VM memory; anything beyond fails the frame.
const MAX_MEMORY: usize = 1 << 24;

/// The built-in reference interpreter.
pub struct BaselineInterpreter;

impl Interpreter for BaselineInterpreter {
    fn apply_message(
        &self,
        block: &BlockContext<'_>,
        tx: &TxContext,
        message: &Message,
        state: &mut dyn StateDb,
        rules: &ChainRules,
        gas_pool: &mut GasPool,
        _config: &VmConfig,
    ) -> Result<ExecutionResult, InterpreterError> {
        let sender = message.from;

        let state_nonce = state.get_nonce(sender);
        if state_nonce != message.nonce {
            return Err(InterpreterError::NonceMismatch {
                expected: state_nonce,
                got: message.nonce,
            });
        }

        // Buy gas from the block pool and the sender balance.
        let gas_cost = U256::from(message.gas_limit) * message.gas_price;
        if state.get_balance(sender) < gas_cost + message.value {
            return Err(InterpreterError::InsufficientFunds(sender));
        }
        gas_pool.sub_gas(message.gas_limit)?;
        state.sub_balance(sender, gas_cost);

        let intrinsic = intrinsic_gas(message, rules, block.number);
        if message.gas_limit < intrinsic {
            return Err(InterpreterError::IntrinsicGas {
                have: message.gas_limit,
                want: intrinsic,
            });
        }
        let gas = message.gas_limit - intrinsic;

        state.set_nonce(sender, state_nonce + 1);

        if rules.is_berlin(block.number) {
            state.add_address_to_access_list(sender);
            if let Some(to) = message.to {
                state.add_address_to_access_list(to);
            }
            for item in &message.access_list {
                state.add_address_to_access_list(item.address);
                for key in &item.storage_keys {
                    state.add_slot_to_access_list(item.address, *key);
                }
            }
        }

        let frame = match message.to {
            Some(to) => execute_call(state, block, rules, sender, to, message.value, gas)?,
            None => execute_create(state, block, rules, sender, message, gas)?,
        };

        // Gas refund, capped relative to consumption.
        let quotient = if rules.is_london(block.number) { 5 } else { 2 };
        let refund = state
            .get_refund()
            .min((message.gas_limit - frame.gas_left) / quotient);
        let gas_left = frame.gas_left + refund;
        let gas_used = message.gas_limit - gas_left;

        // Return unused gas to the sender, pay the fee to the coinbase.
        state.add_balance(sender, U256::from(gas_left) * message.gas_price);
        state.add_balance(block.coinbase, U256::from(gas_used) * tx.gas_price);
        gas_pool.add_gas(gas_left);

        Ok(ExecutionResult {
            gas_used,
            failed: frame.failed,
        })
    }
}

fn intrinsic_gas(message: &Message, rules: &ChainRules, block_number: u64) -> u64 {
    let mut gas = if message.to.is_none() {
        TX_GAS_CONTRACT_CREATION
    } else {
        TX_GAS
    };
    for byte in message.data.iter() {
        gas += if *byte == 0 {
            TX_DATA_ZERO_GAS
        } else {
            TX_DATA_NONZERO_GAS
        };
    }
    if rules.is_berlin(block_number) {
        for item in &message.access_list {
            gas += TX_ACCESS_LIST_ADDRESS_GAS;
            gas += TX_ACCESS_LIST_STORAGE_KEY_GAS * item.storage_keys.len() as u64;
        }
    }
    gas
}

/// Outcome of one execution frame.
struct Frame {
    gas_left: u64,
    output: Bytes,
    failed: bool,
}

fn execute_call(
    state: &mut dyn StateDb,
    block: &BlockContext<'_>,
    rules: &ChainRules,
    caller: Address,
    to: Address,
    value: U256,
    gas: u64,
) -> Result<Frame, InterpreterError> {
    let snapshot = state.snapshot();
    state.sub_balance(caller, value);
    state.add_balance(to, value);

    let code = state.get_code(to);
    if code.is_empty() {
        return Ok(Frame {
            gas_left: gas,
            output: Bytes::new(),
            failed: false,
        });
    }

    let mut vm = Vm::new(state, block, rules, to, caller, gas);
    let frame = vm.run(&code)?;
    if frame.failed {
        state.revert_to_snapshot(snapshot);
    }
    Ok(frame)
}

fn execute_create(
    state: &mut dyn StateDb,
    block: &BlockContext<'_>,
    rules: &ChainRules,
    caller: Address,
    message: &Message,
    gas: u64,
) -> Result<Frame, InterpreterError> {
    let contract = caller.create(message.nonce);
    let snapshot = state.snapshot();

    state.create_account(contract);
    if rules.is_eip158(block.number) {
        state.set_nonce(contract, 1);
    }
    state.sub_balance(caller, message.value);
    state.add_balance(contract, message.value);

    let mut vm = Vm::new(state, block, rules, contract, caller, gas);
    let mut frame = vm.run(&message.data)?;

    if !frame.failed {
        let deposit = frame.output.len() as u64 * CREATE_DATA_GAS;
        if frame.gas_left < deposit {
            frame = Frame {
                gas_left: 0,
                output: Bytes::new(),
                failed: true,
            };
        } else {
            frame.gas_left -= deposit;
            state.set_code(contract, frame.output.clone());
        }
    }
    if frame.failed {
        state.revert_to_snapshot(snapshot);
    }
    Ok(frame)
}

/// Minimal stack machine over the supported opcode subset.
struct Vm<'a, 'b> {
    state: &'a mut dyn StateDb,
    block: &'a BlockContext<'b>,
    rules: &'a ChainRules,
    address: Address,
    caller: Address,
    stack: Vec<U256>,
    memory: Vec<u8>,
    gas: u64,
}

impl<'a, 'b> Vm<'a, 'b> {
    fn new(
        state: &'a mut dyn StateDb,
        block: &'a BlockContext<'b>,
        rules: &'a ChainRules,
        address: Address,
        caller: Address,
        gas: u64,
    ) -> Self {
        Self {
            state,
            block,
            rules,
            address,
            caller,
            stack: Vec::new(),
            memory: Vec::new(),
            gas,
        }
    }

    /// Charges gas; on exhaustion the frame fails consuming everything.
    fn charge(&mut self, cost: u64) -> bool {
        if self.gas < cost {
            self.gas = 0;
            return false;
        }
        self.gas -= cost;
        true
    }

    fn fail(&mut self) -> Frame {
        self.gas = 0;
        Frame {
            gas_left: 0,
            output: Bytes::new(),
            failed: true,
        }
    }

    /// Grows memory to cover `[offset, offset + size)`, charging per new
    /// 32-byte word. Returns false on out-of-gas or out-of-range access.
    fn expand(&mut self, offset: usize, size: usize) -> bool {
        if size == 0 {
            return true;
        }
        let Some(end) = offset.checked_add(size) else {
            return false;
        };
        if end > MAX_MEMORY {
            return false;
        }
        let current_words = self.memory.len().div_ceil(32);
        let needed_words = end.div_ceil(32);
        if needed_words > current_words {
            let cost = (needed_words - current_words) as u64 * MEMORY_WORD_GAS;
            if !self.charge(cost) {
                return false;
            }
            self.memory.resize(needed_words * 32, 0);
        }
        true
    }

    fn run(&mut self, code: &[u8]) -> Result<Frame, InterpreterError> {
        let mut pc = 0usize;
        loop {
            // Running off the end of the code is an implicit STOP.
            let Some(&op) = code.get(pc) else {
                return Ok(self.halt(Bytes::new(), false));
            };

            match op {
                // STOP
                0x00 => return Ok(self.halt(Bytes::new(), false)),

                // ADD
                0x01 => {
                    if !self.charge(GAS_FASTEST_STEP) {
                        return Ok(self.fail());
                    }
                    let (Some(a), Some(b)) = (self.stack.pop(), self.stack.pop()) else {
                        return Ok(self.fail());
                    };
                    self.stack.push(a.wrapping_add(b));
                }

                // CALLER
                0x33 => {
                    if !self.charge(GAS_QUICK_STEP) {
                        return Ok(self.fail());
                    }
                    self.stack.push(U256::from_be_bytes(self.caller.into_word().0));
                }

                // BLOCKHASH
                0x40 => {
                    if !self.charge(BLOCKHASH_GAS) {
                        return Ok(self.fail());
                    }
                    let Some(requested) = self.stack.pop() else {
                        return Ok(self.fail());
                    };
                    let hash = self.block_hash(requested);
                    self.stack.push(U256::from_be_bytes(hash.0));
                }

                // POP
                0x50 => {
                    if !self.charge(GAS_QUICK_STEP) {
                        return Ok(self.fail());
                    }
                    if self.stack.pop().is_none() {
                        return Ok(self.fail());
                    }
                }

                // MLOAD
                0x51 => {
                    if !self.charge(GAS_FASTEST_STEP) {
                        return Ok(self.fail());
                    }
                    let Some(offset) = self.pop_usize() else {
                        return Ok(self.fail());
                    };
                    if !self.expand(offset, 32) {
                        return Ok(self.fail());
                    }
                    let mut word = [0u8; 32];
                    word.copy_from_slice(&self.memory[offset..offset + 32]);
                    self.stack.push(U256::from_be_bytes(word));
                }

                // MSTORE
                0x52 => {
                    if !self.charge(GAS_FASTEST_STEP) {
                        return Ok(self.fail());
                    }
                    let Some(offset) = self.pop_usize() else {
                        return Ok(self.fail());
                    };
                    let Some(value) = self.stack.pop() else {
                        return Ok(self.fail());
                    };
                    if !self.expand(offset, 32) {
                        return Ok(self.fail());
                    }
                    self.memory[offset..offset + 32].copy_from_slice(&value.to_be_bytes::<32>());
                }

                // SLOAD
                0x54 => {
                    let Some(raw_key) = self.stack.pop() else {
                        return Ok(self.fail());
                    };
                    let key = B256::from(raw_key);
                    let cost = if self.rules.is_berlin(self.block.number) {
                        let (_, warm) = self.state.slot_in_access_list(self.address, key);
                        if warm {
                            WARM_STORAGE_READ_GAS
                        } else {
                            self.state.add_slot_to_access_list(self.address, key);
                            COLD_SLOAD_GAS
                        }
                    } else {
                        SLOAD_GAS_PRE_BERLIN
                    };
                    if !self.charge(cost) {
                        return Ok(self.fail());
                    }
                    let value = self.state.get_storage(self.address, key);
                    self.stack.push(U256::from_be_bytes(value.0));
                }

                // SSTORE
                0x55 => {
                    let (Some(raw_key), Some(raw_value)) = (self.stack.pop(), self.stack.pop())
                    else {
                        return Ok(self.fail());
                    };
                    let key = B256::from(raw_key);
                    let new = B256::from(raw_value);

                    let berlin = self.rules.is_berlin(self.block.number);
                    if berlin {
                        let (_, warm) = self.state.slot_in_access_list(self.address, key);
                        if !warm {
                            if !self.charge(COLD_SLOAD_GAS) {
                                return Ok(self.fail());
                            }
                            self.state.add_slot_to_access_list(self.address, key);
                        }
                    }

                    let current = self.state.get_storage(self.address, key);
                    let cost = if new == current {
                        if berlin {
                            WARM_STORAGE_READ_GAS
                        } else {
                            SLOAD_GAS_PRE_BERLIN
                        }
                    } else if current.is_zero() {
                        SSTORE_SET_GAS
                    } else {
                        SSTORE_RESET_GAS
                    };
                    if !self.charge(cost) {
                        return Ok(self.fail());
                    }

                    if !current.is_zero() && new.is_zero() {
                        let clears = if self.rules.is_london(self.block.number) {
                            SSTORE_CLEARS_REFUND_LONDON
                        } else {
                            SSTORE_CLEARS_REFUND
                        };
                        self.state.add_refund(clears);
                    }
                    self.state.set_storage(self.address, key, new);
                }

                // PUSH1..PUSH32
                0x60..=0x7f => {
                    if !self.charge(GAS_FASTEST_STEP) {
                        return Ok(self.fail());
                    }
                    let n = (op - 0x5f) as usize;
                    let start = (pc + 1).min(code.len());
                    let end = (pc + 1 + n).min(code.len());
                    let slice = &code[start..end];
                    let mut word = [0u8; 32];
                    word[32 - n..32 - n + slice.len()].copy_from_slice(slice);
                    self.stack.push(U256::from_be_bytes(word));
                    pc += 1 + n;
                    continue;
                }

                // DUP1
                0x80 => {
                    if !self.charge(GAS_FASTEST_STEP) {
                        return Ok(self.fail());
                    }
                    let Some(top) = self.stack.last().copied() else {
                        return Ok(self.fail());
                    };
                    self.stack.push(top);
                }

                // LOG0..LOG2
                op @ 0xa0..=0xa2 => {
                    let topic_count = (op - 0xa0) as usize;
                    let (Some(offset), Some(size)) = (self.pop_usize(), self.pop_usize()) else {
                        return Ok(self.fail());
                    };
                    let mut topics = Vec::with_capacity(topic_count);
                    for _ in 0..topic_count {
                        let Some(topic) = self.stack.pop() else {
                            return Ok(self.fail());
                        };
                        topics.push(B256::from(topic));
                    }
                    if !self.expand(offset, size) {
                        return Ok(self.fail());
                    }
                    let cost = LOG_GAS
                        + LOG_TOPIC_GAS * topic_count as u64
                        + LOG_DATA_GAS * size as u64;
                    if !self.charge(cost) {
                        return Ok(self.fail());
                    }
                    let data = if size == 0 {
                        Bytes::new()
                    } else {
                        Bytes::copy_from_slice(&self.memory[offset..offset + size])
                    };
                    self.state.add_log(Log {
                        address: self.address,
                        data: LogData::new_unchecked(topics, data),
                    });
                }

                // RETURN
                0xf3 => {
                    let (Some(offset), Some(size)) = (self.pop_usize(), self.pop_usize()) else {
                        return Ok(self.fail());
                    };
                    if !self.expand(offset, size) {
                        return Ok(self.fail());
                    }
                    let output = if size == 0 {
                        Bytes::new()
                    } else {
                        Bytes::copy_from_slice(&self.memory[offset..offset + size])
                    };
                    return Ok(self.halt(output, false));
                }

                // REVERT
                0xfd => {
                    let (Some(offset), Some(size)) = (self.pop_usize(), self.pop_usize()) else {
                        return Ok(self.fail());
                    };
                    if !self.expand(offset, size) {
                        return Ok(self.fail());
                    }
                    let output = if size == 0 {
                        Bytes::new()
                    } else {
                        Bytes::copy_from_slice(&self.memory[offset..offset + size])
                    };
                    return Ok(self.halt(output, true));
                }

                // INVALID consumes everything.
                0xfe => return Ok(self.fail()),

                // SELFDESTRUCT
                0xff => {
                    if !self.charge(SELFDESTRUCT_GAS) {
                        return Ok(self.fail());
                    }
                    let Some(raw) = self.stack.pop() else {
                        return Ok(self.fail());
                    };
                    let beneficiary = Address::from_word(B256::from(raw));
                    let balance = self.state.get_balance(self.address);
                    self.state.add_balance(beneficiary, balance);
                    self.state.suicide(self.address);
                    return Ok(self.halt(Bytes::new(), false));
                }

                other => return Err(InterpreterError::UnsupportedOpcode(other)),
            }
            pc += 1;
        }
    }

    fn halt(&mut self, output: Bytes, reverted: bool) -> Frame {
        Frame {
            gas_left: self.gas,
            output,
            failed: reverted,
        }
    }

    fn pop_usize(&mut self) -> Option<usize> {
        self.stack.pop().and_then(|v| usize::try_from(v).ok())
    }

    fn block_hash(&self, requested: U256) -> B256 {
        let Ok(number) = u64::try_from(requested) else {
            return B256::ZERO;
        };
        let current = self.block.number;
        let lower = current.saturating_sub(256);
        if number >= lower && number < current {
            (self.block.get_hash)(number)
        } else {
            B256::ZERO
        }
    }
}
