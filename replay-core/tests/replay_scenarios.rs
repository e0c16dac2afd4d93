//! End-to-end replay scenarios: handcrafted recordings re-executed through
//! the built-in interpreter, for both state-database variants.

use std::sync::{Arc, atomic::AtomicU64};

use alloy_primitives::{Address, B256, Bytes, Log, LogData, U256};
use replay_core::{
    interpreter::{InterpreterRegistry, baseline},
    pool::{TaskPool, TaskPoolConfig},
    replay::{EngineError, ReplayConfig, ReplayError, replay_task},
    store::SubstateDb,
    substate::{
        BlockEnv, Message, Receipt, ReceiptStatus, Substate, SubstateAccount, SubstateAlloc,
        logs_bloom,
    },
};

const BLOCK: u64 = 40_000_000;

fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

fn sender() -> Address {
    addr(0x0a)
}

fn coinbase() -> Address {
    addr(0xc0)
}

fn env() -> BlockEnv {
    BlockEnv {
        coinbase: coinbase(),
        number: BLOCK,
        timestamp: 1_650_000_000,
        difficulty: U256::from(1u64),
        gas_limit: 30_000_000,
        base_fee: None,
        block_hashes: Default::default(),
    }
}

fn account(nonce: u64, balance: u64) -> SubstateAccount {
    SubstateAccount::new(nonce, U256::from(balance), Bytes::new())
}

fn contract(balance: u64, code: &[u8]) -> SubstateAccount {
    SubstateAccount::new(0, U256::from(balance), Bytes::copy_from_slice(code))
}

fn success_receipt(gas_used: u64) -> Receipt {
    Receipt {
        status: ReceiptStatus::Success,
        gas_used,
        ..Receipt::default()
    }
}

/// Replays the recording with the default interpreter and the selected
/// state-database variant.
fn run(recording: &Substate, use_in_memory: bool) -> Result<(), ReplayError> {
    let registry = InterpreterRegistry::with_builtins();
    let interpreter = registry.resolve("").expect("default interpreter");
    let config = ReplayConfig {
        use_in_memory_state_db: use_in_memory,
        ..ReplayConfig::default()
    };
    let vm_time = AtomicU64::new(0);
    replay_task(
        &config,
        interpreter.as_ref(),
        recording.env.number,
        0,
        recording,
        &vm_time,
    )
}

/// A clean replay must hold for both variants (variant equivalence) and be
/// reproducible across runs (determinism).
fn assert_replays_clean(recording: &Substate) {
    for use_in_memory in [false, true] {
        run(recording, use_in_memory).unwrap();
        run(recording, use_in_memory).unwrap();
    }
}

/// Scenario: plain value transfer.
fn transfer_recording() -> Substate {
    let sender_start = 1_000_000u64;
    let value = 500u64;
    let gas_used = baseline::TX_GAS;

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));
    input_alloc.insert(addr(0x0b), account(0, 0));

    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - value - gas_used));
    output_alloc.insert(addr(0x0b), account(0, value));
    output_alloc.insert(coinbase(), account(0, gas_used));

    Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: Some(addr(0x0b)),
            nonce: 0,
            gas_limit: 21_000,
            gas_price: U256::from(1u64),
            value: U256::from(value),
            ..Message::default()
        },
        output_alloc,
        output_result: success_receipt(gas_used),
    }
}

#[test]
fn pure_transfer() {
    assert_replays_clean(&transfer_recording());
}

#[test]
fn contract_creation_with_trivial_init_code() {
    let sender_start = 1_000_000u64;
    // PUSH1 00, implicit stop: deploys empty code.
    let init_code: &[u8] = &[0x60, 0x00];
    // 53_000 create + one non-zero and one zero calldata byte + one PUSH.
    let gas_used = baseline::TX_GAS_CONTRACT_CREATION
        + baseline::TX_DATA_NONZERO_GAS
        + baseline::TX_DATA_ZERO_GAS
        + baseline::GAS_FASTEST_STEP;
    let created = sender().create(0);

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));

    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - gas_used));
    // EIP-161: the created account starts at nonce 1; STOP leaves no code.
    output_alloc.insert(created, account(1, 0));
    output_alloc.insert(coinbase(), account(0, gas_used));

    let recording = Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: None,
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            data: Bytes::copy_from_slice(init_code),
            ..Message::default()
        },
        output_alloc,
        output_result: Receipt {
            contract_address: Some(created),
            ..success_receipt(gas_used)
        },
    };

    assert_replays_clean(&recording);
}

#[test]
fn reverted_call_only_charges_gas() {
    let sender_start = 1_000_000u64;
    // PUSH1 00, PUSH1 00, REVERT
    let code: &[u8] = &[0x60, 0x00, 0x60, 0x00, 0xfd];
    let gas_used = baseline::TX_GAS + 2 * baseline::GAS_FASTEST_STEP;

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));
    input_alloc.insert(addr(0x0c), contract(0, code));

    // Only gas accounting survives: the callee's touches are rolled back,
    // so it is absent from the post-allocation.
    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - gas_used));
    output_alloc.insert(coinbase(), account(0, gas_used));

    let recording = Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: Some(addr(0x0c)),
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            ..Message::default()
        },
        output_alloc,
        output_result: Receipt {
            status: ReceiptStatus::Failed,
            gas_used,
            ..Receipt::default()
        },
    };

    assert_replays_clean(&recording);
}

#[test]
fn self_destruct_moves_the_balance() {
    let sender_start = 1_000_000u64;
    let destroyed_balance = 777u64;
    let heir_start = 100u64;
    let heir = addr(0x0d);

    // PUSH20 <heir>, SELFDESTRUCT
    let mut code = vec![0x73];
    code.extend_from_slice(heir.as_slice());
    code.push(0xff);
    let gas_used = baseline::TX_GAS + baseline::GAS_FASTEST_STEP + baseline::SELFDESTRUCT_GAS;

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));
    input_alloc.insert(addr(0x0c), contract(destroyed_balance, &code));
    input_alloc.insert(heir, account(0, heir_start));

    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - gas_used));
    output_alloc.insert(heir, account(0, heir_start + destroyed_balance));
    output_alloc.insert(coinbase(), account(0, gas_used));

    let recording = Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: Some(addr(0x0c)),
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            ..Message::default()
        },
        output_alloc,
        output_result: success_receipt(gas_used),
    };

    assert_replays_clean(&recording);
}

#[test]
fn missing_block_hash_is_an_engine_error_not_a_mismatch() {
    let requested = BLOCK - 10;
    // PUSH4 <requested>, BLOCKHASH, POP, STOP
    let mut code = vec![0x63];
    code.extend_from_slice(&(requested as u32).to_be_bytes());
    code.extend_from_slice(&[0x40, 0x50, 0x00]);

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, 1_000_000));
    input_alloc.insert(addr(0x0c), contract(0, &code));

    let recording = Substate {
        input_alloc,
        env: env(), // no block hashes recorded
        message: Message {
            from: sender(),
            to: Some(addr(0x0c)),
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            ..Message::default()
        },
        output_alloc: SubstateAlloc::new(),
        output_result: success_receipt(0),
    };

    for use_in_memory in [false, true] {
        let err = run(&recording, use_in_memory).unwrap_err();
        let ReplayError::Engine {
            source: EngineError::MissingBlockHash(number),
            ..
        } = &err
        else {
            panic!("expected missing block hash, got {err:?}");
        };
        assert_eq!(*number, requested);
        assert!(err.to_string().contains(&requested.to_string()), "{err}");
    }
}

#[test]
fn mutated_gas_usage_is_reported_as_a_mismatch() {
    let mut recording = transfer_recording();
    recording.output_result.gas_used += 1;

    let err = run(&recording, false).unwrap_err();
    let ReplayError::Mismatch { report, .. } = err else {
        panic!("expected mismatch, got {err:?}");
    };

    assert!(report.contains("Different gas usage:"), "{report}");
    assert!(
        report.contains(&format!("want: {}", baseline::TX_GAS + 1)),
        "{report}"
    );
    assert!(
        report.contains(&format!("have: {}", baseline::TX_GAS)),
        "{report}"
    );
}

#[test]
fn emitted_logs_keep_order_and_agree_with_the_bloom() {
    let sender_start = 1_000_000u64;
    // LOG1 topic 0x11 with empty data, then LOG0 with empty data:
    // PUSH1 topic, PUSH1 size, PUSH1 offset, LOG1,
    // PUSH1 size, PUSH1 offset, LOG0, STOP
    let code: &[u8] = &[
        0x60, 0x11, 0x60, 0x00, 0x60, 0x00, 0xa1, 0x60, 0x00, 0x60, 0x00, 0xa0, 0x00,
    ];
    let frame_gas = 5 * baseline::GAS_FASTEST_STEP
        + (baseline::LOG_GAS + baseline::LOG_TOPIC_GAS)
        + baseline::LOG_GAS;
    let gas_used = baseline::TX_GAS + frame_gas;

    let emitter = addr(0x0c);
    let mut topic = [0u8; 32];
    topic[31] = 0x11;
    let logs = vec![
        Log {
            address: emitter,
            data: LogData::new_unchecked(vec![B256::from(topic)], Bytes::new()),
        },
        Log {
            address: emitter,
            data: LogData::new_unchecked(vec![], Bytes::new()),
        },
    ];

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));
    input_alloc.insert(emitter, contract(0, code));

    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - gas_used));
    output_alloc.insert(emitter, contract(0, code));
    output_alloc.insert(coinbase(), account(0, gas_used));

    let recording = Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: Some(emitter),
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            ..Message::default()
        },
        output_alloc,
        output_result: Receipt {
            status: ReceiptStatus::Success,
            gas_used,
            bloom: logs_bloom(&logs),
            logs,
            contract_address: None,
        },
    };

    assert_replays_clean(&recording);
}

#[test]
fn storage_write_survives_into_the_post_allocation() {
    let sender_start = 1_000_000u64;
    let slot = {
        let mut slot = [0u8; 32];
        slot[31] = 0x01;
        B256::from(slot)
    };
    // PUSH1 02, PUSH1 01, SSTORE, STOP
    let code: &[u8] = &[0x60, 0x02, 0x60, 0x01, 0x55, 0x00];
    // Two pushes, a cold slot, and a non-zero to non-zero reset.
    let gas_used = baseline::TX_GAS
        + 2 * baseline::GAS_FASTEST_STEP
        + baseline::COLD_SLOAD_GAS
        + baseline::SSTORE_RESET_GAS;

    let target = addr(0x0c);
    let mut stored = contract(0, code);
    stored.storage.insert(slot, B256::with_last_byte(0x05));

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));
    input_alloc.insert(target, stored);

    let mut updated = contract(0, code);
    updated.storage.insert(slot, B256::with_last_byte(0x02));

    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - gas_used));
    output_alloc.insert(target, updated);
    output_alloc.insert(coinbase(), account(0, gas_used));

    let recording = Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: Some(target),
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            ..Message::default()
        },
        output_alloc,
        output_result: success_receipt(gas_used),
    };

    assert_replays_clean(&recording);
}

#[test]
fn storage_clear_earns_the_refund_and_drops_the_slot() {
    let sender_start = 1_000_000u64;
    let slot = B256::with_last_byte(0x01);
    // PUSH1 00, PUSH1 01, SSTORE, STOP
    let code: &[u8] = &[0x60, 0x00, 0x60, 0x01, 0x55, 0x00];
    let frame_gas = 2 * baseline::GAS_FASTEST_STEP
        + baseline::COLD_SLOAD_GAS
        + baseline::SSTORE_RESET_GAS;
    // London refund rules: the clear refund, capped at a fifth of usage.
    let gas_used = baseline::TX_GAS + frame_gas - baseline::SSTORE_CLEARS_REFUND_LONDON;

    let target = addr(0x0c);
    let mut stored = contract(0, code);
    stored.storage.insert(slot, B256::with_last_byte(0x05));

    let mut input_alloc = SubstateAlloc::new();
    input_alloc.insert(sender(), account(0, sender_start));
    input_alloc.insert(target, stored);

    // The cleared slot is gone from the post-allocation entirely.
    let mut output_alloc = SubstateAlloc::new();
    output_alloc.insert(sender(), account(1, sender_start - gas_used));
    output_alloc.insert(target, contract(0, code));
    output_alloc.insert(coinbase(), account(0, gas_used));

    let recording = Substate {
        input_alloc,
        env: env(),
        message: Message {
            from: sender(),
            to: Some(target),
            nonce: 0,
            gas_limit: 100_000,
            gas_price: U256::from(1u64),
            ..Message::default()
        },
        output_alloc,
        output_result: success_receipt(gas_used),
    };

    assert_replays_clean(&recording);
}

#[test]
fn full_pipeline_replays_a_recorded_range() {
    let dir = tempfile::tempdir().unwrap();
    let db = SubstateDb::open(dir.path().join("substates.redb")).unwrap();
    db.put_substate(BLOCK, 0, &transfer_recording()).unwrap();
    db.put_substate(BLOCK, 1, &transfer_recording()).unwrap();
    db.put_substate(BLOCK + 2, 0, &transfer_recording()).unwrap();
    let db = Arc::new(db);

    for workers in [1usize, 4] {
        let registry = InterpreterRegistry::with_builtins();
        let interpreter = registry.resolve("").unwrap();
        let config = ReplayConfig::default();

        let pool = TaskPool::new(
            "replay-test",
            Box::new(move |block, tx, substate, vm_time| {
                replay_task(&config, interpreter.as_ref(), block, tx, substate, vm_time)
            }),
            BLOCK,
            BLOCK + 2,
            db.clone(),
            TaskPoolConfig {
                workers,
                ..TaskPoolConfig::default()
            },
        );
        pool.execute().unwrap();
    }
}
