//! Structured comparison reports for receipts and allocations.
//!
//! The exact framing is load-bearing: downstream tooling greps for the
//! `Different <label>:` / `want:` / `have:` / `missing key=` / `extra key=`
//! lines. Report builders are pure writers into a caller-provided string;
//! the task pool prints a finished report as one contiguous write so that
//! reports from different workers never interleave.

use std::fmt::Display;

use alloy_primitives::Log;

use crate::substate::{Receipt, SubstateAccount, SubstateAlloc};

/// Writes a `want`/`have` block when the two values differ. Returns true if
/// they do.
fn diff_scalar<T: PartialEq + Display>(out: &mut String, label: &str, want: T, have: T) -> bool {
    if want != have {
        out.push_str(&format!(
            "  Different {label}:\n    want: {want}\n    have: {have}\n"
        ));
        return true;
    }
    false
}

/// Field-by-field receipt comparison in the fixed order: status, contract
/// address, gas usage, bloom, log count, then per-log details.
pub fn write_result_diff(out: &mut String, want: &Receipt, have: &Receipt) {
    diff_scalar(out, "status", want.status, have.status);
    diff_scalar(
        out,
        "contract address",
        want.contract_address.unwrap_or_default(),
        have.contract_address.unwrap_or_default(),
    );
    diff_scalar(out, "gas usage", want.gas_used, have.gas_used);
    diff_scalar(out, "log bloom filter", want.bloom, have.bloom);
    if !diff_scalar(out, "log size", want.logs.len(), have.logs.len()) {
        for (i, (want_log, have_log)) in want.logs.iter().zip(have.logs.iter()).enumerate() {
            write_log_diff(out, &format!("log[{i}]"), want_log, have_log);
        }
    }
}

fn write_log_diff(out: &mut String, label: &str, want: &Log, have: &Log) {
    diff_scalar(out, &format!("{label}.address"), want.address, have.address);
    if !diff_scalar(
        out,
        &format!("{label}.Topics size"),
        want.data.topics().len(),
        have.data.topics().len(),
    ) {
        for (i, (want_topic, have_topic)) in want
            .data
            .topics()
            .iter()
            .zip(have.data.topics().iter())
            .enumerate()
        {
            diff_scalar(out, &format!("{label}.Topics[{i}]"), want_topic, have_topic);
        }
    }
    diff_scalar(out, &format!("{label}.data"), &want.data.data, &have.data.data);
}

/// Allocation comparison: size, missing and extra addresses, then a
/// field-by-field account report for every common address.
pub fn write_alloc_diff(out: &mut String, want: &SubstateAlloc, have: &SubstateAlloc) {
    diff_scalar(out, "substate alloc size", want.len(), have.len());

    for key in want.addresses() {
        if !have.contains(key) {
            out.push_str(&format!("    missing key={key}\n"));
        }
    }

    for key in have.addresses() {
        if !want.contains(key) {
            out.push_str(&format!("    extra key={key}\n"));
        }
    }

    for (key, is) in have.iter() {
        if let Some(should) = want.get(key) {
            write_account_diff(out, &format!("key={key}:"), should, is);
        }
    }
}

fn write_account_diff(
    out: &mut String,
    label: &str,
    want: &SubstateAccount,
    have: &SubstateAccount,
) {
    diff_scalar(out, &format!("{label}.Nonce"), want.nonce, have.nonce);
    diff_scalar(out, &format!("{label}.Balance"), want.balance, have.balance);
    diff_scalar(out, &format!("{label}.Code"), &want.code, &have.code);

    diff_scalar(
        out,
        &format!("len({label}.Storage)"),
        want.storage.len(),
        have.storage.len(),
    );
    for key in want.storage.keys() {
        if !have.storage.contains_key(key) {
            out.push_str(&format!("    {label}.Storage misses key {key}\n"));
        }
    }
    for key in have.storage.keys() {
        if !want.storage.contains_key(key) {
            out.push_str(&format!("    {label}.Storage has extra key {key}\n"));
        }
    }
    for (key, is) in &have.storage {
        if let Some(should) = want.storage.get(key) {
            diff_scalar(out, &format!("{label}.Storage[{key}]"), should, is);
        }
    }
}
