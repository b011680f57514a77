//! # Rollup ABI Codec
//!
//! Solidity ABI encoding for the byte strings exchanged with the machine.
//! Requests are written into the machine's rx buffer before an advance or
//! inspect run, emissions are read back out of the tx buffer and decoded
//! here.
//!
//! ## Signatures
//!
//! | Direction | Signature                                             |
//! |-----------|-------------------------------------------------------|
//! | request   | `EvmAdvance(address,uint256,uint256,uint256,bytes)`   |
//! | request   | `EvmInspect(bytes)`                                   |
//! | emission  | `Voucher(address,uint256,bytes)`                      |
//! | emission  | `DelegateCallVoucher(address,bytes)`                  |
//! | emission  | `Notice(bytes)`                                       |
//!
//! Encodings follow the standard head/tail layout: a 4-byte selector, one
//! 32-byte head word per argument (dynamic arguments hold a byte offset to
//! their tail), then the tails. Decoding is strict: offsets must point at
//! the canonical position and buffers must carry no trailing bytes, so a
//! decoded value always re-encodes to the exact input.

use thiserror::Error;

use crate::types::{Address, Hash32, Input, Output, Query};

const WORD: usize = 32;

const ADVANCE_SIG: &str = "EvmAdvance(address,uint256,uint256,uint256,bytes)";
const INSPECT_SIG: &str = "EvmInspect(bytes)";
const VOUCHER_SIG: &str = "Voucher(address,uint256,bytes)";
const DELEGATE_CALL_VOUCHER_SIG: &str = "DelegateCallVoucher(address,bytes)";
const NOTICE_SIG: &str = "Notice(bytes)";

/// Errors from decoding ABI-encoded byte strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbiError {
    /// Buffer ends before the encoding does.
    #[error("abi buffer too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    /// Leading 4 bytes match none of the known signatures.
    #[error("unknown abi selector 0x{}", hex::encode(.0))]
    UnknownSelector([u8; 4]),
    /// Structurally invalid encoding (bad offset, trailing bytes, padding).
    #[error("malformed abi encoding: {0}")]
    Malformed(&'static str),
    /// An integer word carries a value outside the 64-bit range.
    #[error("abi integer does not fit in u64")]
    IntegerOverflow,
}

/// First 4 bytes of the Keccak-256 of a signature string.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Hash32::digest(signature.as_bytes());
    let mut sel = [0u8; 4];
    sel.copy_from_slice(&digest.as_bytes()[..4]);
    sel
}

// ════════════════════════════════════════════════════════════════════════════
// REQUESTS
// ════════════════════════════════════════════════════════════════════════════

/// Encodes an advance-state request for the machine's rx buffer.
pub fn encode_advance(input: &Input) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 6 * WORD + padded_len(input.payload.len()));
    out.extend_from_slice(&selector(ADVANCE_SIG));
    append_address(&mut out, &input.sender);
    append_u64(&mut out, input.block_number);
    append_u64(&mut out, input.block_timestamp);
    append_u64(&mut out, input.index);
    append_u64(&mut out, (5 * WORD) as u64);
    append_bytes_tail(&mut out, &input.payload);
    out
}

/// Decodes an advance-state request, the inverse of [`encode_advance`].
pub fn decode_advance(buf: &[u8]) -> Result<Input, AbiError> {
    let body = check_selector(buf, ADVANCE_SIG)?;
    Ok(Input {
        sender: word_address(body, 0)?,
        block_number: word_u64(body, 1)?,
        block_timestamp: word_u64(body, 2)?,
        index: word_u64(body, 3)?,
        payload: dynamic_bytes(body, 5, 4)?,
    })
}

/// Encodes an inspect-state request for the machine's rx buffer.
pub fn encode_inspect(query: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * WORD + padded_len(query.payload.len()));
    out.extend_from_slice(&selector(INSPECT_SIG));
    append_u64(&mut out, WORD as u64);
    append_bytes_tail(&mut out, &query.payload);
    out
}

/// Decodes an inspect-state request, the inverse of [`encode_inspect`].
pub fn decode_inspect(buf: &[u8]) -> Result<Query, AbiError> {
    let body = check_selector(buf, INSPECT_SIG)?;
    Ok(Query {
        payload: dynamic_bytes(body, 1, 0)?,
    })
}

// ════════════════════════════════════════════════════════════════════════════
// EMISSIONS
// ════════════════════════════════════════════════════════════════════════════

/// Encodes a voucher emission.
pub fn encode_voucher(destination: &Address, value: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 * WORD + padded_len(payload.len()));
    out.extend_from_slice(&selector(VOUCHER_SIG));
    append_address(&mut out, destination);
    out.extend_from_slice(value);
    append_u64(&mut out, (3 * WORD) as u64);
    append_bytes_tail(&mut out, payload);
    out
}

/// Encodes a delegate-call voucher emission.
pub fn encode_delegate_call_voucher(destination: &Address, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 3 * WORD + padded_len(payload.len()));
    out.extend_from_slice(&selector(DELEGATE_CALL_VOUCHER_SIG));
    append_address(&mut out, destination);
    append_u64(&mut out, (2 * WORD) as u64);
    append_bytes_tail(&mut out, payload);
    out
}

/// Encodes a notice emission.
pub fn encode_notice(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 2 * WORD + padded_len(payload.len()));
    out.extend_from_slice(&selector(NOTICE_SIG));
    append_u64(&mut out, WORD as u64);
    append_bytes_tail(&mut out, payload);
    out
}

/// Encodes any output variant.
pub fn encode_output(output: &Output) -> Vec<u8> {
    match output {
        Output::Voucher {
            destination,
            value,
            payload,
        } => encode_voucher(destination, value, payload),
        Output::DelegateCallVoucher {
            destination,
            payload,
        } => encode_delegate_call_voucher(destination, payload),
        Output::Notice { payload } => encode_notice(payload),
    }
}

/// Decodes a raw machine emission into its output variant, dispatching on
/// the selector.
pub fn decode_output(buf: &[u8]) -> Result<Output, AbiError> {
    if buf.len() < 4 {
        return Err(AbiError::TooShort {
            need: 4,
            have: buf.len(),
        });
    }
    let mut sel = [0u8; 4];
    sel.copy_from_slice(&buf[..4]);
    let body = &buf[4..];

    if sel == selector(VOUCHER_SIG) {
        Ok(Output::Voucher {
            destination: word_address(body, 0)?,
            value: word_u256(body, 1)?,
            payload: dynamic_bytes(body, 3, 2)?,
        })
    } else if sel == selector(DELEGATE_CALL_VOUCHER_SIG) {
        Ok(Output::DelegateCallVoucher {
            destination: word_address(body, 0)?,
            payload: dynamic_bytes(body, 2, 1)?,
        })
    } else if sel == selector(NOTICE_SIG) {
        Ok(Output::Notice {
            payload: dynamic_bytes(body, 1, 0)?,
        })
    } else {
        Err(AbiError::UnknownSelector(sel))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// WORD-LEVEL HELPERS
// ════════════════════════════════════════════════════════════════════════════

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

fn append_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&[0u8; 24]);
    out.extend_from_slice(&v.to_be_bytes());
}

fn append_address(out: &mut Vec<u8>, a: &Address) {
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(a.as_bytes());
}

fn append_bytes_tail(out: &mut Vec<u8>, data: &[u8]) {
    append_u64(out, data.len() as u64);
    out.extend_from_slice(data);
    let rem = data.len() % WORD;
    if rem != 0 {
        out.resize(out.len() + WORD - rem, 0);
    }
}

fn check_selector<'a>(buf: &'a [u8], sig: &str) -> Result<&'a [u8], AbiError> {
    if buf.len() < 4 {
        return Err(AbiError::TooShort {
            need: 4,
            have: buf.len(),
        });
    }
    if buf[..4] != selector(sig) {
        let mut got = [0u8; 4];
        got.copy_from_slice(&buf[..4]);
        return Err(AbiError::UnknownSelector(got));
    }
    Ok(&buf[4..])
}

fn word(body: &[u8], index: usize) -> Result<&[u8], AbiError> {
    let start = index * WORD;
    let end = start + WORD;
    if body.len() < end {
        return Err(AbiError::TooShort {
            need: end,
            have: body.len(),
        });
    }
    Ok(&body[start..end])
}

fn word_u64(body: &[u8], index: usize) -> Result<u64, AbiError> {
    let w = word(body, index)?;
    if w[..24].iter().any(|&b| b != 0) {
        return Err(AbiError::IntegerOverflow);
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&w[24..]);
    Ok(u64::from_be_bytes(be))
}

fn word_u256(body: &[u8], index: usize) -> Result<[u8; 32], AbiError> {
    let w = word(body, index)?;
    let mut v = [0u8; 32];
    v.copy_from_slice(w);
    Ok(v)
}

fn word_address(body: &[u8], index: usize) -> Result<Address, AbiError> {
    let w = word(body, index)?;
    if w[..12].iter().any(|&b| b != 0) {
        return Err(AbiError::Malformed("non-zero padding in address word"));
    }
    let mut a = [0u8; 20];
    a.copy_from_slice(&w[12..]);
    Ok(Address::from_bytes(a))
}

/// Reads the single dynamic `bytes` argument of an encoding whose head is
/// `head_words` long, enforcing the canonical offset and exact buffer length.
fn dynamic_bytes(body: &[u8], head_words: usize, offset_index: usize) -> Result<Vec<u8>, AbiError> {
    let offset = word_u64(body, offset_index)? as usize;
    if offset != head_words * WORD {
        return Err(AbiError::Malformed("dynamic offset does not point at tail"));
    }
    let len = word_u64(body, head_words)? as usize;
    let start = (head_words + 1) * WORD;
    let end = start.checked_add(len).ok_or(AbiError::IntegerOverflow)?;
    if body.len() < end {
        return Err(AbiError::TooShort {
            need: end,
            have: body.len(),
        });
    }
    if body.len() != start + padded_len(len) {
        return Err(AbiError::Malformed("dynamic tail length mismatch"));
    }
    Ok(body[start..end].to_vec())
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
