use std::fmt;
use std::str::FromStr;

use hex::{decode as hex_decode, encode as hex_encode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Errors from parsing fixed-size byte values out of hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Input is not valid hexadecimal.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    /// Decoded byte length does not match the expected size.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// Address is 20 bytes (an EVM account or contract address).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Address(b)
    }
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex_encode(self.0))
    }
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex_decode(s).map_err(|e| ParseError::InvalidHex(e.to_string()))?;
        if bytes.len() != 20 {
            return Err(ParseError::InvalidLength {
                expected: 20,
                got: bytes.len(),
            });
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Address(arr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_hex()).finish()
    }
}

impl FromStr for Address {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Address::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash is a 32-byte Keccak-256 digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn from_bytes(b: [u8; 32]) -> Self {
        Hash32(b)
    }
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex_encode(self.0))
    }
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex_decode(s).map_err(|e| ParseError::InvalidHex(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(ParseError::InvalidLength {
                expected: 32,
                got: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Hash32(arr))
    }

    /// Keccak-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&result);
        Hash32(out)
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash32").field(&self.to_hex()).finish()
    }
}

impl FromStr for Hash32 {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash32::from_hex(s)
    }
}

impl Serialize for Hash32 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D>(deserializer: D) -> Result<Hash32, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash32::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An advance-state request pulled from the on-chain inbox.
///
/// Encoded for the machine as `EvmAdvance(address, uint256, uint256,
/// uint256, bytes)` — see [`crate::abi::encode_advance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Account that submitted the input.
    pub sender: Address,
    /// Block in which the input was included.
    pub block_number: u64,
    /// Timestamp of that block (seconds).
    pub block_timestamp: u64,
    /// Position of the input in the application's inbox.
    pub index: u64,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

/// A read-only inspect-state request. Encoded as `EvmInspect(bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

/// A decoded machine output.
///
/// Raw emissions are opaque byte strings; the first four bytes select the
/// output kind. Vouchers and delegate-call vouchers participate in on-chain
/// execution proofs, notices carry data only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Output {
    Voucher {
        destination: Address,
        /// 256-bit wei value, big-endian.
        value: [u8; 32],
        payload: Vec<u8>,
    },
    DelegateCallVoucher {
        destination: Address,
        payload: Vec<u8>,
    },
    Notice {
        payload: Vec<u8>,
    },
}

/// Result of advancing the machine with one input.
///
/// `outputs` and `reports` preserve the machine's emission order.
/// `outputs_hash` is the Keccak Merkle root over the output hashes and
/// `machine_hash` is the machine's state root after the advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceResult {
    pub outputs: Vec<Vec<u8>>,
    pub reports: Vec<Vec<u8>>,
    pub outputs_hash: Hash32,
    pub machine_hash: Hash32,
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════
