//! # HTIF Register Layout
//!
//! The host-target interface is a pair of memory-mapped registers. The
//! driver writes `fromhost` to inject a request and reads `tohost` to learn
//! why the machine yielded and how long its emission is.
//!
//! ```text
//! fromhost   [63:32] request kind (0 = advance, 1 = inspect)
//!            [31:0]  request payload length
//! tohost     [63:32] yield reason
//!            [31:0]  emission length (TxOutput / TxReport)
//! ```
//!
//! This layout is a binary contract with the machine; both halves are
//! packed and split here and nowhere else.

use crate::bindings::RequestKind;

/// Packs a request kind and payload length into the `fromhost` data word.
///
/// Lengths are `u32` by construction; the driver rejects payloads of
/// 2^32 bytes or more before reaching this point.
pub fn pack_fromhost(kind: RequestKind, length: u32) -> u64 {
    ((kind as u64) << 32) | u64::from(length)
}

/// Yield reason discriminant: high 32 bits of the `tohost` data word.
pub fn tohost_reason(tohost: u64) -> u32 {
    (tohost >> 32) as u32
}

/// Emission length: low 32 bits of the `tohost` data word.
pub fn tohost_length(tohost: u64) -> u32 {
    (tohost & 0xffff_ffff) as u32
}

/// Packs a `tohost` data word; the emulated backend and tests build
/// register values with this.
pub fn pack_tohost(reason: u32, length: u32) -> u64 {
    (u64::from(reason) << 32) | u64::from(length)
}

// ════════════════════════════════════════════════════════════════════════════
// UNIT TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fromhost_layout_is_bit_exact() {
        assert_eq!(pack_fromhost(RequestKind::Advance, 0), 0);
        assert_eq!(pack_fromhost(RequestKind::Advance, 5), 5);
        assert_eq!(pack_fromhost(RequestKind::Inspect, 5), (1u64 << 32) | 5);
        assert_eq!(
            pack_fromhost(RequestKind::Advance, u32::MAX),
            0x0000_0000_ffff_ffff
        );
        assert_eq!(
            pack_fromhost(RequestKind::Inspect, u32::MAX),
            0x0000_0001_ffff_ffff
        );
    }

    #[test]
    fn tohost_split_inverts_pack() {
        let word = pack_tohost(3, 1024);
        assert_eq!(tohost_reason(word), 3);
        assert_eq!(tohost_length(word), 1024);

        let extremes = pack_tohost(u32::MAX, u32::MAX);
        assert_eq!(tohost_reason(extremes), u32::MAX);
        assert_eq!(tohost_length(extremes), u32::MAX);
    }

    #[test]
    fn high_bits_never_leak_into_length() {
        let word = pack_tohost(5, 0);
        assert_eq!(tohost_length(word), 0);
        assert_eq!(tohost_reason(word), 5);
    }
}
