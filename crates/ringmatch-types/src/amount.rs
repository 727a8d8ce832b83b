//! Arbitrary-precision amount helpers with consensus truncation rules.
//!
//! All financial arithmetic in the simulator uses [`BigInt`] and must match
//! a consensus implementation bit for bit. Division truncates toward zero
//! (never toward negative infinity) and is always applied after the full
//! multiplication.

use num_bigint::BigInt;
use num_traits::One;

/// `(a * b) / c` with truncation toward zero applied after the
/// multiplication. Never pre-divide; reports diverge otherwise.
pub fn mul_div(a: &BigInt, b: &BigInt, c: &BigInt) -> BigInt {
    (a * b) / c
}

/// The `2^256 - 1` marker returned by the trade delegate for cancelled
/// orders. Doubles as the "unlimited" allowance value.
pub fn cancelled_sentinel() -> BigInt {
    (BigInt::one() << 256u32) - 1
}

/// Big-endian 32-byte word of a non-negative amount, used for canonical
/// hashing and packed chain queries. Values wider than 256 bits keep their
/// low 256 bits.
pub fn to_word(value: &BigInt) -> [u8; 32] {
    let (_, bytes) = value.to_bytes_be();
    let mut word = [0u8; 32];
    let n = bytes.len().min(32);
    word[32 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    word
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_div_truncates_after_multiplication() {
        // 7 * 3 / 2 must be 10, not 7 * 1 = 7.
        let r = mul_div(&BigInt::from(7), &BigInt::from(3), &BigInt::from(2));
        assert_eq!(r, BigInt::from(10));
    }

    #[test]
    fn division_truncates_toward_zero() {
        let r = mul_div(&BigInt::from(-7), &BigInt::from(1), &BigInt::from(2));
        assert_eq!(r, BigInt::from(-3));
    }

    #[test]
    fn sentinel_is_exactly_256_ones() {
        let s = cancelled_sentinel();
        assert_eq!(s.bits(), 256);
        assert_eq!(s + BigInt::one(), BigInt::one() << 256u32);
    }

    #[test]
    fn to_word_pads_left() {
        let w = to_word(&BigInt::from(0x0102u32));
        assert_eq!(w[30], 0x01);
        assert_eq!(w[31], 0x02);
        assert!(w[..30].iter().all(|&b| b == 0));
    }
}
