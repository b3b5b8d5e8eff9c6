//! Arithmetic and shift primitives shared by every ALU-flavored encoding.
//!
//! Each primitive returns the 32-bit result and, when `setflags` is true,
//! updates N/Z/C/V on the supplied [`Psr`]. Carry/overflow are computed via
//! 64-bit signed/unsigned extension rather than bit tricks, matching the
//! reference formulas in the testable-properties section this core is
//! checked against.

use crate::flags::Psr;

fn set_nz(psr: &mut Psr, result: u32) {
    psr.n = (result as i32) < 0;
    psr.z = result == 0;
}

#[must_use]
pub fn add(psr: &mut Psr, a: u32, b: u32, setflags: bool) -> u32 {
    let result = a.wrapping_add(b);
    if setflags {
        set_nz(psr, result);
        psr.c = (u64::from(a) + u64::from(b)) >= (1u64 << 32);
        psr.v = ((a as i64).wrapping_add(b as i64)) != i64::from(result as i32);
    }
    result
}

/// Add with carry-in (the current value of `psr.c`).
#[must_use]
pub fn adc(psr: &mut Psr, a: u32, b: u32, setflags: bool) -> u32 {
    let carry_in = u32::from(psr.c);
    let wide = u64::from(a) + u64::from(b) + u64::from(carry_in);
    let result = wide as u32;
    if setflags {
        set_nz(psr, result);
        psr.c = wide >= (1u64 << 32);
        let signed = i64::from(a as i32) + i64::from(b as i32) + i64::from(carry_in);
        psr.v = signed != i64::from(result as i32);
    }
    result
}

#[must_use]
pub fn sub(psr: &mut Psr, a: u32, b: u32, setflags: bool) -> u32 {
    let result = a.wrapping_sub(b);
    if setflags {
        set_nz(psr, result);
        psr.c = u64::from(a) >= u64::from(b);
        psr.v = (i64::from(a as i32) - i64::from(b as i32)) != i64::from(result as i32);
    }
    result
}

/// Subtract with borrow-in: `a - b - !c`.
#[must_use]
pub fn sbc(psr: &mut Psr, a: u32, b: u32, setflags: bool) -> u32 {
    let borrow = u64::from(!psr.c);
    let wide = i128::from(a) - i128::from(b) - borrow as i128;
    let result = wide as u32;
    if setflags {
        set_nz(psr, result);
        psr.c = wide >= 0;
        let signed = i64::from(a as i32) - i64::from(b as i32) - borrow as i64;
        psr.v = signed != i64::from(result as i32);
    }
    result
}

/// Logical shift left by a shift amount in `0..=31` (encoded shift amounts
/// of 32+ are not representable by imm5 and are the caller's concern).
#[must_use]
pub fn lsl(psr: &mut Psr, value: u32, amount: u32, setflags: bool) -> u32 {
    let result = if amount == 0 {
        value
    } else if amount >= 32 {
        if setflags {
            psr.c = amount == 32 && (value & 1 != 0);
        }
        0
    } else {
        if setflags {
            psr.c = (value >> (32 - amount)) & 1 != 0;
        }
        value << amount
    };
    if setflags {
        set_nz(psr, result);
    }
    result
}

/// Logical shift right. An encoded immediate of 0 means "shift by 32".
#[must_use]
pub fn lsr(psr: &mut Psr, value: u32, amount: u32, setflags: bool) -> u32 {
    let effective = if amount == 0 { 32 } else { amount };
    let result = if effective >= 32 {
        if setflags {
            psr.c = effective == 32 && (value >> 31) & 1 != 0;
        }
        0
    } else {
        if setflags {
            psr.c = (value >> (effective - 1)) & 1 != 0;
        }
        value >> effective
    };
    if setflags {
        set_nz(psr, result);
    }
    result
}

/// Arithmetic shift right. An encoded immediate of 0 means "shift by 32".
#[must_use]
pub fn asr(psr: &mut Psr, value: u32, amount: u32, setflags: bool) -> u32 {
    let signed = value as i32;
    let effective = if amount == 0 { 32 } else { amount };
    let result = if effective >= 32 {
        let filled = if signed < 0 { u32::MAX } else { 0 };
        if setflags {
            psr.c = (value >> 31) & 1 != 0;
        }
        filled
    } else {
        if setflags {
            psr.c = (value >> (effective - 1)) & 1 != 0;
        }
        (signed >> effective) as u32
    };
    if setflags {
        set_nz(psr, result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_sets_overflow_on_signed_wrap() {
        let mut psr = Psr::new();
        let result = add(&mut psr, 0x7fff_ffff, 1, true);
        assert_eq!(result, 0x8000_0000);
        assert!(psr.n);
        assert!(!psr.z);
        assert!(!psr.c);
        assert!(psr.v);
    }

    #[test]
    fn adds_sets_carry_on_unsigned_wrap() {
        let mut psr = Psr::new();
        let result = add(&mut psr, 0xffff_ffff, 1, true);
        assert_eq!(result, 0);
        assert!(psr.z);
        assert!(psr.c);
        assert!(!psr.v);
    }

    #[test]
    fn subs_carry_means_no_borrow() {
        let mut psr = Psr::new();
        let result = sub(&mut psr, 5, 3, true);
        assert_eq!(result, 2);
        assert!(psr.c);
        let result = sub(&mut psr, 3, 5, true);
        assert_eq!(result, 0xffff_fffe);
        assert!(!psr.c);
    }

    #[test]
    fn lsr_immediate_zero_means_shift_by_32() {
        let mut psr = Psr::new();
        let result = lsr(&mut psr, 0x8000_0000, 0, true);
        assert_eq!(result, 0);
        assert!(psr.c);
    }

    #[test]
    fn asr_of_negative_saturates_to_all_ones() {
        let mut psr = Psr::new();
        let result = asr(&mut psr, 0x8000_0000, 0, true);
        assert_eq!(result, 0xffff_ffff);
        assert!(psr.c);
    }

    #[test]
    fn lsl_by_zero_leaves_carry_alone() {
        let mut psr = Psr::new();
        psr.c = true;
        let result = lsl(&mut psr, 0x1234, 0, true);
        assert_eq!(result, 0x1234);
        assert!(psr.c);
    }
}
