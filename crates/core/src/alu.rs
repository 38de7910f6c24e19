//! Bit-exact arithmetic/logic unit.
//!
//! The ALU is stateless; every operation takes the flags register it
//! mutates. Callers must not interleave ALU calls from multiple threads
//! against the same register bank — the flags register is exclusively owned
//! by the in-flight call sequence.
//!
//! Flag contracts follow the Z80:
//! - Half-carry is the carry/borrow out of bit 3 (bit 11 for 16-bit ops).
//! - Overflow is set when both operands share a sign and the result's sign
//!   differs.
//! - `inc`/`dec` never touch Carry.
//! - The logic ops clear Carry and compute Parity into the P/V flag.

use crate::registers::FlagsRegister;

fn even_parity(val: u8) -> bool {
    val.count_ones() % 2 == 0
}

/// Arithmetic/logic unit. Zero-sized; exists as a component so the
/// execution core can hand it to compiled blocks alongside memory and
/// registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Alu;

impl Alu {
    pub fn new() -> Self {
        Alu
    }

    fn add_impl(&self, flags: &mut FlagsRegister, a: u8, b: u8, carry_in: u8) -> u8 {
        let wide = a as u16 + b as u16 + carry_in as u16;
        let result = wide as u8;

        flags.set_half_carry((a & 0x0F) + (b & 0x0F) + carry_in > 0x0F);
        flags.set_parity_overflow((a ^ b) & 0x80 == 0 && (a ^ result) & 0x80 != 0);
        flags.set_carry(wide > 0xFF);
        flags.set_subtract(false);
        flags.set_result_flags(result);
        result
    }

    fn sub_impl(&self, flags: &mut FlagsRegister, a: u8, b: u8, borrow_in: u8) -> u8 {
        let result = a.wrapping_sub(b).wrapping_sub(borrow_in);

        flags.set_half_carry((a & 0x0F) < (b & 0x0F) + borrow_in);
        flags.set_parity_overflow((a ^ b) & 0x80 != 0 && (a ^ result) & 0x80 != 0);
        flags.set_carry((a as u16) < b as u16 + borrow_in as u16);
        flags.set_subtract(true);
        flags.set_result_flags(result);
        result
    }

    pub fn add(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        self.add_impl(flags, a, b, 0)
    }

    pub fn add_with_carry(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        let carry = flags.carry() as u8;
        self.add_impl(flags, a, b, carry)
    }

    pub fn subtract(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        self.sub_impl(flags, a, b, 0)
    }

    pub fn subtract_with_carry(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        let borrow = flags.carry() as u8;
        self.sub_impl(flags, a, b, borrow)
    }

    /// CP: subtract without keeping the result.
    pub fn compare(&self, flags: &mut FlagsRegister, a: u8, b: u8) {
        self.sub_impl(flags, a, b, 0);
    }

    /// INC: Carry is left untouched; Overflow fires exactly at 0x7F.
    pub fn increment(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let result = a.wrapping_add(1);
        flags.set_half_carry((a & 0x0F) == 0x0F);
        flags.set_parity_overflow(a == 0x7F);
        flags.set_subtract(false);
        flags.set_result_flags(result);
        result
    }

    /// DEC: Carry is left untouched; Overflow fires exactly at 0x80.
    pub fn decrement(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let result = a.wrapping_sub(1);
        flags.set_half_carry((a & 0x0F) == 0);
        flags.set_parity_overflow(a == 0x80);
        flags.set_subtract(true);
        flags.set_result_flags(result);
        result
    }

    fn logic_flags(&self, flags: &mut FlagsRegister, result: u8, half_carry: bool) {
        flags.set_half_carry(half_carry);
        flags.set_parity_overflow(even_parity(result));
        flags.set_carry(false);
        flags.set_subtract(false);
        flags.set_result_flags(result);
    }

    pub fn and(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        let result = a & b;
        self.logic_flags(flags, result, true);
        result
    }

    pub fn or(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        let result = a | b;
        self.logic_flags(flags, result, false);
        result
    }

    pub fn xor(&self, flags: &mut FlagsRegister, a: u8, b: u8) -> u8 {
        let result = a ^ b;
        self.logic_flags(flags, result, false);
        result
    }

    fn rotate_flags(&self, flags: &mut FlagsRegister, result: u8, carry_out: bool) {
        flags.set_carry(carry_out);
        flags.set_half_carry(false);
        flags.set_subtract(false);
        flags.set_parity_overflow(even_parity(result));
        flags.set_result_flags(result);
    }

    /// RLC: carry-out and bit 0 both come from bit 7 of the input.
    pub fn rotate_left_with_carry(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry = (a & 0x80) != 0;
        let result = (a << 1) | carry as u8;
        self.rotate_flags(flags, result, carry);
        result
    }

    /// RL: bit 0 comes from the prior Carry flag, carry-out from bit 7.
    pub fn rotate_left(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry_in = flags.carry() as u8;
        let carry_out = (a & 0x80) != 0;
        let result = (a << 1) | carry_in;
        self.rotate_flags(flags, result, carry_out);
        result
    }

    /// RRC: carry-out and bit 7 both come from bit 0 of the input.
    pub fn rotate_right_with_carry(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry = (a & 0x01) != 0;
        let result = (a >> 1) | ((carry as u8) << 7);
        self.rotate_flags(flags, result, carry);
        result
    }

    /// RR: bit 7 comes from the prior Carry flag, carry-out from bit 0.
    pub fn rotate_right(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry_in = flags.carry() as u8;
        let carry_out = (a & 0x01) != 0;
        let result = (a >> 1) | (carry_in << 7);
        self.rotate_flags(flags, result, carry_out);
        result
    }

    /// SLA: arithmetic shift left, bit 0 filled with zero.
    pub fn shift_left(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry = (a & 0x80) != 0;
        let result = a << 1;
        self.rotate_flags(flags, result, carry);
        result
    }

    /// SRA: arithmetic shift right, bit 7 preserved.
    pub fn shift_right(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry = (a & 0x01) != 0;
        let result = (a >> 1) | (a & 0x80);
        self.rotate_flags(flags, result, carry);
        result
    }

    /// SRL: logical shift right, bit 7 filled with zero.
    pub fn shift_right_logical(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let carry = (a & 0x01) != 0;
        let result = a >> 1;
        self.rotate_flags(flags, result, carry);
        result
    }

    /// DAA: BCD-correct the accumulator after an add or subtract.
    ///
    /// The correction nibble is chosen from (a > 0x99 or Carry) for the high
    /// nibble and (low nibble > 9 or HalfCarry) for the low nibble; it is
    /// added when Subtract is clear and subtracted otherwise. HalfCarry is
    /// recomputed from the bit-4 toggle between the pre and post values.
    pub fn decimal_adjust(&self, flags: &mut FlagsRegister, a: u8) -> u8 {
        let mut correction = 0u8;
        if (a & 0x0F) > 9 || flags.half_carry() {
            correction |= 0x06;
        }
        let mut carry = flags.carry();
        if a > 0x99 || carry {
            correction |= 0x60;
            carry = true;
        }

        let result = if flags.subtract() {
            a.wrapping_sub(correction)
        } else {
            a.wrapping_add(correction)
        };

        flags.set_half_carry(((a ^ result) & 0x10) != 0);
        flags.set_parity_overflow(even_parity(result));
        flags.set_carry(carry);
        flags.set_result_flags(result);
        result
    }

    /// BIT: test a single bit. Zero is set when the bit is clear; Overflow
    /// aliases Zero, Sign is set only when bit 7 is tested and set.
    pub fn bit_test(&self, flags: &mut FlagsRegister, a: u8, bit: u8) {
        let zero = a & (1 << bit) == 0;
        flags.set_zero(zero);
        flags.set_half_carry(true);
        flags.set_subtract(false);
        flags.set_parity_overflow(zero);
        flags.set_sign(bit == 7 && !zero);
        flags.set_flag5((a & 0x20) != 0);
        flags.set_flag3((a & 0x08) != 0);
    }

    /// ADD HL,ss: only HalfCarry (bit 11), Subtract and Carry (bit 15) are
    /// affected; Sign, Zero and Overflow keep their values.
    pub fn add_16(&self, flags: &mut FlagsRegister, a: u16, b: u16) -> u16 {
        let wide = a as u32 + b as u32;
        let result = wide as u16;

        flags.set_half_carry((a & 0x0FFF) + (b & 0x0FFF) > 0x0FFF);
        flags.set_carry(wide > 0xFFFF);
        flags.set_subtract(false);
        flags.set_flag5((result & 0x2000) != 0);
        flags.set_flag3((result & 0x0800) != 0);
        result
    }

    /// ADC HL,ss: the full 8-bit add contract mirrored at bits 11/15.
    pub fn add_with_carry_16(&self, flags: &mut FlagsRegister, a: u16, b: u16) -> u16 {
        let carry_in = flags.carry() as u16;
        let wide = a as u32 + b as u32 + carry_in as u32;
        let result = wide as u16;

        flags.set_half_carry((a & 0x0FFF) + (b & 0x0FFF) + carry_in > 0x0FFF);
        flags.set_parity_overflow((a ^ b) & 0x8000 == 0 && (a ^ result) & 0x8000 != 0);
        flags.set_carry(wide > 0xFFFF);
        flags.set_subtract(false);
        flags.set_sign((result & 0x8000) != 0);
        flags.set_zero(result == 0);
        flags.set_flag5((result & 0x2000) != 0);
        flags.set_flag3((result & 0x0800) != 0);
        result
    }

    /// SBC HL,ss: the full 8-bit subtract contract mirrored at bits 11/15.
    pub fn subtract_with_carry_16(&self, flags: &mut FlagsRegister, a: u16, b: u16) -> u16 {
        let borrow_in = flags.carry() as u16;
        let result = a.wrapping_sub(b).wrapping_sub(borrow_in);

        flags.set_half_carry((a & 0x0FFF) < (b & 0x0FFF) + borrow_in);
        flags.set_parity_overflow((a ^ b) & 0x8000 != 0 && (a ^ result) & 0x8000 != 0);
        flags.set_carry((a as u32) < b as u32 + borrow_in as u32);
        flags.set_subtract(true);
        flags.set_sign((result & 0x8000) != 0);
        flags.set_zero(result == 0);
        flags.set_flag5((result & 0x2000) != 0);
        flags.set_flag3((result & 0x0800) != 0);
        result
    }
}
