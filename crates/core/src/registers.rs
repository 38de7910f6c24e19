//! Register file and flags register.
//!
//! The Z80 carries two banks of the general-purpose registers {B,C,D,E,H,L}
//! and two banks of {A,F}; `EXX` and `EX AF,AF'` select the active bank.
//! Bank switching here flips a selector index between two owned bank values,
//! it never swaps live objects.

use serde::{Deserialize, Serialize};

// Flag bit positions (S Z F5 H F3 P/V N C)
const FLAG_S: u8 = 0b1000_0000; // Sign
const FLAG_Z: u8 = 0b0100_0000; // Zero
const FLAG_5: u8 = 0b0010_0000; // Undocumented bit 5
const FLAG_H: u8 = 0b0001_0000; // Half-carry
const FLAG_3: u8 = 0b0000_1000; // Undocumented bit 3
const FLAG_PV: u8 = 0b0000_0100; // Parity/Overflow
const FLAG_N: u8 = 0b0000_0010; // Subtract
const FLAG_C: u8 = 0b0000_0001; // Carry

/// The F register: eight flags packed into one byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagsRegister {
    bits: u8,
}

impl FlagsRegister {
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    pub fn from_byte(bits: u8) -> Self {
        Self { bits }
    }

    pub fn to_byte(self) -> u8 {
        self.bits
    }

    fn get(self, mask: u8) -> bool {
        (self.bits & mask) != 0
    }

    fn set(&mut self, mask: u8, val: bool) {
        if val {
            self.bits |= mask;
        } else {
            self.bits &= !mask;
        }
    }

    pub fn sign(self) -> bool {
        self.get(FLAG_S)
    }

    pub fn set_sign(&mut self, val: bool) {
        self.set(FLAG_S, val);
    }

    pub fn zero(self) -> bool {
        self.get(FLAG_Z)
    }

    pub fn set_zero(&mut self, val: bool) {
        self.set(FLAG_Z, val);
    }

    pub fn flag5(self) -> bool {
        self.get(FLAG_5)
    }

    pub fn set_flag5(&mut self, val: bool) {
        self.set(FLAG_5, val);
    }

    pub fn half_carry(self) -> bool {
        self.get(FLAG_H)
    }

    pub fn set_half_carry(&mut self, val: bool) {
        self.set(FLAG_H, val);
    }

    pub fn flag3(self) -> bool {
        self.get(FLAG_3)
    }

    pub fn set_flag3(&mut self, val: bool) {
        self.set(FLAG_3, val);
    }

    pub fn parity_overflow(self) -> bool {
        self.get(FLAG_PV)
    }

    pub fn set_parity_overflow(&mut self, val: bool) {
        self.set(FLAG_PV, val);
    }

    pub fn subtract(self) -> bool {
        self.get(FLAG_N)
    }

    pub fn set_subtract(&mut self, val: bool) {
        self.set(FLAG_N, val);
    }

    pub fn carry(self) -> bool {
        self.get(FLAG_C)
    }

    pub fn set_carry(&mut self, val: bool) {
        self.set(FLAG_C, val);
    }

    /// Set Sign, Zero and the undocumented bits 5/3 from a result byte.
    pub fn set_result_flags(&mut self, result: u8) {
        self.set(FLAG_S, (result & 0x80) != 0);
        self.set(FLAG_Z, result == 0);
        self.set(FLAG_5, (result & FLAG_5) != 0);
        self.set(FLAG_3, (result & FLAG_3) != 0);
    }
}

/// One bank of the general-purpose registers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GeneralPurposeBank {
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
}

/// One bank of the accumulator and flags pair.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccumulatorBank {
    pub a: u8,
    pub flags: FlagsRegister,
}

/// Interrupt mode (IM 0/1/2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InterruptMode {
    #[default]
    Mode0,
    Mode1,
    Mode2,
}

/// The full register file: banked GP and AF registers, index registers,
/// special registers and the interrupt flip-flops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterFile {
    gp_banks: [GeneralPurposeBank; 2],
    af_banks: [AccumulatorBank; 2],
    active_gp: usize,
    active_af: usize,

    pub ix: u16,
    pub iy: u16,
    /// Interrupt vector base register.
    pub i: u8,
    /// Memory refresh register.
    pub r: u8,
    pub sp: u16,
    pub pc: u16,

    pub iff1: bool,
    pub iff2: bool,
    pub interrupt_mode: InterruptMode,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            gp_banks: [GeneralPurposeBank::default(); 2],
            af_banks: [AccumulatorBank::default(); 2],
            active_gp: 0,
            active_af: 0,
            ix: 0,
            iy: 0,
            i: 0,
            r: 0,
            sp: 0,
            pc: 0,
            iff1: false,
            iff2: false,
            interrupt_mode: InterruptMode::Mode0,
        }
    }

    /// The active general-purpose bank.
    pub fn gp(&self) -> &GeneralPurposeBank {
        &self.gp_banks[self.active_gp]
    }

    pub fn gp_mut(&mut self) -> &mut GeneralPurposeBank {
        &mut self.gp_banks[self.active_gp]
    }

    /// The active accumulator/flags bank.
    pub fn af_bank(&self) -> &AccumulatorBank {
        &self.af_banks[self.active_af]
    }

    pub fn af_bank_mut(&mut self) -> &mut AccumulatorBank {
        &mut self.af_banks[self.active_af]
    }

    /// EXX: switch the active general-purpose bank.
    pub fn exx(&mut self) {
        self.active_gp ^= 1;
    }

    /// EX AF,AF': switch the active accumulator/flags bank.
    pub fn exchange_af(&mut self) {
        self.active_af ^= 1;
    }

    // 16-bit pair accessors over the active banks

    pub fn af(&self) -> u16 {
        let bank = self.af_bank();
        ((bank.a as u16) << 8) | bank.flags.to_byte() as u16
    }

    pub fn set_af(&mut self, val: u16) {
        let bank = self.af_bank_mut();
        bank.a = (val >> 8) as u8;
        bank.flags = FlagsRegister::from_byte(val as u8);
    }

    pub fn bc(&self) -> u16 {
        ((self.gp().b as u16) << 8) | self.gp().c as u16
    }

    pub fn set_bc(&mut self, val: u16) {
        let gp = self.gp_mut();
        gp.b = (val >> 8) as u8;
        gp.c = val as u8;
    }

    pub fn de(&self) -> u16 {
        ((self.gp().d as u16) << 8) | self.gp().e as u16
    }

    pub fn set_de(&mut self, val: u16) {
        let gp = self.gp_mut();
        gp.d = (val >> 8) as u8;
        gp.e = val as u8;
    }

    pub fn hl(&self) -> u16 {
        ((self.gp().h as u16) << 8) | self.gp().l as u16
    }

    pub fn set_hl(&mut self, val: u16) {
        let gp = self.gp_mut();
        gp.h = (val >> 8) as u8;
        gp.l = val as u8;
    }

    /// Reset to power-on state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Register state as JSON, for frontend debug views.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_into_one_byte() {
        let mut f = FlagsRegister::new();
        f.set_sign(true);
        f.set_carry(true);
        assert_eq!(f.to_byte(), 0x81);

        f.set_sign(false);
        assert_eq!(f.to_byte(), 0x01);
    }

    #[test]
    fn result_flags_pick_up_undocumented_bits() {
        let mut f = FlagsRegister::new();
        f.set_result_flags(0xA8);
        assert!(f.sign());
        assert!(!f.zero());
        assert!(f.flag5());
        assert!(f.flag3());

        f.set_result_flags(0x00);
        assert!(f.zero());
        assert!(!f.sign());
        assert!(!f.flag5());
    }

    #[test]
    fn pair_accessors_compose_bytes() {
        let mut regs = RegisterFile::new();
        regs.set_bc(0x1234);
        assert_eq!(regs.gp().b, 0x12);
        assert_eq!(regs.gp().c, 0x34);
        assert_eq!(regs.bc(), 0x1234);

        regs.set_af(0xAB95);
        assert_eq!(regs.af_bank().a, 0xAB);
        assert_eq!(regs.af_bank().flags.to_byte(), 0x95);
    }

    #[test]
    fn exx_preserves_the_inactive_bank() {
        let mut regs = RegisterFile::new();
        regs.set_bc(0x1111);
        regs.set_de(0x2222);
        regs.exx();
        assert_eq!(regs.bc(), 0);
        regs.set_bc(0x3333);
        regs.exx();
        assert_eq!(regs.bc(), 0x1111);
        assert_eq!(regs.de(), 0x2222);
    }

    #[test]
    fn exchange_af_switches_accumulator_banks() {
        let mut regs = RegisterFile::new();
        regs.af_bank_mut().a = 0x42;
        regs.exchange_af();
        assert_eq!(regs.af_bank().a, 0);
        regs.af_bank_mut().a = 0x99;
        regs.exchange_af();
        assert_eq!(regs.af_bank().a, 0x42);
    }

    #[test]
    fn register_file_serializes_to_json() {
        let mut regs = RegisterFile::new();
        regs.pc = 0x0100;
        let v = regs.to_json();
        assert_eq!(v["pc"], 0x0100);
    }
}
