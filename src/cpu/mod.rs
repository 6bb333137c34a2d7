//! The MU5 central processor.
//!
//! One [`Cpu`] owns the full register file and a [`Store`] standing in for
//! SAC. `execute_next_order` runs exactly one order through the
//! fetch → decode → resolve → execute → retire pipeline and then polls for
//! pending interrupts, so an external scheduler can interleave peripheral
//! activity between orders.

pub mod decode;
pub mod descriptor;
pub mod interrupt;

mod arith;
mod operand;
pub mod org;
mod sts;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{join_address, split_address, AccessFault, CoreStore, Store};
use decode::{Decoded, Order};
use descriptor::Descriptor;
use interrupt::{
    classify, highest_pending, link_entry_line, link_return_line, pack_link, unpack_link,
    ClassifyInputs, Disposition, Fault, Family, InterruptNumber, INTERRUPT_COUNT, INTERRUPT_NONE,
    SES_ACCESS_VIOLATION, SES_CPR_MULTIPLE_EQUIVALENCE, SES_CPR_NEQ_SUPPRESSED, V_BLOCK_PROP,
    V_BLOCK_SYSTEM, V_LINE_INSTRUCTION_COUNTER, V_LINE_PROGRAM_FAULT_STATUS,
    V_LINE_SOFTWARE_INTERRUPT, V_LINE_SYSTEM_ERROR_STATUS,
};

/// Machine-status bits.
pub const MS_L0IF: u16 = 0x0001;
pub const MS_L1IF: u16 = 0x0002;
pub const MS_EXEC: u16 = 0x0004;
/// Route accumulator-unit faults to System Error in privileged mode.
pub const MS_ACC_SE: u16 = 0x0008;
pub const MS_B_SE: u16 = 0x0010;
pub const MS_D_SE: u16 = 0x0020;
pub const MS_INH_COUNT: u16 = 0x0040;
pub const MS_INH_PROG_FAULT: u16 = 0x0080;
pub const MS_BN: u16 = 0x0100;
pub const MS_T0: u16 = 0x0200;
pub const MS_T1: u16 = 0x0400;
pub const MS_T2: u16 = 0x0800;
pub const MS_TOVF: u16 = 0x1000;
pub const MS_DISPLAY0: u16 = 0x4000;
pub const MS_DISPLAY1: u16 = 0x8000;

/// Bits a user-mode MS write may change; the rest are privileged.
pub const MS_USER_WRITABLE: u16 = MS_BN | MS_T0 | MS_T1 | MS_T2 | MS_TOVF;

/// BOD condition bits (inhibits at the same position + 8).
pub const BOD_OVERFLOW: u16 = 0x0001;
pub const BOD_ZERO_DIVIDE: u16 = 0x0002;

/// AOD condition bits. The X unit records here as well: both accumulators
/// share the fault register and the ACC route bit.
pub const AOD_FIXED_OVERFLOW: u16 = 0x0001;
pub const AOD_DECIMAL_OVERFLOW: u16 = 0x0002;
pub const AOD_FLOAT_OVERFLOW: u16 = 0x0004;
pub const AOD_FLOAT_UNDERFLOW: u16 = 0x0008;
pub const AOD_ZERO_DIVIDE: u16 = 0x0010;

/// DOD condition bits.
pub const DOD_ITS: u16 = 0x0001;
pub const DOD_SSS: u16 = 0x0002;
pub const DOD_BOUNDS: u16 = 0x0004;

/// Offset of an inhibit bit from its condition bit in AOD/BOD/DOD.
pub const OD_INHIBIT_SHIFT: u32 = 8;

/// Extracode n enters executive mode here, in segment 0.
pub const EXTRACODE_BASE: u32 = 0x0200;
pub const EXTRACODE_STRIDE: u32 = 32;

/// Internal register numbers (addressing kind K=1).
pub const REG_MS: u8 = 0;
pub const REG_NB: u8 = 1;
pub const REG_XNB: u8 = 2;
pub const REG_SN: u8 = 3;
pub const REG_SF: u8 = 4;
pub const REG_CO: u8 = 5;
pub const REG_AOD: u8 = 6;
pub const REG_BOD: u8 = 7;
pub const REG_DOD: u8 = 8;
pub const REG_B: u8 = 9;
pub const REG_X: u8 = 10;
pub const REG_A: u8 = 11;
pub const REG_D: u8 = 16;
pub const REG_XD: u8 = 17;

/// Misuse of the public register-set entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuError {
    #[error("no such internal register: {0}")]
    UnknownRegister(u8),
    #[error("internal register {0} is read-only")]
    ReadOnlyRegister(u8),
}

/// The process-wide register file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    /// Current order address (byte address of a 16-bit word).
    pub co: u32,
    pub ms: u16,
    pub nb: u16,
    pub xnb: u16,
    pub sn: u16,
    pub sf: u16,
    pub b: u32,
    pub x: u32,
    pub a: u64,
    /// Primary descriptor, packed.
    pub d: u64,
    /// Secondary descriptor, packed.
    pub xd: u64,
    pub aod: u16,
    pub bod: u16,
    pub dod: u16,
}

/// How one call to `execute_next_order` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    /// The order was decoded and ran to retirement (possibly recording
    /// faults along the way).
    Executed(Order),
    /// An access fault abandoned the order; CO still addresses it.
    Abandoned,
}

/// Why order processing stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Abandon {
    /// Translation/permission failure: no side effects, CO frozen so the
    /// order re-executes after the interrupt returns.
    Access,
    /// The order itself faulted: status recorded, CO advances.
    Order,
}

pub(crate) type OrderResult<T> = Result<T, Abandon>;

/// Control-flow outcome of a retired order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Next,
    Jump(u32),
}

pub struct Cpu<S: Store = CoreStore> {
    pub regs: Registers,
    pub store: S,
    pending: u8,
    program_fault_status: u16,
    system_error_status: u16,
    instruction_counter: u32,
    /// Interrupt link pairs, V-store block 1: lines 2n / 2n+1.
    link_table: [u64; INTERRUPT_COUNT * 2],
    console_message: Option<String>,
}

impl Cpu<CoreStore> {
    pub fn new() -> Self {
        Self::with_store(CoreStore::new())
    }
}

impl Default for Cpu<CoreStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Store> Cpu<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            regs: Registers::default(),
            store,
            pending: 0,
            program_fault_status: 0,
            system_error_status: 0,
            instruction_counter: 0,
            link_table: [0; INTERRUPT_COUNT * 2],
            console_message: None,
        }
    }

    /// Zero every register and forget all pending interrupt state. The
    /// store contents are left alone.
    pub fn reset_state(&mut self) {
        self.regs = Registers::default();
        self.pending = 0;
        self.program_fault_status = 0;
        self.system_error_status = 0;
        self.instruction_counter = 0;
        self.link_table = [0; INTERRUPT_COUNT * 2];
        self.console_message = None;
    }

    // ---- machine status ------------------------------------------------

    pub fn get_ms(&self) -> u16 {
        self.regs.ms
    }

    pub fn ms_is_all(&self, mask: u16) -> bool {
        self.regs.ms & mask == mask
    }

    pub fn ms_is_any(&self, mask: u16) -> bool {
        self.regs.ms & mask != 0
    }

    pub(crate) fn ms_set(&mut self, mask: u16, value: bool) {
        if value {
            self.regs.ms |= mask;
        } else {
            self.regs.ms &= !mask;
        }
    }

    pub fn executive(&self) -> bool {
        self.ms_is_any(MS_EXEC)
    }

    /// Privileged for fault classification: executive mode or running
    /// under either interrupt-inhibit level.
    pub fn privileged(&self) -> bool {
        self.ms_is_any(MS_EXEC | MS_L0IF | MS_L1IF)
    }

    /// Apply an MS write with the mode-dependent mask.
    pub(crate) fn load_ms(&mut self, value: u16) {
        if self.executive() {
            self.regs.ms = value;
        } else {
            self.regs.ms = (self.regs.ms & !MS_USER_WRITABLE) | (value & MS_USER_WRITABLE);
        }
    }

    pub(crate) fn set_test_bits(&mut self, t0: bool, t1: bool, t2: bool) {
        self.ms_set(MS_T0, t0);
        self.ms_set(MS_T1, t1);
        self.ms_set(MS_T2, t2);
    }

    // ---- descriptors ---------------------------------------------------

    pub(crate) fn descriptor_d(&self) -> Descriptor {
        Descriptor::from_word(self.regs.d)
    }

    pub(crate) fn descriptor_xd(&self) -> Descriptor {
        Descriptor::from_word(self.regs.xd)
    }

    // ---- the order pipeline --------------------------------------------

    /// Run one order. Returns what happened so a caller can trace it.
    pub fn execute_next_order(&mut self) -> StepEvent {
        let event = match self.fetch_and_decode() {
            Err(_) => StepEvent::Abandoned,
            Ok(decoded) => {
                let (seg, off) = split_address(self.regs.co);
                let next_co = join_address(seg, off.wrapping_add(decoded.words as u16 * 2));
                match self.dispatch(&decoded.order, next_co) {
                    Ok(Flow::Next) | Err(Abandon::Order) => {
                        self.regs.co = next_co;
                        self.count_instruction();
                        StepEvent::Executed(decoded.order)
                    }
                    Ok(Flow::Jump(target)) => {
                        self.regs.co = target & !1;
                        self.count_instruction();
                        StepEvent::Executed(decoded.order)
                    }
                    Err(Abandon::Access) => StepEvent::Abandoned,
                }
            }
        };
        self.evaluate_interrupts();
        event
    }

    fn fetch_and_decode(&mut self) -> OrderResult<Decoded> {
        let co = self.regs.co & !1;
        let first = match self.store.obey_16(co) {
            Ok(word) => word,
            Err(e) => return Err(self.access_abandon(e)),
        };
        let (seg, mut off) = split_address(co);
        let result = {
            let store = &mut self.store;
            decode::decode(first, || {
                off = off.wrapping_add(2);
                store.obey_16(join_address(seg, off))
            })
        };
        result.map_err(|e| self.access_abandon(e))
    }

    fn dispatch(&mut self, order: &Order, next_co: u32) -> OrderResult<Flow> {
        match order.cr {
            decode::CR_ORG => self.exec_org(order, next_co),
            decode::CR_BOOL => self.exec_bool(order),
            decode::CR_B | decode::CR_X | decode::CR_A_DEC | decode::CR_A_FLT => {
                self.exec_arith(order)
            }
            decode::CR_STS1 => self.exec_sts1(order),
            _ => self.exec_sts2(order),
        }
    }

    fn count_instruction(&mut self) {
        if self.ms_is_any(MS_INH_COUNT) || self.instruction_counter == 0 {
            return;
        }
        self.instruction_counter -= 1;
        if self.instruction_counter == 0 {
            self.raise(InterruptNumber::InstructionCountZero);
        }
    }

    // ---- fault recording and classification ----------------------------

    fn raise(&mut self, n: InterruptNumber) {
        self.pending |= 1 << n as u8;
    }

    fn condition_inhibited(&self, fault: Fault) -> bool {
        let (register, bit) = match fault {
            Fault::BOverflow => (self.regs.bod, BOD_OVERFLOW),
            Fault::BZeroDivide => (self.regs.bod, BOD_ZERO_DIVIDE),
            Fault::AccFixedOverflow => (self.regs.aod, AOD_FIXED_OVERFLOW),
            Fault::AccDecimalOverflow => (self.regs.aod, AOD_DECIMAL_OVERFLOW),
            Fault::AccFloatOverflow => (self.regs.aod, AOD_FLOAT_OVERFLOW),
            Fault::AccFloatUnderflow => (self.regs.aod, AOD_FLOAT_UNDERFLOW),
            Fault::AccZeroDivide => (self.regs.aod, AOD_ZERO_DIVIDE),
            Fault::IllegalTypeSize => (self.regs.dod, DOD_ITS),
            Fault::ShortSourceString => (self.regs.dod, DOD_SSS),
            Fault::BoundsCheck => (self.regs.dod, DOD_BOUNDS),
            _ => return false,
        };
        register & (bit << OD_INHIBIT_SHIFT) != 0
    }

    fn set_condition_bit(&mut self, fault: Fault) {
        match fault {
            Fault::BOverflow => self.regs.bod |= BOD_OVERFLOW,
            Fault::BZeroDivide => self.regs.bod |= BOD_ZERO_DIVIDE,
            Fault::AccFixedOverflow => self.regs.aod |= AOD_FIXED_OVERFLOW,
            Fault::AccDecimalOverflow => self.regs.aod |= AOD_DECIMAL_OVERFLOW,
            Fault::AccFloatOverflow => self.regs.aod |= AOD_FLOAT_OVERFLOW,
            Fault::AccFloatUnderflow => self.regs.aod |= AOD_FLOAT_UNDERFLOW,
            Fault::AccZeroDivide => self.regs.aod |= AOD_ZERO_DIVIDE,
            Fault::IllegalTypeSize => self.regs.dod |= DOD_ITS,
            Fault::ShortSourceString => self.regs.dod |= DOD_SSS,
            Fault::BoundsCheck => self.regs.dod |= DOD_BOUNDS,
            _ => {}
        }
    }

    fn route_bit(&self, family: Family) -> bool {
        match family {
            Family::B => self.ms_is_any(MS_B_SE),
            Family::Acc => self.ms_is_any(MS_ACC_SE),
            Family::D => self.ms_is_any(MS_D_SE),
            Family::Order => true,
        }
    }

    /// Record a fault condition: sticky bits always, an interrupt when the
    /// classification says so. The single funnel for every fault family.
    pub(crate) fn record_fault(&mut self, fault: Fault) {
        self.set_condition_bit(fault);
        let inputs = ClassifyInputs {
            privileged: self.privileged(),
            routed: self.route_bit(fault.family()),
            condition_inhibited: self.condition_inhibited(fault),
            program_fault_inhibited: self.ms_is_any(MS_INH_PROG_FAULT),
        };
        let bit = fault.status_bit();
        match classify(fault, inputs) {
            Disposition::Record => {
                if !inputs.privileged {
                    self.program_fault_status |= bit;
                }
            }
            Disposition::RaiseProgramFault => {
                self.program_fault_status |= bit;
                self.raise(InterruptNumber::ProgramFaults);
            }
            Disposition::RaiseSystemError => {
                self.system_error_status |= bit;
                self.raise(InterruptNumber::SystemError);
            }
            Disposition::RaiseIllegalOrders => {
                self.program_fault_status |= bit;
                self.raise(InterruptNumber::IllegalOrders);
            }
        }
    }

    /// Record a fault and abandon the current order (CO still advances).
    pub(crate) fn order_fault<T>(&mut self, fault: Fault) -> OrderResult<T> {
        self.record_fault(fault);
        Err(Abandon::Order)
    }

    /// Translate a store access failure into its interrupt and abandon the
    /// order with CO frozen, so the failed order re-executes on return.
    pub(crate) fn access_abandon(&mut self, fault: AccessFault) -> Abandon {
        match fault {
            AccessFault::NotEquivalent(_) => self.set_cpr_non_equivalence_interrupt(),
            AccessFault::MultipleEquivalence(_) => self.set_cpr_multiple_equivalence_interrupt(),
            AccessFault::Violation(_) => self.set_access_violation_interrupt(),
        }
        Abandon::Access
    }

    // ---- store access with fault plumbing ------------------------------

    pub(crate) fn load_8(&mut self, addr: u32) -> OrderResult<u8> {
        self.store.read_8(addr).map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn load_16(&mut self, addr: u32) -> OrderResult<u16> {
        self.store.read_16(addr).map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn load_32(&mut self, addr: u32) -> OrderResult<u32> {
        self.store.read_32(addr).map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn load_64(&mut self, addr: u32) -> OrderResult<u64> {
        self.store.read_64(addr).map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn store_8(&mut self, addr: u32, value: u8) -> OrderResult<()> {
        self.store
            .write_8(addr, value)
            .map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn store_16(&mut self, addr: u32, value: u16) -> OrderResult<()> {
        self.store
            .write_16(addr, value)
            .map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn store_32(&mut self, addr: u32, value: u32) -> OrderResult<()> {
        self.store
            .write_32(addr, value)
            .map_err(|e| self.access_abandon(e))
    }

    pub(crate) fn store_64(&mut self, addr: u32, value: u64) -> OrderResult<()> {
        self.store
            .write_64(addr, value)
            .map_err(|e| self.access_abandon(e))
    }

    // ---- adders and the stack ------------------------------------------

    /// Name-segment address of `base + delta` bytes, checked against the
    /// 16-bit segment offset range.
    pub(crate) fn name_address(&mut self, base: u16, delta: i64) -> OrderResult<u32> {
        let offset = base as i64 + delta;
        if !(0..=0xFFFF).contains(&offset) {
            return self.order_fault(Fault::NameAdderOverflow);
        }
        Ok(join_address(self.regs.sn, offset as u16))
    }

    /// CO-segment address `delta_words` 16-bit words away from `from`.
    pub(crate) fn control_target(&mut self, from: u32, delta_words: i64) -> OrderResult<u32> {
        let (seg, off) = split_address(from);
        let offset = off as i64 + delta_words * 2;
        if !(0..=0xFFFF).contains(&offset) {
            return self.order_fault(Fault::ControlAdderOverflow);
        }
        Ok(join_address(seg, offset as u16))
    }

    pub(crate) fn stack_push(&mut self, value: u64) -> OrderResult<()> {
        let offset = self.regs.sf as i64 + 8;
        if offset > 0xFFFF {
            return self.order_fault(Fault::NameAdderOverflow);
        }
        let addr = join_address(self.regs.sn, offset as u16);
        self.store_64(addr, value)?;
        self.regs.sf = offset as u16;
        Ok(())
    }

    pub(crate) fn stack_pop(&mut self) -> OrderResult<u64> {
        let addr = join_address(self.regs.sn, self.regs.sf);
        let value = self.load_64(addr)?;
        let offset = self.regs.sf as i64 - 8;
        if offset < 0 {
            return self.order_fault(Fault::NameAdderOverflow);
        }
        self.regs.sf = offset as u16;
        Ok(value)
    }

    // ---- internal register file ----------------------------------------

    /// Read internal register `n`. Non-existent registers read as zero.
    /// Returns (value, significant bits).
    pub(crate) fn internal_read(&self, n: u8) -> (u64, u32) {
        match n {
            REG_MS => (self.regs.ms as u64, 16),
            REG_NB => (self.regs.nb as u64, 16),
            REG_XNB => (self.regs.xnb as u64, 16),
            REG_SN => (self.regs.sn as u64, 16),
            REG_SF => (self.regs.sf as u64, 16),
            REG_CO => (self.regs.co as u64, 32),
            REG_AOD => (self.regs.aod as u64, 16),
            REG_BOD => (self.regs.bod as u64, 16),
            REG_DOD => (self.regs.dod as u64, 16),
            REG_B => (self.regs.b as u64, 32),
            REG_X => (self.regs.x as u64, 32),
            REG_A => (self.regs.a, 64),
            REG_D => (self.regs.d, 64),
            REG_XD => (self.regs.xd, 64),
            _ => (0, 64),
        }
    }

    /// Write internal register `n` with program-write side effects. Err
    /// means the register does not exist or cannot be written.
    fn internal_write(&mut self, n: u8, value: u64) -> Result<(), CpuError> {
        match n {
            REG_MS => self.load_ms(value as u16),
            REG_NB => self.regs.nb = value as u16,
            REG_XNB => self.regs.xnb = value as u16,
            REG_SN => self.regs.sn = value as u16,
            REG_SF => self.regs.sf = value as u16,
            REG_CO => return Err(CpuError::ReadOnlyRegister(n)),
            REG_AOD => {
                self.regs.aod = value as u16;
                self.recompute_fault_interrupts();
            }
            REG_BOD => {
                self.regs.bod = value as u16;
                self.recompute_fault_interrupts();
            }
            REG_DOD => {
                self.regs.dod = value as u16;
                self.recompute_fault_interrupts();
            }
            REG_B => self.regs.b = value as u32,
            REG_X => self.regs.x = value as u32,
            REG_A => self.regs.a = value,
            REG_D => self.regs.d = value,
            REG_XD => self.regs.xd = value,
            _ => return Err(CpuError::UnknownRegister(n)),
        }
        Ok(())
    }

    /// The program path: a failed register write is an illegal function.
    pub(crate) fn write_internal(&mut self, n: u8, value: u64) -> OrderResult<()> {
        match self.internal_write(n, value) {
            Ok(()) => Ok(()),
            Err(_) => self.order_fault(Fault::IllegalFunction),
        }
    }

    /// Debug/test entry point with identical side effects to a program
    /// write, but misuse reports an error instead of a machine fault.
    pub fn write_register(&mut self, n: u8, value: u64) -> Result<(), CpuError> {
        self.internal_write(n, value)
    }

    /// The shared recompute step run after writes to the fault-bearing
    /// registers: every condition bit present is re-classified, which may
    /// raise an interrupt. Already-raised interrupts are never cleared.
    fn recompute_fault_interrupts(&mut self) {
        let conditions = [
            (self.regs.bod, BOD_OVERFLOW, Fault::BOverflow),
            (self.regs.bod, BOD_ZERO_DIVIDE, Fault::BZeroDivide),
            (self.regs.aod, AOD_FIXED_OVERFLOW, Fault::AccFixedOverflow),
            (self.regs.aod, AOD_DECIMAL_OVERFLOW, Fault::AccDecimalOverflow),
            (self.regs.aod, AOD_FLOAT_OVERFLOW, Fault::AccFloatOverflow),
            (self.regs.aod, AOD_FLOAT_UNDERFLOW, Fault::AccFloatUnderflow),
            (self.regs.aod, AOD_ZERO_DIVIDE, Fault::AccZeroDivide),
            (self.regs.dod, DOD_ITS, Fault::IllegalTypeSize),
            (self.regs.dod, DOD_SSS, Fault::ShortSourceString),
            (self.regs.dod, DOD_BOUNDS, Fault::BoundsCheck),
        ];
        for (register, bit, fault) in conditions {
            if register & bit != 0 {
                self.record_fault(fault);
            }
        }
    }

    // ---- V-store ------------------------------------------------------

    /// V-store read with the processor's own blocks intercepted. Reading
    /// a status line clears it.
    pub fn read_v_store(&mut self, block: u8, line: u8) -> Result<u64, AccessFault> {
        match block {
            V_BLOCK_PROP => Ok(match line {
                V_LINE_PROGRAM_FAULT_STATUS => {
                    let v = self.program_fault_status;
                    self.program_fault_status = 0;
                    v as u64
                }
                V_LINE_SYSTEM_ERROR_STATUS => {
                    let v = self.system_error_status;
                    self.system_error_status = 0;
                    v as u64
                }
                V_LINE_INSTRUCTION_COUNTER => self.instruction_counter as u64,
                _ => 0,
            }),
            V_BLOCK_SYSTEM => Ok(self
                .link_table
                .get(line as usize)
                .copied()
                .unwrap_or(0)),
            _ => self.store.read_v_store(block, line),
        }
    }

    pub fn write_v_store(&mut self, block: u8, line: u8, value: u64) -> Result<(), AccessFault> {
        match block {
            V_BLOCK_PROP => {
                match line {
                    V_LINE_PROGRAM_FAULT_STATUS => self.program_fault_status = value as u16,
                    V_LINE_SYSTEM_ERROR_STATUS => self.system_error_status = value as u16,
                    V_LINE_INSTRUCTION_COUNTER => self.instruction_counter = value as u32,
                    V_LINE_SOFTWARE_INTERRUPT => {
                        if value != 0 {
                            self.raise(InterruptNumber::SoftwareInterrupt);
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            V_BLOCK_SYSTEM => {
                if let Some(slot) = self.link_table.get_mut(line as usize) {
                    *slot = value;
                }
                Ok(())
            }
            _ => self.store.write_v_store(block, line, value),
        }
    }

    // ---- interrupt machinery -------------------------------------------

    /// External interrupt signal. Numbers above 7 are ignored.
    pub fn set_interrupt(&mut self, number: u8) {
        if number < INTERRUPT_COUNT as u8 {
            self.pending |= 1 << number;
        }
    }

    /// The current interrupt-number signal: lowest pending number, or 255.
    pub fn get_interrupt_number(&self) -> u8 {
        if self.pending == 0 {
            INTERRUPT_NONE
        } else {
            self.pending.trailing_zeros() as u8
        }
    }

    /// An access-rights failure reported by SAC: System Error when
    /// privileged, Illegal Orders for a user program.
    pub fn set_access_violation_interrupt(&mut self) {
        if self.privileged() {
            self.system_error_status |= SES_ACCESS_VIOLATION;
            self.raise(InterruptNumber::SystemError);
        } else {
            self.raise(InterruptNumber::IllegalOrders);
        }
    }

    /// CPR found no mapping. Always raised; under L0IF in privileged mode
    /// it escalates to System Error instead.
    pub fn set_cpr_non_equivalence_interrupt(&mut self) {
        if self.privileged() && self.ms_is_any(MS_L0IF) {
            self.system_error_status |= SES_CPR_NEQ_SUPPRESSED;
            self.raise(InterruptNumber::SystemError);
        } else {
            self.raise(InterruptNumber::CprNotEquivalence);
        }
    }

    /// CPR found more than one mapping: hardware inconsistency, System
    /// Error in every mode.
    pub fn set_cpr_multiple_equivalence_interrupt(&mut self) {
        self.system_error_status |= SES_CPR_MULTIPLE_EQUIVALENCE;
        self.raise(InterruptNumber::SystemError);
    }

    /// System Performance Monitor attention.
    pub fn spm_interrupt(&mut self) {
        self.raise(InterruptNumber::PeripheralWindow);
    }

    /// Console attention: keep the message for the operator and raise the
    /// peripheral window.
    pub fn set_console_peripheral_window_interrupt(&mut self, message: &str) {
        self.console_message = Some(message.to_string());
        self.raise(InterruptNumber::PeripheralWindow);
    }

    pub fn take_console_message(&mut self) -> Option<String> {
        self.console_message.take()
    }

    fn evaluate_interrupts(&mut self) {
        let l0if = self.ms_is_any(MS_L0IF);
        let l1if = self.ms_is_any(MS_L1IF);
        if let Some(n) = highest_pending(self.pending, l0if, l1if) {
            self.enter_interrupt(n);
        }
    }

    /// The entry sequence: save the current link, load the handler's link,
    /// force executive mode and clear only this interrupt's pending flag.
    fn enter_interrupt(&mut self, n: InterruptNumber) {
        let link = pack_link(self.regs.ms, self.regs.nb, self.regs.co);
        self.link_table[link_return_line(n) as usize] = link;
        let entry = self.link_table[link_entry_line(n) as usize];
        let (ms, nb, co) = unpack_link(entry);
        self.regs.ms = ms | MS_EXEC;
        self.regs.nb = nb;
        self.regs.co = co & !1;
        self.pending &= !(1 << n as u8);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{cpu_with_program, word};
    use super::*;
    use crate::cpu::decode::{FN_ADD, FN_LOAD, CR_B};

    #[test]
    fn reset_zeroes_the_register_file() {
        let mut cpu = Cpu::new();
        cpu.regs.b = 42;
        cpu.regs.ms = MS_EXEC | MS_BN;
        cpu.set_interrupt(3);
        cpu.reset_state();
        assert_eq!(cpu.regs, Registers::default());
        assert_eq!(cpu.get_interrupt_number(), INTERRUPT_NONE);
    }

    #[test]
    fn sequential_orders_advance_co_by_their_length() {
        let mut cpu = cpu_with_program(&[
            word(CR_B, FN_LOAD, 0, 5),          // 1 word
            word(CR_B, FN_ADD, 7, 0), 0x0007,   // extended literal, 2 words
        ]);
        cpu.execute_next_order();
        assert_eq!(cpu.regs.co, 0x1002);
        cpu.execute_next_order();
        assert_eq!(cpu.regs.co, 0x1006);
        assert_eq!(cpu.regs.b, 12);
    }

    #[test]
    fn user_ms_writes_keep_privileged_bits() {
        let mut cpu = Cpu::new();
        cpu.regs.ms = 0;
        cpu.load_ms(0xFFFF);
        assert_eq!(cpu.regs.ms, MS_USER_WRITABLE);
        cpu.regs.ms = MS_EXEC;
        cpu.load_ms(0xFFFF);
        assert_eq!(cpu.regs.ms, 0xFFFF);
    }

    #[test]
    fn interrupt_entry_saves_and_loads_links() {
        let mut cpu = Cpu::new();
        cpu.regs.co = 0x0002_0010;
        cpu.regs.nb = 0x1234;
        cpu.regs.ms = 0;
        // Handler entry: CO 0x3000 in segment 1, NB 0x0100.
        let entry = pack_link(0, 0x0100, 0x0001_3000);
        cpu.write_v_store(
            V_BLOCK_SYSTEM,
            link_entry_line(InterruptNumber::ProgramFaults),
            entry,
        )
        .unwrap();
        cpu.raise(InterruptNumber::ProgramFaults);
        cpu.evaluate_interrupts();
        assert_eq!(cpu.regs.co, 0x0001_3000);
        assert_eq!(cpu.regs.nb, 0x0100);
        assert!(cpu.executive());
        let saved = cpu
            .read_v_store(V_BLOCK_SYSTEM, link_return_line(InterruptNumber::ProgramFaults))
            .unwrap();
        assert_eq!(unpack_link(saved), (0, 0x1234, 0x0002_0010));
        // Only this interrupt's flag was cleared.
        assert_eq!(cpu.get_interrupt_number(), INTERRUPT_NONE);
    }

    #[test]
    fn entering_one_interrupt_leaves_others_pending() {
        let mut cpu = Cpu::new();
        cpu.raise(InterruptNumber::ProgramFaults);
        cpu.raise(InterruptNumber::SoftwareInterrupt);
        cpu.evaluate_interrupts();
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::SoftwareInterrupt as u8
        );
    }

    #[test]
    fn l1if_defers_level_one_until_cleared() {
        let mut cpu = Cpu::new();
        cpu.regs.ms = MS_L1IF;
        cpu.raise(InterruptNumber::ProgramFaults);
        cpu.evaluate_interrupts();
        // Still pending, not entered.
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::ProgramFaults as u8
        );
        cpu.regs.ms = 0;
        cpu.evaluate_interrupts();
        assert_eq!(cpu.get_interrupt_number(), INTERRUPT_NONE);
        assert!(cpu.executive());
    }

    #[test]
    fn fetch_fault_freezes_co_for_reexecution() {
        // CO points past the end of core: the flat store reports a
        // violation in executive mode, which is a system error.
        let mut cpu = Cpu::new();
        cpu.regs.ms = MS_EXEC;
        cpu.regs.co = 0x00FF_0000;
        let event = cpu.execute_next_order();
        assert_eq!(event, StepEvent::Abandoned);
        // CO unchanged until the handler link load; the saved return link
        // addresses the failed order itself.
        let saved = cpu
            .read_v_store(V_BLOCK_SYSTEM, link_return_line(InterruptNumber::SystemError))
            .unwrap();
        let (_, _, co) = unpack_link(saved);
        assert_eq!(co, 0x00FF_0000);
    }

    #[test]
    fn status_lines_read_and_clear() {
        let mut cpu = Cpu::new();
        cpu.regs.ms = 0;
        cpu.record_fault(Fault::BOverflow);
        let first = cpu
            .read_v_store(V_BLOCK_PROP, V_LINE_PROGRAM_FAULT_STATUS)
            .unwrap();
        assert_ne!(first, 0);
        let second = cpu
            .read_v_store(V_BLOCK_PROP, V_LINE_PROGRAM_FAULT_STATUS)
            .unwrap();
        assert_eq!(second, 0);
        // The BOD condition bit survives the status read.
        assert_ne!(cpu.regs.bod & BOD_OVERFLOW, 0);
    }

    #[test]
    fn clearing_bod_does_not_clear_a_raised_interrupt() {
        let mut cpu = Cpu::new();
        cpu.regs.ms = 0;
        cpu.record_fault(Fault::BOverflow);
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::ProgramFaults as u8
        );
        cpu.write_register(REG_BOD, 0).unwrap();
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::ProgramFaults as u8
        );
    }

    #[test]
    fn writing_a_condition_bit_into_bod_raises_like_the_condition() {
        let mut cpu = Cpu::new();
        cpu.regs.ms = 0;
        cpu.write_register(REG_BOD, BOD_ZERO_DIVIDE as u64).unwrap();
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::ProgramFaults as u8
        );
    }

    #[test]
    fn write_register_rejects_unknown_and_readonly_ids() {
        let mut cpu = Cpu::new();
        assert_eq!(cpu.write_register(40, 1), Err(CpuError::UnknownRegister(40)));
        assert_eq!(
            cpu.write_register(REG_CO, 1),
            Err(CpuError::ReadOnlyRegister(REG_CO))
        );
    }

    #[test]
    fn software_interrupt_line_raises_level_one() {
        let mut cpu = Cpu::new();
        cpu.write_v_store(V_BLOCK_PROP, V_LINE_SOFTWARE_INTERRUPT, 1)
            .unwrap();
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::SoftwareInterrupt as u8
        );
    }

    #[test]
    fn instruction_counter_reaching_zero_interrupts() {
        let mut cpu = cpu_with_program(&[
            word(CR_B, FN_LOAD, 0, 1),
            word(CR_B, FN_LOAD, 0, 2),
        ]);
        cpu.regs.ms = 0; // user mode, counting enabled
        cpu.write_v_store(V_BLOCK_PROP, V_LINE_INSTRUCTION_COUNTER, 2)
            .unwrap();
        cpu.execute_next_order();
        assert_eq!(cpu.get_interrupt_number(), INTERRUPT_NONE);
        cpu.execute_next_order();
        // Counter hit zero; the interrupt was entered at the retire poll.
        assert!(cpu.executive());
    }

    #[test]
    fn console_message_rides_the_peripheral_window() {
        let mut cpu = Cpu::new();
        cpu.set_console_peripheral_window_interrupt("attention");
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::PeripheralWindow as u8
        );
        assert_eq!(cpu.take_console_message().as_deref(), Some("attention"));
        assert_eq!(cpu.take_console_message(), None);
    }

    /// A store whose segment 0x00FF has no CPR mapping.
    struct HoleStore(CoreStore);

    impl HoleStore {
        fn check(addr: u32) -> Result<(), AccessFault> {
            if addr >> 16 == 0x00FF {
                Err(AccessFault::NotEquivalent(addr))
            } else {
                Ok(())
            }
        }
    }

    impl Store for HoleStore {
        fn read_8(&mut self, addr: u32) -> Result<u8, AccessFault> {
            Self::check(addr)?;
            self.0.read_8(addr)
        }
        fn write_8(&mut self, addr: u32, value: u8) -> Result<(), AccessFault> {
            Self::check(addr)?;
            self.0.write_8(addr, value)
        }
        fn read_16(&mut self, addr: u32) -> Result<u16, AccessFault> {
            Self::check(addr)?;
            self.0.read_16(addr)
        }
        fn write_16(&mut self, addr: u32, value: u16) -> Result<(), AccessFault> {
            Self::check(addr)?;
            self.0.write_16(addr, value)
        }
        fn read_32(&mut self, addr: u32) -> Result<u32, AccessFault> {
            Self::check(addr)?;
            self.0.read_32(addr)
        }
        fn write_32(&mut self, addr: u32, value: u32) -> Result<(), AccessFault> {
            Self::check(addr)?;
            self.0.write_32(addr, value)
        }
        fn read_64(&mut self, addr: u32) -> Result<u64, AccessFault> {
            Self::check(addr)?;
            self.0.read_64(addr)
        }
        fn write_64(&mut self, addr: u32, value: u64) -> Result<(), AccessFault> {
            Self::check(addr)?;
            self.0.write_64(addr, value)
        }
        fn read_v_store(&mut self, block: u8, line: u8) -> Result<u64, AccessFault> {
            self.0.read_v_store(block, line)
        }
        fn write_v_store(&mut self, block: u8, line: u8, value: u64) -> Result<(), AccessFault> {
            self.0.write_v_store(block, line, value)
        }
    }

    #[test]
    fn operand_neq_freezes_co_at_the_failing_order() {
        // The order itself fetches fine; its 32-bit variable operand lives
        // in the unmapped segment.
        let mut cpu = Cpu::with_store(HoleStore(CoreStore::new()));
        cpu.regs.co = 0x1000;
        cpu.regs.sn = 0x00FF;
        cpu.regs.nb = 0x4000;
        cpu.store
            .0
            .write_16(0x1000, word(decode::CR_B, FN_LOAD, 2, 0))
            .unwrap();
        let event = cpu.execute_next_order();
        assert_eq!(event, StepEvent::Abandoned);
        // The CPR-NEQ handler was entered with a return link addressing
        // the failed order, so a refill-and-return re-executes it.
        let saved = cpu
            .read_v_store(
                V_BLOCK_SYSTEM,
                link_return_line(InterruptNumber::CprNotEquivalence),
            )
            .unwrap();
        let (_, _, co) = unpack_link(saved);
        assert_eq!(co, 0x1000);
        // B was never loaded.
        assert_eq!(cpu.regs.b, 0);
    }

    #[test]
    fn cpr_neq_is_itself_unless_l0if_in_privileged_mode() {
        let mut cpu = Cpu::new();
        cpu.regs.ms = 0;
        cpu.set_cpr_non_equivalence_interrupt();
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::CprNotEquivalence as u8
        );

        let mut cpu = Cpu::new();
        cpu.regs.ms = MS_EXEC;
        cpu.set_cpr_non_equivalence_interrupt();
        assert_eq!(
            cpu.get_interrupt_number(),
            InterruptNumber::CprNotEquivalence as u8
        );

        let mut cpu = Cpu::new();
        cpu.regs.ms = MS_EXEC | MS_L0IF;
        cpu.set_cpr_non_equivalence_interrupt();
        assert_eq!(cpu.get_interrupt_number(), InterruptNumber::SystemError as u8);
    }
}
