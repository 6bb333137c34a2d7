//! The arithmetic/logic register units: B and X (32-bit fixed point) and
//! the accumulator A, run as 64-bit fixed point by CR 3 and as a floating
//! double image by CR 4.
//!
//! Results wrap on overflow; the condition is recorded in the unit's fault
//! register and classified, never unwound. The float unit converts an
//! operand narrower than 64 bits from its signed integer value; a full
//! 64-bit operand is taken as a double image directly.

use super::decode::{self, Order};
use super::interrupt::Fault;
use super::operand::Resolved;
use super::{Cpu, Flow, OrderResult, MS_TOVF};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit32 {
    B,
    X,
}

impl Unit32 {
    fn overflow(self) -> Fault {
        match self {
            Unit32::B => Fault::BOverflow,
            Unit32::X => Fault::AccFixedOverflow,
        }
    }

    fn zero_divide(self) -> Fault {
        match self {
            Unit32::B => Fault::BZeroDivide,
            Unit32::X => Fault::AccZeroDivide,
        }
    }
}

impl<S: Store> Cpu<S> {
    pub(crate) fn exec_arith(&mut self, order: &Order) -> OrderResult<Flow> {
        match order.cr {
            decode::CR_B => self.exec_fixed32(order, Unit32::B),
            decode::CR_X => self.exec_fixed32(order, Unit32::X),
            decode::CR_A_DEC => self.exec_fixed64(order),
            _ => self.exec_float(order),
        }
    }

    fn get32(&self, unit: Unit32) -> i32 {
        match unit {
            Unit32::B => self.regs.b as i32,
            Unit32::X => self.regs.x as i32,
        }
    }

    fn set32(&mut self, unit: Unit32, value: i32) {
        match unit {
            Unit32::B => self.regs.b = value as u32,
            Unit32::X => self.regs.x = value as u32,
        }
    }

    /// Truncate a wide result to 32 bits, recording overflow when the
    /// value does not fit.
    fn fit32(&mut self, unit: Unit32, wide: i64) -> i32 {
        if wide > i32::MAX as i64 || wide < (i32::MIN as i64) {
            self.record_fault(unit.overflow());
        }
        wide as i32
    }

    /// Compare and set the test bits; B/X also report the overflow test
    /// bit, with no interrupt attached.
    fn compare_test(&mut self, diff: i64, with_tovf: bool) {
        self.set_test_bits(diff == 0, diff < 0, diff > 0);
        if with_tovf {
            self.ms_set(
                MS_TOVF,
                diff > i32::MAX as i64 || diff < i32::MIN as i64,
            );
        }
    }

    fn exec_fixed32(&mut self, order: &Order, unit: Unit32) -> OrderResult<Flow> {
        if order.f == decode::FN_STORE {
            let value = self.get32(unit) as i64 as u64;
            self.write_operand(&order.operand, value)?;
            return Ok(Flow::Next);
        }
        let operand = self.resolve_operand(&order.operand)?.signed() as i32;
        let reg = self.get32(unit);
        match order.f {
            decode::FN_LOAD => self.set32(unit, operand),
            decode::FN_STACK_LOAD => {
                self.stack_push(reg as i64 as u64)?;
                self.set32(unit, operand);
            }
            decode::FN_ADD => {
                let r = self.fit32(unit, reg as i64 + operand as i64);
                self.set32(unit, r);
            }
            decode::FN_SUB => {
                let r = self.fit32(unit, reg as i64 - operand as i64);
                self.set32(unit, r);
            }
            decode::FN_RSUB => {
                let r = self.fit32(unit, operand as i64 - reg as i64);
                self.set32(unit, r);
            }
            decode::FN_MUL => {
                let r = self.fit32(unit, reg as i64 * operand as i64);
                self.set32(unit, r);
            }
            decode::FN_DIV => {
                if operand == 0 {
                    self.record_fault(unit.zero_divide());
                } else {
                    let r = self.fit32(unit, reg as i64 / operand as i64);
                    self.set32(unit, r);
                }
            }
            decode::FN_XOR => self.set32(unit, reg ^ operand),
            decode::FN_OR => self.set32(unit, reg | operand),
            decode::FN_AND => self.set32(unit, reg & operand),
            decode::FN_SHIFT => {
                let r = self.shift32(unit, reg, operand);
                self.set32(unit, r);
            }
            decode::FN_COMP => self.compare_test(reg as i64 - operand as i64, true),
            decode::FN_CINC => {
                let r = self.fit32(unit, reg as i64 + 1);
                self.set32(unit, r);
                self.compare_test(r as i64 - operand as i64, true);
            }
            _ => return self.order_fault(Fault::IllegalFunction),
        }
        Ok(Flow::Next)
    }

    /// Positive counts shift left (overflow-checked), negative counts
    /// shift right arithmetically.
    fn shift32(&mut self, unit: Unit32, value: i32, count: i32) -> i32 {
        if count >= 0 {
            let sh = count.min(63) as u32;
            let wide = (value as i128) << sh;
            let result = wide as i32;
            if wide != result as i128 {
                self.record_fault(unit.overflow());
            }
            result
        } else {
            let sh = (-(count as i64)).min(31) as u32;
            value >> sh
        }
    }

    fn exec_fixed64(&mut self, order: &Order) -> OrderResult<Flow> {
        if order.f == decode::FN_STORE {
            let value = self.regs.a;
            self.write_operand(&order.operand, value)?;
            return Ok(Flow::Next);
        }
        let operand = self.resolve_operand(&order.operand)?.signed();
        let reg = self.regs.a as i64;
        match order.f {
            decode::FN_LOAD => self.regs.a = operand as u64,
            decode::FN_STACK_LOAD => {
                self.stack_push(reg as u64)?;
                self.regs.a = operand as u64;
            }
            decode::FN_ADD => self.regs.a = self.fit64(reg as i128 + operand as i128) as u64,
            decode::FN_SUB => self.regs.a = self.fit64(reg as i128 - operand as i128) as u64,
            decode::FN_RSUB => self.regs.a = self.fit64(operand as i128 - reg as i128) as u64,
            decode::FN_MUL => self.regs.a = self.fit64(reg as i128 * operand as i128) as u64,
            decode::FN_DIV => {
                if operand == 0 {
                    self.record_fault(Fault::AccZeroDivide);
                } else {
                    self.regs.a = self.fit64(reg as i128 / operand as i128) as u64;
                }
            }
            decode::FN_XOR => self.regs.a = (reg ^ operand) as u64,
            decode::FN_OR => self.regs.a = (reg | operand) as u64,
            decode::FN_AND => self.regs.a = (reg & operand) as u64,
            decode::FN_SHIFT => self.regs.a = self.shift64(reg, operand) as u64,
            decode::FN_COMP => {
                let diff = reg as i128 - operand as i128;
                self.set_test_bits(diff == 0, diff < 0, diff > 0);
            }
            decode::FN_CINC => {
                let r = self.fit64(reg as i128 + 1);
                self.regs.a = r as u64;
                let diff = r as i128 - operand as i128;
                self.set_test_bits(diff == 0, diff < 0, diff > 0);
            }
            _ => return self.order_fault(Fault::IllegalFunction),
        }
        Ok(Flow::Next)
    }

    fn fit64(&mut self, wide: i128) -> i64 {
        if wide > i64::MAX as i128 || wide < i64::MIN as i128 {
            self.record_fault(Fault::AccDecimalOverflow);
        }
        wide as i64
    }

    fn shift64(&mut self, value: i64, count: i64) -> i64 {
        if count >= 0 {
            let sh = count.min(127) as u32;
            let wide = (value as i128) << sh.min(63);
            let result = wide as i64;
            if wide != result as i128 || (sh > 63 && value != 0) {
                self.record_fault(Fault::AccDecimalOverflow);
            }
            result
        } else {
            let sh = (-(count as i128)).min(63) as u32;
            value >> sh
        }
    }

    /// Operand image for the float unit: full-width store and register
    /// operands are double images, everything narrower (and any literal)
    /// converts from its signed integer value.
    fn float_operand(resolved: Resolved) -> f64 {
        if resolved.bits == 64 && !resolved.literal {
            f64::from_bits(resolved.value)
        } else {
            resolved.signed() as f64
        }
    }

    fn float_check(&mut self, value: f64) -> f64 {
        if value.is_infinite() || value.is_nan() {
            self.record_fault(Fault::AccFloatOverflow);
        } else if value != 0.0 && value.is_subnormal() {
            self.record_fault(Fault::AccFloatUnderflow);
        }
        value
    }

    fn exec_float(&mut self, order: &Order) -> OrderResult<Flow> {
        if order.f == decode::FN_STORE {
            let value = self.regs.a;
            self.write_operand(&order.operand, value)?;
            return Ok(Flow::Next);
        }
        let resolved = self.resolve_operand(&order.operand)?;
        let operand = Self::float_operand(resolved);
        let acc = f64::from_bits(self.regs.a);
        match order.f {
            decode::FN_LOAD => self.regs.a = operand.to_bits(),
            decode::FN_STACK_LOAD => {
                self.stack_push(self.regs.a)?;
                self.regs.a = operand.to_bits();
            }
            decode::FN_ADD => {
                let r = self.float_check(acc + operand);
                self.regs.a = r.to_bits();
            }
            decode::FN_SUB => {
                let r = self.float_check(acc - operand);
                self.regs.a = r.to_bits();
            }
            decode::FN_RSUB => {
                let r = self.float_check(operand - acc);
                self.regs.a = r.to_bits();
            }
            decode::FN_MUL => {
                let r = self.float_check(acc * operand);
                self.regs.a = r.to_bits();
            }
            decode::FN_DIV => {
                if operand == 0.0 {
                    self.record_fault(Fault::AccZeroDivide);
                } else {
                    let r = self.float_check(acc / operand);
                    self.regs.a = r.to_bits();
                }
            }
            decode::FN_XOR => self.regs.a ^= resolved.value,
            decode::FN_OR => self.regs.a |= resolved.value,
            decode::FN_AND => self.regs.a &= resolved.value,
            decode::FN_COMP => match acc.partial_cmp(&operand) {
                Some(ord) => self.set_test_bits(ord.is_eq(), ord.is_lt(), ord.is_gt()),
                None => self.set_test_bits(false, false, false),
            },
            decode::FN_CINC => {
                let r = self.float_check(acc + 1.0);
                self.regs.a = r.to_bits();
                match r.partial_cmp(&operand) {
                    Some(ord) => self.set_test_bits(ord.is_eq(), ord.is_lt(), ord.is_gt()),
                    None => self.set_test_bits(false, false, false),
                }
            }
            // FN_SHIFT has no floating interpretation.
            _ => return self.order_fault(Fault::IllegalFunction),
        }
        Ok(Flow::Next)
    }
}
