//! Organisational unit: control transfer, link management, base-register
//! loads and the boolean orders.
//!
//! Boolean orders compute a new BN from the current BN and a selected test
//! result R. The 16 functions form the complete two-variable truth table:
//! entry (bn, r) of function f is bit `(bn<<1)|r` of f.

use super::decode::{self, Order};
use super::interrupt::{pack_link, unpack_link, Fault};
use super::{
    Cpu, Flow, OrderResult, EXTRACODE_BASE, EXTRACODE_STRIDE, MS_BN, MS_EXEC, MS_T0, MS_T1,
    MS_T2, MS_TOVF, MS_USER_WRITABLE,
};
use crate::store::{join_address, Store};

/// New BN for [function][ (bn << 1) | r ].
pub const CONDITION_TABLE: [[bool; 4]; 16] = [
    [false, false, false, false], // 0: FALSE
    [true, false, false, false],  // 1: NOR
    [false, true, false, false],  // 2: R AND NOT BN
    [true, true, false, false],   // 3: NOT BN
    [false, false, true, false],  // 4: BN AND NOT R
    [true, false, true, false],   // 5: NOT R
    [false, true, true, false],   // 6: XOR
    [true, true, true, false],    // 7: NAND
    [false, false, false, true],  // 8: AND
    [true, false, false, true],   // 9: EQUIV
    [false, true, false, true],   // 10: R
    [true, true, false, true],    // 11: R OR NOT BN
    [false, false, true, true],   // 12: BN
    [true, false, true, true],    // 13: BN OR NOT R
    [false, true, true, true],    // 14: OR
    [true, true, true, true],     // 15: TRUE
];

impl<S: Store> Cpu<S> {
    /// Test input R selected by the low operand bits: T0, T1, T2 or TOVF.
    fn test_input(&mut self, selector: u8) -> OrderResult<bool> {
        let mask = match selector & 0x7 {
            0 => MS_T0,
            1 => MS_T1,
            2 => MS_T2,
            3 => MS_TOVF,
            _ => return self.order_fault(Fault::IllegalFunction),
        };
        Ok(self.ms_is_any(mask))
    }

    fn apply_bn_function(&mut self, func: u8, r: bool) {
        let bn = self.ms_is_any(MS_BN);
        let index = ((bn as usize) << 1) | r as usize;
        let new_bn = CONDITION_TABLE[func as usize & 0xF][index];
        self.ms_set(MS_BN, new_bn);
    }

    /// Boolean orders with the function in the order code (CR 5).
    pub(crate) fn exec_bool(&mut self, order: &Order) -> OrderResult<Flow> {
        let selector = self.resolve_operand(&order.operand)?.value as u8;
        let r = self.test_input(selector)?;
        self.apply_bn_function(order.f, r);
        Ok(Flow::Next)
    }

    pub(crate) fn exec_org(&mut self, order: &Order, next_co: u32) -> OrderResult<Flow> {
        match order.f {
            decode::ORG_REL_JUMP => {
                let offset = self.operand_signed(&order.operand)?;
                let target = self.control_target(self.regs.co, offset)?;
                Ok(Flow::Jump(target))
            }
            decode::ORG_ABS_JUMP => {
                let target = self.resolve_operand(&order.operand)?.value as u32;
                Ok(Flow::Jump(target & !1))
            }
            decode::ORG_BRANCH_TRUE | decode::ORG_BRANCH_FALSE => {
                let offset = self.operand_signed(&order.operand)?;
                let wanted = order.f == decode::ORG_BRANCH_TRUE;
                if self.ms_is_any(MS_BN) == wanted {
                    let target = self.control_target(self.regs.co, offset)?;
                    Ok(Flow::Jump(target))
                } else {
                    Ok(Flow::Next)
                }
            }
            decode::ORG_EXIT => {
                let link = self.resolve_operand(&order.operand)?.value;
                let (ms, nb, co) = unpack_link(link);
                if self.executive() {
                    self.regs.ms = ms;
                } else {
                    // A user-mode return cannot smuggle privileged bits in.
                    self.regs.ms =
                        (self.regs.ms & !MS_USER_WRITABLE) | (ms & MS_USER_WRITABLE);
                }
                self.regs.nb = nb;
                Ok(Flow::Jump(co & !1))
            }
            decode::ORG_XC => {
                let index = self.resolve_operand(&order.operand)?.value as u32 & 0x7;
                if index == 7 {
                    return self.order_fault(Fault::IllegalFunction);
                }
                let link = pack_link(self.regs.ms, self.regs.nb, next_co);
                self.stack_push(link)?;
                self.ms_set(MS_EXEC, true);
                Ok(Flow::Jump(EXTRACODE_BASE + index * EXTRACODE_STRIDE))
            }
            decode::ORG_SETLINK => {
                // Rewrite the CO field of the link on top of the stack.
                let offset = self.operand_signed(&order.operand)?;
                let addr = join_address(self.regs.sn, self.regs.sf);
                let link = self.load_64(addr)?;
                let (ms, nb, co) = unpack_link(link);
                let target = self.control_target(co, offset)?;
                self.store_64(addr, pack_link(ms, nb, target))?;
                Ok(Flow::Next)
            }
            decode::ORG_STACKLINK => {
                let offset = self.operand_signed(&order.operand)?;
                let target = self.control_target(next_co, offset)?;
                let link = pack_link(self.regs.ms, self.regs.nb, target);
                self.stack_push(link)?;
                Ok(Flow::Next)
            }
            decode::ORG_MS_LOAD => {
                let value = self.resolve_operand(&order.operand)?.value as u16;
                self.load_ms(value);
                Ok(Flow::Next)
            }
            decode::ORG_BN_FN_OPERAND => {
                // Function in operand bits 4-7, test selector in bits 0-2.
                let value = self.resolve_operand(&order.operand)?.value;
                let r = self.test_input(value as u8)?;
                self.apply_bn_function((value >> 4) as u8 & 0xF, r);
                Ok(Flow::Next)
            }
            decode::ORG_NB_LOAD => {
                let value = self.resolve_operand(&order.operand)?.value as u16;
                self.regs.nb = value;
                Ok(Flow::Next)
            }
            decode::ORG_NB_PLUS => {
                let delta = self.operand_signed(&order.operand)?;
                let addr = self.name_address(self.regs.nb, delta)?;
                self.regs.nb = addr as u16;
                Ok(Flow::Next)
            }
            decode::ORG_XNB_LOAD => {
                let value = self.resolve_operand(&order.operand)?.value as u16;
                self.regs.xnb = value;
                Ok(Flow::Next)
            }
            decode::ORG_XNB_PLUS => {
                let delta = self.operand_signed(&order.operand)?;
                let addr = self.name_address(self.regs.xnb, delta)?;
                self.regs.xnb = addr as u16;
                Ok(Flow::Next)
            }
            decode::ORG_SF_LOAD => {
                let value = self.resolve_operand(&order.operand)?.value as u16;
                self.regs.sf = value;
                Ok(Flow::Next)
            }
            _ => {
                let delta = self.operand_signed(&order.operand)?;
                let addr = self.name_address(self.regs.sf, delta)?;
                self.regs.sf = addr as u16;
                Ok(Flow::Next)
            }
        }
    }
}
