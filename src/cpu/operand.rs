//! Operand resolution.
//!
//! Turns a decoded [`OperandKind`] into a value (with its significant
//! width) or a destination write. Descriptor-relative kinds load D as a
//! side effect, except K=6 which deliberately goes through the descriptor
//! already in D without reloading it.

use super::decode::{ExtBase, OperandKind};
use super::descriptor::{Descriptor, DESC_TYPE_MISCELLANEOUS};
use super::interrupt::Fault;
use super::{Cpu, OrderResult};
use crate::store::{join_address, split_address, Store};

/// A resolved operand value and the number of significant bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub value: u64,
    pub bits: u32,
    /// The operand was a literal, not a store or register image. The
    /// float unit converts literals numerically.
    pub literal: bool,
}

impl Resolved {
    pub fn wide(value: u64) -> Self {
        Self {
            value,
            bits: 64,
            literal: false,
        }
    }

    pub fn literal(value: i64) -> Self {
        Self {
            value: value as u64,
            bits: 64,
            literal: true,
        }
    }

    /// The value sign-extended from its width.
    pub fn signed(&self) -> i64 {
        if self.bits >= 64 {
            self.value as i64
        } else {
            let shift = 64 - self.bits;
            ((self.value << shift) as i64) >> shift
        }
    }
}

impl<S: Store> Cpu<S> {
    /// `base + delta` bytes with the 16-bit segment-offset check.
    fn address_plus(&mut self, base: u32, delta: i64) -> OrderResult<u32> {
        let (seg, off) = split_address(base);
        let offset = off as i64 + delta;
        if !(0..=0xFFFF).contains(&offset) {
            return self.order_fault(Fault::NameAdderOverflow);
        }
        Ok(join_address(seg, offset as u16))
    }

    /// Effective base address of an extended operand, or None for the
    /// stack kind (which pops or pushes instead of addressing).
    fn ext_base_address(&mut self, base: ExtBase) -> OrderResult<Option<u32>> {
        let sn = self.regs.sn;
        Ok(Some(match base {
            ExtBase::Nb => join_address(sn, self.regs.nb),
            ExtBase::Xnb => join_address(sn, self.regs.xnb),
            ExtBase::Zero => join_address(sn, 0),
            ExtBase::Sf => join_address(sn, self.regs.sf),
            ExtBase::Stack => return Ok(None),
            ExtBase::NbRef => {
                let at = join_address(sn, self.regs.nb);
                self.load_32(at)?
            }
            ExtBase::XnbRef => {
                let at = join_address(sn, self.regs.xnb);
                self.load_32(at)?
            }
        }))
    }

    /// The signed modifier taken from B.
    fn b_modifier(&self) -> i64 {
        self.regs.b as i32 as i64
    }

    /// Load the descriptor named at `addr` into D and return it.
    fn load_descriptor_from(&mut self, addr: u32) -> OrderResult<Descriptor> {
        let word = self.load_64(addr)?;
        self.regs.d = word;
        Ok(Descriptor::from_word(word))
    }

    /// Read the primary operand.
    pub(crate) fn resolve_operand(&mut self, op: &OperandKind) -> OrderResult<Resolved> {
        match *op {
            OperandKind::Literal(v) => Ok(Resolved::literal(v as i64)),
            OperandKind::ExtLiteral(v) => Ok(Resolved::literal(v)),
            OperandKind::InternalRegister(n) | OperandKind::ExtInternalRegister(n) => {
                let (value, bits) = self.internal_read(n);
                Ok(Resolved { value, bits, literal: false })
            }
            OperandKind::Variable32(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 4)?;
                let value = self.load_32(addr)? as u64;
                Ok(Resolved { value, bits: 32, literal: false })
            }
            OperandKind::Variable64(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 8)?;
                Ok(Resolved::wide(self.load_64(addr)?))
            }
            OperandKind::DescriptorB(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 8)?;
                let d = self.load_descriptor_from(addr)?;
                let modifier = self.b_modifier();
                self.descriptor_read_element(d, modifier)
            }
            OperandKind::DescriptorZero(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 8)?;
                let d = self.load_descriptor_from(addr)?;
                self.descriptor_read_element(d, 0)
            }
            OperandKind::DescriptorCurrent(n) => {
                let d = self.descriptor_d();
                self.descriptor_read_element(d, n as i64)
            }
            OperandKind::ExtVariable32 { base, offset } => {
                match self.ext_base_address(base)? {
                    None => {
                        self.stack_offset_must_be_zero(offset)?;
                        let value = self.stack_pop()? as u32 as u64;
                        Ok(Resolved { value, bits: 32, literal: false })
                    }
                    Some(b) => {
                        let addr = self.address_plus(b, offset as i64 * 4)?;
                        let value = self.load_32(addr)? as u64;
                        Ok(Resolved { value, bits: 32, literal: false })
                    }
                }
            }
            OperandKind::ExtVariable64 { base, offset } => {
                match self.ext_base_address(base)? {
                    None => {
                        self.stack_offset_must_be_zero(offset)?;
                        Ok(Resolved::wide(self.stack_pop()?))
                    }
                    Some(b) => {
                        let addr = self.address_plus(b, offset as i64 * 8)?;
                        Ok(Resolved::wide(self.load_64(addr)?))
                    }
                }
            }
            OperandKind::ExtDescriptorB { base, offset } => {
                let d = self.ext_descriptor(base, offset)?;
                let modifier = self.b_modifier();
                self.descriptor_read_element(d, modifier)
            }
            OperandKind::ExtDescriptorZero { base, offset } => {
                let d = self.ext_descriptor(base, offset)?;
                self.descriptor_read_element(d, 0)
            }
            OperandKind::VStore { block, line } => {
                self.require_executive_v_store()?;
                match self.read_v_store(block, line) {
                    Ok(v) => Ok(Resolved::wide(v)),
                    Err(e) => Err(self.access_abandon(e)),
                }
            }
            OperandKind::IllegalOperand => self.order_fault(Fault::IllegalFunction),
        }
    }

    /// The operand as a signed quantity (offsets, modifiers, shifts).
    pub(crate) fn operand_signed(&mut self, op: &OperandKind) -> OrderResult<i64> {
        Ok(self.resolve_operand(op)?.signed())
    }

    /// Write a store-class result back through the operand.
    pub(crate) fn write_operand(&mut self, op: &OperandKind, value: u64) -> OrderResult<()> {
        match *op {
            OperandKind::Literal(_) | OperandKind::ExtLiteral(_) => {
                self.order_fault(Fault::IllegalFunction)
            }
            OperandKind::InternalRegister(n) | OperandKind::ExtInternalRegister(n) => {
                self.write_internal(n, value)
            }
            OperandKind::Variable32(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 4)?;
                self.store_32(addr, value as u32)
            }
            OperandKind::Variable64(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 8)?;
                self.store_64(addr, value)
            }
            // The hardware has no write path through a freshly loaded,
            // B-modified descriptor.
            OperandKind::DescriptorB(_) | OperandKind::ExtDescriptorB { .. } => {
                self.order_fault(Fault::UnsupportedDestination)
            }
            OperandKind::DescriptorZero(n) => {
                let addr = self.name_address(self.regs.nb, n as i64 * 8)?;
                let d = self.load_descriptor_from(addr)?;
                self.descriptor_write_element(d, 0, value)
            }
            OperandKind::DescriptorCurrent(n) => {
                let d = self.descriptor_d();
                self.descriptor_write_element(d, n as i64, value)
            }
            OperandKind::ExtVariable32 { base, offset } => {
                match self.ext_base_address(base)? {
                    None => {
                        self.stack_offset_must_be_zero(offset)?;
                        self.stack_push(value as u32 as i32 as i64 as u64)
                    }
                    Some(b) => {
                        let addr = self.address_plus(b, offset as i64 * 4)?;
                        self.store_32(addr, value as u32)
                    }
                }
            }
            OperandKind::ExtVariable64 { base, offset } => {
                match self.ext_base_address(base)? {
                    None => {
                        self.stack_offset_must_be_zero(offset)?;
                        self.stack_push(value)
                    }
                    Some(b) => {
                        let addr = self.address_plus(b, offset as i64 * 8)?;
                        self.store_64(addr, value)
                    }
                }
            }
            OperandKind::ExtDescriptorZero { base, offset } => {
                let d = self.ext_descriptor(base, offset)?;
                self.descriptor_write_element(d, 0, value)
            }
            OperandKind::VStore { block, line } => {
                self.require_executive_v_store()?;
                match self.write_v_store(block, line, value) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.access_abandon(e)),
                }
            }
            OperandKind::IllegalOperand => self.order_fault(Fault::IllegalFunction),
        }
    }

    fn ext_descriptor(&mut self, base: ExtBase, offset: i16) -> OrderResult<Descriptor> {
        match self.ext_base_address(base)? {
            None => self.order_fault(Fault::IllegalFunction),
            Some(b) => {
                let addr = self.address_plus(b, offset as i64 * 8)?;
                self.load_descriptor_from(addr)
            }
        }
    }

    fn stack_offset_must_be_zero(&mut self, offset: i16) -> OrderResult<()> {
        if offset != 0 {
            return self.order_fault(Fault::IllegalFunction);
        }
        Ok(())
    }

    fn require_executive_v_store(&mut self) -> OrderResult<()> {
        if !self.executive() {
            return self.order_fault(Fault::IllegalVStoreAccess);
        }
        Ok(())
    }

    // ---- descriptor element access -------------------------------------

    fn check_element(&mut self, d: &Descriptor, modifier: i64) -> OrderResult<u32> {
        if d.dtype == DESC_TYPE_MISCELLANEOUS {
            return self.order_fault(Fault::IllegalTypeSize);
        }
        let bits = match d.element_bits() {
            Some(bits) => bits,
            None => return self.order_fault(Fault::IllegalTypeSize),
        };
        if !d.bc && (modifier < 0 || modifier >= d.bound as i64) {
            return self.order_fault(Fault::BoundsCheck);
        }
        Ok(bits)
    }

    /// Read element `modifier` through a descriptor, bounds- and
    /// type-checked, masked to the element width.
    pub(crate) fn descriptor_read_element(
        &mut self,
        d: Descriptor,
        modifier: i64,
    ) -> OrderResult<Resolved> {
        let bits = self.check_element(&d, modifier)?;
        let (addr, shift) = match d.element_location(modifier) {
            Some(loc) => loc,
            None => return self.order_fault(Fault::IllegalTypeSize),
        };
        let value = match bits {
            64 => self.load_64(addr)?,
            32 => self.load_32(addr)? as u64,
            16 => self.load_16(addr)? as u64,
            8 => self.load_8(addr)? as u64,
            _ => {
                let byte = self.load_8(addr)?;
                ((byte >> shift) as u64) & ((1u64 << bits) - 1)
            }
        };
        Ok(Resolved { value, bits, literal: false })
    }

    /// Write element `modifier` through a descriptor. Sub-byte widths
    /// read-modify-write their byte.
    pub(crate) fn descriptor_write_element(
        &mut self,
        d: Descriptor,
        modifier: i64,
        value: u64,
    ) -> OrderResult<()> {
        let bits = self.check_element(&d, modifier)?;
        let (addr, shift) = match d.element_location(modifier) {
            Some(loc) => loc,
            None => return self.order_fault(Fault::IllegalTypeSize),
        };
        match bits {
            64 => self.store_64(addr, value),
            32 => self.store_32(addr, value as u32),
            16 => self.store_16(addr, value as u16),
            8 => self.store_8(addr, value as u8),
            _ => {
                let mask = (((1u16 << bits) - 1) as u8) << shift;
                let old = self.load_8(addr)?;
                let new = (old & !mask) | (((value as u8) << shift) & mask);
                self.store_8(addr, new)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::cpu_with_program;
    use super::super::*;
    use super::*;

    fn cpu() -> Cpu<crate::store::CoreStore> {
        cpu_with_program(&[])
    }

    #[test]
    fn literal_operands_sign_extend() {
        let mut cpu = cpu();
        let r = cpu.resolve_operand(&OperandKind::Literal(-5)).unwrap();
        assert_eq!(r.signed(), -5);
        let r = cpu.resolve_operand(&OperandKind::ExtLiteral(1 << 40)).unwrap();
        assert_eq!(r.signed(), 1 << 40);
    }

    #[test]
    fn named_variables_round_trip() {
        let mut cpu = cpu();
        cpu.write_operand(&OperandKind::Variable32(3), 0xAABB_CCDD)
            .unwrap();
        let r = cpu.resolve_operand(&OperandKind::Variable32(3)).unwrap();
        assert_eq!(r.value, 0xAABB_CCDD);
        assert_eq!(r.bits, 32);

        cpu.write_operand(&OperandKind::Variable64(2), 0x0102_0304_0506_0708)
            .unwrap();
        let r = cpu.resolve_operand(&OperandKind::Variable64(2)).unwrap();
        assert_eq!(r.value, 0x0102_0304_0506_0708);
    }

    #[test]
    fn nonexistent_internal_registers_read_zero_and_refuse_writes() {
        let mut cpu = cpu();
        let r = cpu.resolve_operand(&OperandKind::InternalRegister(33)).unwrap();
        assert_eq!(r.value, 0);
        let err = cpu.write_operand(&OperandKind::InternalRegister(33), 1);
        assert_eq!(err, Err(Abandon::Order));
        assert_ne!(
            cpu.get_interrupt_number(),
            crate::cpu::interrupt::INTERRUPT_NONE
        );
    }

    #[test]
    fn literal_destinations_are_illegal() {
        let mut cpu = cpu();
        assert_eq!(
            cpu.write_operand(&OperandKind::Literal(1), 0),
            Err(Abandon::Order)
        );
    }

    #[test]
    fn descriptor_kind_loads_d_and_reads_the_element() {
        let mut cpu = cpu();
        // Vector of 32-bit elements at 0x6000, bound 4.
        let desc = Descriptor::new(0, 4, 4, 0x6000);
        let name = cpu.name_address(cpu.regs.nb, 8).unwrap();
        cpu.store.write_64(name, desc.to_word()).unwrap();
        cpu.store.write_32(0x6008, 0x1234_5678).unwrap();
        cpu.regs.b = 2;
        let r = cpu.resolve_operand(&OperandKind::DescriptorB(1)).unwrap();
        assert_eq!(r.value, 0x1234_5678);
        assert_eq!(cpu.regs.d, desc.to_word());
    }

    #[test]
    fn descriptor_current_does_not_reload_d() {
        let mut cpu = cpu();
        let desc = Descriptor::new(0, 2, 8, 0x6100); // byte elements
        cpu.regs.d = desc.to_word();
        cpu.store.write_8(0x6103, 0x5A).unwrap();
        let r = cpu
            .resolve_operand(&OperandKind::DescriptorCurrent(3))
            .unwrap();
        assert_eq!(r.value, 0x5A);
        assert_eq!(cpu.regs.d, desc.to_word());
    }

    #[test]
    fn out_of_bound_modifiers_fault() {
        let mut cpu = cpu();
        let desc = Descriptor::new(0, 4, 2, 0x6000);
        cpu.regs.d = desc.to_word();
        assert_eq!(
            cpu.resolve_operand(&OperandKind::DescriptorCurrent(2)),
            Err(Abandon::Order)
        );
        assert_ne!(cpu.regs.dod & DOD_BOUNDS, 0);
    }

    #[test]
    fn bc_flag_disables_the_bounds_check() {
        let mut cpu = cpu();
        let mut desc = Descriptor::new(0, 2, 1, 0x6200);
        desc.bc = true;
        cpu.regs.d = desc.to_word();
        cpu.store.write_8(0x6205, 0x77).unwrap();
        let r = cpu
            .resolve_operand(&OperandKind::DescriptorCurrent(5))
            .unwrap();
        assert_eq!(r.value, 0x77);
    }

    #[test]
    fn type_three_and_bad_sizes_are_its() {
        let mut cpu = cpu();
        let desc = Descriptor::new(DESC_TYPE_MISCELLANEOUS, 2, 4, 0x6000);
        cpu.regs.d = desc.to_word();
        assert_eq!(
            cpu.resolve_operand(&OperandKind::DescriptorCurrent(0)),
            Err(Abandon::Order)
        );
        assert_ne!(cpu.regs.dod & DOD_ITS, 0);

        let mut cpu = cpu_with_program(&[]);
        let desc = Descriptor::new(0, 7, 4, 0x6000);
        cpu.regs.d = desc.to_word();
        assert_eq!(
            cpu.resolve_operand(&OperandKind::DescriptorCurrent(0)),
            Err(Abandon::Order)
        );
    }

    #[test]
    fn sub_byte_elements_round_trip_across_byte_edges() {
        let mut cpu = cpu();
        // 4-bit elements, origin = bit address of 0x6300.
        let desc = Descriptor::new(0, 1, 16, 0x6300 * 8);
        cpu.regs.d = desc.to_word();
        for (i, v) in [(0i64, 0x9u64), (1, 0xA), (2, 0xB), (3, 0xC)] {
            cpu.descriptor_write_element(desc, i, v).unwrap();
        }
        for (i, v) in [(0i64, 0x9u64), (1, 0xA), (2, 0xB), (3, 0xC)] {
            let r = cpu.descriptor_read_element(desc, i).unwrap();
            assert_eq!(r.value, v, "element {}", i);
        }
        // Elements 0/1 share a byte, LSB-first.
        assert_eq!(cpu.store.read_8(0x6300).unwrap(), 0xA9);
        assert_eq!(cpu.store.read_8(0x6301).unwrap(), 0xCB);
    }

    #[test]
    fn one_bit_elements_address_individual_bits() {
        let mut cpu = cpu();
        let desc = Descriptor::new(0, 0, 32, 0x6400 * 8 + 6);
        cpu.regs.d = desc.to_word();
        cpu.descriptor_write_element(desc, 0, 1).unwrap();
        cpu.descriptor_write_element(desc, 2, 1).unwrap();
        assert_eq!(cpu.store.read_8(0x6400).unwrap(), 0x40);
        assert_eq!(cpu.store.read_8(0x6401).unwrap(), 0x01);
        assert_eq!(cpu.descriptor_read_element(desc, 1).unwrap().value, 0);
        assert_eq!(cpu.descriptor_read_element(desc, 2).unwrap().value, 1);
    }

    #[test]
    fn stack_kind_pushes_and_pops() {
        let mut cpu = cpu();
        let dst = OperandKind::ExtVariable64 {
            base: ExtBase::Stack,
            offset: 0,
        };
        let sf0 = cpu.regs.sf;
        cpu.write_operand(&dst, 0xFEED).unwrap();
        assert_eq!(cpu.regs.sf, sf0 + 8);
        let r = cpu.resolve_operand(&dst).unwrap();
        assert_eq!(r.value, 0xFEED);
        assert_eq!(cpu.regs.sf, sf0);
    }

    #[test]
    fn stack_kind_rejects_nonzero_offsets() {
        let mut cpu = cpu();
        let op = OperandKind::ExtVariable64 {
            base: ExtBase::Stack,
            offset: 1,
        };
        assert_eq!(cpu.resolve_operand(&op), Err(Abandon::Order));
    }

    #[test]
    fn back_reference_bases_indirect_through_the_name() {
        let mut cpu = cpu();
        // The 32-bit word at SN:NB holds the address of a table.
        let nb_addr = join_address(cpu.regs.sn, cpu.regs.nb);
        cpu.store.write_32(nb_addr, 0x7000).unwrap();
        cpu.store.write_32(0x7008, 0xCAFE).unwrap();
        let op = OperandKind::ExtVariable32 {
            base: ExtBase::NbRef,
            offset: 2,
        };
        assert_eq!(cpu.resolve_operand(&op).unwrap().value, 0xCAFE);
    }

    #[test]
    fn name_adder_overflow_is_recorded() {
        let mut cpu = cpu();
        cpu.regs.ms = 0; // user mode: the fault becomes a program fault
        cpu.regs.nb = 0xFFF0;
        assert_eq!(
            cpu.resolve_operand(&OperandKind::Variable64(60)),
            Err(Abandon::Order)
        );
        let pfs = cpu
            .read_v_store(
                crate::cpu::interrupt::V_BLOCK_PROP,
                crate::cpu::interrupt::V_LINE_PROGRAM_FAULT_STATUS,
            )
            .unwrap();
        assert_ne!(pfs & crate::cpu::interrupt::PFS_NAME_ADDER_OVERFLOW as u64, 0);
    }

    #[test]
    fn v_store_kind_requires_executive_mode() {
        let mut cpu = cpu();
        cpu.regs.ms = 0;
        let op = OperandKind::VStore { block: 4, line: 1 };
        assert_eq!(cpu.resolve_operand(&op), Err(Abandon::Order));
        assert_eq!(
            cpu.get_interrupt_number(),
            crate::cpu::interrupt::InterruptNumber::IllegalOrders as u8
        );

        let mut cpu = cpu_with_program(&[]);
        cpu.store.write_v_store(4, 1, 99).unwrap();
        assert_eq!(cpu.resolve_operand(&op).unwrap().value, 99);
    }

    #[test]
    fn b_relative_destinations_are_a_system_error_everywhere() {
        for exec in [false, true] {
            let mut cpu = cpu();
            cpu.regs.ms = if exec { MS_EXEC } else { 0 };
            let desc = Descriptor::new(0, 4, 4, 0x6000);
            let name = cpu.name_address(cpu.regs.nb, 0).unwrap();
            cpu.store.write_64(name, desc.to_word()).unwrap();
            assert_eq!(
                cpu.write_operand(&OperandKind::DescriptorB(0), 1),
                Err(Abandon::Order)
            );
            assert_eq!(
                cpu.get_interrupt_number(),
                crate::cpu::interrupt::InterruptNumber::SystemError as u8
            );
        }
    }
}
