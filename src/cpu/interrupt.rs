//! Interrupt numbers, fault conditions and their classification.
//!
//! Every fault condition funnels through [`classify`], a pure function of
//! the condition and the relevant mode/inhibit/route bits. The caller
//! records sticky status bits and raises the chosen interrupt; nothing in
//! here touches machine state.

/// Interrupt numbers, in priority order (lowest wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptNumber {
    SystemError = 0,
    CprNotEquivalence = 1,
    Exchange = 2,
    PeripheralWindow = 3,
    InstructionCountZero = 4,
    IllegalOrders = 5,
    ProgramFaults = 6,
    SoftwareInterrupt = 7,
}

/// Value of the interrupt-number signal when nothing is pending.
pub const INTERRUPT_NONE: u8 = 255;

pub const INTERRUPT_COUNT: usize = 8;

/// Interrupts masked by L0IF. System Error is never masked.
const L0IF_MASKED: u8 = 0b0000_1110;
/// Level-1 interrupts, masked by either inhibit bit.
const LEVEL1: u8 = 0b1111_0000;

/// Pick the interrupt to enter, if any: the lowest pending number that the
/// current inhibit bits do not mask.
pub fn highest_pending(pending: u8, l0if: bool, l1if: bool) -> Option<InterruptNumber> {
    let mut masked = 0u8;
    if l0if {
        masked |= L0IF_MASKED | LEVEL1;
    }
    if l1if {
        masked |= LEVEL1;
    }
    let live = pending & !masked;
    if live == 0 {
        return None;
    }
    let n = live.trailing_zeros() as u8;
    Some(match n {
        0 => InterruptNumber::SystemError,
        1 => InterruptNumber::CprNotEquivalence,
        2 => InterruptNumber::Exchange,
        3 => InterruptNumber::PeripheralWindow,
        4 => InterruptNumber::InstructionCountZero,
        5 => InterruptNumber::IllegalOrders,
        6 => InterruptNumber::ProgramFaults,
        _ => InterruptNumber::SoftwareInterrupt,
    })
}

/// Program Fault Status bits (PROP V-line).
pub const PFS_B_ERROR: u16 = 0x0001;
pub const PFS_ACC_ERROR: u16 = 0x0002;
pub const PFS_D_ERROR: u16 = 0x0004;
pub const PFS_NAME_ADDER_OVERFLOW: u16 = 0x0008;
pub const PFS_CONTROL_ADDER_OVERFLOW: u16 = 0x0010;
pub const PFS_ILLEGAL_FUNCTION: u16 = 0x0020;
pub const PFS_ILLEGAL_V_STORE_ACCESS: u16 = 0x0040;

/// System Error Status bits (PROP V-line).
pub const SES_B_ERROR: u16 = 0x0001;
pub const SES_ACC_ERROR: u16 = 0x0002;
pub const SES_D_ERROR: u16 = 0x0004;
pub const SES_NAME_ADDER_OVERFLOW: u16 = 0x0008;
pub const SES_CONTROL_ADDER_OVERFLOW: u16 = 0x0010;
pub const SES_ILLEGAL_FUNCTION: u16 = 0x0020;
pub const SES_ACCESS_VIOLATION: u16 = 0x0040;
pub const SES_CPR_NEQ_SUPPRESSED: u16 = 0x0080;
pub const SES_CPR_MULTIPLE_EQUIVALENCE: u16 = 0x0100;

/// Fault conditions subject to uniform classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    BOverflow,
    BZeroDivide,
    AccFixedOverflow,
    AccDecimalOverflow,
    AccFloatOverflow,
    AccFloatUnderflow,
    AccZeroDivide,
    IllegalTypeSize,
    ShortSourceString,
    BoundsCheck,
    NameAdderOverflow,
    ControlAdderOverflow,
    IllegalFunction,
    /// Store through the B-modified descriptor destination pairing, which
    /// the hardware does not implement. System Error in every mode.
    UnsupportedDestination,
    IllegalVStoreAccess,
}

/// Fault-register families, matching the MS route bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    B,
    Acc,
    /// Descriptor unit, plus the name/control adders.
    D,
    /// Order-level conditions with no unit register behind them.
    Order,
}

impl Fault {
    pub fn family(self) -> Family {
        match self {
            Fault::BOverflow | Fault::BZeroDivide => Family::B,
            Fault::AccFixedOverflow
            | Fault::AccDecimalOverflow
            | Fault::AccFloatOverflow
            | Fault::AccFloatUnderflow
            | Fault::AccZeroDivide => Family::Acc,
            Fault::IllegalTypeSize
            | Fault::ShortSourceString
            | Fault::BoundsCheck
            | Fault::NameAdderOverflow
            | Fault::ControlAdderOverflow => Family::D,
            Fault::IllegalFunction
            | Fault::UnsupportedDestination
            | Fault::IllegalVStoreAccess => Family::Order,
        }
    }

    /// The sticky status bit recorded for this condition; identical
    /// layouts are used for the program-fault and system-error lines.
    pub fn status_bit(self) -> u16 {
        match self {
            Fault::BOverflow | Fault::BZeroDivide => PFS_B_ERROR,
            Fault::AccFixedOverflow
            | Fault::AccDecimalOverflow
            | Fault::AccFloatOverflow
            | Fault::AccFloatUnderflow
            | Fault::AccZeroDivide => PFS_ACC_ERROR,
            Fault::IllegalTypeSize | Fault::ShortSourceString | Fault::BoundsCheck => PFS_D_ERROR,
            Fault::NameAdderOverflow => PFS_NAME_ADDER_OVERFLOW,
            Fault::ControlAdderOverflow => PFS_CONTROL_ADDER_OVERFLOW,
            Fault::IllegalFunction | Fault::UnsupportedDestination => PFS_ILLEGAL_FUNCTION,
            Fault::IllegalVStoreAccess => PFS_ILLEGAL_V_STORE_ACCESS,
        }
    }
}

/// Mode and inhibit inputs to classification, extracted by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyInputs {
    /// Executive mode, or either interrupt-inhibit level set.
    pub privileged: bool,
    /// The family's route-to-system-error MS bit.
    pub routed: bool,
    /// The condition's own inhibit bit (AOD/BOD/DOD).
    pub condition_inhibited: bool,
    /// The global program-fault inhibit MS bit.
    pub program_fault_inhibited: bool,
}

/// What becomes of a fault condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Sticky bits only; no interrupt.
    Record,
    RaiseSystemError,
    RaiseProgramFault,
    RaiseIllegalOrders,
}

/// The uniform classification rule. Order-level faults ignore the inhibit
/// machinery: a privileged program issuing an undefined order is a system
/// error, a user program an illegal order.
pub fn classify(fault: Fault, inputs: ClassifyInputs) -> Disposition {
    if fault == Fault::UnsupportedDestination {
        return Disposition::RaiseSystemError;
    }
    match fault.family() {
        Family::Order => {
            if inputs.privileged {
                Disposition::RaiseSystemError
            } else {
                Disposition::RaiseIllegalOrders
            }
        }
        _ => {
            if inputs.privileged {
                if inputs.routed {
                    Disposition::RaiseSystemError
                } else {
                    Disposition::Record
                }
            } else if inputs.condition_inhibited || inputs.program_fault_inhibited {
                Disposition::Record
            } else {
                Disposition::RaiseProgramFault
            }
        }
    }
}

/// Interrupt link packing: `MS<<48 | NB<<32 | CO`.
pub fn pack_link(ms: u16, nb: u16, co: u32) -> u64 {
    ((ms as u64) << 48) | ((nb as u64) << 32) | co as u64
}

pub fn unpack_link(link: u64) -> (u16, u16, u32) {
    ((link >> 48) as u16, (link >> 32) as u16, link as u32)
}

/// V-store blocks the processor answers for itself.
pub const V_BLOCK_PROP: u8 = 0;
pub const V_BLOCK_SYSTEM: u8 = 1;

/// PROP block lines.
pub const V_LINE_PROGRAM_FAULT_STATUS: u8 = 0;
pub const V_LINE_SYSTEM_ERROR_STATUS: u8 = 1;
pub const V_LINE_INSTRUCTION_COUNTER: u8 = 2;
pub const V_LINE_SOFTWARE_INTERRUPT: u8 = 3;

/// System block: interrupt number n owns lines 2n (return address) and
/// 2n+1 (entry point).
pub fn link_return_line(n: InterruptNumber) -> u8 {
    (n as u8) * 2
}

pub fn link_entry_line(n: InterruptNumber) -> u8 {
    (n as u8) * 2 + 1
}
