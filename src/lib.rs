//! # MU5 Emulator
//!
//! An instruction-level emulator of the central processor of the
//! Manchester MU5 (1972) mainframe: order fetch and decode,
//! descriptor-based virtual addressing, the arithmetic and string
//! execution units, and the two-level interrupt and fault-classification
//! engine.
//!
//! Storage and address translation live behind the [`Store`] trait, so
//! the processor runs against the flat [`CoreStore`] and a full SAC/CPR
//! model alike.

pub mod cpu;
pub mod store;

// Re-export commonly used types
pub use cpu::decode::{OperandKind, Order};
pub use cpu::descriptor::Descriptor;
pub use cpu::interrupt::{Disposition, Fault, InterruptNumber, INTERRUPT_NONE};
pub use cpu::{Cpu, CpuError, Registers, StepEvent};
pub use store::{AccessFault, CoreStore, Store};
