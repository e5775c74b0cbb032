//! Peephole and dataflow optimizer for a PEG bytecode virtual machine.
//!
//! A rule's compiled bytecode comes in as a flat `i64` stream (the same
//! encoding the VM executes directly). [`driver::optimize_block`] parses it
//! into a recursive tree ([`bytecode::Block`]), runs an abstract-interpreting
//! peephole pass ([`state::State::run`]) and a block-local dead-slot pass
//! ([`dead_slot::remove_dead_slots`]) to a fixed point, and flattens the
//! result back to the wire encoding.
//!
//! Nothing here executes untrusted bytecode; [`error::OptError`] exists to
//! reject malformed *input* to the optimizer itself, not to model runtime
//! failures of the rules being optimized.

pub mod bytecode;
pub mod codec;
pub mod dead_slot;
pub mod driver;
pub mod error;
pub mod grammar;
pub mod opcode;
pub mod print;
pub mod state;
pub mod value;
pub mod visit;

pub use bytecode::{Block, Element, Modification};
pub use driver::{optimize_block, OptimizerOptions, OutputMode};
pub use error::{OptError, OptResult};
pub use grammar::{GrammarHints, RuleMatch};
pub use opcode::Opcode;
