//! The recursive ("formatted") bytecode representation.
//!
//! A flat opcode stream is awkward to rewrite: splicing instructions means
//! fixing up every jump offset that crossed the edit. This tree form makes
//! conditionals and loops first-class nodes with owned child blocks, so a
//! splice only has to touch the block it lands in.

use crate::opcode::Opcode;

/// One element of a formatted bytecode block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// A non-structural opcode with its flat argument list.
    Flat { op: Opcode, args: Vec<i64> },
    /// `IF`, `IF_ERROR`, `IF_NOT_ERROR`, `MATCH_ANY` (no flag arg) or
    /// `IF_LT`, `IF_GE`, `IF_LT_DYNAMIC`, `IF_GE_DYNAMIC`, `MATCH_STRING`,
    /// `MATCH_STRING_IC`, `MATCH_CHAR_CLASS` (one flag arg).
    Cond {
        op: Opcode,
        arg: Option<i64>,
        then_block: Block,
        else_block: Block,
    },
    /// `WHILE_NOT_ERROR body`.
    Loop { body: Block },
}

/// An ordered sequence of elements. Child blocks are always owned, never
/// shared, so a visitor holding `&mut Block` can freely splice it.
pub type Block = Vec<Element>;

impl Element {
    pub fn op(&self) -> Opcode {
        match self {
            Element::Flat { op, .. } => *op,
            Element::Cond { op, .. } => *op,
            Element::Loop { .. } => Opcode::WHILE_NOT_ERROR,
        }
    }

    pub fn flat(op: Opcode, args: impl Into<Vec<i64>>) -> Element {
        Element::Flat { op, args: args.into() }
    }

    /// True if this conditional's both branches contain nothing but
    /// `POP`/`POP_N`/`NIP` — the "pops only" shape a handful of peephole
    /// rules special-case (spec.md §4.4's "both branches pops only" rule,
    /// and the cheap-block test used by conditional fusion).
    pub fn is_pops_only_block(block: &[Element]) -> bool {
        block.iter().all(|e| matches!(e, Element::Flat { op, .. } if op.is_slot_killer()))
    }
}

/// A declarative rewrite a visitor wants applied to the block it observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    /// The visitor mutated the tree in place (e.g. rewrote an opcode's
    /// argument) without changing the element count; no splice needed, but
    /// the driver should still note that a change happened.
    Mutated,
    /// Replace `block[start_offset .. start_offset + length]` with
    /// `replacements`.
    Splice {
        start_offset: usize,
        length: usize,
        replacements: Vec<Element>,
    },
}

impl Modification {
    pub fn splice(start_offset: usize, length: usize, replacements: Vec<Element>) -> Self {
        Self::Splice { start_offset, length, replacements }
    }

    pub fn delete(start_offset: usize, length: usize) -> Self {
        Self::Splice { start_offset, length, replacements: Vec::new() }
    }

    pub fn replace_one(start_offset: usize, replacement: Element) -> Self {
        Self::Splice { start_offset, length: 1, replacements: vec![replacement] }
    }

    /// Where the driver should resume after applying this modification.
    /// `fallback` is whatever the next instruction pointer would have been
    /// had this modification not existed. A `Mutated` changed no element
    /// count, so `fallback` is already correct; a `Splice` resumes right
    /// after its own replacement content, since none of that content is
    /// ever re-interpreted this pass — every splice's replacements must
    /// already have had their abstract effect applied to `State` by
    /// whoever built the `Modification`.
    pub fn resume_point(&self, fallback: usize) -> usize {
        match self {
            Modification::Mutated => fallback,
            Modification::Splice { start_offset, replacements, .. } => {
                start_offset + replacements.len()
            }
        }
    }

    /// Apply this modification to `block`, returning the net change in
    /// element count at `start_offset` (how much the caller's instruction
    /// pointer should be adjusted by).
    pub fn apply(self, block: &mut Block) -> isize {
        match self {
            Modification::Mutated => 0,
            Modification::Splice { start_offset, length, replacements } => {
                let delta = replacements.len() as isize - length as isize;
                block.splice(start_offset..start_offset + length, replacements);
                delta
            }
        }
    }
}
