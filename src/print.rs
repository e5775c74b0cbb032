//! Human-readable dumps of formatted bytecode, for `--log` diagnostics.
//!
//! Grounded on `cfg_printer.rs`'s pattern of a small struct wrapping a
//! borrowed IR and a `write(&self, w: &mut dyn Write)` method, rather than
//! building the whole string up front.

use std::fmt::{self, Write};

use log::debug;

use crate::bytecode::{Block, Element};
use crate::codec::format;

/// Pretty-prints one formatted block, indenting `Cond`/`Loop` children and
/// annotating each flat opcode with the net stack-depth delta it leaves
/// behind (`Opcode::stack_effect`) and the running depth that results.
///
/// A conditional's two branches are each walked starting from the depth on
/// entry to the `Cond`; a loop's body is walked the same way but the depth
/// it leaves is discarded rather than carried past the loop, since a
/// well-formed loop body is required to be depth-neutral for the
/// interpreter's fixpoint to converge at all (`State::equal` checks stack
/// length), so the depth after the loop is always the depth before it.
pub struct BlockPrinter<'a> {
    block: &'a Block,
}

impl<'a> BlockPrinter<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self { block }
    }

    pub fn write(&self, w: &mut dyn Write) -> fmt::Result {
        let mut stack_depth = 0i64;
        Self::write_block(w, self.block, 0, &mut stack_depth)
    }

    fn write_block(w: &mut dyn Write, block: &Block, depth: usize, stack_depth: &mut i64) -> fmt::Result {
        for el in block {
            Self::write_element(w, el, depth, stack_depth)?;
        }
        Ok(())
    }

    fn write_element(w: &mut dyn Write, el: &Element, depth: usize, stack_depth: &mut i64) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match el {
            Element::Flat { op, args } => {
                let delta = op.stack_effect(args);
                *stack_depth += delta;
                let sign = if delta >= 0 { "+" } else { "" };
                if args.is_empty() {
                    writeln!(w, "{pad}{op}  ; {sign}{delta} -> depth {stack_depth}")?;
                } else {
                    let args_str =
                        args.iter().map(i64::to_string).collect::<Vec<_>>().join(" ");
                    writeln!(w, "{pad}{op} {args_str}  ; {sign}{delta} -> depth {stack_depth}")?;
                }
            }
            Element::Cond { op, arg, then_block, else_block } => {
                match arg {
                    Some(a) => writeln!(w, "{pad}{op} {a} {{")?,
                    None => writeln!(w, "{pad}{op} {{")?,
                }
                let mut then_depth = *stack_depth;
                Self::write_block(w, then_block, depth + 1, &mut then_depth)?;
                writeln!(w, "{pad}}} else {{")?;
                let mut else_depth = *stack_depth;
                Self::write_block(w, else_block, depth + 1, &mut else_depth)?;
                writeln!(w, "{pad}}}")?;
                *stack_depth = then_depth;
            }
            Element::Loop { body } => {
                writeln!(w, "{pad}WHILE_NOT_ERROR {{")?;
                let mut body_depth = *stack_depth;
                Self::write_block(w, body, depth + 1, &mut body_depth)?;
                writeln!(w, "{pad}}}")?;
            }
        }
        Ok(())
    }
}

impl<'a> fmt::Display for BlockPrinter<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f)
    }
}

/// Logs a before/after dump of one rule's optimization at `debug` level.
///
/// Falls back to the raw flat stream when a side fails to parse back into
/// a tree (shouldn't happen for well-formed input, but a diagnostic dump
/// must never be the thing that turns a real error into a panic).
pub fn dump(rule_name: &str, before: &[i64], after: &[i64]) {
    let before_str = render(rule_name, before);
    let after_str = render(rule_name, after);
    debug!("== {rule_name} ==\n-- before --\n{before_str}-- after --\n{after_str}");
}

fn render(rule_name: &str, flat: &[i64]) -> String {
    match format(flat, rule_name) {
        Ok(block) => BlockPrinter::new(&block).to_string(),
        Err(_) => format!("{flat:?}\n"),
    }
}
