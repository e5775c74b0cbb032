//! Bidirectional conversion between the flat opcode stream and the
//! formatted-bytecode tree, with the structural validation spec.md §4.2
//! requires of both directions.

use crate::bytecode::{Block, Element};
use crate::error::{OptError, OptResult};
use crate::opcode::{ArgShape, CondArgCount, Opcode};

/// Parse a flat opcode stream into a formatted-bytecode block.
pub fn format(flat: &[i64], rule: &str) -> OptResult<Block> {
    let mut cursor = Cursor { flat, pos: 0, rule };
    let block = cursor.format_block(flat.len())?;
    Ok(block)
}

struct Cursor<'a> {
    flat: &'a [i64],
    pos: usize,
    rule: &'a str,
}

impl<'a> Cursor<'a> {
    fn take(&mut self) -> OptResult<i64> {
        let v = self.flat.get(self.pos).copied().ok_or_else(|| {
            OptError::malformed_tree(self.rule, "unexpected end of opcode stream")
        })?;
        self.pos += 1;
        Ok(v)
    }

    fn take_n(&mut self, n: usize) -> OptResult<Vec<i64>> {
        (0..n).map(|_| self.take()).collect()
    }

    /// Parse elements until `self.pos` reaches `end` exactly.
    fn format_block(&mut self, end: usize) -> OptResult<Block> {
        let mut block = Vec::new();
        while self.pos < end {
            block.push(self.format_element()?);
        }
        if self.pos != end {
            return Err(OptError::malformed_tree(
                self.rule,
                "element overran its enclosing block boundary",
            ));
        }
        Ok(block)
    }

    fn format_element(&mut self) -> OptResult<Element> {
        let raw = self.take()?;
        let op_byte = u8::try_from(raw)
            .map_err(|_| OptError::invalid_opcode(self.rule, raw))?;
        let op = Opcode::from_u8(op_byte).ok_or_else(|| OptError::invalid_opcode(self.rule, raw))?;

        if let Some(cond_arity) = op.conditional_arg_count() {
            let arg = match cond_arity {
                CondArgCount::Zero => None,
                CondArgCount::One => Some(self.take()?),
            };
            let len_then = usize::try_from(self.take()?)
                .map_err(|_| OptError::malformed_tree(self.rule, "negative then-length"))?;
            let len_else = usize::try_from(self.take()?)
                .map_err(|_| OptError::malformed_tree(self.rule, "negative else-length"))?;
            let then_start = self.pos;
            let then_end = then_start + len_then;
            let else_end = then_end + len_else;
            if else_end > self.flat.len() {
                return Err(OptError::malformed_tree(
                    self.rule,
                    "conditional child length exceeds remaining stream",
                ));
            }
            let then_block = self.format_block(then_end)?;
            let else_block = self.format_block(else_end)?;
            return Ok(Element::Cond { op, arg, then_block, else_block });
        }

        if op.is_loop() {
            let len_body = usize::try_from(self.take()?)
                .map_err(|_| OptError::malformed_tree(self.rule, "negative loop-body length"))?;
            let body_end = self.pos + len_body;
            if body_end > self.flat.len() {
                return Err(OptError::malformed_tree(
                    self.rule,
                    "loop body length exceeds remaining stream",
                ));
            }
            let body = self.format_block(body_end)?;
            return Ok(Element::Loop { body });
        }

        let args = match op.arg_shape() {
            ArgShape::Fixed(n) => self.take_n(n)?,
            ArgShape::SelfDescribing { header_len } => {
                let mut header = self.take_n(header_len)?;
                let trailing = usize::try_from(header[header_len - 1]).map_err(|_| {
                    OptError::malformed_tree(self.rule, "negative self-describing arg count")
                })?;
                let trailing_args = self.take_n(trailing)?;
                header.extend(trailing_args);
                header
            }
        };
        Ok(Element::Flat { op, args })
    }
}

/// Flatten a formatted-bytecode block back into a flat opcode stream,
/// recomputing every conditional/loop length from the actual child sizes.
pub fn flatten(block: &Block, rule: &str) -> OptResult<Vec<i64>> {
    let mut out = Vec::new();
    flatten_into(block, rule, &mut out)?;
    Ok(out)
}

fn flatten_into(block: &Block, rule: &str, out: &mut Vec<i64>) -> OptResult<()> {
    for element in block {
        flatten_element(element, rule, out)?;
    }
    Ok(())
}

fn flatten_element(element: &Element, rule: &str, out: &mut Vec<i64>) -> OptResult<()> {
    match element {
        Element::Flat { op, args } => {
            validate_flat_arity(*op, args, rule)?;
            out.push(*op as i64);
            out.extend_from_slice(args);
            Ok(())
        }
        Element::Cond { op, arg, then_block, else_block } => {
            let wants_arg = matches!(op.conditional_arg_count(), Some(CondArgCount::One));
            if wants_arg != arg.is_some() {
                return Err(OptError::malformed_tree(
                    rule,
                    format!("{op} conditional's flag argument does not match its arity"),
                ));
            }
            let mut then_bytes = Vec::new();
            flatten_into(then_block, rule, &mut then_bytes)?;
            let mut else_bytes = Vec::new();
            flatten_into(else_block, rule, &mut else_bytes)?;

            out.push(*op as i64);
            if let Some(arg) = arg {
                out.push(*arg);
            }
            out.push(then_bytes.len() as i64);
            out.push(else_bytes.len() as i64);
            out.extend(then_bytes);
            out.extend(else_bytes);
            Ok(())
        }
        Element::Loop { body } => {
            let mut body_bytes = Vec::new();
            flatten_into(body, rule, &mut body_bytes)?;
            out.push(Opcode::WHILE_NOT_ERROR as i64);
            out.push(body_bytes.len() as i64);
            out.extend(body_bytes);
            Ok(())
        }
    }
}

fn validate_flat_arity(op: Opcode, args: &[i64], rule: &str) -> OptResult<()> {
    match op.arg_shape() {
        ArgShape::Fixed(n) => {
            if args.len() != n {
                return Err(OptError::malformed_tree(
                    rule,
                    format!("{op} expected {n} argument(s), found {}", args.len()),
                ));
            }
        }
        ArgShape::SelfDescribing { header_len } => {
            if args.len() < header_len {
                return Err(OptError::malformed_tree(
                    rule,
                    format!("{op} is missing its self-describing header"),
                ));
            }
            let declared = usize::try_from(args[header_len - 1]).map_err(|_| {
                OptError::malformed_tree(rule, format!("{op} has a negative trailing count"))
            })?;
            if args.len() != header_len + declared {
                return Err(OptError::malformed_tree(
                    rule,
                    format!(
                        "{op} declares {declared} trailing argument(s) but has {}",
                        args.len() - header_len
                    ),
                ));
            }
        }
    }
    Ok(())
}
