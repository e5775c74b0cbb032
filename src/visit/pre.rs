//! Pre-interp peephole rules: rewrites that fire on an element and its
//! successor *before* either has been interpreted, so the driver re-runs
//! `interp` on whatever the rewrite left behind instead of double-accounting
//! for its effect.
//!
//! Each rule here is conservative by construction: the replacement sequence
//! has the exact same abstract effect as the sequence it replaces, so it is
//! always safe to apply regardless of what the abstract stack currently
//! holds.

use crate::bytecode::{Block, Element, Modification};
use crate::error::OptResult;
use crate::opcode::Opcode;
use crate::state::State;
use crate::value::T;

/// The exact tag a const-push opcode always produces, for the subset of
/// pushes whose value carries no identity an elision needs to preserve.
/// `PUSH_CURR_POS` is deliberately excluded: its output shares `currPos`'s
/// identity, so popping and re-pushing it is not a no-op in general.
fn singleton_push_tag(op: Opcode) -> Option<T> {
    match op {
        Opcode::PUSH_EMPTY_STRING => Some(T::STRING),
        Opcode::PUSH_UNDEFINED => Some(T::UNDEFINED),
        Opcode::PUSH_NULL => Some(T::NULL),
        Opcode::PUSH_FAILED => Some(T::FAILED),
        Opcode::PUSH_EMPTY_ARRAY => Some(T::ARRAY),
        _ => None,
    }
}

/// Run every pre-interp rule against `block[ip]`/`block[ip + 1]`, returning
/// the first applicable rewrite.
pub fn pre_interp(state: &mut State, block: &mut Block, ip: usize) -> OptResult<Option<Modification>> {
    let Some(cur) = block.get(ip) else { return Ok(None) };
    let next = block.get(ip + 1);

    if let (Element::Flat { op: Opcode::POP, .. }, Some(Element::Flat { op: push_op, .. })) =
        (cur, next)
    {
        if let Some(tag) = singleton_push_tag(*push_op) {
            if state.stack.last().is_some_and(|top| top.must_be(tag)) {
                return Ok(Some(Modification::delete(ip, 2)));
            }
        }
    }

    if let Element::Cond { then_block, else_block, .. } = cur {
        if Element::is_pops_only_block(then_block) && Element::is_pops_only_block(else_block) {
            let replacement = else_block.clone();
            return Ok(Some(Modification::splice(ip, 1, replacement)));
        }
    }

    if let (Element::Flat { op, .. }, Some(Element::Flat { op: Opcode::NIP, .. })) = (cur, next) {
        if op.is_single_value_producer() {
            let push = cur.clone();
            return Ok(Some(Modification::splice(
                ip,
                2,
                vec![Element::flat(Opcode::POP, []), push],
            )));
        }
    }

    if let (
        Element::Flat { op: Opcode::CALL, args },
        Some(Element::Flat { op: Opcode::NIP, .. }),
    ) = (cur, next)
    {
        let mut new_args = args.clone();
        new_args[1] += 1;
        let pc = new_args[2] as usize;
        for p in &mut new_args[3..3 + pc] {
            *p += 1;
        }
        return Ok(Some(Modification::splice(
            ip,
            2,
            vec![Element::Flat { op: Opcode::CALL, args: new_args }],
        )));
    }

    if let (
        Element::Flat { op: Opcode::TEXT, .. },
        Some(Element::Flat { op: Opcode::POP | Opcode::POP_N, .. }),
    ) = (cur, next)
    {
        return Ok(Some(Modification::delete(ip, 1)));
    }

    if let (Element::Flat { op: Opcode::TEXT, .. }, Some(Element::Flat { op: Opcode::NIP, .. })) =
        (cur, next)
    {
        return Ok(Some(Modification::splice(
            ip,
            2,
            vec![Element::flat(Opcode::NIP, []), Element::flat(Opcode::TEXT, [])],
        )));
    }

    if let (
        Element::Flat { op: Opcode::POP_CURR_POS, .. },
        Some(Element::Flat { op: Opcode::PUSH_CURR_POS, .. }),
    ) = (cur, next)
    {
        return Ok(Some(Modification::delete(ip, 2)));
    }

    if let (Element::Flat { op: Opcode::NIP, .. }, Some(Element::Flat { op, args })) = (cur, next) {
        match op {
            Opcode::POP => {
                return Ok(Some(Modification::splice(
                    ip,
                    2,
                    vec![Element::flat(Opcode::POP_N, [2])],
                )))
            }
            Opcode::POP_N => {
                return Ok(Some(Modification::splice(
                    ip,
                    2,
                    vec![Element::flat(Opcode::POP_N, [args[0] + 1])],
                )))
            }
            _ => {}
        }
    }

    if let (
        Element::Flat { op: Opcode::WRAP, args },
        Some(Element::Flat { op: Opcode::POP, .. }),
    ) = (cur, next)
    {
        let n = args[0];
        return Ok(Some(Modification::splice(ip, 2, vec![Element::flat(Opcode::POP_N, [n])])));
    }

    if let (Element::Flat { op: Opcode::PLUCK, args }, Some(Element::Flat { op: Opcode::POP, .. })) =
        (cur, next)
    {
        let n = args[0];
        return Ok(Some(Modification::splice(ip, 2, vec![Element::flat(Opcode::POP_N, [n])])));
    }

    if let (Element::Flat { op: Opcode::WRAP, args }, Some(Element::Flat { op: Opcode::NIP, .. })) =
        (cur, next)
    {
        let n = args[0];
        if n == 1 {
            return Ok(Some(Modification::splice(
                ip,
                2,
                vec![Element::flat(Opcode::NIP, []), Element::flat(Opcode::WRAP, [1])],
            )));
        }
        let mut pluck_args = vec![n + 1, n];
        pluck_args.extend(1..=n);
        return Ok(Some(Modification::splice(
            ip,
            2,
            vec![Element::flat(Opcode::PLUCK, pluck_args)],
        )));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Element;

    fn run(block: Vec<Element>) -> Vec<Element> {
        let mut block = block;
        let mut state = State::new("r", None);
        loop {
            let m = pre_interp(&mut state, &mut block, 0).unwrap();
            match m {
                Some(m) => {
                    m.apply(&mut block);
                }
                None => break,
            }
        }
        block
    }

    #[test]
    fn push_then_nip_becomes_pop_then_push() {
        let out = run(vec![Element::flat(Opcode::PUSH_NULL, []), Element::flat(Opcode::NIP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::POP, []), Element::flat(Opcode::PUSH_NULL, [])]);
    }

    #[test]
    fn accept_n_then_nip_swaps_too() {
        let out = run(vec![Element::flat(Opcode::ACCEPT_N, [1]), Element::flat(Opcode::NIP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::POP, []), Element::flat(Opcode::ACCEPT_N, [1])]);
    }

    #[test]
    fn fail_then_nip_swaps_too() {
        let out = run(vec![Element::flat(Opcode::FAIL, [1]), Element::flat(Opcode::NIP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::POP, []), Element::flat(Opcode::FAIL, [1])]);
    }

    #[test]
    fn pop_then_matching_push_is_elided() {
        let mut state = State::new("r", None);
        state.stack.push(crate::value::AbstractValue::new(T::NULL));
        let mut block = vec![Element::flat(Opcode::POP, []), Element::flat(Opcode::PUSH_NULL, [])];
        let m = pre_interp(&mut state, &mut block, 0).unwrap();
        assert_eq!(m, Some(Modification::delete(0, 2)));
    }

    #[test]
    fn pop_then_mismatched_push_is_untouched() {
        let mut state = State::new("r", None);
        state.stack.push(crate::value::AbstractValue::new(T::UNDEFINED));
        let mut block = vec![Element::flat(Opcode::POP, []), Element::flat(Opcode::PUSH_NULL, [])];
        let m = pre_interp(&mut state, &mut block, 0).unwrap();
        assert_eq!(m, None);
    }

    #[test]
    fn pops_only_conditional_collapses_to_else() {
        let mut state = State::new("r", None);
        let mut block = vec![Element::Cond {
            op: Opcode::IF,
            arg: None,
            then_block: vec![Element::flat(Opcode::POP, [])],
            else_block: vec![Element::flat(Opcode::POP_N, [2])],
        }];
        let m = pre_interp(&mut state, &mut block, 0).unwrap().expect("should collapse");
        assert_eq!(m, Modification::splice(0, 1, vec![Element::flat(Opcode::POP_N, [2])]));
    }

    #[test]
    fn text_then_pop_drops_text() {
        let out = run(vec![Element::flat(Opcode::TEXT, []), Element::flat(Opcode::POP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::POP, [])]);
    }

    #[test]
    fn text_then_nip_swaps() {
        let out = run(vec![Element::flat(Opcode::TEXT, []), Element::flat(Opcode::NIP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::NIP, []), Element::flat(Opcode::TEXT, [])]);
    }

    #[test]
    fn nip_then_pop_n_merges() {
        let out = run(vec![Element::flat(Opcode::NIP, []), Element::flat(Opcode::POP_N, [3])]);
        assert_eq!(out, vec![Element::flat(Opcode::POP_N, [4])]);
    }

    #[test]
    fn wrap_then_pop_collapses_to_pop_n() {
        let out = run(vec![Element::flat(Opcode::WRAP, [3]), Element::flat(Opcode::POP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::POP_N, [3])]);
    }

    #[test]
    fn wrap_n_then_nip_becomes_pluck() {
        let out = run(vec![Element::flat(Opcode::WRAP, [2]), Element::flat(Opcode::NIP, [])]);
        assert_eq!(out, vec![Element::flat(Opcode::PLUCK, [3, 2, 1, 2])]);
    }

    #[test]
    fn call_then_nip_absorbs_discard() {
        let out = run(vec![
            Element::flat(Opcode::CALL, [5, 2, 1, 0]),
            Element::flat(Opcode::NIP, []),
        ]);
        assert_eq!(out, vec![Element::flat(Opcode::CALL, [5, 3, 1, 1])]);
    }
}
