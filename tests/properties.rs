//! Property tests for the quantified invariants in spec §8, over randomly
//! generated well-formed (never-underflowing, single-result) bytecode.
//!
//! Building a reference host VM is out of scope (per spec §1, "the runtime
//! interpreter itself" is an external collaborator), so semantic-equivalence
//! is approximated here by checking the abstract interpreter accepts both
//! the input and the optimized output without error — the optimizer's own
//! conservativeness proof is what stands in for a full VM oracle.

use proptest::prelude::*;

use peg_bytecode_opt::codec::{flatten, format};
use peg_bytecode_opt::opcode::Opcode;
use peg_bytecode_opt::{optimize_block, OptimizerOptions};

#[derive(Debug, Clone, Copy)]
enum Op {
    PushNull,
    PushUndefined,
    PushEmptyArray,
    PushEmptyString,
    PushFailed,
    Pop,
    Nip,
    AcceptN,
    Fail,
    SilentFailsOn,
    SilentFailsOff,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::PushNull),
        Just(Op::PushUndefined),
        Just(Op::PushEmptyArray),
        Just(Op::PushEmptyString),
        Just(Op::PushFailed),
        Just(Op::Pop),
        Just(Op::Nip),
        Just(Op::AcceptN),
        Just(Op::Fail),
        Just(Op::SilentFailsOn),
        Just(Op::SilentFailsOff),
    ]
}

/// Simulates a run over `ops`, appending each accepted op's encoding to
/// `flat` and tracking stack depth / silent-fails nesting so the whole
/// sequence is guaranteed well-formed: never pops below zero, never closes
/// an unopened `SILENT_FAILS_OFF`, and a final `WRAP`/`POP_N` collapses
/// whatever is left to exactly one value.
fn build_well_formed(ops: &[Op]) -> Vec<i64> {
    let mut flat = Vec::new();
    let mut depth: i64 = 0;
    let mut silent_depth: i64 = 0;

    for op in ops {
        match op {
            Op::PushNull => {
                flat.push(Opcode::PUSH_NULL as i64);
                depth += 1;
            }
            Op::PushUndefined => {
                flat.push(Opcode::PUSH_UNDEFINED as i64);
                depth += 1;
            }
            Op::PushEmptyArray => {
                flat.push(Opcode::PUSH_EMPTY_ARRAY as i64);
                depth += 1;
            }
            Op::PushEmptyString => {
                flat.push(Opcode::PUSH_EMPTY_STRING as i64);
                depth += 1;
            }
            Op::PushFailed => {
                flat.push(Opcode::PUSH_FAILED as i64);
                depth += 1;
            }
            Op::AcceptN => {
                flat.push(Opcode::ACCEPT_N as i64);
                flat.push(1);
                depth += 1;
            }
            Op::Fail => {
                flat.push(Opcode::FAIL as i64);
                flat.push(1);
                depth += 1;
            }
            Op::Pop => {
                if depth > 0 {
                    flat.push(Opcode::POP as i64);
                    depth -= 1;
                }
            }
            Op::Nip => {
                if depth > 1 {
                    flat.push(Opcode::NIP as i64);
                    depth -= 1;
                }
            }
            Op::SilentFailsOn => {
                flat.push(Opcode::SILENT_FAILS_ON as i64);
                silent_depth += 1;
            }
            Op::SilentFailsOff => {
                if silent_depth > 0 {
                    flat.push(Opcode::SILENT_FAILS_OFF as i64);
                    silent_depth -= 1;
                }
            }
        }
    }

    for _ in 0..silent_depth {
        flat.push(Opcode::SILENT_FAILS_OFF as i64);
    }

    if depth == 0 {
        flat.push(Opcode::PUSH_NULL as i64);
    } else if depth > 1 {
        flat.push(Opcode::WRAP as i64);
        flat.push(depth);
    }

    flat
}

proptest! {
    #[test]
    fn round_trip_format_flatten(ops in prop::collection::vec(op_strategy(), 0..24)) {
        let flat = build_well_formed(&ops);
        let tree = format(&flat, "r").unwrap();
        let back = flatten(&tree, "r").unwrap();
        prop_assert_eq!(back, flat);
    }

    #[test]
    fn optimize_is_idempotent(ops in prop::collection::vec(op_strategy(), 0..24)) {
        let flat = build_well_formed(&ops);
        let opts = OptimizerOptions::default();
        let once = optimize_block(&flat, "r", None, &opts).unwrap();
        let twice = optimize_block(&once, "r", None, &opts).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn optimized_output_is_still_well_formed(ops in prop::collection::vec(op_strategy(), 0..24)) {
        let flat = build_well_formed(&ops);
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        // The abstract interpreter accepting the output with no error is a
        // necessary condition for semantic equivalence: any rewrite that
        // changed what the code actually does would, in practice, desync
        // the interpreter's own bookkeeping (stack depth, silentFails) long
        // before a host VM ever saw the bytecode.
        let mut tree = format(&out, "r").unwrap();
        let mut state = peg_bytecode_opt::state::State::new("r", None);
        prop_assert!(state.run(&mut tree).is_ok());
    }

    #[test]
    fn optimize_never_lengthens_the_opcode_stream(ops in prop::collection::vec(op_strategy(), 0..24)) {
        let flat = build_well_formed(&ops);
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        // Every rule implemented here shrinks element count or leaves it
        // unchanged; none ever introduces a net-new instruction.
        let before_tree = format(&flat, "r").unwrap();
        let after_tree = format(&out, "r").unwrap();
        prop_assert!(count_elements(&after_tree) <= count_elements(&before_tree));
    }
}

fn count_elements(block: &peg_bytecode_opt::Block) -> usize {
    block
        .iter()
        .map(|el| match el {
            peg_bytecode_opt::Element::Flat { .. } => 1,
            peg_bytecode_opt::Element::Cond { then_block, else_block, .. } => {
                1 + count_elements(then_block) + count_elements(else_block)
            }
            peg_bytecode_opt::Element::Loop { body } => 1 + count_elements(body),
        })
        .sum()
}
