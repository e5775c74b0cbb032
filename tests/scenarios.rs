//! End-to-end scenarios driven entirely through the public `optimize_block`
//! entry point, one rule named "r" at a time.

use peg_bytecode_opt::{optimize_block, OptimizerOptions, OutputMode, Opcode};

fn opt(flat: &[i64]) -> Vec<i64> {
    optimize_block(flat, "r", None, &OptimizerOptions::default()).unwrap()
}

#[test]
fn dead_push_pop_collapses_to_nothing() {
    let flat = vec![
        Opcode::PUSH_NULL as i64,
        Opcode::PUSH_UNDEFINED as i64,
        Opcode::PUSH_EMPTY_ARRAY as i64,
        Opcode::PUSH_EMPTY_STRING as i64,
        Opcode::POP as i64,
        Opcode::POP as i64,
        Opcode::POP as i64,
        Opcode::POP as i64,
    ];
    assert!(opt(&flat).is_empty());
}

#[test]
fn dead_push_pop_n_collapses_to_nothing() {
    let flat = vec![
        Opcode::PUSH_NULL as i64,
        Opcode::PUSH_UNDEFINED as i64,
        Opcode::PUSH_EMPTY_ARRAY as i64,
        Opcode::PUSH_EMPTY_STRING as i64,
        Opcode::POP_N as i64,
        4,
    ];
    assert!(opt(&flat).is_empty());
}

#[test]
fn always_true_if_collapses_to_then() {
    let flat = vec![
        Opcode::PUSH_EMPTY_ARRAY as i64,
        Opcode::IF as i64,
        2,
        2,
        Opcode::ACCEPT_N as i64,
        1,
        Opcode::FAIL as i64,
        1,
    ];
    assert_eq!(opt(&flat), vec![Opcode::PUSH_EMPTY_ARRAY as i64, Opcode::ACCEPT_N as i64, 1]);
}

#[test]
fn always_false_if_collapses_to_else() {
    let flat = vec![
        Opcode::PUSH_NULL as i64,
        Opcode::IF as i64,
        2,
        2,
        Opcode::ACCEPT_N as i64,
        1,
        Opcode::FAIL as i64,
        1,
    ];
    assert_eq!(opt(&flat), vec![Opcode::PUSH_NULL as i64, Opcode::FAIL as i64, 1]);
}

#[test]
fn nested_silent_fails_flatten_to_one_pair() {
    let flat = vec![
        Opcode::SILENT_FAILS_ON as i64,
        Opcode::SILENT_FAILS_ON as i64,
        Opcode::RULE as i64,
        1,
        Opcode::SILENT_FAILS_OFF as i64,
        Opcode::SILENT_FAILS_OFF as i64,
    ];
    assert_eq!(
        opt(&flat),
        vec![
            Opcode::SILENT_FAILS_ON as i64,
            Opcode::RULE as i64,
            1,
            Opcode::SILENT_FAILS_OFF as i64,
        ]
    );
}

#[test]
fn dead_while_loop_is_removed_leaving_its_guard() {
    // The loop's guard is already FAILED, so the loop body never runs and
    // disappears entirely; the value that fed the guard has no consumer
    // left and becomes the rule's sole result.
    let flat = vec![
        Opcode::PUSH_FAILED as i64,
        Opcode::WHILE_NOT_ERROR as i64,
        3,
        Opcode::POP as i64,
        Opcode::ACCEPT_N as i64,
        1,
    ];
    assert_eq!(opt(&flat), vec![Opcode::PUSH_FAILED as i64]);
}

#[test]
fn source_map_output_mode_disables_all_rewrites() {
    let flat = vec![Opcode::PUSH_NULL as i64, Opcode::POP as i64];
    for mode in [OutputMode::SourceAndMap, OutputMode::SourceWithInlineMap] {
        let opts = OptimizerOptions { output_mode: mode, ..Default::default() };
        let out = optimize_block(&flat, "r", None, &opts).unwrap();
        assert_eq!(out, flat);
    }
}

#[test]
fn skip_dead_slot_still_runs_the_peephole_pass() {
    let flat = vec![Opcode::PUSH_NULL as i64, Opcode::POP as i64];
    let opts = OptimizerOptions { skip_dead_slot: true, ..Default::default() };
    let out = optimize_block(&flat, "r", None, &opts).unwrap();
    assert!(out.is_empty());
}

#[test]
fn pop_on_empty_stack_is_a_stack_underflow() {
    let flat = vec![Opcode::POP as i64];
    let err = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap_err();
    assert!(matches!(err, peg_bytecode_opt::OptError::StackUnderflow { .. }));
}

#[test]
fn unknown_opcode_is_rejected() {
    let flat = vec![250];
    let err = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap_err();
    assert!(matches!(err, peg_bytecode_opt::OptError::InvalidOpcode { .. }));
}

#[test]
fn already_optimal_input_is_returned_unchanged() {
    let flat = vec![Opcode::PUSH_NULL as i64, Opcode::ACCEPT_N as i64, 1];
    assert_eq!(opt(&flat), flat);
}

#[test]
fn dead_slot_through_pluck_window_shrinks_the_window() {
    // A const push whose only consumer is a `PLUCK` window that never
    // selects it should be deleted, and the window's surviving indices
    // renumbered to account for the missing slot.
    let flat = vec![
        Opcode::PUSH_CURR_POS as i64,
        Opcode::PUSH_NULL as i64,
        Opcode::ACCEPT_N as i64,
        1,
        Opcode::PLUCK as i64,
        3,
        1,
        0,
    ];
    assert_eq!(
        opt(&flat),
        vec![
            Opcode::PUSH_CURR_POS as i64,
            Opcode::ACCEPT_N as i64,
            1,
            Opcode::PLUCK as i64,
            2,
            1,
            0,
        ]
    );
}
