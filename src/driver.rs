//! The top-level entry point: drives the peephole visitors and the
//! dead-slot pass to a fixed point per rule, the way `context.rs`'s
//! `Context` runs its own pipeline of passes to a fixed point.

use std::collections::HashSet;
use std::rc::Rc;

use log::{debug, trace};

use crate::bytecode::Block;
use crate::codec::{flatten, format};
use crate::dead_slot::remove_dead_slots;
use crate::error::OptResult;
use crate::grammar::GrammarHints;
use crate::print::dump;
use crate::state::State;
use crate::visit::{post_interp, pre_interp};

/// What the host toolchain asked this rule's output to carry. Spec §6:
/// the optimizer is a no-op whenever a source map was requested, since the
/// rewrites it performs are not (yet) reflected in emitted source-map
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Source,
    SourceAndMap,
    SourceWithInlineMap,
}

impl OutputMode {
    fn wants_source_map(self) -> bool {
        matches!(self, OutputMode::SourceAndMap | OutputMode::SourceWithInlineMap)
    }
}

/// Explicit configuration threaded into [`optimize_block`] — no global or
/// thread-local state, per spec.md §9's "No global state" note and the
/// teacher's habit of passing a `Flags`/`Context` value rather than reading
/// statics.
#[derive(Debug, Clone, Default)]
pub struct OptimizerOptions {
    pub output_mode: OutputMode,
    /// Opt-in per-rule diagnostic dump. `None` disables logging outright;
    /// `Some(set)` where `set` is empty enables it for every rule; a
    /// non-empty set enables it only for the named rules.
    pub log_rules: Option<HashSet<String>>,
    pub skip_dead_slot: bool,
    /// Safety cap on the outer visitors/dead-slot fixpoint loop, per the
    /// open question in spec.md §9. `None` means uncapped.
    pub max_outer_iterations: Option<usize>,
}

impl OptimizerOptions {
    fn should_log(&self, rule_name: &str) -> bool {
        match &self.log_rules {
            None => false,
            Some(set) => set.is_empty() || set.contains(rule_name),
        }
    }
}

/// Optimize one rule's flat opcode stream to a fixed point.
///
/// Returns the input unchanged (not even re-encoded) when `opts.output_mode`
/// requests a source map, matching spec.md §6's external-interface contract.
pub fn optimize_block(
    flat: &[i64],
    rule_name: &str,
    hints: Option<&GrammarHints>,
    opts: &OptimizerOptions,
) -> OptResult<Vec<i64>> {
    if opts.output_mode.wants_source_map() {
        trace!("{rule_name}: output mode requests a source map, skipping optimization");
        return Ok(flat.to_vec());
    }

    let mut tree = format(flat, rule_name)?;
    let hints = hints.cloned().map(Rc::new);
    let mut changed_overall = false;
    let mut iterations = 0usize;

    loop {
        if let Some(max) = opts.max_outer_iterations {
            if iterations >= max {
                debug!(
                    "{rule_name}: outer fixpoint hit its {max}-iteration cap, stopping early"
                );
                break;
            }
        }
        iterations += 1;

        let peephole_changed = run_peephole_pass(&mut tree, rule_name, hints.clone())?;
        let dead_slot_changed = if opts.skip_dead_slot {
            false
        } else {
            remove_dead_slots(&mut tree)
        };

        trace!(
            "{rule_name}: outer iteration {iterations}: peephole={peephole_changed} dead_slot={dead_slot_changed}"
        );

        if !peephole_changed && !dead_slot_changed {
            break;
        }
        changed_overall = true;
    }

    let out = if changed_overall { flatten(&tree, rule_name)? } else { flat.to_vec() };

    if opts.should_log(rule_name) {
        dump(rule_name, flat, &out);
    }

    Ok(out)
}

fn run_peephole_pass(
    tree: &mut Block,
    rule_name: &str,
    hints: Option<Rc<GrammarHints>>,
) -> OptResult<bool> {
    let mut state = State::new(rule_name, hints).with_pre_interp(pre_interp).with_post_interp(post_interp);
    let result = state.run(tree)?;
    debug!("{rule_name}: peephole pass changed={}", result.changed);
    Ok(result.changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn dead_push_pop_collapses_to_empty() {
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
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn dead_push_pop_n_collapses_to_empty() {
        let flat = vec![
            Opcode::PUSH_NULL as i64,
            Opcode::PUSH_UNDEFINED as i64,
            Opcode::PUSH_EMPTY_ARRAY as i64,
            Opcode::PUSH_EMPTY_STRING as i64,
            Opcode::POP_N as i64,
            4,
        ];
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn always_true_if_collapses_to_then_branch() {
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
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        assert_eq!(
            out,
            vec![Opcode::PUSH_EMPTY_ARRAY as i64, Opcode::ACCEPT_N as i64, 1]
        );
    }

    #[test]
    fn always_false_if_collapses_to_else_branch() {
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
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        assert_eq!(out, vec![Opcode::PUSH_NULL as i64, Opcode::FAIL as i64, 1]);
    }

    #[test]
    fn nested_silent_fails_flatten() {
        let flat = vec![
            Opcode::SILENT_FAILS_ON as i64,
            Opcode::SILENT_FAILS_ON as i64,
            Opcode::RULE as i64,
            1,
            Opcode::SILENT_FAILS_OFF as i64,
            Opcode::SILENT_FAILS_OFF as i64,
        ];
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        assert_eq!(
            out,
            vec![
                Opcode::SILENT_FAILS_ON as i64,
                Opcode::RULE as i64,
                1,
                Opcode::SILENT_FAILS_OFF as i64,
            ]
        );
    }

    #[test]
    fn dead_while_loop_is_removed() {
        // The loop's body never runs (its guard is already FAILED), so the
        // whole loop disappears; the `PUSH_FAILED` that fed it is left
        // behind as the rule's one required result value, not discarded —
        // nothing downstream of it is a POP for the peephole pass to fuse.
        let flat = vec![
            Opcode::PUSH_FAILED as i64,
            Opcode::WHILE_NOT_ERROR as i64,
            3,
            Opcode::POP as i64,
            Opcode::ACCEPT_N as i64,
            1,
        ];
        let out = optimize_block(&flat, "r", None, &OptimizerOptions::default()).unwrap();
        assert_eq!(out, vec![Opcode::PUSH_FAILED as i64]);
    }

    #[test]
    fn source_map_output_mode_is_a_no_op() {
        let flat = vec![
            Opcode::PUSH_NULL as i64,
            Opcode::POP as i64,
        ];
        let opts = OptimizerOptions { output_mode: OutputMode::SourceAndMap, ..Default::default() };
        let out = optimize_block(&flat, "r", None, &opts).unwrap();
        assert_eq!(out, flat);
    }

    #[test]
    fn idempotent_on_already_optimized_input() {
        let flat = vec![Opcode::PUSH_NULL as i64, Opcode::POP as i64];
        let opts = OptimizerOptions::default();
        let once = optimize_block(&flat, "r", None, &opts).unwrap();
        let twice = optimize_block(&once, "r", None, &opts).unwrap();
        assert_eq!(once, twice);
    }
}
