//! The abstract interpreter: a symbolic stack machine that simulates the PEG
//! VM's runtime stack while the tree it is walking is rewritten underneath
//! it, to a fixed point.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::bytecode::{Block, Element, Modification};
use crate::error::{OptError, OptResult};
use crate::grammar::{GrammarHints, RuleMatch};
use crate::opcode::Opcode;
use crate::value::{AbstractValue, Identity, IdentitySource, T};

/// Per-branch abstract state observed at a conditional's join point,
/// preserved so a following peephole rule (conditional fusion, dead-branch
/// pop-chain pushdown) can reason about each branch independently.
#[derive(Clone)]
pub enum CondState {
    Terminal(Box<State>),
    Branch(Box<CondState>, Box<CondState>),
}

impl CondState {
    /// Visit every terminal `State` in the same left-to-right order
    /// `interp_condition` built this tree in. Conditional fusion walks a
    /// `CondState` twice with this: once to classify each terminal against a
    /// following conditional's guard, once more (via `collect_dead_guard_votes`)
    /// to check a following loop's guard is dead on every terminal. Splicing
    /// new code into a terminal's own block needs the physical `Block` tree
    /// alongside the `CondState` one, which this read-only visit doesn't
    /// carry, so that part (`apply_plans`) walks both trees in lock step
    /// instead of going through here.
    pub fn for_each_terminal(&self, f: &mut impl FnMut(&State)) {
        match self {
            CondState::Terminal(state) => f(state),
            CondState::Branch(then_side, else_side) => {
                then_side.for_each_terminal(f);
                else_side.for_each_terminal(f);
            }
        }
    }
}

/// The raw per-element outcome `interp` computes, before any visitor gets a
/// chance to turn it into a rewrite.
#[derive(Clone)]
pub struct InterpResult {
    pub next_ip: usize,
    pub cond_state: Option<CondState>,
    pub mods: Option<Modification>,
}

/// What a `postInterp` hook is handed: enough to decide a rewrite without
/// re-deriving it from the block.
#[derive(Clone)]
pub struct InterpOutcome {
    pub op: Opcode,
    pub cond_state: Option<CondState>,
}

/// The result of running a whole block: whether anything changed, and (for
/// the caller's benefit, e.g. conditional fusion one level up) the
/// `CondState` of the last element, if it was a conditional.
pub struct RunResult {
    pub changed: bool,
    pub cond_state: Option<CondState>,
}

type PreInterpHook = Rc<RefCell<dyn FnMut(&mut State, &mut Block, usize) -> OptResult<Option<Modification>>>>;
type PostInterpHook =
    Rc<RefCell<dyn FnMut(&mut State, &mut Block, usize, &InterpOutcome) -> OptResult<Option<Modification>>>>;
type PreRunHook = Rc<RefCell<dyn FnMut(&mut State, &mut Block)>>;
type PostRunHook = Rc<RefCell<dyn FnMut(&mut State, &mut Block)>>;

/// One optimization pass's interpreter state: the symbolic stack, the
/// current-position tracker, the silent-fails counter, loop-reentry depth,
/// and (shared, not per-branch) the rule name, grammar hints, identity
/// source, and visitor hooks.
///
/// `stack`/`curr_pos`/`silent_fails`/`looping` are the part that gets
/// snapshotted at every conditional branch and loop entry; the rest is
/// environment shared by `Rc` across every clone of a single rule's
/// optimization.
#[derive(Clone)]
pub struct State {
    pub stack: Vec<AbstractValue>,
    pub curr_pos: AbstractValue,
    pub silent_fails: u32,
    pub looping: u32,
    pub rule_name: Rc<str>,
    pub hints: Option<Rc<GrammarHints>>,
    ids: Rc<RefCell<IdentitySource>>,
    pre_interp: Option<PreInterpHook>,
    post_interp: Option<PostInterpHook>,
    pre_run: Option<PreRunHook>,
    post_run: Option<PostRunHook>,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("stack", &self.stack)
            .field("curr_pos", &self.curr_pos)
            .field("silent_fails", &self.silent_fails)
            .field("looping", &self.looping)
            .field("rule_name", &self.rule_name)
            .finish_non_exhaustive()
    }
}

impl State {
    /// A fresh interpreter state for optimizing `rule_name`, with an empty
    /// stack and a freshly-minted `currPos`.
    pub fn new(rule_name: impl Into<Rc<str>>, hints: Option<Rc<GrammarHints>>) -> State {
        let ids = Rc::new(RefCell::new(IdentitySource::new()));
        let curr_pos = AbstractValue::with_identity(T::OFFSET, ids.borrow_mut().mint());
        State {
            stack: Vec::new(),
            curr_pos,
            silent_fails: 0,
            looping: 0,
            rule_name: rule_name.into(),
            hints,
            ids,
            pre_interp: None,
            post_interp: None,
            pre_run: None,
            post_run: None,
        }
    }

    pub fn with_pre_interp(
        mut self,
        hook: impl FnMut(&mut State, &mut Block, usize) -> OptResult<Option<Modification>> + 'static,
    ) -> Self {
        self.pre_interp = Some(Rc::new(RefCell::new(hook)));
        self
    }

    pub fn with_post_interp(
        mut self,
        hook: impl FnMut(&mut State, &mut Block, usize, &InterpOutcome) -> OptResult<Option<Modification>>
            + 'static,
    ) -> Self {
        self.post_interp = Some(Rc::new(RefCell::new(hook)));
        self
    }

    pub fn with_pre_run(mut self, hook: impl FnMut(&mut State, &mut Block) + 'static) -> Self {
        self.pre_run = Some(Rc::new(RefCell::new(hook)));
        self
    }

    pub fn with_post_run(mut self, hook: impl FnMut(&mut State, &mut Block) + 'static) -> Self {
        self.post_run = Some(Rc::new(RefCell::new(hook)));
        self
    }

    fn err_underflow(&self, detail: impl Into<String>) -> OptError {
        OptError::stack_underflow(self.rule_name.as_ref(), detail)
    }

    pub fn mint_identity(&self) -> Identity {
        self.ids.borrow_mut().mint()
    }

    fn pop(&mut self) -> OptResult<AbstractValue> {
        self.stack.pop().ok_or_else(|| self.err_underflow("pop on empty stack"))
    }

    fn push(&mut self, v: AbstractValue) {
        self.stack.push(v);
    }

    fn top_mut(&mut self) -> OptResult<&mut AbstractValue> {
        self.stack.last_mut().ok_or_else(|| self.err_underflow("inspect below bottom of stack"))
    }

    /// `merge(a, b)` at a conditional or loop join: stacks must agree in
    /// length and `silentFails` must agree; each stack slot and `currPos`
    /// are joined with [`AbstractValue::union`].
    pub fn merge(&mut self, other: &State) -> OptResult<()> {
        if self.stack.len() != other.stack.len() {
            return Err(OptError::StackMismatch {
                rule: self.rule_name.to_string(),
                left: self.stack.len(),
                right: other.stack.len(),
            });
        }
        if self.silent_fails != other.silent_fails {
            return Err(OptError::SilentFailsMismatch {
                rule: self.rule_name.to_string(),
                left: self.silent_fails,
                right: other.silent_fails,
            });
        }
        for (mine, theirs) in self.stack.iter_mut().zip(other.stack.iter()) {
            *mine = mine.union(*theirs);
        }
        self.curr_pos = self.curr_pos.union(other.curr_pos);
        Ok(())
    }

    /// Fixpoint-convergence test: same shape and same values by tag *and*
    /// identity. `currPos` is deliberately excluded — every loop iteration
    /// legitimately mints a fresh `currPos` identity.
    pub fn equal(&self, other: &State) -> bool {
        self.silent_fails == other.silent_fails
            && self.stack.len() == other.stack.len()
            && self
                .stack
                .iter()
                .zip(other.stack.iter())
                .all(|(a, b)| a.tag == b.tag && a.identity == b.identity)
    }

    /// Drive one block to completion, applying pre/post visitor rewrites and
    /// the interpreter's own "hard" rewrites (dead-branch collapse, dead
    /// loop removal) as it goes.
    pub fn run(&mut self, block: &mut Block) -> OptResult<RunResult> {
        if self.looping == 0 {
            if let Some(hook) = self.pre_run.clone() {
                (hook.borrow_mut())(self, block);
            }
        }

        let mut changed = false;
        let mut last_cond_state = None;
        let mut ip = 0usize;
        while ip < block.len() {
            loop {
                let hook = self.pre_interp.clone();
                let modification = match hook {
                    Some(hook) => (hook.borrow_mut())(self, block, ip)?,
                    None => None,
                };
                match modification {
                    Some(m) => {
                        changed = true;
                        m.apply(block);
                    }
                    None => break,
                }
            }
            if ip >= block.len() {
                break;
            }

            let result = self.interp(block, ip)?;
            let outcome = InterpOutcome { op: block[ip].op(), cond_state: result.cond_state.clone() };
            last_cond_state = result.cond_state;

            let mut next_ip = result.next_ip;
            if let Some(m) = result.mods {
                changed = true;
                next_ip = m.resume_point(next_ip);
                m.apply(block);
            }

            if self.looping == 0 {
                let hook = self.post_interp.clone();
                if let Some(hook) = hook {
                    if let Some(m) = (hook.borrow_mut())(self, block, ip, &outcome)? {
                        changed = true;
                        next_ip = m.resume_point(next_ip);
                        m.apply(block);
                    }
                }
            }

            ip = next_ip;
        }

        if self.looping == 0 {
            if let Some(hook) = self.post_run.clone() {
                (hook.borrow_mut())(self, block);
            }
        }

        Ok(RunResult { changed, cond_state: last_cond_state })
    }

    /// Compute the transfer function of `block[ip]` and advance past it.
    pub fn interp(&mut self, block: &mut Block, ip: usize) -> OptResult<InterpResult> {
        match &block[ip] {
            Element::Cond { .. } => self.interp_condition(block, ip),
            Element::Loop { .. } => self.interp_loop(block, ip),
            Element::Flat { op, args } => {
                let op = *op;
                let args = args.clone();
                self.interp_flat(op, &args)?;
                Ok(InterpResult { next_ip: ip + 1, cond_state: None, mods: None })
            }
        }
    }

    fn interp_flat(&mut self, op: Opcode, args: &[i64]) -> OptResult<()> {
        use Opcode::*;
        match op {
            PUSH_EMPTY_STRING => self.push(AbstractValue::new(T::STRING)),
            PUSH_CURR_POS => {
                let v = self.curr_pos;
                self.push(v);
            }
            PUSH_UNDEFINED => self.push(AbstractValue::new(T::UNDEFINED)),
            PUSH_NULL => self.push(AbstractValue::new(T::NULL)),
            PUSH_FAILED => self.push(AbstractValue::new(T::FAILED)),
            PUSH_EMPTY_ARRAY => {
                let id = self.mint_identity();
                self.push(AbstractValue::with_identity(T::ARRAY, id));
            }
            POP => {
                self.pop()?;
            }
            POP_N => {
                let n = non_negative(args[0], &self.rule_name, "POP_N")?;
                if self.stack.len() < n {
                    return Err(self.err_underflow("POP_N discards more than the stack holds"));
                }
                self.stack.truncate(self.stack.len() - n);
            }
            NIP => {
                if self.stack.len() < 2 {
                    return Err(self.err_underflow("NIP needs two values on the stack"));
                }
                let idx = self.stack.len() - 2;
                self.stack.remove(idx);
            }
            POP_CURR_POS => {
                let v = self.pop()?;
                if !v.must_be(T::OFFSET) {
                    return Err(OptError::BadCurrPos { rule: self.rule_name.to_string() });
                }
                self.curr_pos = v;
            }
            APPEND => {
                self.pop()?;
                let top = self.top_mut()?;
                if !top.must_be(T::ARRAY) {
                    return Err(OptError::BadAppend { rule: self.rule_name.to_string() });
                }
                let id = self.mint_identity();
                *self.top_mut()? = AbstractValue::with_identity(T::ARRAY, id);
            }
            WRAP => {
                let n = non_negative(args[0], &self.rule_name, "WRAP")?;
                if self.stack.len() < n {
                    return Err(self.err_underflow("WRAP needs n values on the stack"));
                }
                self.stack.truncate(self.stack.len() - n);
                let id = self.mint_identity();
                self.push(AbstractValue::with_identity(T::ARRAY, id));
            }
            TEXT => {
                let v = self.pop()?;
                if !v.must_be(T::OFFSET) {
                    return Err(OptError::BadText { rule: self.rule_name.to_string() });
                }
                self.push(AbstractValue::new(T::STRING));
            }
            PLUCK => self.interp_pluck(args)?,
            ACCEPT_N | ACCEPT_STRING => {
                let id = self.mint_identity();
                self.curr_pos = AbstractValue::with_identity(T::OFFSET, id);
                self.push(AbstractValue::new(T::STRING));
            }
            LOAD_SAVED_POS | UPDATE_SAVED_POS => {
                // Operate on the host VM's separate saved-position stack;
                // no effect on the abstract value stack or `currPos`.
            }
            FAIL => self.push(AbstractValue::new(T::FAILED)),
            SILENT_FAILS_ON => self.silent_fails += 1,
            SILENT_FAILS_OFF => {
                self.silent_fails = self.silent_fails.checked_sub(1).ok_or_else(|| {
                    OptError::malformed_tree(self.rule_name.as_ref(), "unbalanced SILENT_FAILS_OFF")
                })?;
            }
            CALL => self.interp_call(args)?,
            RULE => {
                let hint = self
                    .hints
                    .as_ref()
                    .map(|h| h.match_hint(args[0]))
                    .unwrap_or(RuleMatch::Unknown);
                let id = self.mint_identity();
                self.curr_pos = AbstractValue::with_identity(T::OFFSET, id);
                let tag = match hint {
                    RuleMatch::Always => T::ANY & !T::FAILED,
                    RuleMatch::Never => T::FAILED,
                    RuleMatch::Unknown => T::ANY,
                };
                self.push(AbstractValue::new(tag));
            }
            IF | IF_ERROR | IF_NOT_ERROR | MATCH_ANY | IF_LT | IF_GE | IF_LT_DYNAMIC
            | IF_GE_DYNAMIC | MATCH_STRING | MATCH_STRING_IC | MATCH_CHAR_CLASS
            | WHILE_NOT_ERROR => {
                unreachable!("structural opcode {op} dispatched through interp_flat")
            }
            SOURCE_MAP_PUSH | SOURCE_MAP_POP | SOURCE_MAP_LABEL_PUSH | SOURCE_MAP_LABEL_POP => {}
        }
        Ok(())
    }

    fn interp_pluck(&mut self, args: &[i64]) -> OptResult<()> {
        let n = non_negative(args[0], &self.rule_name, "PLUCK discard count")?;
        let k = non_negative(args[1], &self.rule_name, "PLUCK inspect count")?;
        let indices = &args[2..2 + k];
        if self.stack.len() < n {
            return Err(self.err_underflow("PLUCK discards more than the stack holds"));
        }
        let base = self.stack.len() - n;
        let mut inspected = Vec::with_capacity(k);
        for &raw in indices {
            let i = non_negative(raw, &self.rule_name, "PLUCK inspect index")?;
            if i >= n {
                return Err(self.err_underflow("PLUCK inspect index out of the discard window"));
            }
            inspected.push(self.stack[base + i]);
        }
        self.stack.truncate(base);
        if k == 1 {
            self.push(inspected[0]);
        } else {
            let id = self.mint_identity();
            self.push(AbstractValue::with_identity(T::ARRAY, id));
        }
        Ok(())
    }

    fn interp_call(&mut self, args: &[i64]) -> OptResult<()> {
        let n = non_negative(args[1], &self.rule_name, "CALL discard count")?;
        let pc = non_negative(args[2], &self.rule_name, "CALL param count")?;
        for &raw in &args[3..3 + pc] {
            let i = non_negative(raw, &self.rule_name, "CALL param index")?;
            if i >= n {
                return Err(self.err_underflow("CALL param index out of the discard window"));
            }
        }
        if self.stack.len() < n {
            return Err(self.err_underflow("CALL discards more than the stack holds"));
        }
        self.stack.truncate(self.stack.len() - n);
        let id = self.mint_identity();
        self.curr_pos = AbstractValue::with_identity(T::OFFSET, id);
        self.push(AbstractValue::any());
        Ok(())
    }

    fn interp_condition(&mut self, block: &mut Block, ip: usize) -> OptResult<InterpResult> {
        let (op, _arg) = match &block[ip] {
            Element::Cond { op, arg, .. } => (*op, *arg),
            _ => unreachable!(),
        };
        let top = *self.stack.last().ok_or_else(|| {
            self.err_underflow("conditional needs a value on top of the stack")
        })?;
        let else_was_empty = match &block[ip] {
            Element::Cond { else_block, .. } => else_block.is_empty(),
            _ => unreachable!(),
        };

        let classification = classify(op, top);
        if let Some(decision) = classification.as_ref().and_then(Classification::resolve) {
            return match decision {
                Err(()) => Err(OptError::ImpossibleConditional { rule: self.rule_name.to_string() }),
                Ok((take_then, refine)) => {
                    if let Some(refine) = refine {
                        self.top_mut()?.tag = refine;
                    }
                    let mut branch = match &mut block[ip] {
                        Element::Cond { then_block, else_block, .. } => {
                            std::mem::take(if take_then { then_block } else { else_block })
                        }
                        _ => unreachable!(),
                    };
                    let run_result = self.run(&mut branch)?;
                    Ok(InterpResult {
                        next_ip: ip + 1,
                        cond_state: run_result.cond_state,
                        mods: Some(Modification::splice(ip, 1, branch)),
                    })
                }
            };
        }

        let (then_refine, else_refine) =
            classification.map(|c| (c.then_refine, c.else_refine)).unwrap_or((None, None));

        let mut then_state = self.clone();
        if let Some(refine) = then_refine {
            then_state.top_mut()?.tag = refine;
        }
        if let Some(refine) = else_refine {
            self.top_mut()?.tag = refine;
        }

        let then_run = {
            let then_block = match &mut block[ip] {
                Element::Cond { then_block, .. } => then_block,
                _ => unreachable!(),
            };
            then_state.run(then_block)?
        };
        let else_run = {
            let else_block = match &mut block[ip] {
                Element::Cond { else_block, .. } => else_block,
                _ => unreachable!(),
            };
            self.run(else_block)?
        };
        let changed = then_run.changed || else_run.changed;

        if else_was_empty && then_state.stack.len() > self.stack.len() {
            then_state.stack.truncate(self.stack.len());
        }

        let else_snapshot = self.clone();
        self.merge(&then_state)?;

        let then_side = then_run.cond_state.unwrap_or(CondState::Terminal(Box::new(then_state)));
        let else_side = else_run.cond_state.unwrap_or(CondState::Terminal(Box::new(else_snapshot)));

        Ok(InterpResult {
            next_ip: ip + 1,
            cond_state: Some(CondState::Branch(Box::new(then_side), Box::new(else_side))),
            mods: if changed { Some(Modification::Mutated) } else { None },
        })
    }

    fn interp_loop(&mut self, block: &mut Block, ip: usize) -> OptResult<InterpResult> {
        let top = *self
            .stack
            .last()
            .ok_or_else(|| self.err_underflow("WHILE_NOT_ERROR needs a value on top of the stack"))?;
        if top.must_be(T::FAILED) {
            return Ok(InterpResult { next_ip: ip + 1, cond_state: None, mods: Some(Modification::delete(ip, 1)) });
        }

        self.looping += 1;
        let mut saved = self.clone();
        loop {
            let mut iter_state = saved.clone();
            {
                let body = match &mut block[ip] {
                    Element::Loop { body } => body,
                    _ => unreachable!(),
                };
                iter_state.run(body)?;
            }
            iter_state.merge(&saved)?;
            let converged = iter_state.equal(&saved);
            saved = iter_state;
            if converged {
                break;
            }
        }
        self.looping -= 1;
        self.stack = saved.stack;
        self.curr_pos = saved.curr_pos;
        self.silent_fails = saved.silent_fails;

        let changed = if self.looping == 0 {
            let mut realize_state = self.clone();
            let body = match &mut block[ip] {
                Element::Loop { body } => body,
                _ => unreachable!(),
            };
            realize_state.run(body)?.changed
        } else {
            false
        };

        Ok(InterpResult {
            next_ip: ip + 1,
            cond_state: None,
            mods: if changed { Some(Modification::Mutated) } else { None },
        })
    }
}

fn non_negative(v: i64, rule: &str, what: &str) -> OptResult<usize> {
    usize::try_from(v).map_err(|_| OptError::stack_underflow(rule, format!("{what} is negative")))
}

/// The outcome of testing `IF`/`IF_ERROR`/`IF_NOT_ERROR`'s top-of-stack
/// against the lattice, built only for the three opcodes with a statically
/// known truthiness test (`MATCH_ANY` and the one-flag-arg conditionals have
/// no classifier: their branch taken depends on runtime input, not on any
/// abstract value already on the stack).
#[derive(Clone, Copy)]
pub(crate) struct Classification {
    then_only: bool,
    else_only: bool,
    then_refine: Option<T>,
    else_refine: Option<T>,
}

impl Classification {
    /// `Some(Err(()))` when both branches claim exclusivity (a contradiction
    /// — the bytecode is unsatisfiable). `Some(Ok((take_then, refine)))` when
    /// exactly one side is reachable. `None` when both sides remain
    /// reachable (the common case; caller falls through to running both).
    pub(crate) fn resolve(&self) -> Option<Result<(bool, Option<T>), ()>> {
        match (self.then_only, self.else_only) {
            (true, true) => Some(Err(())),
            (true, false) => Some(Ok((true, self.then_refine))),
            (false, true) => Some(Ok((false, self.else_refine))),
            (false, false) => None,
        }
    }
}

/// Reused by conditional fusion (`visit::post`) to test each terminal
/// branch's top-of-stack against the opcode the fusion candidate is gated
/// on, the same way a live `IF`/`IF_ERROR`/`IF_NOT_ERROR` would be.
pub(crate) fn classify(op: Opcode, top: AbstractValue) -> Option<Classification> {
    match op {
        Opcode::IF => Some(Classification {
            then_only: top.must_be_true(),
            else_only: top.must_be_false(),
            then_refine: Some(top.tag & (T::ARRAY | T::FAILED)),
            else_refine: Some(top.tag & (T::NULL | T::UNDEFINED)),
        }),
        Opcode::IF_ERROR => Some(Classification {
            then_only: top.must_be(T::FAILED),
            else_only: top.must_be(T::ANY & !T::FAILED),
            then_refine: Some(top.tag & T::FAILED),
            else_refine: Some(top.tag & !T::FAILED),
        }),
        Opcode::IF_NOT_ERROR => Some(Classification {
            then_only: top.must_be(T::ANY & !T::FAILED),
            else_only: top.must_be(T::FAILED),
            then_refine: Some(top.tag & !T::FAILED),
            else_refine: Some(top.tag & T::FAILED),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Element;

    fn state() -> State {
        State::new("r", None)
    }

    #[test]
    fn push_pop_balance() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::PUSH_NULL, []),
            Element::flat(Opcode::PUSH_UNDEFINED, []),
            Element::flat(Opcode::POP, []),
            Element::flat(Opcode::POP, []),
        ];
        let result = s.run(&mut block).unwrap();
        assert!(!result.changed);
        assert!(s.stack.is_empty());
    }

    #[test]
    fn pop_on_empty_stack_errors() {
        let mut s = state();
        let mut block: Block = vec![Element::flat(Opcode::POP, [])];
        let err = s.run(&mut block).unwrap_err();
        assert!(matches!(err, OptError::StackUnderflow { .. }));
    }

    #[test]
    fn push_curr_pos_shares_identity() {
        let mut s = state();
        let mut block: Block = vec![Element::flat(Opcode::PUSH_CURR_POS, [])];
        s.run(&mut block).unwrap();
        assert_eq!(s.stack[0].identity, s.curr_pos.identity);
    }

    #[test]
    fn pop_curr_pos_requires_offset() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::PUSH_NULL, []),
            Element::flat(Opcode::POP_CURR_POS, []),
        ];
        let err = s.run(&mut block).unwrap_err();
        assert!(matches!(err, OptError::BadCurrPos { .. }));
    }

    #[test]
    fn append_requires_array_below_top() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::PUSH_NULL, []),
            Element::flat(Opcode::PUSH_UNDEFINED, []),
            Element::flat(Opcode::APPEND, []),
        ];
        let err = s.run(&mut block).unwrap_err();
        assert!(matches!(err, OptError::BadAppend { .. }));
    }

    #[test]
    fn text_requires_offset() {
        let mut s = state();
        let mut block: Block = vec![Element::flat(Opcode::PUSH_NULL, []), Element::flat(Opcode::TEXT, [])];
        let err = s.run(&mut block).unwrap_err();
        assert!(matches!(err, OptError::BadText { .. }));
    }

    #[test]
    fn merge_rejects_mismatched_depth() {
        let mut a = state();
        a.push(AbstractValue::new(T::NULL));
        let b = state();
        let err = a.merge(&b).unwrap_err();
        assert!(matches!(err, OptError::StackMismatch { .. }));
    }

    #[test]
    fn merge_is_symmetric_modulo_identity() {
        let mut a = state();
        a.push(AbstractValue::new(T::NULL));
        let mut b = state();
        b.push(AbstractValue::new(T::STRING));

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab.stack[0].tag, ba.stack[0].tag);
        assert_eq!(ab.silent_fails, ba.silent_fails);
    }

    #[test]
    fn always_true_if_collapses_to_then_branch() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::PUSH_EMPTY_ARRAY, []),
            Element::Cond {
                op: Opcode::IF,
                arg: None,
                then_block: vec![Element::flat(Opcode::ACCEPT_N, [1])],
                else_block: vec![Element::flat(Opcode::FAIL, [1])],
            },
        ];
        let result = s.run(&mut block).unwrap();
        assert!(result.changed);
        assert_eq!(block.len(), 2);
        assert_eq!(block[1].op(), Opcode::ACCEPT_N);
    }

    #[test]
    fn always_false_if_collapses_to_else_branch() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::PUSH_NULL, []),
            Element::Cond {
                op: Opcode::IF,
                arg: None,
                then_block: vec![Element::flat(Opcode::ACCEPT_N, [1])],
                else_block: vec![Element::flat(Opcode::FAIL, [1])],
            },
        ];
        let result = s.run(&mut block).unwrap();
        assert!(result.changed);
        assert_eq!(block.len(), 2);
        assert_eq!(block[1].op(), Opcode::FAIL);
    }

    #[test]
    fn contradictory_classification_is_impossible_conditional() {
        let c = Classification {
            then_only: true,
            else_only: true,
            then_refine: None,
            else_refine: None,
        };
        assert_eq!(c.resolve(), Some(Err(())));
    }

    #[test]
    fn dead_while_loop_is_removed() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::PUSH_FAILED, []),
            Element::Loop {
                body: vec![
                    Element::flat(Opcode::POP, []),
                    Element::flat(Opcode::ACCEPT_N, [1]),
                    Element::flat(Opcode::POP, []),
                ],
            },
        ];
        let result = s.run(&mut block).unwrap();
        assert!(result.changed);
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn silent_fails_on_off_balance() {
        let mut s = state();
        let mut block: Block = vec![
            Element::flat(Opcode::SILENT_FAILS_ON, []),
            Element::flat(Opcode::SILENT_FAILS_OFF, []),
        ];
        s.run(&mut block).unwrap();
        assert_eq!(s.silent_fails, 0);
    }

    #[test]
    fn unbalanced_silent_fails_off_errors() {
        let mut s = state();
        let mut block: Block = vec![Element::flat(Opcode::SILENT_FAILS_OFF, [])];
        let err = s.run(&mut block).unwrap_err();
        assert!(matches!(err, OptError::MalformedTree { .. }));
    }
}
