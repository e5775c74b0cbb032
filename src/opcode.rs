//! The opcode table: names, argument shapes, and categorization.
//!
//! This table is the "shared declaration" external tools are expected to
//! read the numbering from (see the crate's module docs); nothing else in
//! this crate is allowed to hardcode an opcode's integer value.

use std::fmt;

/// How many flag arguments (if any) a conditional element carries before its
/// two child blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondArgCount {
    /// `IF`, `IF_ERROR`, `IF_NOT_ERROR`, `MATCH_ANY`.
    Zero,
    /// `IF_LT`, `IF_GE`, `IF_LT_DYNAMIC`, `IF_GE_DYNAMIC`, `MATCH_STRING`,
    /// `MATCH_STRING_IC`, `MATCH_CHAR_CLASS`.
    One,
}

/// The flat-encoding shape of a non-conditional, non-loop opcode's argument
/// list, i.e. everything after the opcode mnemonic and before the next
/// element starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    /// A fixed number of trailing integer arguments.
    Fixed(usize),
    /// `header_len` fixed arguments, the *last* of which is itself the count
    /// of further trailing arguments. Covers `PLUCK n k p1..pk` (header
    /// `[n, k]`, trailing count `k`), `CALL f n pc p1..pN` (header
    /// `[f, n, pc]`, trailing count `pc`), and `SOURCE_MAP_LABEL_PUSH idx len
    /// c1..clen` (header `[idx, len]`, trailing count `len`).
    SelfDescribing { header_len: usize },
}

macro_rules! opcodes {
    ( $( $variant:ident = $disc:expr ),+ $(,)? ) => {
        /// A single PEG VM opcode.
        ///
        /// Discriminants are part of this crate's external contract: the
        /// formatted-bytecode flattener and the runtime VM must agree on
        /// them, so they are assigned explicitly and never renumbered.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $variant = $disc, )+
        }

        impl Opcode {
            const ALL: &'static [Opcode] = &[ $( Opcode::$variant, )+ ];

            /// Recover an `Opcode` from its wire value.
            pub fn from_u8(v: u8) -> Option<Opcode> {
                Self::ALL.iter().copied().find(|op| *op as u8 == v)
            }
        }

        impl fmt::Display for Opcode {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $( Opcode::$variant => stringify!($variant), )+
                };
                f.write_str(s)
            }
        }

        impl Opcode {
            /// The inverse of [`Display`](fmt::Display), for reading the
            /// mnemonic dump format back in.
            pub fn from_name(s: &str) -> Option<Opcode> {
                match s {
                    $( stringify!($variant) => Some(Opcode::$variant), )+
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    PUSH_EMPTY_STRING = 0,
    PUSH_CURR_POS = 1,
    PUSH_UNDEFINED = 2,
    PUSH_NULL = 3,
    PUSH_FAILED = 4,
    PUSH_EMPTY_ARRAY = 5,

    POP = 6,
    POP_N = 7,
    NIP = 8,
    PLUCK = 9,
    WRAP = 10,
    APPEND = 11,
    TEXT = 12,

    POP_CURR_POS = 13,
    ACCEPT_N = 14,
    ACCEPT_STRING = 15,
    LOAD_SAVED_POS = 16,
    UPDATE_SAVED_POS = 17,

    FAIL = 18,
    SILENT_FAILS_ON = 19,
    SILENT_FAILS_OFF = 20,

    CALL = 21,
    RULE = 22,

    IF = 23,
    IF_ERROR = 24,
    IF_NOT_ERROR = 25,
    MATCH_ANY = 26,

    IF_LT = 27,
    IF_GE = 28,
    IF_LT_DYNAMIC = 29,
    IF_GE_DYNAMIC = 30,
    MATCH_STRING = 31,
    MATCH_STRING_IC = 32,
    MATCH_CHAR_CLASS = 33,

    WHILE_NOT_ERROR = 34,

    SOURCE_MAP_PUSH = 35,
    SOURCE_MAP_POP = 36,
    SOURCE_MAP_LABEL_PUSH = 37,
    SOURCE_MAP_LABEL_POP = 38,
}

impl Opcode {
    /// True for `IF, IF_ERROR, IF_NOT_ERROR, MATCH_ANY, IF_LT, IF_GE,
    /// IF_LT_DYNAMIC, IF_GE_DYNAMIC, MATCH_STRING, MATCH_STRING_IC,
    /// MATCH_CHAR_CLASS`.
    pub fn is_conditional(self) -> bool {
        self.conditional_arg_count().is_some()
    }

    /// `Some(Zero)` / `Some(One)` for conditionals, `None` otherwise.
    ///
    /// Calling [`Opcode::conditional_arg_count_or_panic`] on a non-conditional
    /// is a programmer error, matching spec.md's requirement that
    /// `conditionalArgCount` signal on misuse rather than silently default.
    pub fn conditional_arg_count(self) -> Option<CondArgCount> {
        use Opcode::*;
        match self {
            IF | IF_ERROR | IF_NOT_ERROR | MATCH_ANY => Some(CondArgCount::Zero),
            IF_LT | IF_GE | IF_LT_DYNAMIC | IF_GE_DYNAMIC | MATCH_STRING | MATCH_STRING_IC
            | MATCH_CHAR_CLASS => Some(CondArgCount::One),
            _ => None,
        }
    }

    /// Panics if `self` is not a conditional opcode. Exists so callers that
    /// have already branched on [`Opcode::is_conditional`] don't have to
    /// thread an `Option` they know is always `Some`.
    pub fn conditional_arg_count_or_panic(self) -> CondArgCount {
        self.conditional_arg_count()
            .unwrap_or_else(|| panic!("{self} is not a conditional opcode"))
    }

    /// True only for `WHILE_NOT_ERROR`.
    pub fn is_loop(self) -> bool {
        matches!(self, Opcode::WHILE_NOT_ERROR)
    }

    /// The flat-encoding argument shape for non-conditional, non-loop
    /// opcodes. Panics on a conditional or loop opcode; those are encoded
    /// structurally, not via [`ArgShape`].
    pub fn arg_shape(self) -> ArgShape {
        use Opcode::*;
        match self {
            PUSH_EMPTY_STRING | PUSH_CURR_POS | PUSH_UNDEFINED | PUSH_NULL | PUSH_FAILED
            | PUSH_EMPTY_ARRAY | POP | NIP | APPEND | TEXT | POP_CURR_POS
            | UPDATE_SAVED_POS | SILENT_FAILS_ON | SILENT_FAILS_OFF | SOURCE_MAP_POP => {
                ArgShape::Fixed(0)
            }
            POP_N | WRAP | ACCEPT_N | ACCEPT_STRING | LOAD_SAVED_POS | FAIL | RULE
            | SOURCE_MAP_PUSH | SOURCE_MAP_LABEL_POP => ArgShape::Fixed(1),
            PLUCK => ArgShape::SelfDescribing { header_len: 2 },
            CALL => ArgShape::SelfDescribing { header_len: 3 },
            SOURCE_MAP_LABEL_PUSH => ArgShape::SelfDescribing { header_len: 2 },
            IF | IF_ERROR | IF_NOT_ERROR | MATCH_ANY | IF_LT | IF_GE | IF_LT_DYNAMIC
            | IF_GE_DYNAMIC | MATCH_STRING | MATCH_STRING_IC | MATCH_CHAR_CLASS
            | WHILE_NOT_ERROR => {
                panic!("{self} is a structural (conditional/loop) opcode, not a flat one")
            }
        }
    }

    /// True for opcodes whose transfer function pushes exactly one value
    /// without consuming anything ("const pushes" in spec.md §4.3).
    pub fn is_const_push(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            PUSH_EMPTY_STRING
                | PUSH_CURR_POS
                | PUSH_UNDEFINED
                | PUSH_NULL
                | PUSH_FAILED
                | PUSH_EMPTY_ARRAY
        )
    }

    /// True for the discard-only opcodes peephole rules call "slot killers":
    /// `POP`, `POP_N`, `NIP`.
    pub fn is_slot_killer(self) -> bool {
        matches!(self, Opcode::POP | Opcode::POP_N | Opcode::NIP)
    }

    /// True for opcodes whose transfer function pushes exactly one new value
    /// and reads nothing already on the stack: the six `PUSH_*` opcodes plus
    /// `RULE`, `ACCEPT_N`, `ACCEPT_STRING`, `FAIL`. Swapping one of these
    /// past a `POP` of the slot below commutes, since nothing it does
    /// touches that slot.
    pub fn is_single_value_producer(self) -> bool {
        self.is_const_push()
            || matches!(self, Opcode::RULE | Opcode::ACCEPT_N | Opcode::ACCEPT_STRING | Opcode::FAIL)
    }

    /// True for the one opcode that reads `currPos` off the interpreter's
    /// side channel rather than overwriting it: `PUSH_CURR_POS`.
    pub fn reads_curr_pos(self) -> bool {
        matches!(self, Opcode::PUSH_CURR_POS)
    }

    /// True for opcodes that overwrite `currPos` outright without reading
    /// its previous value first — a previous write to `currPos` is dead if
    /// one of these runs before anything reads it.
    pub fn kills_curr_pos(self) -> bool {
        matches!(
            self,
            Opcode::POP_CURR_POS | Opcode::ACCEPT_N | Opcode::ACCEPT_STRING | Opcode::CALL | Opcode::RULE
        )
    }

    /// Net number of stack slots this opcode's transfer function leaves
    /// behind: positive for a net push, negative for a net discard, zero for
    /// opcodes that only rewrite the top in place or touch no stack at all.
    /// `args` supplies the counts for the opcodes whose arity depends on one
    /// (`POP_N`, `WRAP`, `PLUCK`, `CALL`); ignored otherwise. This mirrors
    /// `interp_flat`'s arithmetic but never runs it — it exists solely for
    /// the pretty-printer's stack-depth annotation, which has no abstract
    /// values to interpret and only needs the slot count.
    ///
    /// Panics on a conditional or loop opcode, same as [`Opcode::arg_shape`].
    pub fn stack_effect(self, args: &[i64]) -> i64 {
        use Opcode::*;
        match self {
            PUSH_EMPTY_STRING | PUSH_CURR_POS | PUSH_UNDEFINED | PUSH_NULL | PUSH_FAILED
            | PUSH_EMPTY_ARRAY | FAIL | RULE | ACCEPT_N | ACCEPT_STRING => 1,
            POP | NIP | POP_CURR_POS | APPEND => -1,
            POP_N => -args[0],
            WRAP => 1 - args[0],
            PLUCK => 1 - args[0],
            CALL => 1 - args[1],
            TEXT | LOAD_SAVED_POS | UPDATE_SAVED_POS | SILENT_FAILS_ON | SILENT_FAILS_OFF => 0,
            SOURCE_MAP_PUSH | SOURCE_MAP_POP | SOURCE_MAP_LABEL_PUSH | SOURCE_MAP_LABEL_POP => 0,
            IF | IF_ERROR | IF_NOT_ERROR | MATCH_ANY | IF_LT | IF_GE | IF_LT_DYNAMIC
            | IF_GE_DYNAMIC | MATCH_STRING | MATCH_STRING_IC | MATCH_CHAR_CLASS
            | WHILE_NOT_ERROR => {
                panic!("{self} is a structural (conditional/loop) opcode, not a flat one")
            }
        }
    }

    /// True for the two annotation opcodes `SILENT_FAILS_ON/OFF`.
    pub fn is_silent_fails_marker(self) -> bool {
        matches!(self, Opcode::SILENT_FAILS_ON | Opcode::SILENT_FAILS_OFF)
    }

    /// True for the four `SOURCE_MAP_*` opcodes, which carry no semantic
    /// effect on the abstract stack and exist only so the codec round-trips.
    pub fn is_source_map_annotation(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            SOURCE_MAP_PUSH | SOURCE_MAP_POP | SOURCE_MAP_LABEL_PUSH | SOURCE_MAP_LABEL_POP
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_u8() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(*op as u8), Some(*op));
        }
    }

    #[test]
    fn conditional_and_loop_disjoint_from_flat() {
        for op in Opcode::ALL {
            if op.is_conditional() || op.is_loop() {
                continue;
            }
            // Must not panic.
            let _ = op.arg_shape();
        }
    }

    #[test]
    #[should_panic]
    fn conditional_arg_count_panics_on_non_conditional() {
        Opcode::POP.conditional_arg_count_or_panic();
    }

    #[test]
    fn stack_effect_matches_arity() {
        assert_eq!(Opcode::PUSH_NULL.stack_effect(&[]), 1);
        assert_eq!(Opcode::POP.stack_effect(&[]), -1);
        assert_eq!(Opcode::POP_N.stack_effect(&[3]), -3);
        assert_eq!(Opcode::WRAP.stack_effect(&[3]), -2);
        assert_eq!(Opcode::PLUCK.stack_effect(&[4, 2, 0, 1]), -3);
        assert_eq!(Opcode::CALL.stack_effect(&[5, 2, 1, 0]), -1);
        assert_eq!(Opcode::TEXT.stack_effect(&[]), 0);
    }

    #[test]
    #[should_panic]
    fn stack_effect_panics_on_structural_opcode() {
        Opcode::IF.stack_effect(&[]);
    }
}
