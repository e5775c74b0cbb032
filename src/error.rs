//! The optimizer's error surface.
//!
//! Every variant means "the input bytecode is invalid"; none of these should
//! ever fire on output produced by a correct emitter. The driver never
//! catches these — callers handle them at the per-rule boundary.

use thiserror::Error;

use crate::opcode::Opcode;

/// All structural and dataflow errors the optimizer can raise, each scoped
/// to the rule being optimized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptError {
    #[error("rule `{rule}`: stack underflow ({detail})")]
    StackUnderflow { rule: String, detail: String },

    #[error("rule `{rule}`: POP_CURR_POS on a value that is not tag OFFSET")]
    BadCurrPos { rule: String },

    #[error("rule `{rule}`: APPEND on a value that is not exactly tag ARRAY")]
    BadAppend { rule: String },

    #[error("rule `{rule}`: TEXT on a value that is not exactly tag OFFSET")]
    BadText { rule: String },

    #[error("rule `{rule}`: merge at a join with mismatched stack depths ({left} vs {right})")]
    StackMismatch { rule: String, left: usize, right: usize },

    #[error(
        "rule `{rule}`: merge at a join with mismatched silentFails counters ({left} vs {right})"
    )]
    SilentFailsMismatch { rule: String, left: u32, right: u32 },

    #[error("rule `{rule}`: conditional is unreachable on both branches")]
    ImpossibleConditional { rule: String },

    #[error("rule `{rule}`: unknown opcode value {value}")]
    InvalidOpcode { rule: String, value: i64 },

    #[error("rule `{rule}`: malformed tree ({detail})")]
    MalformedTree { rule: String, detail: String },
}

impl OptError {
    pub fn stack_underflow(rule: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::StackUnderflow { rule: rule.into(), detail: detail.into() }
    }

    pub fn malformed_tree(rule: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::MalformedTree { rule: rule.into(), detail: detail.into() }
    }

    pub fn invalid_opcode(rule: impl Into<String>, value: i64) -> Self {
        Self::InvalidOpcode { rule: rule.into(), value }
    }

    /// Convenience constructor for the "programmer asked for a conditional's
    /// arg count on a non-conditional" misuse path, surfaced as a malformed
    /// tree rather than a panic when it originates from untrusted input.
    pub fn not_a_conditional(rule: impl Into<String>, op: Opcode) -> Self {
        Self::malformed_tree(rule, format!("{op} used as a conditional element"))
    }
}

pub type OptResult<T> = Result<T, OptError>;
