//! The grammar-description shim: the only thing the optimizer sees of the
//! host toolchain's AST, narrowed to the one hint it needs per rule.

/// Whether calling a rule is statically known to always match, never match,
/// or is unknown (the common case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    Always,
    Never,
    Unknown,
}

impl RuleMatch {
    /// Per spec.md §9's Open Question: a rule index with no entry in the
    /// table (or no table at all) is always treated as `Unknown`, i.e. the
    /// `RULE` transfer function pushes `ANY`.
    pub fn from_signed(v: i8) -> RuleMatch {
        if v > 0 {
            RuleMatch::Always
        } else if v < 0 {
            RuleMatch::Never
        } else {
            RuleMatch::Unknown
        }
    }
}

/// Per-rule match hints, indexed by rule number. An absent table, or an
/// out-of-range index, both resolve to [`RuleMatch::Unknown`].
#[derive(Debug, Clone, Default)]
pub struct GrammarHints {
    rules: Vec<RuleMatch>,
}

impl GrammarHints {
    pub fn new(rules: Vec<RuleMatch>) -> Self {
        Self { rules }
    }

    pub fn match_hint(&self, rule_index: i64) -> RuleMatch {
        usize::try_from(rule_index)
            .ok()
            .and_then(|i| self.rules.get(i))
            .copied()
            .unwrap_or(RuleMatch::Unknown)
    }
}
