//! The rule table: pattern rules loaded from `rules.json`, and matching of
//! paths against them.

pub mod expr;
pub mod load;
pub mod pattern;
pub mod rule;
pub mod table;

pub use rule::{Attr, DepFlags, Resolved, Rule, TargetFlags};
pub use table::{RuleId, RuleMatch, RuleTable};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("bad pattern {pattern:?}: {msg}")]
    BadPattern { pattern: String, msg: String },
    #[error("pattern {pattern:?} uses undefined stem {stem:?}")]
    UnknownStem { pattern: String, stem: String },
    #[error("rule {rule}: bad regex: {err}")]
    Regex {
        rule: String,
        #[source]
        err: regex::Error,
    },
    #[error("multiple rules match {path} at the same priority: {}", .rules.join(", "))]
    MultiMatch { path: String, rules: Vec<String> },
    #[error("job {job}: dep {key} expands to bad path {path:?}")]
    BadDep {
        job: String,
        key: String,
        path: String,
    },
    #[error("rule {rule}: attribute {attr}: {err}")]
    Attr {
        rule: String,
        attr: String,
        #[source]
        err: expr::ExprError,
    },
    #[error("rule {rule}: {msg}")]
    Invalid { rule: String, msg: String },
    #[error("unknown flag {0:?}")]
    UnknownFlag(String),
}
