//! Matching paths against the whole set of rules.

use super::rule::{CmdLine, Resolved, Rule, StaticDep};
use super::RuleError;
use crate::smallmap::SmallMap;
use regex::RegexSet;
use rustc_hash::FxHashSet;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub usize);

/// A rule selected for a path, with its stems bound.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: RuleId,
    /// Index of the target that matched.
    pub target: usize,
    /// The stems identifying the job; star stems excluded.
    pub stems: SmallMap<String, String>,
    pub job_name: String,
}

/// Everything about a job that derives from its rule and stems.
#[derive(Debug, Clone)]
pub struct Instance {
    pub deps: Vec<StaticDep>,
    pub cmd: CmdLine,
    pub resolved: Resolved,
}

pub struct RuleTable {
    rules: Vec<Rule>,
    /// Source manifest; None means "any existing file is a source".
    sources: Option<FxHashSet<String>>,
    /// One entry per matchable target of every rule, used as a prefilter.
    set: RegexSet,
    /// Maps a RegexSet index to (rule, matcher index among its matchables).
    set_owner: Vec<(RuleId, usize)>,
}

impl RuleTable {
    pub fn new(rules: Vec<Rule>, sources: Option<Vec<String>>) -> Result<Self, RuleError> {
        let mut patterns = Vec::new();
        let mut set_owner = Vec::new();
        for (i, rule) in rules.iter().enumerate() {
            for (j, m) in rule.matchers().enumerate() {
                patterns.push(Rule::matcher_regex(m).to_string());
                set_owner.push((RuleId(i), j));
            }
        }
        let set = RegexSet::new(&patterns).map_err(|err| RuleError::Regex {
            rule: "<table>".to_string(),
            err,
        })?;
        let sources = sources.map(|list| {
            list.into_iter()
                .map(crate::canon::canon_path)
                .collect::<FxHashSet<_>>()
        });
        Ok(RuleTable {
            rules,
            sources,
            set,
            set_owner,
        })
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0]
    }

    pub fn by_name(&self, name: &str) -> Option<RuleId> {
        self.rules.iter().position(|r| r.name == name).map(RuleId)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Some(listed) if a manifest is configured.
    pub fn is_listed_source(&self, path: &str) -> Option<bool> {
        self.sources.as_ref().map(|s| s.contains(path))
    }

    /// All rules matching `path`, highest priority first, one match per
    /// rule.  Two rules tied at the top priority is an error.
    pub fn matches(&self, path: &str) -> Result<Vec<RuleMatch>, RuleError> {
        let mut out: Vec<RuleMatch> = Vec::new();
        for idx in self.set.matches(path).iter() {
            let (rid, j) = self.set_owner[idx];
            if out.iter().any(|m| m.rule == rid) {
                continue;
            }
            let rule = &self.rules[rid.0];
            let Some(m) = rule.matchers().nth(j) else {
                continue;
            };
            // The set does not check repeated stems; the rule's own match does.
            let Some(bindings) = rule.match_with(m, path) else {
                continue;
            };
            let stems = rule.job_stems(m.target, &bindings);
            let job_name = rule.job_name(&stems)?;
            out.push(RuleMatch {
                rule: rid,
                target: m.target,
                stems,
                job_name,
            });
        }
        // Stable: equal priorities keep rule order for the error message.
        out.sort_by(|a, b| {
            let pa = self.rules[a.rule.0].prio;
            let pb = self.rules[b.rule.0].prio;
            pb.total_cmp(&pa)
        });
        if out.len() >= 2 && self.rules[out[0].rule.0].prio == self.rules[out[1].rule.0].prio {
            let top = self.rules[out[0].rule.0].prio;
            let rules = out
                .iter()
                .filter(|m| self.rules[m.rule.0].prio == top)
                .map(|m| self.rules[m.rule.0].name.clone())
                .collect();
            return Err(RuleError::MultiMatch {
                path: path.to_string(),
                rules,
            });
        }
        Ok(out)
    }

    /// Expand everything a job needs to run.  A dep expanding to an empty
    /// or external path makes the match inapplicable.
    pub fn instantiate(&self, m: &RuleMatch) -> Result<Instance, RuleError> {
        let rule = self.rule(m.rule);
        let deps = rule.expand_deps(&m.job_name, &m.stems)?;
        let cmd = rule.render_cmd(&m.stems, &deps)?;
        let resolved = rule.resolve(&m.stems, &deps)?;
        Ok(Instance {
            deps,
            cmd,
            resolved,
        })
    }

    /// Rebuild the match of an existing job from its recorded rule and stems.
    pub fn rematch(&self, rule: &str, stems: &SmallMap<String, String>) -> Option<RuleMatch> {
        let rid = self.by_name(rule)?;
        let r = self.rule(rid);
        let target = r.matchers().next()?.target;
        Some(RuleMatch {
            rule: rid,
            target,
            stems: stems.clone(),
            job_name: r.job_name(stems).ok()?,
        })
    }
}
