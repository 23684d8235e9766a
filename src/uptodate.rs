//! Static up-to-date checks: whether a job's recorded run still stands,
//! without running or building anything.

use crate::graph::{JobId, NodeId};
use crate::hash::FileDigest;
use crate::rules::RuleTable;
use crate::store::{Store, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};

/// Why a job must run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    NeverRun,
    /// The rule is gone or no longer instantiates for these stems.
    RuleGone,
    RuleChanged,
    DepChanged(String),
    /// A dep's producer is itself out of date.
    DepStale(String),
    ManualModification(String),
    TargetMissing(String),
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::NeverRun => write!(f, "never run"),
            Reason::RuleGone => write!(f, "rule gone"),
            Reason::RuleChanged => write!(f, "rule changed"),
            Reason::DepChanged(n) => write!(f, "dep changed: {}", n),
            Reason::DepStale(n) => write!(f, "dep out of date: {}", n),
            Reason::ManualModification(n) => write!(f, "manual modification: {}", n),
            Reason::TargetMissing(n) => write!(f, "target missing: {}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    UpToDate,
    Stale(Reason),
}

/// Things noticed about nodes while checking, for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    New(NodeId),
    Changed(NodeId),
    Manual(NodeId),
}

/// Compare the rule digest recorded for a job with what the current rules
/// produce.  None if unchanged.
pub fn rule_reason(store: &Store, rules: &RuleTable, id: JobId) -> Option<Reason> {
    let job = store.graph.job(id);
    let Some(recorded) = job.rule_digest else {
        return Some(Reason::NeverRun);
    };
    let Some(m) = rules.rematch(&job.rule, &job.stems) else {
        return Some(Reason::RuleGone);
    };
    let Ok(inst) = rules.instantiate(&m) else {
        return Some(Reason::RuleGone);
    };
    let digest = rules
        .rule(m.rule)
        .job_digest(&job.name, &inst.cmd, &inst.resolved);
    (digest != recorded).then_some(Reason::RuleChanged)
}

/// Compare a job's recorded targets with the disk.  A target that differs
/// is a manual modification, recorded on the node.
pub fn target_reason(
    store: &mut Store,
    id: JobId,
    events: &mut Vec<NodeEvent>,
) -> Result<Option<Reason>, StoreError> {
    let targets = store.graph.job(id).targets.clone();
    for t in targets {
        let now = store.observe(t.node)?.digest;
        if now == t.digest {
            continue;
        }
        let name = store.graph.node(t.node).name.clone();
        if !now.exists() {
            if t.flags.phony || t.flags.optional {
                continue;
            }
            return Ok(Some(Reason::TargetMissing(name)));
        }
        if !store.graph.node(t.node).manual {
            events.push(NodeEvent::Manual(t.node));
        }
        store.set_manual(t.node, true)?;
        return Ok(Some(Reason::ManualModification(name)));
    }
    Ok(None)
}

/// Memoized recursive checker.  One per query batch; the memo assumes the
/// disk does not change underneath.
pub struct Checker<'a> {
    store: &'a mut Store,
    rules: &'a RuleTable,
    max_depth: usize,
    memo: FxHashMap<JobId, Verdict>,
    visiting: FxHashSet<JobId>,
    observed: FxHashSet<NodeId>,
    pub events: Vec<NodeEvent>,
}

impl<'a> Checker<'a> {
    pub fn new(store: &'a mut Store, rules: &'a RuleTable, max_depth: usize) -> Self {
        Checker {
            store,
            rules,
            max_depth,
            memo: FxHashMap::default(),
            visiting: FxHashSet::default(),
            observed: FxHashSet::default(),
            events: Vec::new(),
        }
    }

    pub fn check_job(&mut self, id: JobId) -> Result<Verdict, StoreError> {
        self.visit(id, 0)
    }

    fn visit(&mut self, id: JobId, depth: usize) -> Result<Verdict, StoreError> {
        if let Some(v) = self.memo.get(&id) {
            return Ok(v.clone());
        }
        if depth > self.max_depth {
            return Err(StoreError::TooDeep {
                job: self.store.graph.job(id).name.clone(),
                depth: self.max_depth,
            });
        }
        if !self.visiting.insert(id) {
            return Err(StoreError::Loop {
                job: self.store.graph.job(id).name.clone(),
            });
        }
        let verdict = self.evaluate(id, depth);
        self.visiting.remove(&id);
        let verdict = verdict?;
        tracing::trace!(job = %self.store.graph.job(id).name, ?verdict, "checked");
        self.memo.insert(id, verdict.clone());
        Ok(verdict)
    }

    /// Current content of a dep, checking its producer first.
    fn dep_digest(&mut self, node: NodeId, depth: usize) -> Result<Result<FileDigest, Reason>, StoreError> {
        let n = self.store.graph.node(node);
        if let (Some(producer), false) = (n.producer, n.frozen) {
            if let Verdict::Stale(_) = self.visit(producer, depth + 1)? {
                let name = self.store.graph.node(node).name.clone();
                return Ok(Err(Reason::DepStale(name)));
            }
        }
        let seen = self.store.observe(node)?;
        if self.observed.insert(node) {
            if seen.is_new() {
                self.events.push(NodeEvent::New(node));
            } else if seen.is_changed() {
                self.events.push(NodeEvent::Changed(node));
            }
        }
        Ok(Ok(seen.digest))
    }

    fn evaluate(&mut self, id: JobId, depth: usize) -> Result<Verdict, StoreError> {
        if let Some(reason) = rule_reason(self.store, self.rules, id) {
            return Ok(Verdict::Stale(reason));
        }
        if let Some(reason) = target_reason(self.store, id, &mut self.events)? {
            return Ok(Verdict::Stale(reason));
        }
        let deps = self.store.graph.job(id).deps.clone();
        // The first modified dep decides; anything after it, notably past a
        // critical one, was never looked at by the job in this configuration.
        for dep in deps {
            let now = match self.dep_digest(dep.node, depth)? {
                Ok(d) => d,
                Err(reason) => return Ok(Verdict::Stale(reason)),
            };
            if now != dep.digest {
                let name = self.store.graph.node(dep.node).name.clone();
                return Ok(Verdict::Stale(Reason::DepChanged(name)));
            }
        }
        Ok(Verdict::UpToDate)
    }
}
