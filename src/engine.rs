//! The engine: brings goals up to date, discovering dependencies while jobs
//! run.
//!
//! Single threaded.  Backend workers and control sockets talk to it over
//! one channel; it owns the store, the scheduler and the caches.  State
//! kept here is per invocation and layered over the persistent graph:
//! what has been asked of each node and job during this build.

use crate::autodep::protocol::{EngineRequest, NewDep, Reply};
use crate::backend::scheduler::Scheduler;
use crate::cache::{Cache, CacheEntry, CacheMode, EntryMeta};
use crate::codec;
use crate::config::EngineConfig;
use crate::exec::{ExecOutcome, ExecSpec, JobMsg, Termination};
use crate::graph::{Accesses, Dep, JobId, JobStatus, NodeId, NodeStatus, Target};
use crate::hash::{self, deps_digest, Digest, FileDigest, FileKind, FileSig};
use crate::progress::{Progress, ReportKey, Summary};
use crate::rules::table::Instance;
use crate::rules::{DepFlags, RuleError, RuleId, RuleTable, TargetFlags};
use crate::signal;
use crate::store::{JobOutcome, Observation, Store};
use crate::uptodate::{self, NodeEvent, Reason};
use anyhow::{bail, Context};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Upper bound on how long the loop sleeps, so that Ctrl-C is noticed.
const MAX_TICK: Duration = Duration::from_millis(200);

/// What a node turned out to be, once known.
#[derive(Debug, Clone, PartialEq)]
enum NodeOutcome {
    Ok(FileDigest),
    Absent,
    Err(String),
}

impl NodeOutcome {
    fn digest(&self) -> Option<FileDigest> {
        match self {
            NodeOutcome::Ok(d) => Some(*d),
            NodeOutcome::Absent => Some(FileDigest::Absent),
            NodeOutcome::Err(_) => None,
        }
    }

    /// The error seen by a dep with `flags` on this node.
    fn error(&self, name: &str, flags: DepFlags) -> Option<String> {
        match self {
            NodeOutcome::Err(msg) => Some(msg.clone()),
            NodeOutcome::Absent if flags.must_exist() => Some(format!("{} is missing", name)),
            _ => None,
        }
    }
}

enum NodeState {
    Pending(JobId),
    Resolved(NodeOutcome),
}

struct NodeReq {
    state: NodeState,
    producer: Option<JobId>,
    /// Jobs to analyze again once this node is resolved.
    waiting: Vec<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Being analyzed, or waiting for deps.
    Waiting,
    Queued,
    Running,
    Done(bool),
}

struct JobReq {
    phase: Phase,
    rule: RuleId,
    inst: Instance,
    rule_digest: Digest,
    /// Launched on a guess; failures stay quiet until confirmed.
    speculative: bool,
    depth: usize,
    /// Identifies the current execution.
    seq: u32,
    /// Rule and targets were checked.
    checked: bool,
    reason: Option<Reason>,
    /// Nodes pending on this job.
    nodes: Vec<NodeId>,
    /// Deps asked for, in order.
    deps: Vec<NodeId>,
    discovered: Vec<NewDep>,
    declared: Vec<(String, TargetFlags)>,
    /// The running job was told one of its deps is in error.
    dep_error: bool,
    deferred: Option<(ReportKey, Vec<u8>)>,
}

/// A running job blocked until some nodes are resolved.
struct PendingReply {
    job: JobId,
    nodes: Vec<(NodeId, DepFlags)>,
    reply: Sender<Reply>,
}

enum Analysis {
    Waiting,
    UpToDate,
    MustRun(Reason),
    DepErr(String),
}

pub struct Engine<'a> {
    store: &'a mut Store,
    rules: &'a RuleTable,
    config: &'a EngineConfig,
    progress: &'a mut dyn Progress,
    scheduler: Scheduler,
    caches: BTreeMap<String, Box<dyn Cache>>,
    cache_mode: CacheMode,
    autodep_lib: Option<PathBuf>,
    tx: Sender<JobMsg>,
    rx: Receiver<JobMsg>,
    nodes: FxHashMap<NodeId, NodeReq>,
    jobs: FxHashMap<JobId, JobReq>,
    /// Jobs to analyze.
    ready: VecDeque<JobId>,
    replies: Vec<PendingReply>,
    summary: Summary,
    seq: u32,
}

impl<'a> Engine<'a> {
    pub fn new(
        store: &'a mut Store,
        rules: &'a RuleTable,
        config: &'a EngineConfig,
        scheduler: Scheduler,
        progress: &'a mut dyn Progress,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Engine {
            store,
            rules,
            config,
            progress,
            scheduler,
            caches: BTreeMap::new(),
            cache_mode: CacheMode::None,
            autodep_lib: None,
            tx,
            rx,
            nodes: FxHashMap::default(),
            jobs: FxHashMap::default(),
            ready: VecDeque::new(),
            replies: Vec::new(),
            summary: Summary::default(),
            seq: 0,
        }
    }

    pub fn with_caches(mut self, caches: BTreeMap<String, Box<dyn Cache>>, mode: CacheMode) -> Self {
        self.caches = caches;
        self.cache_mode = mode;
        self
    }

    pub fn with_autodep_lib(mut self, lib: Option<PathBuf>) -> Self {
        self.autodep_lib = lib;
        self
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    fn report(&mut self, key: ReportKey, name: &str) {
        self.summary.add(key);
        self.progress.report(key, name);
    }

    fn node_name(&self, id: NodeId) -> String {
        self.store.graph.node(id).name.clone()
    }

    fn job_name(&self, id: JobId) -> String {
        self.store.graph.job(id).name.clone()
    }

    fn node_events(&mut self, events: Vec<NodeEvent>) {
        for e in events {
            let (key, node) = match e {
                NodeEvent::New(n) => (ReportKey::New, n),
                NodeEvent::Changed(n) => (ReportKey::Changed, n),
                NodeEvent::Manual(n) => (ReportKey::Manual, n),
            };
            let name = self.node_name(node);
            self.report(key, &name);
        }
    }

    /// Bring `goals` up to date.  Returns whether all of them are ok.
    pub fn build(&mut self, goals: &[String]) -> anyhow::Result<bool> {
        let goal_nodes: Vec<NodeId> = goals
            .iter()
            .map(|g| self.store.get_or_create_node(g))
            .collect();
        for &node in &goal_nodes {
            self.need_node(node, 0, false);
        }
        let mut interrupted = false;
        loop {
            while let Some(job) = self.ready.pop_front() {
                self.analyze(job)?;
            }
            if goal_nodes.iter().all(|&n| self.is_resolved(n)) {
                // Whatever still runs was started on a guess.
                for job in self.scheduler.kill_all() {
                    tracing::debug!(job = %self.job_name(job), "no longer needed");
                }
                break;
            }
            if signal::interrupted() {
                self.interrupt();
                interrupted = true;
                break;
            }
            for (job, err) in self.scheduler.launch(&self.tx) {
                self.fail(job, ReportKey::Failed, format!("{}\n", err).into_bytes())?;
            }
            if !self.ready.is_empty() {
                continue;
            }
            if self.scheduler.running_count() == 0 && self.scheduler.queued_count() == 0 {
                if !self.break_cycles()? {
                    bail!("build stalled with nothing to run");
                }
                continue;
            }
            for job in self.scheduler.heartbeat() {
                self.lost(job)?;
            }
            let tick = self.scheduler.tick().min(MAX_TICK);
            match self.rx.recv_timeout(tick) {
                Ok(msg) => self.handle(msg)?,
                Err(RecvTimeoutError::Timeout) => {
                    if self.stuck() {
                        self.break_cycles()?;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => bail!("job channel closed"),
            }
        }
        // Killed jobs must be gone before their targets are looked at again.
        self.scheduler.drain();

        let mut ok = !interrupted;
        for &node in &goal_nodes {
            let name = self.node_name(node);
            match self.nodes.get(&node).map(|r| (&r.state, r.producer)) {
                Some((NodeState::Resolved(NodeOutcome::Ok(_)), _)) => {}
                Some((NodeState::Resolved(NodeOutcome::Absent), None)) => {
                    self.progress.message(&format!("don't know how to make {}", name));
                    ok = false;
                }
                Some((NodeState::Resolved(NodeOutcome::Err(msg)), None)) => {
                    let msg = format!("error: {}", msg);
                    self.progress.message(&msg);
                    ok = false;
                }
                _ => ok = false,
            }
        }
        self.summary.unconfirmed = self.jobs.values().filter(|j| j.deferred.is_some()).count();
        self.summary.ok = ok;
        self.progress.finish(&self.summary);
        Ok(ok)
    }

    fn is_resolved(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(&node),
            Some(NodeReq {
                state: NodeState::Resolved(_),
                ..
            })
        )
    }

    /// Ask for a node.  Returns its outcome if it is known now; otherwise
    /// the node is pending on a job.
    fn need_node(&mut self, id: NodeId, depth: usize, speculative: bool) -> Option<NodeOutcome> {
        if let Some(req) = self.nodes.get(&id) {
            let (outcome, producer) = match &req.state {
                NodeState::Pending(job) => (None, Some(*job)),
                NodeState::Resolved(o) => (Some(o.clone()), req.producer),
            };
            if !speculative {
                if let Some(job) = producer {
                    self.confirm(job);
                }
            }
            return outcome;
        }
        let rules = self.rules;
        let name = self.node_name(id);
        if depth > self.config.max_dep_depth {
            let msg = format!(
                "{}: dependency chain deeper than {}",
                name, self.config.max_dep_depth
            );
            return Some(self.resolve(id, NodeOutcome::Err(msg), None));
        }
        if self.store.graph.node(id).frozen {
            return Some(self.source(id));
        }
        let matches = match rules.matches(&name) {
            Ok(m) => m,
            Err(err) => return Some(self.resolve(id, NodeOutcome::Err(err.to_string()), None)),
        };
        for m in matches {
            match rules.instantiate(&m) {
                Ok(inst) => {
                    let rule = rules.rule(m.rule);
                    let job = self.store.get_or_create_job(&rule.name, &m.job_name, &m.stems);
                    self.store.graph.node_mut(id).status = NodeStatus::Buildable;
                    self.start_job(job, m.rule, inst, depth, speculative);
                    return self.attach(id, job);
                }
                Err(RuleError::BadDep { .. }) => {
                    tracing::debug!(node = %name, rule = %rules.rule(m.rule).name, "rule does not apply");
                    self.report(ReportKey::BadDep, &m.job_name);
                }
                Err(err) => return Some(self.resolve(id, NodeOutcome::Err(err.to_string()), None)),
            }
        }

        let seen = match self.store.observe(id) {
            Ok(p) => p,
            Err(err) => return Some(self.resolve(id, NodeOutcome::Err(err.to_string()), None)),
        };
        match (rules.is_listed_source(&name), seen.digest.exists()) {
            (Some(true), _) | (None, true) => Some(self.record_source(id, seen)),
            (Some(false), true) => {
                self.store.graph.node_mut(id).status = NodeStatus::Dangling;
                self.report(ReportKey::Dangling, &name);
                let msg = format!("{} is dangling: not a source and no rule makes it", name);
                Some(self.resolve(id, NodeOutcome::Err(msg), None))
            }
            (_, false) => {
                self.store.graph.node_mut(id).status = NodeStatus::NoTarget;
                Some(self.resolve(id, NodeOutcome::Absent, None))
            }
        }
    }

    fn source(&mut self, id: NodeId) -> NodeOutcome {
        match self.store.observe(id) {
            Ok(p) => self.record_source(id, p),
            Err(err) => self.resolve(id, NodeOutcome::Err(err.to_string()), None),
        }
    }

    fn record_source(&mut self, id: NodeId, p: Observation) -> NodeOutcome {
        self.store.graph.node_mut(id).status = NodeStatus::Source;
        let name = self.node_name(id);
        if p.is_new() {
            self.report(ReportKey::New, &name);
        } else if p.is_changed() {
            self.report(ReportKey::Changed, &name);
        }
        let outcome = match self.store.save_node(id) {
            Ok(()) => observed_outcome(&p),
            Err(err) => NodeOutcome::Err(err.to_string()),
        };
        self.resolve(id, outcome, None)
    }

    fn resolve(&mut self, id: NodeId, outcome: NodeOutcome, producer: Option<JobId>) -> NodeOutcome {
        let req = self.nodes.entry(id).or_insert(NodeReq {
            state: NodeState::Resolved(NodeOutcome::Absent),
            producer: None,
            waiting: Vec::new(),
        });
        req.state = NodeState::Resolved(outcome.clone());
        req.producer = producer;
        for job in std::mem::take(&mut req.waiting) {
            self.ready.push_back(job);
        }
        outcome
    }

    /// Make a node depend on a job of this build.
    fn attach(&mut self, id: NodeId, job: JobId) -> Option<NodeOutcome> {
        match self.jobs.get_mut(&job) {
            Some(jr) if !matches!(jr.phase, Phase::Done(_)) => {
                jr.nodes.push(id);
                self.nodes.insert(
                    id,
                    NodeReq {
                        state: NodeState::Pending(job),
                        producer: Some(job),
                        waiting: Vec::new(),
                    },
                );
                None
            }
            Some(jr) => {
                let ok = jr.phase == Phase::Done(true);
                let outcome = self.produced(job, id, ok);
                Some(self.resolve(id, outcome, Some(job)))
            }
            None => None,
        }
    }

    /// What a node is once its job completed.
    fn produced(&mut self, job: JobId, node: NodeId, ok: bool) -> NodeOutcome {
        if !ok {
            return NodeOutcome::Err(format!("{} failed", self.job_name(job)));
        }
        let phony = self
            .store
            .graph
            .job(job)
            .targets
            .iter()
            .any(|t| t.node == node && t.flags.phony);
        match self.store.observe(node) {
            Ok(p) if p.digest.exists() || phony => NodeOutcome::Ok(p.digest),
            Ok(_) => NodeOutcome::Absent,
            Err(err) => NodeOutcome::Err(err.to_string()),
        }
    }

    fn start_job(&mut self, job: JobId, rule: RuleId, inst: Instance, depth: usize, speculative: bool) {
        if self.jobs.contains_key(&job) {
            if !speculative {
                self.confirm(job);
            }
            return;
        }
        let name = self.job_name(job);
        let rule_digest = self
            .rules
            .rule(rule)
            .job_digest(&name, &inst.cmd, &inst.resolved);
        let j = self.store.graph.job_mut(job);
        j.submits = 0;
        j.lost = 0;
        self.jobs.insert(
            job,
            JobReq {
                phase: Phase::Waiting,
                rule,
                inst,
                rule_digest,
                speculative,
                depth,
                seq: 0,
                checked: false,
                reason: None,
                nodes: Vec::new(),
                deps: Vec::new(),
                discovered: Vec::new(),
                declared: Vec::new(),
                dep_error: false,
                deferred: None,
            },
        );
        self.ready.push_back(job);
    }

    /// A job turned out to be needed: surface its failure if it was kept
    /// quiet, and do the same for whatever it failed on.
    fn confirm(&mut self, job: JobId) {
        let mut stack = vec![job];
        let mut visited = FxHashSet::default();
        while let Some(j) = stack.pop() {
            if !visited.insert(j) {
                continue;
            }
            let Some(jr) = self.jobs.get_mut(&j) else {
                continue;
            };
            if !std::mem::replace(&mut jr.speculative, false) {
                continue;
            }
            let deferred = jr.deferred.take();
            let deps = jr.deps.clone();
            if let Some((key, text)) = deferred {
                let name = self.job_name(j);
                self.report(key, &name);
                self.progress.output(&name, &text);
            }
            for node in deps {
                if let Some(NodeReq {
                    state: NodeState::Resolved(NodeOutcome::Err(_)),
                    producer: Some(p),
                    ..
                }) = self.nodes.get(&node)
                {
                    stack.push(*p);
                }
            }
        }
    }

    fn analyze(&mut self, job: JobId) -> anyhow::Result<()> {
        match self.jobs.get(&job) {
            Some(jr) if jr.phase == Phase::Waiting => {}
            _ => return Ok(()),
        }
        if !self.jobs[&job].checked {
            let mut events = Vec::new();
            let reason = match uptodate::rule_reason(self.store, self.rules, job) {
                Some(r) => Some(r),
                None => uptodate::target_reason(self.store, job, &mut events)?,
            };
            self.node_events(events);
            if let Some(jr) = self.jobs.get_mut(&job) {
                jr.checked = true;
                jr.reason = reason;
            }
        }
        let analysis = if self.jobs[&job].reason.is_some() {
            self.scan_static(job)
        } else {
            match self.scan_recorded(job) {
                Analysis::MustRun(reason) => {
                    if let Some(jr) = self.jobs.get_mut(&job) {
                        jr.reason = Some(reason);
                    }
                    self.scan_static(job)
                }
                other => other,
            }
        };
        match analysis {
            Analysis::Waiting => Ok(()),
            Analysis::UpToDate => {
                if self.store.graph.job(job).status == JobStatus::Failed {
                    self.fail(job, ReportKey::WasFailed, Vec::new())
                } else {
                    self.complete_job(job, true);
                    Ok(())
                }
            }
            Analysis::DepErr(msg) => {
                tracing::debug!(job = %self.job_name(job), %msg, "dep error");
                self.fail(job, ReportKey::DepErr, format!("{}\n", msg).into_bytes())
            }
            Analysis::MustRun(reason) => self.must_run(job, reason),
        }
    }

    fn scan_static(&mut self, job: JobId) -> Analysis {
        let deps: Vec<(String, DepFlags)> = self.jobs[&job]
            .inst
            .deps
            .iter()
            .map(|d| (d.path.clone(), d.flags))
            .collect();
        let deps = deps
            .into_iter()
            .map(|(path, flags)| (self.store.get_or_create_node(&path), flags, None))
            .collect();
        match self.scan(job, deps) {
            // Static deps alone cannot make a job run; it runs anyway.
            Analysis::UpToDate => match self.jobs[&job].reason.clone() {
                Some(reason) => Analysis::MustRun(reason),
                None => Analysis::UpToDate,
            },
            other => other,
        }
    }

    fn scan_recorded(&mut self, job: JobId) -> Analysis {
        let deps = self
            .store
            .graph
            .job(job)
            .deps
            .iter()
            .map(|d| (d.node, d.flags, Some(d.digest)))
            .collect();
        self.scan(job, deps)
    }

    /// Walk deps in order, asking for each.  Deps past an unresolved one
    /// are asked speculatively; the scan stops at a critical dep that is
    /// unresolved or modified.
    fn scan(&mut self, job: JobId, deps: Vec<(NodeId, DepFlags, Option<FileDigest>)>) -> Analysis {
        let (depth, speculative) = {
            let jr = &self.jobs[&job];
            (jr.depth, jr.speculative)
        };
        let mut decisive = true;
        let mut pending = false;
        let mut reason = None;
        // The first error past an undecided dep, and whether it is static.
        let mut deferred: Option<(String, bool)> = None;
        for (node, flags, recorded) in deps {
            if let Some(jr) = self.jobs.get_mut(&job) {
                if !jr.deps.contains(&node) {
                    jr.deps.push(node);
                }
            }
            let Some(outcome) = self.need_node(node, depth + 1, speculative || !decisive) else {
                pending = true;
                if let Some(req) = self.nodes.get_mut(&node) {
                    if !req.waiting.contains(&job) {
                        req.waiting.push(job);
                    }
                }
                if flags.critical {
                    break;
                }
                decisive = false;
                continue;
            };
            let name = self.node_name(node);
            if let Some(msg) = outcome.error(&name, flags) {
                if flags.error_matters() {
                    let msg = format!("required dep {}: {}", name, msg);
                    if decisive {
                        return Analysis::DepErr(msg);
                    }
                    deferred.get_or_insert((msg, flags.is_static));
                }
                continue;
            }
            if let (Some(rec), Some(now)) = (recorded, outcome.digest()) {
                if rec != now {
                    if decisive && reason.is_none() {
                        reason = Some(Reason::DepChanged(name));
                    }
                    decisive = false;
                    if flags.critical {
                        break;
                    }
                }
            }
        }
        if pending {
            return Analysis::Waiting;
        }
        match (reason, deferred) {
            (Some(_), Some((msg, true))) => Analysis::DepErr(msg),
            (Some(reason), _) => Analysis::MustRun(reason),
            (None, Some((msg, _))) => Analysis::DepErr(msg),
            (None, None) => Analysis::UpToDate,
        }
    }

    /// Report a job failure, or keep it for later if the job is
    /// speculative, then complete the job.
    fn fail(&mut self, job: JobId, key: ReportKey, text: Vec<u8>) -> anyhow::Result<()> {
        let Some(jr) = self.jobs.get_mut(&job) else {
            return Ok(());
        };
        if jr.speculative {
            let key = if key == ReportKey::Failed {
                ReportKey::WasFailed
            } else {
                key
            };
            jr.deferred = Some((key, text));
        } else {
            // Speculative jobs whose failure this one depends on are needed
            // after all.
            let culprits: Vec<JobId> = jr
                .deps
                .iter()
                .filter_map(|node| match self.nodes.get(node) {
                    Some(NodeReq {
                        state: NodeState::Resolved(NodeOutcome::Err(_)),
                        producer: Some(p),
                        ..
                    }) => Some(*p),
                    _ => None,
                })
                .collect();
            for p in culprits {
                self.confirm(p);
            }
            let name = self.job_name(job);
            self.report(key, &name);
            self.progress.output(&name, &text);
        }
        self.complete_job(job, false);
        Ok(())
    }

    fn must_run(&mut self, job: JobId, reason: Reason) -> anyhow::Result<()> {
        let name = self.job_name(job);
        tracing::info!(job = %name, %reason, "must run");
        self.quarantine(job)?;
        let max_submits = self.jobs[&job]
            .inst
            .resolved
            .max_submits
            .unwrap_or(self.config.max_submits);
        let submits = self.store.graph.job(job).submits;
        if submits >= max_submits {
            let msg = format!("submit loop: ran {} times without settling\n", submits);
            return self.fail(job, ReportKey::Failed, msg.into_bytes());
        }
        if self.try_cache(job)? {
            return Ok(());
        }
        self.submit(job)
    }

    /// Move manually modified targets aside before the job overwrites them.
    fn quarantine(&mut self, job: JobId) -> anyhow::Result<()> {
        let targets: Vec<(NodeId, TargetFlags)> = self
            .store
            .graph
            .job(job)
            .targets
            .iter()
            .map(|t| (t.node, t.flags))
            .collect();
        for (node, flags) in targets {
            if !self.store.graph.node(node).manual || flags.manual_ok || flags.source_ok {
                continue;
            }
            let name = self.node_name(node);
            let from = self.store.root().abs(&name);
            let to = self.store.root().admin_dir().join("quarantine").join(&name);
            if let Some(dir) = to.parent() {
                std::fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))?;
            }
            match std::fs::rename(&from, &to) {
                Ok(()) => self.report(ReportKey::Quarantine, &name),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("quarantine {}", name)),
            }
            self.store.set_manual(node, false)?;
        }
        Ok(())
    }

    fn submit(&mut self, job: JobId) -> anyhow::Result<()> {
        self.seq += 1;
        let seq = self.seq;
        // Previous outputs must not be mistaken for fresh ones.
        let stale: Vec<String> = self
            .store
            .graph
            .job(job)
            .targets
            .iter()
            .filter(|t| !t.flags.incremental && self.store.graph.node(t.node).producer == Some(job))
            .map(|t| self.node_name(t.node))
            .collect();
        for name in stale {
            match std::fs::remove_file(self.store.root().abs(&name)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("remove {}", name)),
            }
        }
        let spec = self.exec_spec(job, seq);
        let exec_time = self.store.graph.job(job).exec_time;
        let Some(jr) = self.jobs.get_mut(&job) else {
            return Ok(());
        };
        jr.seq = seq;
        jr.discovered.clear();
        jr.declared.clear();
        jr.dep_error = false;
        let backend = jr.inst.resolved.backend.clone();
        let resources = jr.inst.resolved.resources.clone();
        match self.scheduler.enqueue(spec, &backend, &resources, exec_time) {
            Ok(_) => {
                if let Some(jr) = self.jobs.get_mut(&job) {
                    jr.phase = Phase::Queued;
                }
                self.store.graph.job_mut(job).submits += 1;
                Ok(())
            }
            Err(err) => self.fail(job, ReportKey::Failed, format!("{}\n", err).into_bytes()),
        }
    }

    fn exec_spec(&self, job: JobId, seq: u32) -> ExecSpec {
        let jr = &self.jobs[&job];
        let j = self.store.graph.job(job);
        let r = &jr.inst.resolved;
        let stdout_target = self
            .rules
            .rule(jr.rule)
            .static_targets(&j.stems)
            .ok()
            .and_then(|ts| ts.into_iter().find(|(_, f)| f.stdout).map(|(n, _)| n));
        ExecSpec {
            job,
            seq,
            name: j.name.clone(),
            cmd: jr.inst.cmd.clone(),
            root: self.store.root().clone(),
            env: r.env.clone(),
            autodep: r.autodep,
            autodep_lib: self.autodep_lib.clone(),
            timeout: r.timeout.map(Duration::from_secs_f64),
            kill_sigs: r
                .kill_sigs
                .clone()
                .unwrap_or_else(|| self.config.kill_sigs.clone()),
            kill_grace: Duration::from_secs_f64(self.config.kill_grace),
            stdout_target,
            keep_tmp: r.keep_tmp,
        }
    }

    /// Look the job up in its cache.  Returns whether it was satisfied.
    fn try_cache(&mut self, job: JobId) -> anyhow::Result<bool> {
        if !self.cache_mode.download() {
            return Ok(false);
        }
        let jr = &self.jobs[&job];
        let Some(cache_name) = jr.inst.resolved.cache.clone() else {
            return Ok(false);
        };
        let key = jr.rule_digest;
        let Engine {
            caches,
            store,
            nodes,
            rules,
            ..
        } = self;
        let Some(cache) = caches.get_mut(&cache_name) else {
            tracing::warn!(cache = %cache_name, "no such cache");
            return Ok(false);
        };
        let root = store.root().clone();
        let graph = &store.graph;
        let mut current = |name: &str| -> Option<FileDigest> {
            if let Some(id) = graph.node_id(name) {
                if let Some(NodeReq {
                    state: NodeState::Resolved(o),
                    ..
                }) = nodes.get(&id)
                {
                    return o.digest();
                }
            }
            // Only plain sources can be judged without building anything.
            match rules.matches(name) {
                Ok(m) if m.is_empty() => hash::observe(&root.abs(name)).ok().map(|(_, d)| d),
                _ => None,
            }
        };
        let entry = match cache.fetch(&key, &mut current) {
            Ok(Some(e)) => e,
            Ok(None) => return Ok(false),
            Err(err) => {
                tracing::warn!(cache = %cache_name, %err, "fetch failed");
                return Ok(false);
            }
        };
        if let Err(err) = self.restore(job, key, &entry) {
            tracing::warn!(job = %self.job_name(job), "restoring from cache: {:#}", err);
            return Ok(false);
        }
        let name = self.job_name(job);
        self.report(ReportKey::Hit, &name);
        self.progress.output(&name, &entry.stderr);
        self.complete_job(job, true);
        Ok(true)
    }

    fn restore(&mut self, job: JobId, key: Digest, entry: &CacheEntry) -> anyhow::Result<()> {
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::fs::PermissionsExt;
        for ((name, digest), data) in entry.meta.targets.iter().zip(&entry.contents) {
            let path = self.store.root().abs(name);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            match std::fs::remove_file(&path) {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
            match digest {
                FileDigest::Absent => {}
                FileDigest::Link(_) => {
                    std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(data), &path)?
                }
                FileDigest::File(_) => std::fs::write(&path, data)?,
                FileDigest::Exe(_) => {
                    std::fs::write(&path, data)?;
                    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
                }
            }
        }
        let rules = self.rules;
        let jr = &self.jobs[&job];
        let rule = rules.rule(jr.rule);
        let stems = self.store.graph.job(job).stems.clone();
        let exec_time = self.store.graph.job(job).exec_time;
        let statics: Vec<(String, DepFlags)> =
            jr.inst.deps.iter().map(|d| (d.path.clone(), d.flags)).collect();
        let resources = jr.inst.resolved.resources.clone();
        let rule_digest = jr.rule_digest;
        let static_targets = rule.static_targets(&stems).unwrap_or_default();
        let mut targets = Vec::new();
        for (name, digest) in &entry.meta.targets {
            let flags = static_targets
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, f)| *f)
                .or_else(|| rule.target_flags(&stems, name))
                .unwrap_or_default();
            targets.push(Target {
                node: self.store.get_or_create_node(name),
                flags,
                digest: *digest,
            });
        }
        let mut deps = Vec::new();
        for (name, digest) in &entry.meta.deps {
            let flags = statics
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, f)| *f)
                .unwrap_or_default();
            deps.push(Dep {
                node: self.store.get_or_create_node(name),
                flags,
                accesses: Accesses {
                    read: true,
                    stat: false,
                },
                digest: *digest,
            });
        }
        self.store.commit_job(
            job,
            JobOutcome {
                status: JobStatus::Done,
                deps,
                targets,
                rule_digest,
                job_digest: Some(deps_digest(&key, &entry.meta.deps)),
                resources,
                exec_time,
            },
        )?;
        Ok(())
    }

    /// The job if `seq` is its current execution.
    fn live(&mut self, job: JobId, seq: u32) -> Option<&mut JobReq> {
        self.jobs
            .get_mut(&job)
            .filter(|jr| jr.seq == seq && matches!(jr.phase, Phase::Queued | Phase::Running))
    }

    fn handle(&mut self, msg: JobMsg) -> anyhow::Result<()> {
        match msg {
            JobMsg::Started { job, seq } => {
                if let Some(jr) = self.live(job, seq) {
                    jr.phase = Phase::Running;
                }
                Ok(())
            }
            JobMsg::Request {
                job,
                seq,
                req,
                reply,
            } => {
                if self.live(job, seq).is_none() {
                    // Dropping `reply` tells the job it is no longer wanted.
                    return Ok(());
                }
                self.request(job, req, reply);
                Ok(())
            }
            JobMsg::Finished { job, seq, outcome } => {
                if self.live(job, seq).is_none() {
                    return Ok(());
                }
                self.scheduler.finished(job);
                self.finalize(job, outcome)
            }
        }
    }

    fn request(&mut self, job: JobId, req: EngineRequest, reply: Sender<Reply>) {
        match req {
            EngineRequest::Deps(deps) => {
                let depth = self.jobs[&job].depth;
                let mut nodes = Vec::with_capacity(deps.len());
                for d in deps {
                    if self.is_own_target(job, &d.name) {
                        continue;
                    }
                    let node = self.store.get_or_create_node(&d.name);
                    if let Some(jr) = self.jobs.get_mut(&job) {
                        match jr.discovered.iter_mut().find(|x| x.name == d.name) {
                            Some(x) => {
                                x.flags.merge(d.flags);
                                x.accesses.read |= d.accesses.read;
                                x.accesses.stat |= d.accesses.stat;
                            }
                            None => jr.discovered.push(d.clone()),
                        }
                        if !jr.deps.contains(&node) {
                            jr.deps.push(node);
                        }
                    }
                    // An actual access: whatever produces it is needed.
                    self.need_node(node, depth + 1, false);
                    nodes.push((node, d.flags));
                }
                self.answer_or_wait(job, nodes, reply);
            }
            EngineRequest::Targets(targets) => {
                if let Some(jr) = self.jobs.get_mut(&job) {
                    jr.declared.extend(targets);
                }
                let _ = reply.send(Reply::Ok);
            }
            EngineRequest::CheckDeps => {
                let discovered: Vec<(String, DepFlags)> = self.jobs[&job]
                    .discovered
                    .iter()
                    .map(|d| (d.name.clone(), d.flags))
                    .collect();
                let nodes = discovered
                    .into_iter()
                    .map(|(name, flags)| (self.store.get_or_create_node(&name), flags))
                    .collect();
                self.answer_or_wait(job, nodes, reply);
            }
            EngineRequest::Encode {
                file,
                ctx,
                value,
                min_len,
            } => {
                let path = self.store.root().abs(&file);
                let r = match codec::encode(&path, &ctx, &value, min_len) {
                    Ok(code) => Reply::Code { code },
                    Err(err) => Reply::error(format!("{}: {}", file, err)),
                };
                let _ = reply.send(r);
            }
            EngineRequest::Decode { file, ctx, code } => {
                let path = self.store.root().abs(&file);
                let r = match codec::decode(&path, &ctx, &code) {
                    Ok(Some(value)) => Reply::Value { value },
                    Ok(None) => Reply::error(format!("{}: no code {} in {}", file, code, ctx)),
                    Err(err) => Reply::error(format!("{}: {}", file, err)),
                };
                let _ = reply.send(r);
            }
        }
    }

    /// Whether a job reading `name` reads back its own output.
    fn is_own_target(&self, job: JobId, name: &str) -> bool {
        let Some(jr) = self.jobs.get(&job) else {
            return false;
        };
        let stems = &self.store.graph.job(job).stems;
        jr.declared.iter().any(|(n, _)| n == name)
            || self.rules.rule(jr.rule).target_flags(stems, name).is_some()
    }

    /// The reply to a request about `nodes`, if all of them are resolved.
    fn answer(&self, nodes: &[(NodeId, DepFlags)]) -> Option<Reply> {
        let mut error = None;
        for &(node, flags) in nodes {
            let Some(NodeReq {
                state: NodeState::Resolved(o),
                ..
            }) = self.nodes.get(&node)
            else {
                return None;
            };
            if error.is_none() && flags.error_matters() {
                let name = &self.store.graph.node(node).name;
                error = o.error(name, flags).map(|msg| format!("{}: {}", name, msg));
            }
        }
        Some(error.map_or(Reply::Ok, Reply::error))
    }

    fn answer_or_wait(&mut self, job: JobId, nodes: Vec<(NodeId, DepFlags)>, reply: Sender<Reply>) {
        match self.answer(&nodes) {
            Some(r) => self.send_reply(job, r, reply),
            None => {
                // Let others use the job's resources while it waits.
                self.scheduler.lend(job);
                self.replies.push(PendingReply { job, nodes, reply });
            }
        }
    }

    fn send_reply(&mut self, job: JobId, r: Reply, reply: Sender<Reply>) {
        if let (Reply::Error { .. }, Some(jr)) = (&r, self.jobs.get_mut(&job)) {
            jr.dep_error = true;
        }
        let _ = reply.send(r);
    }

    fn check_replies(&mut self) {
        let pending = std::mem::take(&mut self.replies);
        let mut answered = Vec::new();
        for p in pending {
            match self.answer(&p.nodes) {
                Some(r) => {
                    answered.push(p.job);
                    self.send_reply(p.job, r, p.reply);
                }
                None => self.replies.push(p),
            }
        }
        for job in answered {
            if !self.replies.iter().any(|p| p.job == job) {
                self.scheduler.reclaim(job);
            }
        }
    }

    fn complete_job(&mut self, job: JobId, ok: bool) {
        let Some(jr) = self.jobs.get_mut(&job) else {
            return;
        };
        jr.phase = Phase::Done(ok);
        let nodes = std::mem::take(&mut jr.nodes);
        for node in nodes {
            let outcome = self.produced(job, node, ok);
            self.resolve(node, outcome, Some(job));
        }
        self.check_replies();
    }

    fn finalize(&mut self, job: JobId, outcome: ExecOutcome) -> anyhow::Result<()> {
        self.replies.retain(|p| p.job != job);
        let rules = self.rules;
        let name = self.job_name(job);
        let (stems, prev_targets, prev_ok) = {
            let j = self.store.graph.job(job);
            let prev: Vec<(NodeId, FileDigest)> = j.targets.iter().map(|t| (t.node, t.digest)).collect();
            (j.stems.clone(), prev, j.has_run() && j.status.is_ok())
        };
        let Some(jr) = self.jobs.get_mut(&job) else {
            return Ok(());
        };
        let declared = std::mem::take(&mut jr.declared);
        let discovered = std::mem::take(&mut jr.discovered);
        let dep_error = jr.dep_error;
        let rule_digest = jr.rule_digest;
        let statics: Vec<(String, DepFlags)> =
            jr.inst.deps.iter().map(|d| (d.path.clone(), d.flags)).collect();
        let resources = jr.inst.resolved.resources.clone();
        let rule = rules.rule(jr.rule);
        let recorded = outcome.recorded.clone();
        tracing::debug!(job = %name, termination = %outcome.termination, method = %outcome.method, "finished");

        let mut failure = (!outcome.termination.success()).then(|| outcome.termination.to_string());
        // A job told that a dep is in error cannot be trusted even if it
        // exits cleanly.
        if dep_error {
            failure.get_or_insert_with(|| "read a dep in error".to_string());
        }

        // Targets: the rule's, then those declared, then any other write a
        // target pattern of the rule covers.
        let mut targets = rule.static_targets(&stems).unwrap_or_default();
        let n_static = targets.len();
        for (n, f) in declared.into_iter().chain(recorded.declared_targets) {
            if !targets.iter().any(|(t, _)| *t == n) {
                targets.push((n, f));
            }
        }
        for w in &recorded.writes {
            if targets.iter().any(|(t, _)| t == w) {
                continue;
            }
            match rule.target_flags(&stems, w) {
                Some(f) => targets.push((w.clone(), f)),
                None => {
                    failure.get_or_insert_with(|| format!("unexpected write to {}", w));
                }
            }
        }
        let root = self.store.root().clone();
        let observed: Vec<(Option<FileSig>, FileDigest)> = targets
            .par_iter()
            .map(|(n, _)| hash::observe(&root.abs(n)).unwrap_or((None, FileDigest::Absent)))
            .collect();
        if failure.is_none() {
            for ((n, f), (_, d)) in targets.iter().zip(&observed).take(n_static) {
                if !d.exists() && !f.phony && !f.optional {
                    failure = Some(format!("target {} was not produced", n));
                    break;
                }
            }
        }
        let mut target_list = Vec::with_capacity(targets.len());
        for ((n, flags), (sig, digest)) in targets.iter().zip(observed) {
            let node = self.store.get_or_create_node(n);
            self.store.graph.node_mut(node).sig = sig;
            target_list.push(Target {
                node,
                flags: *flags,
                digest,
            });
        }
        let own: FxHashSet<NodeId> = target_list.iter().map(|t| t.node).collect();

        // Deps: static ones first, then discovered ones in access order.
        let mut candidates: Vec<(NodeId, DepFlags, Accesses)> = Vec::new();
        for (path, flags) in statics {
            let accesses = Accesses {
                read: true,
                stat: false,
            };
            candidates.push((self.store.get_or_create_node(&path), flags, accesses));
        }
        for d in discovered.into_iter().chain(recorded.deps) {
            candidates.push((self.store.get_or_create_node(&d.name), d.flags, d.accesses));
        }
        let mut deps = Vec::new();
        let mut seen = FxHashSet::default();
        let mut changed = None;
        for (node, flags, accesses) in candidates {
            if own.contains(&node) || !seen.insert(node) {
                continue;
            }
            let current = self.store.observe(node)?;
            let sig = self.store.graph.node(node).sig.as_ref();
            if sig.is_some_and(|s| s.kind == FileKind::Dir) {
                continue;
            }
            let digest = match self.nodes.get(&node).map(|r| &r.state) {
                Some(NodeState::Resolved(o)) => match o.digest() {
                    Some(d) => {
                        if d != current.digest && changed.is_none() {
                            changed = Some(node);
                        }
                        d
                    }
                    None => current.digest,
                },
                _ => current.digest,
            };
            deps.push(Dep {
                node,
                flags,
                accesses,
                digest,
            });
        }

        let spawned = !matches!(outcome.termination, Termination::SpawnFailed(_));
        if let (Some(node), true) = (changed, spawned) {
            let dep = self.node_name(node);
            tracing::info!(job = %name, dep = %dep, "dep changed while the job ran");
            let now = self.store.observe(node)?;
            self.resolve(node, observed_outcome(&now), self.nodes.get(&node).and_then(|r| r.producer));
            self.report(ReportKey::Rerun, &name);
            if let Some(jr) = self.jobs.get_mut(&job) {
                jr.phase = Phase::Waiting;
            }
            return self.must_run(job, Reason::DepChanged(dep));
        }

        let status = if failure.is_some() {
            JobStatus::Failed
        } else {
            let now: Vec<(NodeId, FileDigest)> = target_list.iter().map(|t| (t.node, t.digest)).collect();
            if prev_ok && now == prev_targets {
                JobStatus::Steady
            } else {
                JobStatus::Done
            }
        };
        let dep_pairs: Vec<(String, FileDigest)> = deps
            .iter()
            .map(|d| (self.node_name(d.node), d.digest))
            .collect();
        let job_digest = status.is_ok().then(|| deps_digest(&rule_digest, &dep_pairs));
        self.store.commit_job(
            job,
            JobOutcome {
                status,
                deps,
                targets: target_list.clone(),
                rule_digest,
                job_digest,
                resources,
                exec_time: Some(outcome.elapsed),
            },
        )?;

        match status {
            JobStatus::Done | JobStatus::Steady => {
                let key = if status == JobStatus::Done {
                    ReportKey::Done
                } else {
                    ReportKey::Steady
                };
                self.report(key, &name);
                self.progress.output(&name, &outcome.stderr);
                self.upload(job, &target_list, dep_pairs, &outcome);
                self.complete_job(job, true);
                Ok(())
            }
            _ => {
                let key = if dep_error {
                    ReportKey::WasDepErr
                } else {
                    ReportKey::Failed
                };
                let mut text = outcome.stderr;
                if let Some(msg) = failure {
                    text.extend_from_slice(format!("{}\n", msg).as_bytes());
                }
                self.fail(job, key, text)
            }
        }
    }

    fn upload(&mut self, job: JobId, targets: &[Target], deps: Vec<(String, FileDigest)>, outcome: &ExecOutcome) {
        use std::os::unix::ffi::OsStrExt;
        if !self.cache_mode.upload() {
            return;
        }
        let jr = &self.jobs[&job];
        let Some(cache_name) = jr.inst.resolved.cache.clone() else {
            return;
        };
        let key = jr.rule_digest;
        let compression = jr.inst.resolved.compression;
        let mut meta_targets = Vec::with_capacity(targets.len());
        let mut contents = Vec::with_capacity(targets.len());
        for t in targets {
            let name = self.node_name(t.node);
            let path = self.store.root().abs(&name);
            let data = match t.digest {
                FileDigest::Absent => Ok(Vec::new()),
                FileDigest::Link(_) => std::fs::read_link(&path).map(|p| p.as_os_str().as_bytes().to_vec()),
                FileDigest::File(_) | FileDigest::Exe(_) => std::fs::read(&path),
            };
            match data {
                Ok(d) => contents.push(d),
                Err(err) => {
                    tracing::warn!(job = %self.job_name(job), target = %name, %err, "not cached");
                    return;
                }
            }
            meta_targets.push((name, t.digest));
        }
        let entry = CacheEntry {
            meta: EntryMeta {
                job: self.job_name(job),
                deps,
                targets: meta_targets,
                compression,
            },
            stdout: outcome.stdout.clone(),
            stderr: outcome.stderr.clone(),
            contents,
        };
        let Some(cache) = self.caches.get_mut(&cache_name) else {
            tracing::warn!(cache = %cache_name, "no such cache");
            return;
        };
        if let Err(err) = cache.store(&key, &entry) {
            tracing::warn!(cache = %cache_name, %err, "upload failed");
        }
    }

    fn lost(&mut self, job: JobId) -> anyhow::Result<()> {
        let Some(jr) = self.jobs.get_mut(&job) else {
            return Ok(());
        };
        let max = jr
            .inst
            .resolved
            .max_retries_on_lost
            .unwrap_or(self.config.max_retries_on_lost);
        jr.phase = Phase::Waiting;
        self.replies.retain(|p| p.job != job);
        let name = self.job_name(job);
        self.report(ReportKey::Lost, &name);
        let j = self.store.graph.job_mut(job);
        j.lost += 1;
        let lost = j.lost;
        if lost <= max {
            tracing::info!(job = %name, lost, "retrying lost job");
            self.submit(job)
        } else {
            let msg = format!("lost {} times\n", lost);
            self.fail(job, ReportKey::Failed, msg.into_bytes())
        }
    }

    fn interrupt(&mut self) {
        self.replies.clear();
        for job in self.scheduler.kill_all() {
            let name = self.job_name(job);
            self.report(ReportKey::Killed, &name);
            if let Some(jr) = self.jobs.get_mut(&job) {
                jr.phase = Phase::Done(false);
            }
        }
    }

    /// Nothing can move: no job to analyze or start, and every running
    /// job waits on a dep.
    fn stuck(&self) -> bool {
        self.ready.is_empty()
            && self.scheduler.queued_count() == 0
            && self
                .jobs
                .iter()
                .filter(|(_, jr)| matches!(jr.phase, Phase::Queued | Phase::Running))
                .all(|(job, _)| self.replies.iter().any(|p| p.job == *job))
    }

    /// Fail the jobs of a dependency loop.  Returns whether anything was
    /// done.
    fn break_cycles(&mut self) -> anyhow::Result<bool> {
        let mut edges: FxHashMap<JobId, Vec<JobId>> = FxHashMap::default();
        for req in self.nodes.values() {
            if let NodeState::Pending(p) = req.state {
                for &w in &req.waiting {
                    edges.entry(w).or_default().push(p);
                }
            }
        }
        for r in &self.replies {
            for (node, _) in &r.nodes {
                if let Some(NodeReq {
                    state: NodeState::Pending(p),
                    ..
                }) = self.nodes.get(node)
                {
                    edges.entry(r.job).or_default().push(*p);
                }
            }
        }
        let mut stuck = find_cycle(&edges);
        if stuck.is_empty() {
            stuck = self
                .jobs
                .iter()
                .filter(|(_, jr)| !matches!(jr.phase, Phase::Done(_)))
                .map(|(&j, _)| j)
                .collect();
            stuck.sort_unstable();
        }
        if stuck.is_empty() {
            return Ok(false);
        }
        for job in stuck {
            let names: Vec<String> = edges
                .get(&job)
                .map(|v| v.iter().map(|&p| self.job_name(p)).collect())
                .unwrap_or_default();
            tracing::warn!(job = %self.job_name(job), waits_on = ?names, "dependency loop");
            let blocked: Vec<PendingReply> = {
                let (mine, rest) = std::mem::take(&mut self.replies)
                    .into_iter()
                    .partition(|p| p.job == job);
                self.replies = rest;
                mine
            };
            if !blocked.is_empty() {
                for p in blocked {
                    self.send_reply(job, Reply::error("dependency loop"), p.reply);
                }
                self.scheduler.reclaim(job);
            } else if self.jobs.get(&job).map(|jr| jr.phase) == Some(Phase::Waiting) {
                self.fail(job, ReportKey::Failed, b"dependency loop\n".to_vec())?;
            }
        }
        Ok(true)
    }
}

fn observed_outcome(p: &Observation) -> NodeOutcome {
    if p.digest.exists() {
        NodeOutcome::Ok(p.digest)
    } else {
        NodeOutcome::Absent
    }
}

/// Jobs on some cycle of the wait graph, or nothing.
fn find_cycle(edges: &FxHashMap<JobId, Vec<JobId>>) -> Vec<JobId> {
    // false: on the current path, true: fully explored.
    let mut state: FxHashMap<JobId, bool> = FxHashMap::default();
    let mut starts: Vec<JobId> = edges.keys().copied().collect();
    starts.sort_unstable();
    for start in starts {
        if state.contains_key(&start) {
            continue;
        }
        state.insert(start, false);
        let mut path = vec![(start, 0usize)];
        while let Some((top, i)) = path.last_mut() {
            let top = *top;
            let next = edges.get(&top).and_then(|v| v.get(*i)).copied();
            *i += 1;
            match next {
                None => {
                    state.insert(top, true);
                    path.pop();
                }
                Some(n) => match state.get(&n) {
                    Some(false) => {
                        let pos = path.iter().position(|&(j, _)| j == n).unwrap_or(0);
                        return path[pos..].iter().map(|&(j, _)| j).collect();
                    }
                    Some(true) => {}
                    None => {
                        state.insert(n, false);
                        path.push((n, 0));
                    }
                },
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::LocalBackend;
    use crate::backend::resources::ResourcePool;
    use crate::canon::RepoRoot;
    use crate::config::ResourceConfig;
    use crate::rules::load;

    #[derive(Default)]
    struct Recording {
        lines: Vec<(ReportKey, String)>,
    }

    impl Progress for Recording {
        fn report(&mut self, key: ReportKey, name: &str) {
            self.lines.push((key, name.to_string()));
        }
        fn output(&mut self, _name: &str, _text: &[u8]) {}
        fn message(&mut self, _msg: &str) {}
        fn finish(&mut self, _summary: &Summary) {}
    }

    impl Recording {
        fn count(&self, key: ReportKey) -> usize {
            self.lines.iter().filter(|(k, _)| *k == key).count()
        }
    }

    fn scheduler() -> Scheduler {
        let mut s = Scheduler::new(Duration::from_millis(50), Duration::from_secs(10));
        let mut limits = BTreeMap::new();
        limits.insert(
            "cpu".to_string(),
            ResourceConfig {
                capacity: 4,
                precision: 0,
            },
        );
        s.add_backend("local", Box::new(LocalBackend::default()), ResourcePool::new("local", limits));
        s
    }

    const CAT: &str = r#"{"rules": [
        {"name": "cat", "stems": {"A": "[^+/]+", "B": "[^+/]+"},
         "targets": {"out": "{A}+{B}"}, "deps": {"a": "{A}", "b": "{B}"},
         "cmd": "cat {a} {b} > {out}", "attrs": {"autodep": "none"}},
        {"name": "bad", "targets": {"out": "bad"}, "cmd": "exit 1", "attrs": {"autodep": "none"}},
        {"name": "use_bad", "targets": {"out": "use_bad"}, "deps": {"b": "bad"},
         "cmd": "cp {b} {out}", "attrs": {"autodep": "none"}},
        {"name": "self", "targets": {"out": "loop"}, "deps": {"d": "loop"},
         "cmd": "touch loop", "attrs": {"autodep": "none"}}
    ]}"#;

    fn build(dir: &std::path::Path, goals: &[&str]) -> (bool, Recording) {
        build_with(dir, CAT, &EngineConfig::default(), goals)
    }

    fn build_with(
        dir: &std::path::Path,
        rules: &str,
        config: &EngineConfig,
        goals: &[&str],
    ) -> (bool, Recording) {
        let mut store = Store::open(RepoRoot::new(dir, ".dynmake")).unwrap();
        let rules = load::parse(rules).unwrap();
        let mut progress = Recording::default();
        let goals: Vec<String> = goals.iter().map(|g| g.to_string()).collect();
        let ok = {
            let mut engine = Engine::new(&mut store, &rules, config, scheduler(), &mut progress);
            engine.build(&goals).unwrap()
        };
        (ok, progress)
    }

    #[test]
    fn builds_then_idles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello"), "hello\n").unwrap();
        std::fs::write(dir.path().join("world"), "world\n").unwrap();
        let (ok, p) = build(dir.path(), &["hello+world"]);
        assert!(ok);
        assert_eq!(p.count(ReportKey::New), 2);
        assert_eq!(p.count(ReportKey::Done), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello+world")).unwrap(),
            "hello\nworld\n"
        );

        let (ok, p) = build(dir.path(), &["hello+world"]);
        assert!(ok);
        assert_eq!(p.count(ReportKey::Done), 0);
        assert_eq!(p.count(ReportKey::New), 0);
    }

    #[test]
    fn failure_and_dep_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ok, p) = build(dir.path(), &["use_bad"]);
        assert!(!ok);
        assert_eq!(p.count(ReportKey::Failed), 1);
        assert_eq!(p.count(ReportKey::DepErr), 1);
    }

    #[test]
    fn missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let (ok, p) = build(dir.path(), &["nothing"]);
        assert!(!ok);
        assert!(p.lines.is_empty());
    }

    #[test]
    fn self_loop_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (ok, p) = build(dir.path(), &["loop"]);
        assert!(!ok);
        assert_eq!(p.count(ReportKey::Failed), 1);
    }

    #[test]
    fn job_changing_its_own_dep_hits_the_submit_limit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src"), "x\n").unwrap();
        let rules = r#"{"rules": [
            {"name": "churn", "targets": {"out": "churn"}, "deps": {"s": "src"},
             "cmd": "cat {s} > {out}; echo x >> {s}", "attrs": {"autodep": "none"}}
        ]}"#;
        let config = EngineConfig {
            max_submits: 3,
            ..EngineConfig::default()
        };
        let (ok, p) = build_with(dir.path(), rules, &config, &["churn"]);
        assert!(!ok);
        assert_eq!(p.count(ReportKey::Rerun), 3);
        assert_eq!(p.count(ReportKey::Failed), 1);
        assert_eq!(p.count(ReportKey::Done), 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src")).unwrap(),
            "x\nx\nx\nx\n"
        );
    }

    const SUFFIX: &str = r#"{"rules": [
        {"name": "dot", "stems": {"A": ".+"}, "targets": {"out": "{A}.x"},
         "deps": {"src": "{A}"}, "cmd": "cp {src} {out}", "attrs": {"autodep": "none"}}
    ]}"#;

    #[test]
    fn dep_chain_deeper_than_the_limit_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "a\n").unwrap();
        let config = EngineConfig {
            max_dep_depth: 2,
            ..EngineConfig::default()
        };
        let (ok, p) = build_with(dir.path(), SUFFIX, &config, &["a.x.x.x"]);
        assert!(!ok);
        assert_eq!(p.count(ReportKey::Done), 0);
        assert_eq!(p.count(ReportKey::DepErr), 3);
        assert!(!dir.path().join("a.x").exists());

        let config = EngineConfig {
            max_dep_depth: 3,
            ..EngineConfig::default()
        };
        let (ok, p) = build_with(dir.path(), SUFFIX, &config, &["a.x.x.x"]);
        assert!(ok);
        assert_eq!(p.count(ReportKey::Done), 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.x.x.x")).unwrap(),
            "a\n"
        );
    }

    #[test]
    fn cycle_detection() {
        let mut edges: FxHashMap<JobId, Vec<JobId>> = FxHashMap::default();
        let j = |i: usize| JobId::from(i);
        edges.insert(j(0), vec![j(1)]);
        edges.insert(j(1), vec![j(2)]);
        edges.insert(j(2), vec![j(1)]);
        let mut c = find_cycle(&edges);
        c.sort();
        assert_eq!(c, vec![j(1), j(2)]);

        edges.insert(j(2), vec![j(3)]);
        assert!(find_cycle(&edges).is_empty());
    }
}
