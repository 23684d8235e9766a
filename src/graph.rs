//! The dependency graph, between files (nodes) and rule instances (jobs).

use crate::densemap::{self, DenseMap};
use crate::hash::{Digest, FileDigest, FileSig};
use crate::rules::{DepFlags, TargetFlags};
use crate::smallmap::SmallMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Id for Node entries in the Graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

/// Id for Job entries in the Graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct JobId(u32);
impl densemap::Index for JobId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for JobId {
    fn from(u: usize) -> JobId {
        JobId(u as u32)
    }
}

/// How a path is obtained.  Decided afresh each invocation, since the rules
/// or the manifest may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Unknown,
    /// Checked in: listed in the manifest, or present on disk without one.
    Source,
    /// Some rule produces it.
    Buildable,
    /// On disk, but neither a source nor buildable.
    Dangling,
    /// Neither on disk nor buildable.
    NoTarget,
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Canonical repo-relative path.
    pub name: String,
    /// The job that last wrote this node.
    pub producer: Option<JobId>,
    /// Last known content, None if never looked at.
    pub digest: Option<FileDigest>,
    pub sig: Option<FileSig>,
    pub status: NodeStatus,
    /// Modified behind our back.
    pub manual: bool,
    /// Pinned: treated as a source, never rebuilt.
    pub frozen: bool,
}

impl Node {
    fn new(name: String) -> Self {
        Node {
            name,
            producer: None,
            digest: None,
            sig: None,
            status: NodeStatus::Unknown,
            manual: false,
            frozen: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Queued,
    Running,
    Done,
    Steady,
    Failed,
    Lost,
    Quarantined,
}

impl JobStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Steady)
    }

    /// A status that can be persisted as the outcome of a run.
    pub fn is_final(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Steady | JobStatus::Failed)
    }
}

/// How a job touched a dep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accesses {
    pub read: bool,
    pub stat: bool,
}

impl Accesses {
    pub fn any(&self) -> bool {
        self.read || self.stat
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dep {
    pub node: NodeId,
    pub flags: DepFlags,
    pub accesses: Accesses,
    /// Content as seen by the job.
    pub digest: FileDigest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub node: NodeId,
    pub flags: TargetFlags,
    /// Content as written by the job.
    pub digest: FileDigest,
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Display name, the first target of the rule with stems substituted.
    pub name: String,
    pub rule: String,
    pub stems: SmallMap<String, String>,
    /// Static deps first, then discovered ones in access order.
    pub deps: Vec<Dep>,
    pub targets: Vec<Target>,
    pub status: JobStatus,
    /// Digest of rule identity and resolved attributes at the last run;
    /// None if the job never ran.
    pub rule_digest: Option<Digest>,
    /// Cache key of the last run.
    pub job_digest: Option<Digest>,
    pub resources: BTreeMap<String, u64>,
    /// Seconds, used to start long jobs first.
    pub exec_time: Option<f64>,
    /// Executions in this invocation.
    pub submits: u32,
    /// Losses in this invocation.
    pub lost: u32,
}

impl Job {
    fn new(rule: String, name: String, stems: SmallMap<String, String>) -> Self {
        Job {
            name,
            rule,
            stems,
            deps: Vec::new(),
            targets: Vec::new(),
            status: JobStatus::New,
            rule_digest: None,
            job_digest: None,
            resources: BTreeMap::new(),
            exec_time: None,
            submits: 0,
            lost: 0,
        }
    }

    pub fn has_run(&self) -> bool {
        self.rule_digest.is_some()
    }
}

#[derive(Default)]
pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    jobs: DenseMap<JobId, Job>,
    node_ids: FxHashMap<String, NodeId>,
    job_ids: FxHashMap<(String, String), JobId>,
}

impl Graph {
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_ids.get(name).copied()
    }

    /// Look up a node by canonical name, creating it if needed.
    pub fn get_or_create_node(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.node_ids.get(name) {
            return id;
        }
        let id = self.nodes.push(Node::new(name.to_string()));
        self.node_ids.insert(name.to_string(), id);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn job_id(&self, rule: &str, name: &str) -> Option<JobId> {
        self.job_ids
            .get(&(rule.to_string(), name.to_string()))
            .copied()
    }

    /// Returns the job and whether it was just created.
    pub fn get_or_create_job(
        &mut self,
        rule: &str,
        name: &str,
        stems: &SmallMap<String, String>,
    ) -> (JobId, bool) {
        let key = (rule.to_string(), name.to_string());
        if let Some(&id) = self.job_ids.get(&key) {
            return (id, false);
        }
        let id = self
            .jobs
            .push(Job::new(rule.to_string(), name.to_string(), stems.clone()));
        self.job_ids.insert(key, id);
        (id, true)
    }

    pub fn job(&self, id: JobId) -> &Job {
        &self.jobs[id]
    }

    pub fn job_mut(&mut self, id: JobId) -> &mut Job {
        &mut self.jobs[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter()
    }

    pub fn jobs(&self) -> impl Iterator<Item = (JobId, &Job)> {
        self.jobs.iter()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Replace a job's recorded deps and targets, and point target nodes at
    /// it as their producer.
    pub fn set_job_result(&mut self, id: JobId, deps: Vec<Dep>, targets: Vec<Target>) {
        for t in &targets {
            self.nodes[t.node].producer = Some(id);
        }
        let job = &mut self.jobs[id];
        job.deps = deps;
        job.targets = targets;
    }

    /// Drop everything recorded about a job's runs.  The job id stays valid.
    pub fn reset_job(&mut self, id: JobId) {
        let targets = std::mem::take(&mut self.jobs[id].targets);
        for t in targets {
            if self.nodes[t.node].producer == Some(id) {
                self.nodes[t.node].producer = None;
            }
        }
        let job = &mut self.jobs[id];
        job.deps.clear();
        job.status = JobStatus::New;
        job.rule_digest = None;
        job.job_digest = None;
        job.exec_time = None;
    }
}
