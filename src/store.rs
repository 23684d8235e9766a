//! The store: the graph plus its persistence.  Single writer, the engine.

use crate::canon::RepoRoot;
use crate::db::{self, DepRecord, Entry, JobRecord, NodeRecord, TargetRecord};
use crate::graph::{Dep, Graph, JobId, JobStatus, NodeId, Target};
use crate::hash::{self, Digest, FileDigest};
use crate::rules::RuleTable;
use crate::smallmap::SmallMap;
use crate::uptodate::{Checker, Verdict};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dependency loop through job {job}")]
    Loop { job: String },
    #[error("job {job}: dependency chain deeper than {depth}")]
    TooDeep { job: String, depth: usize },
}

/// What changed about a node when it was looked at on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub digest: FileDigest,
    /// The last known content before this look, None if never seen.
    pub previous: Option<FileDigest>,
}

impl Observation {
    pub fn is_new(&self) -> bool {
        self.previous.is_none() && self.digest.exists()
    }

    pub fn is_changed(&self) -> bool {
        matches!(self.previous, Some(prev) if prev != self.digest)
    }
}

/// The result of one execution, to be committed.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub deps: Vec<Dep>,
    pub targets: Vec<Target>,
    pub rule_digest: Digest,
    pub job_digest: Option<Digest>,
    pub resources: BTreeMap<String, u64>,
    pub exec_time: Option<f64>,
}

pub struct Store {
    pub graph: Graph,
    root: RepoRoot,
    db: db::Writer,
}

impl Store {
    /// Load the graph recorded under the admin dir.
    pub fn open(root: RepoRoot) -> anyhow::Result<Store> {
        let path = root.admin_dir().join("db");
        let (entries, db) = db::open(&path)?;
        let mut store = Store {
            graph: Graph::default(),
            root,
            db,
        };
        for e in entries {
            store.replay(e);
        }
        let live = store.live_entries();
        if store.db.wants_compaction(live.len()) {
            store.db.compact(&live)?;
        }
        tracing::debug!(
            nodes = store.graph.node_count(),
            jobs = store.graph.job_count(),
            "loaded db"
        );
        Ok(store)
    }

    pub fn root(&self) -> &RepoRoot {
        &self.root
    }

    fn apply_node(&mut self, rec: NodeRecord) {
        let id = self.graph.get_or_create_node(&rec.name);
        let node = self.graph.node_mut(id);
        node.digest = rec.digest;
        node.sig = rec.sig;
        node.manual = rec.manual;
        node.frozen = rec.frozen;
    }

    fn replay(&mut self, entry: Entry) {
        match entry {
            Entry::Node(rec) => self.apply_node(rec),
            Entry::Commit { job, nodes } => {
                for rec in nodes {
                    self.apply_node(rec);
                }
                let stems: SmallMap<String, String> = job.stems.into_iter().collect();
                let (id, _) = self.graph.get_or_create_job(&job.rule, &job.name, &stems);
                let deps = job
                    .deps
                    .into_iter()
                    .map(|d| Dep {
                        node: self.graph.get_or_create_node(&d.node),
                        flags: d.flags,
                        accesses: d.accesses,
                        digest: d.digest,
                    })
                    .collect();
                let targets = job
                    .targets
                    .into_iter()
                    .map(|t| Target {
                        node: self.graph.get_or_create_node(&t.node),
                        flags: t.flags,
                        digest: t.digest,
                    })
                    .collect();
                self.graph.set_job_result(id, deps, targets);
                let j = self.graph.job_mut(id);
                j.status = job.status;
                j.rule_digest = job.rule_digest;
                j.job_digest = job.job_digest;
                j.resources = job.resources;
                j.exec_time = job.exec_time;
            }
            Entry::Forget { rule, name } => {
                if let Some(id) = self.graph.job_id(&rule, &name) {
                    self.graph.reset_job(id);
                }
            }
        }
    }

    fn node_record(&self, id: NodeId) -> NodeRecord {
        let n = self.graph.node(id);
        NodeRecord {
            name: n.name.clone(),
            digest: n.digest,
            sig: n.sig,
            manual: n.manual,
            frozen: n.frozen,
        }
    }

    fn job_record(&self, id: JobId) -> JobRecord {
        let j = self.graph.job(id);
        let name = |n: NodeId| self.graph.node(n).name.clone();
        JobRecord {
            rule: j.rule.clone(),
            name: j.name.clone(),
            stems: j.stems.iter().cloned().collect(),
            deps: j
                .deps
                .iter()
                .map(|d| DepRecord {
                    node: name(d.node),
                    flags: d.flags,
                    accesses: d.accesses,
                    digest: d.digest,
                })
                .collect(),
            targets: j
                .targets
                .iter()
                .map(|t| TargetRecord {
                    node: name(t.node),
                    flags: t.flags,
                    digest: t.digest,
                })
                .collect(),
            status: j.status,
            rule_digest: j.rule_digest,
            job_digest: j.job_digest,
            resources: j.resources.clone(),
            exec_time: j.exec_time,
        }
    }

    /// Everything a freshly written log must contain.
    fn live_entries(&self) -> Vec<Entry> {
        let mut out: Vec<Entry> = self
            .graph
            .nodes()
            .filter(|(_, n)| n.digest.is_some() || n.frozen || n.manual)
            .map(|(id, _)| Entry::Node(self.node_record(id)))
            .collect();
        out.extend(
            self.graph
                .jobs()
                .filter(|(_, j)| j.has_run())
                .map(|(id, _)| Entry::Commit {
                    job: self.job_record(id),
                    nodes: Vec::new(),
                }),
        );
        out
    }

    fn write(&mut self, entry: &Entry) -> Result<(), StoreError> {
        self.db.append(entry).map_err(|source| StoreError::Io {
            path: "db".to_string(),
            source,
        })
    }

    pub fn get_or_create_node(&mut self, path: &str) -> NodeId {
        self.graph
            .get_or_create_node(&crate::canon::canon_path(path))
    }

    pub fn get_or_create_job(
        &mut self,
        rule: &str,
        name: &str,
        stems: &SmallMap<String, String>,
    ) -> JobId {
        self.graph.get_or_create_job(rule, name, stems).0
    }

    /// Look at a node on disk, reusing the recorded digest when the file's
    /// signature is unchanged.  Updates the in-memory record only.
    pub fn observe(&mut self, id: NodeId) -> Result<Observation, StoreError> {
        let path = self.root.abs(&self.graph.node(id).name);
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        let sig = hash::FileSig::observe(&path).map_err(io_err)?;
        let node = self.graph.node(id);
        let previous = node.digest;
        let digest = match (node.digest, node.sig, sig) {
            (Some(d), Some(old), Some(new)) if old == new => d,
            (_, _, sig) => hash::file_digest(&path, sig.as_ref()).map_err(io_err)?,
        };
        let node = self.graph.node_mut(id);
        node.digest = Some(digest);
        node.sig = sig;
        Ok(Observation { digest, previous })
    }

    /// Persist a node's record, e.g. a source's digest.
    pub fn save_node(&mut self, id: NodeId) -> Result<(), StoreError> {
        let rec = self.node_record(id);
        self.write(&Entry::Node(rec))
    }

    /// Record the outcome of a job and every node it touched in one frame.
    pub fn commit_job(&mut self, id: JobId, outcome: JobOutcome) -> Result<(), StoreError> {
        let mut touched: Vec<NodeId> = outcome
            .targets
            .iter()
            .map(|t| t.node)
            .chain(outcome.deps.iter().map(|d| d.node))
            .collect();
        touched.sort_unstable();
        touched.dedup();
        for t in &outcome.targets {
            let node = self.graph.node_mut(t.node);
            node.digest = Some(t.digest);
            node.manual = false;
        }
        self.graph.set_job_result(id, outcome.deps, outcome.targets);
        let job = self.graph.job_mut(id);
        job.status = outcome.status;
        job.rule_digest = Some(outcome.rule_digest);
        job.job_digest = outcome.job_digest;
        job.resources = outcome.resources;
        job.exec_time = outcome.exec_time;
        let entry = Entry::Commit {
            job: self.job_record(id),
            nodes: touched.into_iter().map(|n| self.node_record(n)).collect(),
        };
        self.write(&entry)
    }

    /// Forget a job's history, so its next request reruns it.
    pub fn forget(&mut self, id: JobId) -> Result<(), StoreError> {
        self.graph.reset_job(id);
        let job = self.graph.job(id);
        let entry = Entry::Forget {
            rule: job.rule.clone(),
            name: job.name.clone(),
        };
        self.write(&entry)
    }

    /// Pin a node: it is treated as a source and never rebuilt.
    pub fn freeze(&mut self, id: NodeId, frozen: bool) -> Result<(), StoreError> {
        self.graph.node_mut(id).frozen = frozen;
        self.save_node(id)
    }

    pub fn set_manual(&mut self, id: NodeId, manual: bool) -> Result<(), StoreError> {
        if self.graph.node(id).manual == manual {
            return Ok(());
        }
        self.graph.node_mut(id).manual = manual;
        self.save_node(id)
    }

    /// Up-to-date check of a job without running anything.
    pub fn is_up_to_date(
        &mut self,
        rules: &RuleTable,
        id: JobId,
        max_dep_depth: usize,
    ) -> Result<bool, StoreError> {
        let mut checker = Checker::new(self, rules, max_dep_depth);
        Ok(checker.check_job(id)? == Verdict::UpToDate)
    }
}
