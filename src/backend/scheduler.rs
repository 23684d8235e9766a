//! Queueing jobs until their backend has room, and watching over the ones
//! that run.

use super::resources::ResourcePool;
use super::{Backend, BackendError, Handle, Liveness};
use crate::exec::{ExecSpec, JobMsg};
use crate::graph::JobId;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

struct Slot {
    backend: Box<dyn Backend>,
    pool: ResourcePool,
}

/// A job waiting for resources.  Longest expected jobs go first, then
/// first come first served.
struct Queued {
    exec_time: f64,
    order: u64,
    backend: String,
    resources: BTreeMap<String, u64>,
    spec: ExecSpec,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Queued {}
impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.exec_time
            .total_cmp(&other.exec_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

struct Running {
    backend: String,
    handle: Handle,
    resources: BTreeMap<String, u64>,
    /// Resources handed back while the job waits on a dep.
    lent: bool,
    unknown_since: Option<Instant>,
}

pub struct Scheduler {
    slots: BTreeMap<String, Slot>,
    queue: BinaryHeap<Queued>,
    running: FxHashMap<JobId, Running>,
    order: u64,
    heartbeat: Duration,
    lost_after: Duration,
    last_heartbeat: Instant,
}

impl Scheduler {
    pub fn new(heartbeat: Duration, lost_after: Duration) -> Self {
        Scheduler {
            slots: BTreeMap::new(),
            queue: BinaryHeap::new(),
            running: FxHashMap::default(),
            order: 0,
            heartbeat,
            lost_after,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn add_backend(&mut self, name: &str, backend: Box<dyn Backend>, pool: ResourcePool) {
        self.slots.insert(name.to_string(), Slot { backend, pool });
    }

    /// Queue a job.  Fails if its request can never be satisfied.
    pub fn enqueue(
        &mut self,
        spec: ExecSpec,
        backend: &str,
        resources: &BTreeMap<String, u64>,
        exec_time: Option<f64>,
    ) -> Result<BTreeMap<String, u64>, BackendError> {
        let slot = self
            .slots
            .get(backend)
            .ok_or_else(|| BackendError::Unknown(backend.to_string()))?;
        let resources = slot.pool.normalize(resources)?;
        self.order += 1;
        self.queue.push(Queued {
            exec_time: exec_time.unwrap_or(0.0),
            order: self.order,
            backend: backend.to_string(),
            resources: resources.clone(),
            spec,
        });
        Ok(resources)
    }

    /// Start every queued job that fits, in priority order.  Returns the
    /// jobs that failed to start.
    pub fn launch(&mut self, tx: &Sender<JobMsg>) -> Vec<(JobId, BackendError)> {
        let mut failed = Vec::new();
        let mut deferred = Vec::new();
        while let Some(q) = self.queue.pop() {
            let Some(slot) = self.slots.get_mut(&q.backend) else {
                failed.push((q.spec.job, BackendError::Unknown(q.backend)));
                continue;
            };
            if !slot.pool.fits(&q.resources) {
                deferred.push(q);
                continue;
            }
            let job = q.spec.job;
            tracing::debug!(job = %q.spec.name, backend = %q.backend, "submit");
            match slot.backend.submit(q.spec, tx.clone()) {
                Ok(handle) => {
                    slot.pool.acquire(&q.resources);
                    self.running.insert(
                        job,
                        Running {
                            backend: q.backend,
                            handle,
                            resources: q.resources,
                            lent: false,
                            unknown_since: None,
                        },
                    );
                }
                Err(err) => failed.push((job, err)),
            }
        }
        self.queue.extend(deferred);
        failed
    }

    fn release(&mut self, r: &Running) {
        if r.lent {
            return;
        }
        if let Some(slot) = self.slots.get_mut(&r.backend) {
            slot.pool.release(&r.resources);
        }
    }

    /// The job's execution is over; free what it held.
    pub fn finished(&mut self, job: JobId) {
        if let Some(r) = self.running.remove(&job) {
            self.release(&r);
        }
    }

    /// Kill a running job or drop it from the queue.
    pub fn kill(&mut self, job: JobId) {
        if let Some(r) = self.running.remove(&job) {
            if let Some(slot) = self.slots.get_mut(&r.backend) {
                slot.backend.kill(r.handle);
            }
            self.release(&r);
        }
        self.queue.retain(|q| q.spec.job != job);
    }

    pub fn kill_all(&mut self) -> Vec<JobId> {
        let jobs: Vec<JobId> = self.running.keys().copied().collect();
        for &job in &jobs {
            self.kill(job);
        }
        self.queue.clear();
        jobs
    }

    /// Wait for pending kills to finish escalating on every backend.
    pub fn drain(&mut self) {
        for slot in self.slots.values_mut() {
            slot.backend.drain();
        }
    }

    /// A running job blocks on a dep: let others use its resources.
    pub fn lend(&mut self, job: JobId) {
        let Some(r) = self.running.get_mut(&job) else {
            return;
        };
        if r.lent {
            return;
        }
        r.lent = true;
        if let Some(slot) = self.slots.get_mut(&r.backend) {
            slot.pool.release(&r.resources);
        }
    }

    /// The job resumes.  It takes its resources back even if that
    /// overcommits the backend for a while.
    pub fn reclaim(&mut self, job: JobId) {
        let Some(r) = self.running.get_mut(&job) else {
            return;
        };
        if !r.lent {
            return;
        }
        r.lent = false;
        if let Some(slot) = self.slots.get_mut(&r.backend) {
            slot.pool.acquire(&r.resources);
        }
    }

    pub fn is_running(&self, job: JobId) -> bool {
        self.running.contains_key(&job)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    /// How long the engine may sleep before the next heartbeat is due.
    pub fn tick(&self) -> Duration {
        self.heartbeat
            .saturating_sub(self.last_heartbeat.elapsed())
            .max(Duration::from_millis(1))
    }

    /// Poll running jobs if a heartbeat is due.  Returns the jobs whose
    /// liveness could not be confirmed for too long; they are forgotten.
    pub fn heartbeat(&mut self) -> Vec<JobId> {
        if self.last_heartbeat.elapsed() < self.heartbeat {
            return Vec::new();
        }
        self.last_heartbeat = Instant::now();
        let now = Instant::now();
        let mut lost = Vec::new();
        for (&job, r) in self.running.iter_mut() {
            let Some(slot) = self.slots.get_mut(&r.backend) else {
                continue;
            };
            match slot.backend.poll(r.handle) {
                Liveness::Running | Liveness::Finished => r.unknown_since = None,
                Liveness::Unknown => {
                    let since = *r.unknown_since.get_or_insert(now);
                    if now.duration_since(since) >= self.lost_after {
                        lost.push(job);
                    }
                }
            }
        }
        for &job in &lost {
            tracing::warn!(?job, "lost contact with job");
            self.kill(job);
        }
        lost
    }
}
