//! Where jobs run.  A backend starts executions and answers liveness
//! queries; the scheduler decides when to start what.

pub mod local;
pub mod resources;
pub mod scheduler;

use crate::exec::{ExecSpec, JobMsg};
use std::sync::mpsc::Sender;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no backend named {0}")]
    Unknown(String),
    #[error("backend {backend} has no resource {resource}")]
    UnknownResource { backend: String, resource: String },
    #[error("backend {backend}: {asked} {resource} requested, capacity is {capacity}")]
    TooBig {
        backend: String,
        resource: String,
        asked: u64,
        capacity: u64,
    },
    #[error("cannot submit: {0}")]
    Submit(String),
}

/// Identifies one execution within its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Done; its Finished message is on the way.
    Finished,
    /// Could not be confirmed, e.g. the host does not answer.
    Unknown,
}

pub trait Backend: Send {
    /// Start an execution.  It reports through `tx`.
    fn submit(&mut self, spec: ExecSpec, tx: Sender<JobMsg>) -> Result<Handle, BackendError>;
    fn poll(&mut self, handle: Handle) -> Liveness;
    /// Kill and forget an execution.  No message is expected afterwards.
    fn kill(&mut self, handle: Handle);
    /// Block until every kill issued so far has run its course.
    fn drain(&mut self) {}
}
