//! Discovering what a job really reads and writes while it runs.
//!
//! A `Tracker` wraps the job's process.  Accesses it sees go through a
//! `Recorder`, which keeps the first access to each repo path; first reads
//! are forwarded over a `Link` to the engine and the job stays blocked until
//! the engine has brought that path up to date.

pub mod ld;
pub mod protocol;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod ptrace;
pub mod record;
pub mod server;

use protocol::{EngineRequest, Reply};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::Mutex;

pub use record::{Recorded, Recorder};

/// How accesses are observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Only declared deps are known.
    None,
    #[default]
    Ptrace,
    LdPreload,
    LdAudit,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Method::None => "none",
            Method::Ptrace => "ptrace",
            Method::LdPreload => "ld_preload",
            Method::LdAudit => "ld_audit",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
    Stat,
    Unlink,
}

/// The engine side of a running job's control channel.
pub trait Link: Send + Sync {
    /// Blocks until the engine answers.
    fn request(&self, req: EngineRequest) -> Reply;
}

/// Runs a job's process under some access observation strategy.
pub trait Tracker: Send {
    fn method(&self) -> Method;

    /// Adjust the command before it is spawned.
    fn prepare(&mut self, cmd: &mut Command) -> anyhow::Result<()>;

    /// Supervise the spawned process until it exits.
    fn wait(
        &mut self,
        child: &mut Child,
        recorder: &Mutex<Recorder>,
        link: &dyn Link,
    ) -> anyhow::Result<ExitStatus>;
}

/// Accesses only arrive through the control socket, if at all.
pub struct PassiveTracker {
    method: Method,
    env: Vec<(&'static str, String)>,
}

impl PassiveTracker {
    pub fn none() -> Self {
        PassiveTracker {
            method: Method::None,
            env: Vec::new(),
        }
    }
}

impl Tracker for PassiveTracker {
    fn method(&self) -> Method {
        self.method
    }

    fn prepare(&mut self, cmd: &mut Command) -> anyhow::Result<()> {
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        Ok(())
    }

    fn wait(
        &mut self,
        child: &mut Child,
        _recorder: &Mutex<Recorder>,
        _link: &dyn Link,
    ) -> anyhow::Result<ExitStatus> {
        Ok(child.wait()?)
    }
}

/// Pick a tracker for `program`, falling back when the method cannot work.
/// `lib` is the interposition library, if one was found.
pub fn tracker_for(method: Method, program: &Path, lib: Option<&Path>) -> Box<dyn Tracker> {
    match method {
        Method::None => Box::new(PassiveTracker::none()),
        Method::Ptrace => ptrace_or_none(),
        Method::LdPreload | Method::LdAudit => {
            let Some(lib) = lib else {
                tracing::warn!(%method, "autodep library not found, using ptrace");
                return ptrace_or_none();
            };
            match ld::is_dynamic(program) {
                Ok(true) => Box::new(PassiveTracker {
                    method,
                    env: vec![(ld::env_var(method), lib.display().to_string())],
                }),
                Ok(false) => {
                    tracing::debug!(program = %program.display(), "static executable, using ptrace");
                    ptrace_or_none()
                }
                Err(err) => {
                    tracing::warn!(program = %program.display(), %err, "cannot inspect executable");
                    ptrace_or_none()
                }
            }
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn ptrace_or_none() -> Box<dyn Tracker> {
    Box::new(ptrace::PtraceTracker::default())
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn ptrace_or_none() -> Box<dyn Tracker> {
    tracing::warn!("ptrace unavailable on this platform");
    Box::new(PassiveTracker::none())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names() {
        let m: Method = serde_json::from_str("\"ld_audit\"").unwrap();
        assert_eq!(m, Method::LdAudit);
        assert_eq!(Method::default().to_string(), "ptrace");
    }

    #[test]
    fn missing_library_falls_back() {
        let t = tracker_for(Method::LdPreload, Path::new("/bin/sh"), None);
        assert_ne!(t.method(), Method::LdPreload);
        let t = tracker_for(Method::None, Path::new("/bin/sh"), None);
        assert_eq!(t.method(), Method::None);
    }
}
