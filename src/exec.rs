//! Running one execution of a job, on a backend worker thread, and talking
//! back to the engine.

use crate::autodep::protocol::{EngineRequest, Reply, CONTROL_ENV};
use crate::autodep::server::ControlServer;
use crate::autodep::{self, AccessKind, Link, Method, Recorded, Recorder};
use crate::canon::RepoRoot;
use crate::graph::JobId;
use crate::process;
use crate::rules::rule::CmdLine;
use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Messages from running jobs to the engine.  `seq` identifies the
/// execution, so that messages from a superseded one are ignored.
pub enum JobMsg {
    Started {
        job: JobId,
        seq: u32,
    },
    Request {
        job: JobId,
        seq: u32,
        req: EngineRequest,
        reply: Sender<Reply>,
    },
    Finished {
        job: JobId,
        seq: u32,
        outcome: ExecOutcome,
    },
}

/// Everything needed to run a job, independent of the graph.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub job: JobId,
    pub seq: u32,
    pub name: String,
    pub cmd: CmdLine,
    pub root: RepoRoot,
    pub env: BTreeMap<String, String>,
    pub autodep: Method,
    pub autodep_lib: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub kill_sigs: Vec<i32>,
    pub kill_grace: Duration,
    /// Node name receiving the job's stdout.
    pub stdout_target: Option<String>,
    pub keep_tmp: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    /// The job never started.
    SpawnFailed(String),
}

impl Termination {
    pub fn success(&self) -> bool {
        *self == Termination::Exited(0)
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit code {}", code),
            Termination::Signaled(sig) => write!(f, "signal {}", sig),
            Termination::TimedOut => write!(f, "timed out"),
            Termination::SpawnFailed(msg) => write!(f, "cannot start: {}", msg),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub recorded: Recorded,
    /// The method actually used, after fallbacks.
    pub method: Method,
    pub elapsed: f64,
}

impl ExecOutcome {
    pub fn spawn_failed(msg: String) -> ExecOutcome {
        ExecOutcome {
            termination: Termination::SpawnFailed(msg),
            stdout: Vec::new(),
            stderr: Vec::new(),
            recorded: Recorded::default(),
            method: Method::None,
            elapsed: 0.0,
        }
    }
}

/// The control channel's view of the engine.
struct EngineLink {
    job: JobId,
    seq: u32,
    tx: Sender<JobMsg>,
}

impl Link for EngineLink {
    fn request(&self, req: EngineRequest) -> Reply {
        let (reply, wait) = mpsc::channel();
        let msg = JobMsg::Request {
            job: self.job,
            seq: self.seq,
            req,
            reply,
        };
        if self.tx.send(msg).is_err() {
            return Reply::error("build interrupted");
        }
        // The engine drops the sender if the job is cancelled.
        wait.recv().unwrap_or_else(|_| Reply::error("build interrupted"))
    }
}

fn drain(mut r: impl Read + Send + 'static) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        buf
    })
}

fn termination(status: std::process::ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited(code),
        (None, Some(sig)) => Termination::Signaled(sig),
        (None, None) => Termination::Exited(-1),
    }
}

/// Run the job to completion.  `on_start` receives the pid of the process
/// group leader.
pub fn run(spec: &ExecSpec, tx: &Sender<JobMsg>, on_start: impl FnOnce(u32)) -> ExecOutcome {
    let start = Instant::now();
    let admin = spec.root.admin_dir();
    let tmp = admin.join("tmp").join(format!("{}-{}", spec.job_index(), spec.seq));
    let mut outcome = match run_in(spec, tx, &tmp, on_start) {
        Ok(o) => o,
        Err(err) => ExecOutcome::spawn_failed(format!("{:#}", err)),
    };
    if !spec.keep_tmp {
        let _ = std::fs::remove_dir_all(&tmp);
    }
    outcome.elapsed = start.elapsed().as_secs_f64();
    outcome
}

impl ExecSpec {
    fn job_index(&self) -> usize {
        use crate::densemap::Index;
        self.job.index()
    }
}

fn run_in(
    spec: &ExecSpec,
    tx: &Sender<JobMsg>,
    tmp: &Path,
    on_start: impl FnOnce(u32),
) -> anyhow::Result<ExecOutcome> {
    std::fs::create_dir_all(tmp)?;
    let cwd = spec.root.path().to_path_buf();
    let recorder = Arc::new(Mutex::new(Recorder::new(spec.root.clone(), cwd.clone())));
    let link: Arc<EngineLink> = Arc::new(EngineLink {
        job: spec.job,
        seq: spec.seq,
        tx: tx.clone(),
    });
    let server = ControlServer::start(tmp.join("control"), recorder.clone(), link.clone())?;

    let program = process::program(&spec.cmd);
    let mut tracker = autodep::tracker_for(spec.autodep, &program, spec.autodep_lib.as_deref());
    let prepare = |tracker: &mut Box<dyn autodep::Tracker>| -> anyhow::Result<std::process::Command> {
        let mut cmd = process::command(&spec.cmd, &cwd, &spec.env)?;
        cmd.env(CONTROL_ENV, server.path()).env("TMPDIR", tmp);
        tracker.prepare(&mut cmd)?;
        Ok(cmd)
    };
    let mut child = match prepare(&mut tracker)?.spawn() {
        Ok(child) => child,
        Err(err) if tracker.method() == Method::Ptrace => {
            // Typically a sandbox forbidding ptrace.
            tracing::warn!(job = %spec.name, %err, "ptrace unavailable, running without autodep");
            tracker = Box::new(autodep::PassiveTracker::none());
            prepare(&mut tracker)?.spawn()?
        }
        Err(err) => return Err(err.into()),
    };
    let pid = child.id();
    on_start(pid);
    let _ = tx.send(JobMsg::Started {
        job: spec.job,
        seq: spec.seq,
    });

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let timed_out = Arc::new(AtomicBool::new(false));
    let (cancel, cancelled) = mpsc::channel::<()>();
    let watchdog = spec.timeout.map(|limit| {
        let timed_out = timed_out.clone();
        let sigs = spec.kill_sigs.clone();
        let grace = spec.kill_grace;
        std::thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(limit) {
                timed_out.store(true, Ordering::SeqCst);
                process::kill_group(pid, &sigs, grace);
            }
        })
    });

    let status = tracker.wait(&mut child, &recorder, link.as_ref());
    drop(cancel);
    if let Some(w) = watchdog {
        let _ = w.join();
    }
    // Stragglers left in the group would hold the pipes open.
    process::kill_group(pid, &[libc::SIGKILL], Duration::ZERO);
    let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    drop(server);
    let status = status?;

    let termination = if timed_out.load(Ordering::SeqCst) {
        Termination::TimedOut
    } else {
        termination(status)
    };
    let mut recorder = recorder.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(target) = &spec.stdout_target {
        if termination.success() {
            let path = spec.root.abs(target);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&path, &stdout)?;
            recorder.record(None, &path, AccessKind::Write);
        }
    }
    Ok(ExecOutcome {
        termination,
        stdout,
        stderr,
        recorded: recorder.finish(),
        method: tracker.method(),
        elapsed: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path, cmd: &str) -> ExecSpec {
        ExecSpec {
            job: JobId::from(0),
            seq: 1,
            name: "test".into(),
            cmd: CmdLine::Shell(cmd.into()),
            root: RepoRoot::new(dir, ".dynmake"),
            env: BTreeMap::new(),
            autodep: Method::None,
            autodep_lib: None,
            timeout: None,
            kill_sigs: vec![libc::SIGTERM, libc::SIGKILL],
            kill_grace: Duration::from_millis(100),
            stdout_target: None,
            keep_tmp: false,
        }
    }

    #[test]
    fn captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let o = run(&spec(dir.path(), "echo out; echo err >&2; exit 3"), &tx, |_| {});
        assert_eq!(o.termination, Termination::Exited(3));
        assert_eq!(o.stdout, b"out\n");
        assert_eq!(o.stderr, b"err\n");
    }

    #[test]
    fn stdout_target_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let mut s = spec(dir.path(), "echo hi");
        s.stdout_target = Some("out/greeting".into());
        let o = run(&s, &tx, |_| {});
        assert!(o.termination.success());
        assert_eq!(std::fs::read(dir.path().join("out/greeting")).unwrap(), b"hi\n");
        assert_eq!(o.recorded.writes, vec!["out/greeting"]);
    }

    #[test]
    fn timeout_kills() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let mut s = spec(dir.path(), "sleep 10");
        s.timeout = Some(Duration::from_millis(100));
        let start = Instant::now();
        let o = run(&s, &tx, |_| {});
        assert_eq!(o.termination, Termination::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
