//! Engine tests against scripted backends, for paths a real process cannot
//! reliably take.

use dynmake::autodep::protocol::NewDep;
use dynmake::autodep::{Method, Recorded};
use dynmake::backend::resources::ResourcePool;
use dynmake::backend::scheduler::Scheduler;
use dynmake::backend::{Backend, BackendError, Handle, Liveness};
use dynmake::canon::RepoRoot;
use dynmake::config::{EngineConfig, ResourceConfig};
use dynmake::engine::Engine;
use dynmake::exec::{ExecOutcome, ExecSpec, JobMsg, Termination};
use dynmake::graph::Accesses;
use dynmake::progress::{Progress, ReportKey, Summary};
use dynmake::rules::{load, DepFlags};
use dynmake::store::Store;
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Implementation of Progress that remembers report lines.
#[derive(Default)]
struct Lines {
    lines: Vec<(ReportKey, String)>,
    unconfirmed: usize,
}

impl Progress for Lines {
    fn report(&mut self, key: ReportKey, name: &str) {
        self.lines.push((key, name.to_string()));
    }
    fn output(&mut self, _name: &str, _text: &[u8]) {}
    fn message(&mut self, _msg: &str) {}
    fn finish(&mut self, summary: &Summary) {
        self.unconfirmed = summary.unconfirmed;
    }
}

impl Lines {
    fn count(&self, key: ReportKey) -> usize {
        self.lines.iter().filter(|(k, _)| *k == key).count()
    }

    fn has(&self, key: ReportKey, name: &str) -> bool {
        self.lines.iter().any(|(k, n)| *k == key && n == name)
    }
}

/// A backend whose jobs never report back and never answer a poll.
#[derive(Clone, Default)]
struct Silent {
    submits: Arc<Mutex<u32>>,
}

impl Backend for Silent {
    fn submit(&mut self, _spec: ExecSpec, _tx: Sender<JobMsg>) -> Result<Handle, BackendError> {
        let mut n = self.submits.lock().unwrap();
        *n += 1;
        Ok(Handle(*n as u64))
    }
    fn poll(&mut self, _handle: Handle) -> Liveness {
        Liveness::Unknown
    }
    fn kill(&mut self, _handle: Handle) {}
}

/// A backend that "runs" a job by writing its stdout target on submit.
#[derive(Default)]
struct Immediate {
    next: u64,
}

impl Backend for Immediate {
    fn submit(&mut self, spec: ExecSpec, tx: Sender<JobMsg>) -> Result<Handle, BackendError> {
        let stdout = format!("ran {}\n", spec.name).into_bytes();
        if let Some(target) = &spec.stdout_target {
            std::fs::write(spec.root.abs(target), &stdout).map_err(|e| BackendError::Submit(e.to_string()))?;
        }
        let mut recorded = Recorded::default();
        recorded.writes.extend(spec.stdout_target.clone());
        let outcome = ExecOutcome {
            termination: Termination::Exited(0),
            stdout,
            stderr: Vec::new(),
            recorded,
            method: Method::None,
            elapsed: 0.0,
        };
        let _ = tx.send(JobMsg::Finished {
            job: spec.job,
            seq: spec.seq,
            outcome,
        });
        self.next += 1;
        Ok(Handle(self.next))
    }
    fn poll(&mut self, _handle: Handle) -> Liveness {
        Liveness::Finished
    }
    fn kill(&mut self, _handle: Handle) {}
}

fn scheduler(backend: Box<dyn Backend>, heartbeat: Duration) -> Scheduler {
    let mut s = Scheduler::new(heartbeat, Duration::ZERO);
    let mut limits = BTreeMap::new();
    limits.insert(
        "cpu".to_string(),
        ResourceConfig {
            capacity: 2,
            precision: 0,
        },
    );
    s.add_backend("local", backend, ResourcePool::new("local", limits));
    s
}

const RULES: &str = r#"{"rules": [
    {"name": "gen", "stems": {"N": "[a-z]+"}, "target": "{N}.out", "cmd": "never run",
     "attrs": {"autodep": "none"}}
]}"#;

#[test]
fn lost_job_is_retried_then_failed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = Store::open(RepoRoot::new(dir.path(), ".dynmake"))?;
    let rules = load::parse(RULES)?;
    let config = EngineConfig {
        max_retries_on_lost: 2,
        ..EngineConfig::default()
    };
    let backend = Silent::default();
    let submits = backend.submits.clone();
    let mut progress = Lines::default();
    let ok = Engine::new(
        &mut store,
        &rules,
        &config,
        scheduler(Box::new(backend), Duration::from_millis(10)),
        &mut progress,
    )
    .build(&["a.out".to_string()])?;

    assert!(!ok);
    assert_eq!(*submits.lock().unwrap(), 3);
    assert_eq!(progress.count(ReportKey::Lost), 3);
    assert_eq!(progress.count(ReportKey::Failed), 1);
    assert_eq!(progress.count(ReportKey::Done), 0);
    Ok(())
}

#[test]
fn scripted_run_produces_target() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = Store::open(RepoRoot::new(dir.path(), ".dynmake"))?;
    let rules = load::parse(RULES)?;
    let config = EngineConfig::default();
    let mut progress = Lines::default();
    let ok = Engine::new(
        &mut store,
        &rules,
        &config,
        scheduler(Box::new(Immediate::default()), Duration::from_secs(10)),
        &mut progress,
    )
    .build(&["a.out".to_string(), "b.out".to_string()])?;

    assert!(ok);
    assert_eq!(progress.count(ReportKey::Done), 2);
    assert!(std::fs::read_to_string(dir.path().join("a.out"))?.starts_with("ran "));
    Ok(())
}

/// A backend interpreting each command as one of a few file operations,
/// recording reads as deps:
///   copy SRC DST      fails if SRC holds "bad"
///   cat A B DST
///   catif A B DST     reads B only if A holds "more"
#[derive(Clone, Default)]
struct Script {
    next: u64,
    ran: Arc<Mutex<Vec<String>>>,
}

impl Script {
    fn exec(spec: &ExecSpec) -> (bool, Recorded) {
        let cmd = spec.cmd.to_string();
        let words: Vec<&str> = cmd.split_whitespace().collect();
        let mut recorded = Recorded::default();
        let mut read = |name: &str| {
            recorded.deps.push(NewDep {
                name: name.to_string(),
                flags: DepFlags::default(),
                accesses: Accesses {
                    read: true,
                    stat: false,
                },
            });
            std::fs::read_to_string(spec.root.abs(name)).unwrap_or_default()
        };
        let (ok, out, dst) = match words.as_slice() {
            ["copy", src, dst] => {
                let text = read(*src);
                (text.trim() != "bad", text, *dst)
            }
            ["cat", a, b, dst] => (true, read(*a) + &read(*b), *dst),
            ["catif", a, b, dst] => {
                let mut text = read(*a);
                if text.contains("more") {
                    text += &read(*b);
                }
                (true, text, *dst)
            }
            _ => panic!("unknown command {:?}", cmd),
        };
        if ok {
            std::fs::write(spec.root.abs(dst), out).unwrap();
            recorded.writes.push(dst.to_string());
        }
        (ok, recorded)
    }
}

impl Backend for Script {
    fn submit(&mut self, spec: ExecSpec, tx: Sender<JobMsg>) -> Result<Handle, BackendError> {
        self.ran.lock().unwrap().push(spec.cmd.to_string());
        let (ok, recorded) = Script::exec(&spec);
        let outcome = ExecOutcome {
            termination: Termination::Exited(if ok { 0 } else { 1 }),
            stdout: Vec::new(),
            stderr: Vec::new(),
            recorded,
            method: Method::None,
            elapsed: 0.0,
        };
        let _ = tx.send(JobMsg::Finished {
            job: spec.job,
            seq: spec.seq,
            outcome,
        });
        self.next += 1;
        Ok(Handle(self.next))
    }
    fn poll(&mut self, _handle: Handle) -> Liveness {
        Liveness::Finished
    }
    fn kill(&mut self, _handle: Handle) {}
}

const SCRIPTED: &str = r#"{"rules": [
    {"name": "x", "targets": {"out": "x"}, "cmd": "copy xs x", "attrs": {"autodep": "none"}},
    {"name": "y", "targets": {"out": "y"}, "cmd": "copy ys y", "attrs": {"autodep": "none"}},
    {"name": "both", "targets": {"out": "both"}, "deps": {"a": "x", "b": "y"},
     "cmd": "cat x y both", "attrs": {"autodep": "none"}},
    {"name": "maybe", "targets": {"out": "maybe"}, "deps": {"a": "x"},
     "cmd": "catif x y maybe", "attrs": {"autodep": "none"}},
    {"name": "guarded", "targets": {"out": "guarded"}, "deps": {"a": ["x", "critical"]},
     "cmd": "catif x y guarded", "attrs": {"autodep": "none"}}
]}"#;

/// Build `goal` in `dir` with the scripted backend.  Returns whether it
/// succeeded, the reports and the commands that ran.  Reads are only known
/// once a job ends, so anything a job reads must already be built.
fn scripted(dir: &std::path::Path, goal: &str) -> anyhow::Result<(bool, Lines, Vec<String>)> {
    let mut store = Store::open(RepoRoot::new(dir, ".dynmake"))?;
    let rules = load::parse(SCRIPTED)?;
    let config = EngineConfig::default();
    let backend = Script::default();
    let ran = backend.ran.clone();
    let mut progress = Lines::default();
    let ok = Engine::new(
        &mut store,
        &rules,
        &config,
        scheduler(Box::new(backend), Duration::from_secs(10)),
        &mut progress,
    )
    .build(&[goal.to_string()])?;
    let ran = ran.lock().unwrap().clone();
    Ok((ok, progress, ran))
}

fn sources(dir: &std::path::Path, xs: &str, ys: &str) -> std::io::Result<()> {
    std::fs::write(dir.join("xs"), xs)?;
    std::fs::write(dir.join("ys"), ys)
}

#[test]
fn speculative_failure_nobody_needs_is_not_reported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    sources(dir.path(), "more\n", "ok\n")?;
    assert!(scripted(dir.path(), "y")?.0);
    let (ok, _, _) = scripted(dir.path(), "maybe")?;
    assert!(ok);
    assert_eq!(std::fs::read_to_string(dir.path().join("maybe"))?, "more\nok\n");

    // x changes so that maybe no longer reads y, which now fails.  y was
    // run on a guess while x was rebuilt.
    sources(dir.path(), "less!\n", "bad\n")?;
    let (ok, p, ran) = scripted(dir.path(), "maybe")?;
    assert!(ok);
    assert!(ran.iter().any(|c| c == "copy ys y"));
    assert!(p.has(ReportKey::Done, "maybe"));
    assert_eq!(p.count(ReportKey::Failed), 0);
    assert_eq!(p.count(ReportKey::WasFailed), 0);
    assert_eq!(p.unconfirmed, 1);
    assert_eq!(std::fs::read_to_string(dir.path().join("maybe"))?, "less!\n");
    Ok(())
}

#[test]
fn speculative_failure_is_reported_once_needed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    sources(dir.path(), "1\n", "ok\n")?;
    let (ok, _, _) = scripted(dir.path(), "both")?;
    assert!(ok);

    sources(dir.path(), "22\n", "bad\n")?;
    let (ok, p, _) = scripted(dir.path(), "both")?;
    assert!(!ok);
    assert!(p.has(ReportKey::Done, "x"));
    assert!(p.has(ReportKey::WasFailed, "y"));
    assert!(p.has(ReportKey::DepErr, "both"));
    assert_eq!(p.count(ReportKey::Failed), 0);
    assert_eq!(p.unconfirmed, 0);
    Ok(())
}

#[test]
fn critical_dep_stops_the_scan() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    sources(dir.path(), "more\n", "ok\n")?;
    assert!(scripted(dir.path(), "y")?.0);
    let (ok, _, _) = scripted(dir.path(), "guarded")?;
    assert!(ok);

    // Unlike maybe, y is not even tried while the critical x is rebuilt.
    sources(dir.path(), "less!\n", "bad\n")?;
    let (ok, p, ran) = scripted(dir.path(), "guarded")?;
    assert!(ok);
    assert!(!ran.iter().any(|c| c == "copy ys y"));
    assert!(p.has(ReportKey::Done, "guarded"));
    assert_eq!(p.unconfirmed, 0);
    Ok(())
}
