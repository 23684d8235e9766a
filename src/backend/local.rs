//! Running jobs on this machine: one worker thread and one process group
//! per execution.

use super::{Backend, BackendError, Handle, Liveness};
use crate::exec::{self, ExecSpec, JobMsg};
use crate::process;
use dashmap::DashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
struct Execution {
    pid: Option<u32>,
    finished: bool,
    /// Set when a kill arrives before the process exists.
    killed: bool,
    kill_sigs: Vec<i32>,
    kill_grace: Duration,
}

/// Threads escalating kill signals, joined by `drain`.
type Reapers = Arc<Mutex<Vec<JoinHandle<()>>>>;

#[derive(Default)]
pub struct LocalBackend {
    next: u64,
    table: Arc<DashMap<u64, Execution>>,
    reapers: Reapers,
}

fn kill_async(reapers: &Reapers, pid: u32, sigs: Vec<i32>, grace: Duration) {
    let reaper = std::thread::spawn(move || process::kill_group(pid, &sigs, grace));
    if let Ok(mut reapers) = reapers.lock() {
        reapers.push(reaper);
    }
}

impl Backend for LocalBackend {
    fn submit(&mut self, spec: ExecSpec, tx: Sender<JobMsg>) -> Result<Handle, BackendError> {
        self.next += 1;
        let id = self.next;
        self.table.insert(
            id,
            Execution {
                kill_sigs: spec.kill_sigs.clone(),
                kill_grace: spec.kill_grace,
                ..Execution::default()
            },
        );
        let table = self.table.clone();
        let reapers = self.reapers.clone();
        std::thread::Builder::new()
            .name(format!("job-{}", id))
            .spawn(move || {
                let outcome = exec::run(&spec, &tx, |pid| {
                    if let Some(mut e) = table.get_mut(&id) {
                        e.pid = Some(pid);
                        if e.killed {
                            kill_async(&reapers, pid, e.kill_sigs.clone(), e.kill_grace);
                        }
                    }
                });
                let forgotten = match table.get_mut(&id) {
                    Some(mut e) => {
                        e.finished = true;
                        e.killed
                    }
                    None => true,
                };
                if !forgotten {
                    let _ = tx.send(JobMsg::Finished {
                        job: spec.job,
                        seq: spec.seq,
                        outcome,
                    });
                }
                table.remove(&id);
            })
            .map_err(|err| BackendError::Submit(err.to_string()))?;
        Ok(Handle(id))
    }

    fn poll(&mut self, handle: Handle) -> Liveness {
        let Some(e) = self.table.get(&handle.0) else {
            return Liveness::Unknown;
        };
        match (e.finished, e.pid) {
            (true, _) => Liveness::Finished,
            (false, None) => Liveness::Running,
            (false, Some(pid)) if process::is_alive(pid) => Liveness::Running,
            // Exited but not yet collected.
            (false, Some(_)) => Liveness::Finished,
        }
    }

    fn kill(&mut self, handle: Handle) {
        let Some(mut e) = self.table.get_mut(&handle.0) else {
            return;
        };
        e.killed = true;
        if let Some(pid) = e.pid {
            kill_async(&self.reapers, pid, e.kill_sigs.clone(), e.kill_grace);
        }
    }

    fn drain(&mut self) {
        let reapers = match self.reapers.lock() {
            Ok(mut reapers) => std::mem::take(&mut *reapers),
            Err(_) => return,
        };
        for reaper in reapers {
            let _ = reaper.join();
        }
    }
}
