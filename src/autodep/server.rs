//! The per-job control socket.  Every process of the job may connect; each
//! connection is served on its own thread.

use super::protocol::{read_msg, write_msg, EngineRequest, ProtocolError, Reply, Request};
use super::{Link, Recorder};
use crate::rules::{DepFlags, TargetFlags};
use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Answer one request.  The recorder lock is never held while the engine
/// is being waited on.
pub fn handle(req: Request, recorder: &Mutex<Recorder>, link: &dyn Link) -> Reply {
    let lock = || recorder.lock().unwrap_or_else(|e| e.into_inner());
    match req {
        Request::Access { path, kind, cwd } => {
            let cwd = cwd.map(PathBuf::from);
            let dep = lock().record(cwd.as_deref(), Path::new(&path), kind);
            match dep {
                Some(dep) => link.request(EngineRequest::Deps(vec![dep])),
                None => Reply::Ok,
            }
        }
        Request::DeclareDeps { paths, flags, cwd } => {
            let flags = match DepFlags::resolve(&flags) {
                Ok(f) => f,
                Err(err) => return Reply::error(err),
            };
            let cwd = cwd.map(PathBuf::from);
            let deps: Vec<_> = {
                let mut r = lock();
                paths
                    .iter()
                    .filter_map(|p| r.declare_dep(cwd.as_deref(), Path::new(p), flags))
                    .collect()
            };
            if deps.is_empty() {
                return Reply::Ok;
            }
            link.request(EngineRequest::Deps(deps))
        }
        Request::DeclareTargets { paths, flags, cwd } => {
            let flags = match TargetFlags::resolve(&flags) {
                Ok(f) => f,
                Err(err) => return Reply::error(err),
            };
            let cwd = cwd.map(PathBuf::from);
            let targets: Vec<_> = {
                let mut r = lock();
                paths
                    .iter()
                    .filter_map(|p| r.declare_target(cwd.as_deref(), Path::new(p), flags))
                    .map(|name| (name, flags))
                    .collect()
            };
            link.request(EngineRequest::Targets(targets))
        }
        Request::CheckDeps => link.request(EngineRequest::CheckDeps),
        Request::Encode {
            file,
            ctx,
            value,
            min_len,
        } => {
            let Some(file) = lock().locate(None, Path::new(&file)) else {
                return Reply::error(format!("{}: not in the repo", file));
            };
            link.request(EngineRequest::Encode {
                file,
                ctx,
                value,
                min_len: min_len.unwrap_or(crate::codec::MIN_CODE_LEN),
            })
        }
        Request::Decode { file, ctx, code } => {
            let Some(file) = lock().locate(None, Path::new(&file)) else {
                return Reply::error(format!("{}: not in the repo", file));
            };
            link.request(EngineRequest::Decode { file, ctx, code })
        }
    }
}

fn serve_conn(
    stream: UnixStream,
    recorder: &Mutex<Recorder>,
    link: &dyn Link,
) -> Result<(), ProtocolError> {
    let mut w = stream.try_clone()?;
    let mut r = BufReader::new(stream);
    loop {
        let req: Request = match read_msg(&mut r) {
            Ok(req) => req,
            Err(ProtocolError::Closed) => return Ok(()),
            Err(err) => return Err(err),
        };
        let reply = handle(req, recorder, link);
        write_msg(&mut w, &reply)?;
    }
}

impl ControlServer {
    pub fn start(
        path: PathBuf,
        recorder: Arc<Mutex<Recorder>>,
        link: Arc<dyn Link>,
    ) -> anyhow::Result<ControlServer> {
        // A stale socket from a crashed run would make bind fail.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("control".into())
                .spawn(move || {
                    for conn in listener.incoming() {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let stream = match conn {
                            Ok(s) => s,
                            Err(err) => {
                                tracing::warn!(%err, "control accept");
                                continue;
                            }
                        };
                        let recorder = recorder.clone();
                        let link = link.clone();
                        std::thread::spawn(move || {
                            if let Err(err) = serve_conn(stream, &recorder, link.as_ref()) {
                                tracing::warn!(%err, "control connection");
                            }
                        });
                    }
                })?
        };
        Ok(ControlServer {
            path,
            stop,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it sees the flag.
        let _ = UnixStream::connect(&self.path);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}
