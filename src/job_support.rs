//! The job side of the control socket: what `dynmake depend`, `target` and
//! friends use from inside a running job.

use crate::autodep::protocol::{read_msg, write_msg, ProtocolError, Reply, Request, CONTROL_ENV};
use anyhow::{anyhow, bail};
use std::io::BufReader;
use std::os::unix::net::UnixStream;

pub struct JobClient {
    w: UnixStream,
    r: BufReader<UnixStream>,
    cwd: Option<String>,
}

impl JobClient {
    /// Connect to the engine of the job this process runs in.
    pub fn from_env() -> anyhow::Result<JobClient> {
        let Some(path) = std::env::var_os(CONTROL_ENV) else {
            bail!("not running inside a job ({} is not set)", CONTROL_ENV);
        };
        let stream = UnixStream::connect(&path)
            .map_err(|err| anyhow!("connect {}: {}", path.to_string_lossy(), err))?;
        let cwd = std::env::current_dir()
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        Ok(JobClient {
            w: stream.try_clone()?,
            r: BufReader::new(stream),
            cwd,
        })
    }

    fn call(&mut self, req: &Request) -> Result<Reply, ProtocolError> {
        write_msg(&mut self.w, req)?;
        read_msg(&mut self.r)
    }

    /// Send a request whose only good answer is Ok.
    fn call_ok(&mut self, req: &Request) -> anyhow::Result<()> {
        match self.call(req)? {
            Reply::Ok => Ok(()),
            Reply::Error { msg } => bail!("{}", msg),
            other => bail!("unexpected reply {:?}", other),
        }
    }

    /// Declare deps; returns once they are up to date.  Fails if one of
    /// them is in error.
    pub fn declare_deps(&mut self, paths: &[String], flags: &[String]) -> anyhow::Result<()> {
        self.call_ok(&Request::DeclareDeps {
            paths: paths.to_vec(),
            flags: flags.to_vec(),
            cwd: self.cwd.clone(),
        })
    }

    pub fn declare_targets(&mut self, paths: &[String], flags: &[String]) -> anyhow::Result<()> {
        self.call_ok(&Request::DeclareTargets {
            paths: paths.to_vec(),
            flags: flags.to_vec(),
            cwd: self.cwd.clone(),
        })
    }

    /// Wait until every dep seen so far is up to date.
    pub fn check_deps(&mut self) -> anyhow::Result<()> {
        self.call_ok(&Request::CheckDeps)
    }

    pub fn encode(&mut self, file: &str, ctx: &str, value: &str, min_len: Option<usize>) -> anyhow::Result<String> {
        let req = Request::Encode {
            file: file.to_string(),
            ctx: ctx.to_string(),
            value: value.to_string(),
            min_len,
        };
        match self.call(&req)? {
            Reply::Code { code } => Ok(code),
            Reply::Error { msg } => bail!("{}", msg),
            other => bail!("unexpected reply {:?}", other),
        }
    }

    pub fn decode(&mut self, file: &str, ctx: &str, code: &str) -> anyhow::Result<String> {
        let req = Request::Decode {
            file: file.to_string(),
            ctx: ctx.to_string(),
            code: code.to_string(),
        };
        match self.call(&req)? {
            Reply::Value { value } => Ok(value),
            Reply::Error { msg } => bail!("{}", msg),
            other => bail!("unexpected reply {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    #[test]
    fn round_trip_through_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let listener = UnixListener::bind(&path).unwrap();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut w = stream.try_clone().unwrap();
            let mut r = BufReader::new(stream);
            let req: Request = read_msg(&mut r).unwrap();
            assert!(matches!(req, Request::DeclareDeps { .. }));
            write_msg(&mut w, &Reply::error("b: failed")).unwrap();
            let req: Request = read_msg(&mut r).unwrap();
            assert_eq!(req, Request::CheckDeps);
            write_msg(&mut w, &Reply::Ok).unwrap();
        });
        let stream = UnixStream::connect(&path).unwrap();
        let mut client = JobClient {
            w: stream.try_clone().unwrap(),
            r: BufReader::new(stream),
            cwd: None,
        };
        let err = client.declare_deps(&["b".to_string()], &[]).unwrap_err();
        assert_eq!(err.to_string(), "b: failed");
        client.check_deps().unwrap();
        server.join().unwrap();
    }
}
