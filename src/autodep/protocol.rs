//! The job control protocol: one JSON object per line each way, over the
//! Unix socket named by `DYNMAKE_CONTROL`.

use super::AccessKind;
use crate::graph::Accesses;
use crate::rules::{DepFlags, TargetFlags};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

pub const CONTROL_ENV: &str = "DYNMAKE_CONTROL";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("control channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad control message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control channel closed")]
    Closed,
}

/// Requests from a job's processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Reported by the interposition library before the real call.
    Access {
        path: String,
        kind: AccessKind,
        /// Working directory of the reporting process, for relative paths.
        #[serde(default)]
        cwd: Option<String>,
    },
    DeclareDeps {
        paths: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    DeclareTargets {
        paths: Vec<String>,
        #[serde(default)]
        flags: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    CheckDeps,
    Encode {
        file: String,
        ctx: String,
        value: String,
        #[serde(default)]
        min_len: Option<usize>,
    },
    Decode {
        file: String,
        ctx: String,
        code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Code { code: String },
    Value { value: String },
    Error { msg: String },
}

impl Reply {
    pub fn error(msg: impl std::fmt::Display) -> Reply {
        Reply::Error {
            msg: msg.to_string(),
        }
    }
}

/// A repo path the job has started to depend on.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDep {
    pub name: String,
    pub flags: DepFlags,
    pub accesses: Accesses,
}

/// What the engine is asked on behalf of a running job.  Paths are node
/// names by now.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    /// Bring these deps up to date before the job goes on.
    Deps(Vec<NewDep>),
    /// Additional targets the job will write.
    Targets(Vec<(String, TargetFlags)>),
    CheckDeps,
    Encode {
        file: String,
        ctx: String,
        value: String,
        min_len: usize,
    },
    Decode {
        file: String,
        ctx: String,
        code: String,
    },
}

pub fn write_msg<T: Serialize>(w: &mut impl Write, msg: &T) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    w.write_all(&line)?;
    w.flush()?;
    Ok(())
}

pub fn read_msg<T: for<'de> Deserialize<'de>>(r: &mut impl BufRead) -> Result<T, ProtocolError> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Err(ProtocolError::Closed);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let req: Request =
            serde_json::from_str(r#"{"op":"access","path":"a.c","kind":"read"}"#).unwrap();
        assert_eq!(
            req,
            Request::Access {
                path: "a.c".into(),
                kind: AccessKind::Read,
                cwd: None
            }
        );
        let text = serde_json::to_string(&Reply::Code { code: "1a2b".into() }).unwrap();
        assert_eq!(text, r#"{"status":"code","code":"1a2b"}"#);
    }

    #[test]
    fn lines() {
        let mut buf = Vec::new();
        write_msg(&mut buf, &Request::CheckDeps).unwrap();
        write_msg(&mut buf, &Reply::Ok).unwrap();
        let mut r = std::io::BufReader::new(&buf[..]);
        assert_eq!(read_msg::<Request>(&mut r).unwrap(), Request::CheckDeps);
        assert_eq!(read_msg::<Reply>(&mut r).unwrap(), Reply::Ok);
        assert!(matches!(read_msg::<Reply>(&mut r), Err(ProtocolError::Closed)));
    }
}
