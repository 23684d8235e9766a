//! The dynmake database stores what previous runs learned: node digests and
//! each job's deps and targets.
//!
//! The file is an append-only log of frames, each a little-endian u32
//! payload length, a u32 check value and a JSON payload.  A commit is one
//! frame, so a crash leaves at worst a torn final frame, which is dropped on
//! the next open.  Once most frames are superseded the log is rewritten.

use crate::graph::{Accesses, JobStatus};
use crate::hash::{Digest, FileDigest, FileSig};
use crate::rules::{DepFlags, TargetFlags};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8] = b"dynmake-db 1\n";
const FRAME_HEADER: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub digest: Option<FileDigest>,
    pub sig: Option<FileSig>,
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub frozen: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepRecord {
    pub node: String,
    pub flags: DepFlags,
    pub accesses: Accesses,
    pub digest: FileDigest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub node: String,
    pub flags: TargetFlags,
    pub digest: FileDigest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub rule: String,
    pub name: String,
    pub stems: Vec<(String, String)>,
    pub deps: Vec<DepRecord>,
    pub targets: Vec<TargetRecord>,
    pub status: JobStatus,
    pub rule_digest: Option<Digest>,
    pub job_digest: Option<Digest>,
    #[serde(default)]
    pub resources: BTreeMap<String, u64>,
    pub exec_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Entry {
    Node(NodeRecord),
    /// A finished job and every node it touched, atomically.
    Commit {
        job: JobRecord,
        nodes: Vec<NodeRecord>,
    },
    Forget {
        rule: String,
        name: String,
    },
}

fn check_value(payload: &[u8]) -> u32 {
    let d = Digest::of(payload);
    u32::from_le_bytes([d.0[0], d.0[1], d.0[2], d.0[3]])
}

/// Parse frames from a loaded log.  Returns the entries and the offset
/// just past the last intact frame.
fn parse_frames(buf: &[u8]) -> anyhow::Result<(Vec<Entry>, usize)> {
    if buf.len() < MAGIC.len() {
        // Crashed while writing the header; treat as empty.
        return Ok((Vec::new(), 0));
    }
    if &buf[..MAGIC.len()] != MAGIC {
        bail!("not a dynmake database (bad header)");
    }
    let mut ofs = MAGIC.len();
    let mut entries = Vec::new();
    while ofs + FRAME_HEADER <= buf.len() {
        let len = u32::from_le_bytes([buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]]) as usize;
        let check = u32::from_le_bytes([buf[ofs + 4], buf[ofs + 5], buf[ofs + 6], buf[ofs + 7]]);
        let start = ofs + FRAME_HEADER;
        let Some(payload) = buf.get(start..start + len) else {
            break;
        };
        if check_value(payload) != check {
            break;
        }
        match serde_json::from_slice::<Entry>(payload) {
            Ok(e) => entries.push(e),
            Err(err) => {
                tracing::warn!(offset = ofs, %err, "unreadable db frame, dropping tail");
                break;
            }
        }
        ofs = start + len;
    }
    Ok((entries, ofs))
}

pub struct Writer {
    path: PathBuf,
    w: BufWriter<File>,
    /// Frames in the file.
    frames: usize,
}

fn write_frame(w: &mut impl Write, entry: &Entry) -> std::io::Result<()> {
    let payload = serde_json::to_vec(entry)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "db frame too large"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&check_value(&payload).to_le_bytes())?;
    w.write_all(&payload)
}

impl Writer {
    pub fn append(&mut self, entry: &Entry) -> std::io::Result<()> {
        write_frame(&mut self.w, entry)?;
        self.frames += 1;
        self.w.flush()
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Whether the log is mostly superseded frames, given how many entries
    /// a rewrite would keep.
    pub fn wants_compaction(&self, live: usize) -> bool {
        self.frames > 1000 && self.frames > 3 * live
    }

    /// Rewrite the log with only `entries`, atomically.
    pub fn compact(&mut self, entries: &[Entry]) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            w.write_all(MAGIC)?;
            for e in entries {
                write_frame(&mut w, e)?;
            }
            w.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {}", tmp.display()))?;
        let f = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        self.w = BufWriter::new(f);
        self.frames = entries.len();
        tracing::debug!(frames = self.frames, "compacted db");
        Ok(())
    }
}

/// Open (or create) the database, returning the entries recorded so far.
pub fn open(path: &Path) -> anyhow::Result<(Vec<Entry>, Writer)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let len = f.metadata()?.len();
    let (entries, good) = if len == 0 {
        (Vec::new(), 0)
    } else {
        // Safety: the db is private to this repo's admin dir and we hold the
        // only writer; the map is dropped before we append.
        let map = unsafe { memmap2::Mmap::map(&f)? };
        let parsed = parse_frames(&map).with_context(|| format!("read {}", path.display()))?;
        drop(map);
        parsed
    };
    if good == 0 {
        f.set_len(0)?;
        f.write_all(MAGIC)?;
    } else if (good as u64) < len {
        tracing::warn!(path = %path.display(), dropped = len - good as u64, "truncating torn db tail");
        f.set_len(good as u64)?;
    }
    let frames = entries.len();
    Ok((
        entries,
        Writer {
            path: path.to_path_buf(),
            w: BufWriter::new(f),
            frames,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> Entry {
        Entry::Node(NodeRecord {
            name: name.to_string(),
            digest: Some(FileDigest::File(Digest::of(name.as_bytes()))),
            sig: None,
            manual: false,
            frozen: false,
        })
    }

    #[test]
    fn reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let (entries, mut w) = open(&path)?;
            assert!(entries.is_empty());
            w.append(&node("a"))?;
            w.append(&Entry::Forget {
                rule: "r".into(),
                name: "x".into(),
            })?;
        }
        let (entries, w) = open(&path)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], node("a"));
        assert_eq!(w.frames(), 2);
        Ok(())
    }

    #[test]
    fn node_with_stat_signature_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        let record = Entry::Node(NodeRecord {
            name: "src/a.c".into(),
            digest: Some(FileDigest::File(Digest::of(b"int a;"))),
            sig: Some(FileSig {
                kind: crate::hash::FileKind::File,
                size: 6,
                mtime_ns: 1_700_000_000_123_456_789,
                ino: 42,
            }),
            manual: false,
            frozen: false,
        });
        {
            let (_, mut w) = open(&path)?;
            w.append(&record)?;
        }
        let (entries, _) = open(&path)?;
        assert_eq!(entries, vec![record]);
        Ok(())
    }

    #[test]
    fn torn_tail_is_dropped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        {
            let (_, mut w) = open(&path)?;
            w.append(&node("a"))?;
            w.append(&node("b"))?;
        }
        let full = std::fs::metadata(&path)?.len();
        let f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.set_len(full - 3)?;
        drop(f);

        let (entries, mut w) = open(&path)?;
        assert_eq!(entries, vec![node("a")]);
        w.append(&node("c"))?;
        drop(w);
        let (entries, _) = open(&path)?;
        assert_eq!(entries, vec![node("a"), node("c")]);
        Ok(())
    }

    #[test]
    fn compact_keeps_given_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        let (_, mut w) = open(&path)?;
        for _ in 0..10 {
            w.append(&node("a"))?;
        }
        w.compact(&[node("a")])?;
        w.append(&node("b"))?;
        drop(w);
        let (entries, w) = open(&path)?;
        assert_eq!(entries, vec![node("a"), node("b")]);
        assert_eq!(w.frames(), 2);
        Ok(())
    }

    #[test]
    fn rejects_foreign_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db");
        std::fs::write(&path, "something else entirely")?;
        assert!(open(&path).is_err());
        Ok(())
    }
}
