//! Digests of file contents and of job inputs.
//!
//! A job is identified by a single hash over its rule identity, its resolved
//! attributes and the contents of the deps it actually read.  Only content
//! enters a digest (never mtimes, hosts or absolute paths), so a digest
//! computed in one checkout is valid in another.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// A sha256 value.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Digest(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Digest(out))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Digest::from_hex(&s).ok_or_else(|| serde::de::Error::custom("bad digest"))
    }
}

/// The content identity of a path, as far as dependents are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "digest", rename_all = "lowercase")]
pub enum FileDigest {
    Absent,
    File(Digest),
    /// Executable bit set: a file that gains +x is a different dep.
    Exe(Digest),
    /// Symlink, digest of the link text.
    Link(Digest),
}

impl FileDigest {
    pub fn exists(&self) -> bool {
        !matches!(self, FileDigest::Absent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Exe,
    Link,
    Dir,
}

/// Cheap stat-level signature, used to skip rehashing files whose metadata
/// is unchanged since their digest was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSig {
    pub kind: FileKind,
    pub size: u64,
    /// Nanoseconds since the epoch; fits in an i64 until 2262.
    pub mtime_ns: i64,
    pub ino: u64,
}

impl FileSig {
    /// Stat a path without following symlinks.  Ok(None) if missing.
    pub fn observe(path: &Path) -> std::io::Result<Option<FileSig>> {
        let meta = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            // ENOTDIR: a path component is a regular file.
            Err(err) if err.raw_os_error() == Some(libc::ENOTDIR) => return Ok(None),
            Err(err) => return Err(err),
        };
        let ft = meta.file_type();
        let kind = if ft.is_symlink() {
            FileKind::Link
        } else if ft.is_dir() {
            FileKind::Dir
        } else if meta.permissions().mode() & 0o111 != 0 {
            FileKind::Exe
        } else {
            FileKind::File
        };
        Ok(Some(FileSig {
            kind,
            size: meta.len(),
            mtime_ns: meta.mtime().saturating_mul(1_000_000_000).saturating_add(meta.mtime_nsec()),
            ino: meta.ino(),
        }))
    }
}

fn digest_reader(mut r: impl Read) -> std::io::Result<Digest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest(hasher.finalize().into()))
}

/// Hash the content of a path.  Directories are reported as Absent; they
/// are not nodes.
pub fn file_digest(path: &Path, sig: Option<&FileSig>) -> std::io::Result<FileDigest> {
    let Some(sig) = sig else {
        return Ok(FileDigest::Absent);
    };
    Ok(match sig.kind {
        FileKind::Dir => FileDigest::Absent,
        FileKind::Link => {
            let target = std::fs::read_link(path)?;
            FileDigest::Link(Digest::of(target.as_os_str().as_bytes()))
        }
        FileKind::File => FileDigest::File(digest_reader(std::fs::File::open(path)?)?),
        FileKind::Exe => FileDigest::Exe(digest_reader(std::fs::File::open(path)?)?),
    })
}

/// Stat and hash in one go, for callers with no recorded signature.
pub fn observe(path: &Path) -> std::io::Result<(Option<FileSig>, FileDigest)> {
    let sig = FileSig::observe(path)?;
    let digest = file_digest(path, sig.as_ref())?;
    Ok((sig, digest))
}

/// A trait for computing a job's hash.  Indirected as a trait so we can
/// implement it a second time for "status --explain" purposes.
pub trait JobHasher {
    fn write_field(&mut self, key: &str, value: &str);
    fn write_dep(&mut self, name: &str, digest: &FileDigest);
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// The JobHasher used during builds.
#[derive(Default)]
pub struct TerseHash(Sha256);

impl TerseHash {
    fn write_string(&mut self, s: &str) {
        self.0.update((s.len() as u64).to_le_bytes());
        self.0.update(s.as_bytes());
    }

    pub fn finish(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

impl JobHasher for TerseHash {
    fn write_field(&mut self, key: &str, value: &str) {
        self.write_string(key);
        self.write_string(value);
        self.0.update([UNIT_SEPARATOR]);
    }

    fn write_dep(&mut self, name: &str, digest: &FileDigest) {
        self.write_string(name);
        match digest {
            FileDigest::Absent => self.0.update([0u8]),
            FileDigest::File(d) => {
                self.0.update([1u8]);
                self.0.update(d.0);
            }
            FileDigest::Exe(d) => {
                self.0.update([2u8]);
                self.0.update(d.0);
            }
            FileDigest::Link(d) => {
                self.0.update([3u8]);
                self.0.update(d.0);
            }
        }
        self.0.update([UNIT_SEPARATOR]);
    }
}

/// A JobHasher that records the inputs as text, for explaining why a job
/// is out of date.
#[derive(Default)]
pub struct ExplainHash {
    pub lines: Vec<String>,
}

impl JobHasher for ExplainHash {
    fn write_field(&mut self, key: &str, value: &str) {
        self.lines.push(format!("{key}: {value}"));
    }

    fn write_dep(&mut self, name: &str, digest: &FileDigest) {
        let d = match digest {
            FileDigest::Absent => "absent".to_string(),
            FileDigest::File(d) => format!("file {}", &d.to_hex()[..16]),
            FileDigest::Exe(d) => format!("exe {}", &d.to_hex()[..16]),
            FileDigest::Link(d) => format!("link {}", &d.to_hex()[..16]),
        };
        self.lines.push(format!("dep {name}: {d}"));
    }
}

/// Cache key of a job: its rule digest followed by the deps it read, in order.
pub fn hash_deps<H: JobHasher>(hasher: &mut H, rule_digest: &Digest, deps: &[(String, FileDigest)]) {
    hasher.write_field("rule", &rule_digest.to_hex());
    for (name, digest) in deps {
        hasher.write_dep(name, digest);
    }
}

pub fn deps_digest(rule_digest: &Digest, deps: &[(String, FileDigest)]) -> Digest {
    let mut h = TerseHash::default();
    hash_deps(&mut h, rule_digest, deps);
    h.finish()
}
