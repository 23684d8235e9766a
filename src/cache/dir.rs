//! A cache in a local (possibly shared) directory.
//!
//! ```text
//! <root>/meta.json                                total size, max size, policy
//! <root>/tmp/                                     entries being written
//! <root>/<repo>/<key[..2]>/<key>/<deps digest>/   one entry:
//!     meta.json  stdout  stderr  targets/<n>
//! ```
//!
//! Entries are written under tmp/ and renamed into place, so readers never
//! see a partial entry.  Eviction removes least recently used entries.

use super::{Cache, CacheEntry, CacheError, EntryMeta};
use crate::hash::{deps_digest, Digest, FileDigest};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RootMeta {
    total_size: u64,
    max_size: u64,
    policy: String,
}

pub struct DirCache {
    root: PathBuf,
    repo: String,
    max_size: u64,
}

fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, CacheError> {
    if level == 0 {
        return Ok(data.to_vec());
    }
    Ok(zstd::encode_all(data, level)?)
}

fn decompress(data: Vec<u8>, level: i32) -> Result<Vec<u8>, CacheError> {
    if level == 0 {
        return Ok(data);
    }
    Ok(zstd::decode_all(&data[..])?)
}

fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

impl DirCache {
    pub fn new(root: impl Into<PathBuf>, repo: &str, max_size: u64) -> DirCache {
        DirCache {
            root: root.into(),
            repo: repo.to_string(),
            max_size,
        }
    }

    fn job_dir(&self, key: &Digest) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&self.repo).join(&hex[..2]).join(hex)
    }

    fn read_meta(&self) -> RootMeta {
        std::fs::read(self.root.join("meta.json"))
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .unwrap_or(RootMeta {
                total_size: 0,
                max_size: self.max_size,
                policy: "lru".to_string(),
            })
    }

    fn write_meta(&self, meta: &RootMeta) -> Result<(), CacheError> {
        let tmp = self.root.join("meta.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        std::fs::rename(tmp, self.root.join("meta.json"))?;
        Ok(())
    }

    fn load_entry(&self, dir: &Path, meta: EntryMeta) -> Result<CacheEntry, CacheError> {
        let level = meta.compression;
        let read = |name: &Path| -> Result<Vec<u8>, CacheError> {
            decompress(std::fs::read(dir.join(name))?, level)
        };
        let stdout = read(Path::new("stdout"))?;
        let stderr = read(Path::new("stderr"))?;
        let mut contents = Vec::with_capacity(meta.targets.len());
        for (i, (_, digest)) in meta.targets.iter().enumerate() {
            let data = read(&Path::new("targets").join(i.to_string()))?;
            let ok = match digest {
                FileDigest::File(d) | FileDigest::Exe(d) | FileDigest::Link(d) => Digest::of(&data) == *d,
                FileDigest::Absent => data.is_empty(),
            };
            if !ok {
                return Err(CacheError::Corrupt {
                    path: dir.display().to_string(),
                    msg: format!("target {} does not match its digest", i),
                });
            }
            contents.push(data);
        }
        Ok(CacheEntry {
            meta,
            stdout,
            stderr,
            contents,
        })
    }

    /// Remove least recently used entries until under the size limit.
    fn evict(&self) -> Result<u64, CacheError> {
        let mut entries: Vec<(SystemTime, u64, PathBuf)> = walkdir::WalkDir::new(self.root.join(&self.repo))
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
            .map(|e| {
                let used = std::fs::metadata(e.path().join("meta.json"))
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (used, dir_size(e.path()), e.path().to_path_buf())
            })
            .collect();
        let mut total: u64 = entries.iter().map(|(_, size, _)| size).sum();
        entries.sort_by_key(|(used, _, _)| *used);
        for (_, size, path) in entries {
            if total <= self.max_size {
                break;
            }
            tracing::debug!(entry = %path.display(), size, "evicting");
            std::fs::remove_dir_all(&path)?;
            total -= size;
        }
        Ok(total)
    }
}

impl Cache for DirCache {
    fn fetch(
        &mut self,
        key: &Digest,
        current: &mut dyn FnMut(&str) -> Option<FileDigest>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.job_dir(key);
        let list = match std::fs::read_dir(&dir) {
            Ok(list) => list,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        for e in list {
            let e = e?;
            let Ok(bytes) = std::fs::read(e.path().join("meta.json")) else {
                continue;
            };
            let meta: EntryMeta = serde_json::from_slice(&bytes)?;
            let mut now = Vec::with_capacity(meta.deps.len());
            for (name, _) in &meta.deps {
                match current(name) {
                    Some(d) => now.push((name.clone(), d)),
                    None => break,
                }
            }
            if now.len() != meta.deps.len() {
                continue;
            }
            if deps_digest(key, &now).to_hex() != e.file_name().to_string_lossy() {
                continue;
            }
            let entry = self.load_entry(&e.path(), meta)?;
            // Mark as used, for eviction.
            if let Ok(f) = std::fs::OpenOptions::new().write(true).open(e.path().join("meta.json")) {
                let _ = f.set_modified(SystemTime::now());
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    fn store(&mut self, key: &Digest, entry: &CacheEntry) -> Result<(), CacheError> {
        let digest = deps_digest(key, &entry.meta.deps);
        let dest = self.job_dir(key).join(digest.to_hex());
        if dest.exists() {
            return Ok(());
        }
        let tmp_root = self.root.join("tmp");
        std::fs::create_dir_all(&tmp_root)?;
        let tmp = tmp_root.join(format!("{}-{}", digest.to_hex(), std::process::id()));
        let _ = std::fs::remove_dir_all(&tmp);
        std::fs::create_dir_all(tmp.join("targets"))?;
        let level = entry.meta.compression;
        std::fs::write(tmp.join("stdout"), compress(&entry.stdout, level)?)?;
        std::fs::write(tmp.join("stderr"), compress(&entry.stderr, level)?)?;
        for (i, data) in entry.contents.iter().enumerate() {
            std::fs::write(tmp.join("targets").join(i.to_string()), compress(data, level)?)?;
        }
        std::fs::write(tmp.join("meta.json"), serde_json::to_vec_pretty(&entry.meta)?)?;
        let size = dir_size(&tmp);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Err(err) = std::fs::rename(&tmp, &dest) {
            let _ = std::fs::remove_dir_all(&tmp);
            // Someone else stored the same entry first.
            if dest.exists() {
                return Ok(());
            }
            return Err(err.into());
        }
        let mut meta = self.read_meta();
        meta.max_size = self.max_size;
        meta.total_size += size;
        if meta.total_size > self.max_size {
            meta.total_size = self.evict()?;
        }
        self.write_meta(&meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job: &str, dep: FileDigest, level: i32) -> CacheEntry {
        let out = b"result".to_vec();
        CacheEntry {
            meta: EntryMeta {
                job: job.to_string(),
                deps: vec![("src".to_string(), dep)],
                targets: vec![(job.to_string(), FileDigest::File(Digest::of(&out)))],
                compression: level,
            },
            stdout: b"hello\n".to_vec(),
            stderr: Vec::new(),
            contents: vec![out],
        }
    }

    #[test]
    fn store_then_fetch() -> Result<(), CacheError> {
        let dir = tempfile::tempdir()?;
        let mut cache = DirCache::new(dir.path(), "repo", 1 << 20);
        let key = Digest::of(b"job");
        let src = FileDigest::File(Digest::of(b"v1"));
        let e = entry("out", src, 3);
        cache.store(&key, &e)?;
        // Idempotent.
        cache.store(&key, &e)?;

        let hit = cache.fetch(&key, &mut |_| Some(src))?;
        assert_eq!(hit, Some(e));
        let other = FileDigest::File(Digest::of(b"v2"));
        assert_eq!(cache.fetch(&key, &mut |_| Some(other))?, None);
        assert_eq!(cache.fetch(&key, &mut |_| None)?, None);
        assert_eq!(cache.fetch(&Digest::of(b"other job"), &mut |_| Some(src))?, None);
        Ok(())
    }

    #[test]
    fn eviction_keeps_under_limit() -> Result<(), CacheError> {
        let dir = tempfile::tempdir()?;
        let mut cache = DirCache::new(dir.path(), "repo", 100);
        for i in 0..5 {
            let key = Digest::of(format!("job{}", i).as_bytes());
            cache.store(&key, &entry("out", FileDigest::Absent, 0))?;
        }
        let meta = cache.read_meta();
        assert!(meta.total_size <= 100);
        assert_eq!(meta.policy, "lru");
        Ok(())
    }
}
