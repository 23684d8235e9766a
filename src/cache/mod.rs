//! Reusing job results across builds and repos.
//!
//! A result is stored under the job's rule digest (rule identity and
//! resolved attributes), then under the digest of the deps it read.  Since
//! deps are only known after a run, a lookup tries each stored dep list
//! against the current contents.

pub mod dir;

use crate::hash::{Digest, FileDigest};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    None,
    /// Fetch only.
    Download,
    /// Store only.
    Upload,
    #[default]
    Plain,
}

impl CacheMode {
    pub fn download(self) -> bool {
        matches!(self, CacheMode::Download | CacheMode::Plain)
    }

    pub fn upload(self) -> bool {
        matches!(self, CacheMode::Upload | CacheMode::Plain)
    }
}

impl std::str::FromStr for CacheMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => CacheMode::None,
            "download" => CacheMode::Download,
            "upload" => CacheMode::Upload,
            "plain" => CacheMode::Plain,
            _ => return Err(format!("unknown cache mode {:?}", s)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt cache entry {path}: {msg}")]
    Corrupt { path: String, msg: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub job: String,
    /// Deps read by the run, in order.
    pub deps: Vec<(String, FileDigest)>,
    /// Targets in the order of the content files.
    pub targets: Vec<(String, FileDigest)>,
    pub compression: i32,
}

/// A stored result: everything needed to pretend the job just ran.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Contents of `meta.targets`, same order; empty for absent ones.
    pub contents: Vec<Vec<u8>>,
}

pub trait Cache: Send {
    /// Find an entry of `key` whose deps all have the contents given by
    /// `current`.  Deps `current` cannot tell disqualify an entry.
    fn fetch(
        &mut self,
        key: &Digest,
        current: &mut dyn FnMut(&str) -> Option<FileDigest>,
    ) -> Result<Option<CacheEntry>, CacheError>;

    /// Store an entry.  Storing one that is already there is a no-op.
    fn store(&mut self, key: &Digest, entry: &CacheEntry) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes() {
        let m: CacheMode = "download".parse().unwrap();
        assert!(m.download() && !m.upload());
        assert!(!CacheMode::None.download());
        assert!("bogus".parse::<CacheMode>().is_err());
    }
}
