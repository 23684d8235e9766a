//! Per-job bookkeeping of observed accesses.

use super::protocol::NewDep;
use super::AccessKind;
use crate::canon::{Location, RepoRoot};
use crate::graph::Accesses;
use crate::rules::{DepFlags, TargetFlags};
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};

/// Everything a job did, once it is over.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recorded {
    /// In order of first access.
    pub deps: Vec<NewDep>,
    /// Paths written and still present, in order of first write.
    pub writes: Vec<String>,
    /// Pre-existing paths the job removed.
    pub unlinks: Vec<String>,
    pub declared_targets: Vec<(String, TargetFlags)>,
}

pub struct Recorder {
    root: RepoRoot,
    cwd: PathBuf,
    deps: Vec<NewDep>,
    dep_index: FxHashMap<String, usize>,
    writes: Vec<String>,
    written: FxHashSet<String>,
    unlinks: Vec<String>,
    declared_targets: Vec<(String, TargetFlags)>,
}

impl Recorder {
    pub fn new(root: RepoRoot, cwd: PathBuf) -> Self {
        Recorder {
            root,
            cwd,
            deps: Vec::new(),
            dep_index: FxHashMap::default(),
            writes: Vec::new(),
            written: FxHashSet::default(),
            unlinks: Vec::new(),
            declared_targets: Vec::new(),
        }
    }

    /// The job's working directory, used when a report has none.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Node name of a path, or None if it is not tracked.
    pub fn locate(&self, cwd: Option<&Path>, path: &Path) -> Option<String> {
        match self.root.locate(cwd.unwrap_or(&self.cwd), path) {
            Location::Repo(name) => Some(name),
            Location::Admin | Location::External => None,
        }
    }

    /// Note an access.  Returns the dep to forward if this is the first
    /// time the job looks at that path.
    pub fn record(&mut self, cwd: Option<&Path>, path: &Path, kind: AccessKind) -> Option<NewDep> {
        let name = self.locate(cwd, path)?;
        match kind {
            AccessKind::Read | AccessKind::Stat => {
                // Reading back what it wrote itself is not a dependency.
                if self.written.contains(&name) {
                    return None;
                }
                let read = kind == AccessKind::Read;
                if let Some(&i) = self.dep_index.get(&name) {
                    let acc = &mut self.deps[i].accesses;
                    acc.read |= read;
                    acc.stat |= !read;
                    return None;
                }
                let dep = NewDep {
                    name: name.clone(),
                    flags: DepFlags::default(),
                    accesses: Accesses {
                        read,
                        stat: !read,
                    },
                };
                self.dep_index.insert(name, self.deps.len());
                self.deps.push(dep.clone());
                Some(dep)
            }
            AccessKind::Write => {
                if self.written.insert(name.clone()) {
                    self.writes.push(name.clone());
                    self.unlinks.retain(|u| *u != name);
                }
                None
            }
            AccessKind::Unlink => {
                if self.written.remove(&name) {
                    // A temporary of the job's own.
                    self.writes.retain(|w| *w != name);
                } else if !self.unlinks.contains(&name) {
                    self.unlinks.push(name);
                }
                None
            }
        }
    }

    /// An explicit dependency.  Always forwarded, since flags may have
    /// been added to an already known dep.
    pub fn declare_dep(&mut self, cwd: Option<&Path>, path: &Path, flags: DepFlags) -> Option<NewDep> {
        let name = self.locate(cwd, path)?;
        let dep = match self.dep_index.get(&name) {
            Some(&i) => {
                self.deps[i].flags.merge(flags);
                self.deps[i].accesses.read = true;
                self.deps[i].clone()
            }
            None => {
                let dep = NewDep {
                    name: name.clone(),
                    flags,
                    accesses: Accesses {
                        read: true,
                        stat: false,
                    },
                };
                self.dep_index.insert(name, self.deps.len());
                self.deps.push(dep.clone());
                dep
            }
        };
        Some(dep)
    }

    pub fn declare_target(&mut self, cwd: Option<&Path>, path: &Path, flags: TargetFlags) -> Option<String> {
        let name = self.locate(cwd, path)?;
        match self.declared_targets.iter_mut().find(|(n, _)| *n == name) {
            Some((_, f)) => *f = flags,
            None => self.declared_targets.push((name.clone(), flags)),
        }
        Some(name)
    }

    pub fn finish(&mut self) -> Recorded {
        self.dep_index.clear();
        self.written.clear();
        Recorded {
            deps: std::mem::take(&mut self.deps),
            writes: std::mem::take(&mut self.writes),
            unlinks: std::mem::take(&mut self.unlinks),
            declared_targets: std::mem::take(&mut self.declared_targets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Recorder {
        Recorder::new(RepoRoot::new("/repo", ".dynmake"), PathBuf::from("/repo/sub"))
    }

    #[test]
    fn first_access_is_forwarded() {
        let mut r = recorder();
        let d = r.record(None, Path::new("a.c"), AccessKind::Stat).unwrap();
        assert_eq!(d.name, "sub/a.c");
        assert!(d.accesses.stat && !d.accesses.read);
        assert!(r.record(None, Path::new("/repo/sub/a.c"), AccessKind::Read).is_none());
        assert!(r.record(None, Path::new("/usr/include/stdio.h"), AccessKind::Read).is_none());
        assert!(r.record(None, Path::new("/repo/.dynmake/db"), AccessKind::Read).is_none());
        let rec = r.finish();
        assert_eq!(rec.deps.len(), 1);
        assert!(rec.deps[0].accesses.read && rec.deps[0].accesses.stat);
    }

    #[test]
    fn own_writes_are_not_deps() {
        let mut r = recorder();
        r.record(None, Path::new("out.tmp"), AccessKind::Write);
        assert!(r.record(None, Path::new("out.tmp"), AccessKind::Read).is_none());
        r.record(None, Path::new("out"), AccessKind::Write);
        r.record(None, Path::new("out.tmp"), AccessKind::Unlink);
        r.record(None, Path::new("old"), AccessKind::Unlink);
        let rec = r.finish();
        assert!(rec.deps.is_empty());
        assert_eq!(rec.writes, vec!["sub/out"]);
        assert_eq!(rec.unlinks, vec!["sub/old"]);
    }

    #[test]
    fn declared_flags_merge() {
        let mut r = recorder();
        r.record(Some(Path::new("/repo")), Path::new("x"), AccessKind::Read);
        let flags = DepFlags {
            critical: true,
            ..DepFlags::default()
        };
        let d = r.declare_dep(Some(Path::new("/repo")), Path::new("x"), flags).unwrap();
        assert!(d.flags.critical);
        assert_eq!(r.finish().deps.len(), 1);
    }
}
