//! Path canonicalization.
//!
//! Nodes are keyed by lexically canonical, repo-relative names.  Paths seen
//! by the autodep tracker are absolute (or relative to a job's cwd) and must
//! be mapped back to that form; anything outside the repository, or inside
//! the admin directory, is not a node.

use std::path::{Component, Path, PathBuf};

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, but only simplifies things like
/// "foo/./bar" => "foo/bar" and "foo/../bar" => "bar".
pub fn canon_path<T: AsRef<str>>(inpath: T) -> String {
    let path = inpath.as_ref();
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    // Number of leading ".." that could not be resolved (relative paths only).
    let mut ups = 0usize;
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    ups += 1;
                }
            }
            c => parts.push(c),
        }
    }
    let mut out = String::with_capacity(path.len());
    if absolute {
        out.push('/');
    }
    for _ in 0..ups {
        out.push_str("../");
    }
    out.push_str(&parts.join("/"));
    if out.ends_with('/') && out.len() > 1 {
        out.pop();
    }
    out
}

/// Where a path lands once resolved against the repository.
#[derive(Debug, PartialEq, Eq)]
pub enum Location {
    /// Inside the repo, with its canonical repo-relative name.
    Repo(String),
    /// Inside the admin directory, never tracked.
    Admin,
    /// Outside the repo (system headers, tools, ...), never tracked.
    External,
}

/// The repository root, used to map paths to node names.
#[derive(Debug, Clone)]
pub struct RepoRoot {
    root: PathBuf,
    admin: String,
}

impl RepoRoot {
    pub fn new(root: impl Into<PathBuf>, admin_dir: &str) -> Self {
        RepoRoot {
            root: root.into(),
            admin: canon_path(admin_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn admin_dir(&self) -> PathBuf {
        self.root.join(&self.admin)
    }

    /// Absolute path of a node name.
    pub fn abs(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Resolve `path`, which is relative to `cwd` unless absolute.
    pub fn locate(&self, cwd: &Path, path: &Path) -> Location {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        let Some(joined) = joined.to_str() else {
            return Location::External;
        };
        let abs = canon_path(joined);
        let Some(root) = self.root.to_str() else {
            return Location::External;
        };
        let root = canon_path(root);
        let rel = if abs == root {
            ""
        } else if let Some(rest) = abs.strip_prefix(&root) {
            match rest.strip_prefix('/') {
                Some(rel) => rel,
                None if root == "/" => rest,
                None => return Location::External,
            }
        } else {
            return Location::External;
        };
        if rel.is_empty() {
            // The repo dir itself is not a file node.
            return Location::External;
        }
        if rel == self.admin || rel.starts_with(&format!("{}/", self.admin)) {
            return Location::Admin;
        }
        Location::Repo(rel.to_string())
    }

    /// Shorthand for paths that come from the job side, relative to the root.
    pub fn node_name(&self, path: &str) -> Option<String> {
        match self.locate(&self.root, Path::new(path)) {
            Location::Repo(name) => Some(name),
            _ => None,
        }
    }
}

/// True if `name` stays inside the repo once canonicalized.
pub fn is_local(name: &str) -> bool {
    let c = canon_path(name);
    !c.is_empty() && !c.starts_with('/') && !c.starts_with("..") && Path::new(&c)
        .components()
        .all(|comp| matches!(comp, Component::Normal(_)))
}
