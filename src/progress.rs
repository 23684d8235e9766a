//! Build progress reporting, for the purpose of display to the user.
//!
//! Every event is one `<key> <name>` line; job output follows its line,
//! indented.  These lines are the user-facing record of a build, so they
//! are not logs.

use std::collections::BTreeMap;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportKey {
    // Nodes.
    New,
    Changed,
    Manual,
    Quarantine,
    Dangling,
    // Jobs.
    Done,
    Steady,
    Hit,
    Failed,
    WasFailed,
    DepErr,
    WasDepErr,
    BadDep,
    Rerun,
    Lost,
    Killed,
}

impl ReportKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKey::New => "new",
            ReportKey::Changed => "changed",
            ReportKey::Manual => "manual",
            ReportKey::Quarantine => "quarantine",
            ReportKey::Dangling => "dangling",
            ReportKey::Done => "done",
            ReportKey::Steady => "steady",
            ReportKey::Hit => "hit",
            ReportKey::Failed => "failed",
            ReportKey::WasFailed => "was_failed",
            ReportKey::DepErr => "dep_err",
            ReportKey::WasDepErr => "was_dep_err",
            ReportKey::BadDep => "bad_dep",
            ReportKey::Rerun => "rerun",
            ReportKey::Lost => "lost",
            ReportKey::Killed => "killed",
        }
    }

    /// Whether the key means the job did not produce its targets.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ReportKey::Failed
                | ReportKey::WasFailed
                | ReportKey::DepErr
                | ReportKey::WasDepErr
                | ReportKey::Killed
        )
    }
}

impl std::fmt::Display for ReportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Totals of a build, printed when it ends.
#[derive(Debug, Default, Clone)]
pub struct Summary {
    counts: BTreeMap<ReportKey, usize>,
    /// Failures of speculative jobs nobody turned out to need.
    pub unconfirmed: usize,
    pub ok: bool,
}

impl Summary {
    pub fn add(&mut self, key: ReportKey) {
        *self.counts.entry(key).or_default() += 1;
    }

    pub fn count(&self, key: ReportKey) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", if self.ok { "ok" } else { "failed" })?;
        for (key, n) in &self.counts {
            write!(f, " {}={}", key, n)?;
        }
        if self.unconfirmed > 0 {
            write!(f, " (ignored {} speculative failures)", self.unconfirmed)?;
        }
        Ok(())
    }
}

/// Trait for build progress notifications.
pub trait Progress {
    /// One event about a node or a job.
    fn report(&mut self, key: ReportKey, name: &str);

    /// Output of a job, shown under its report line.
    fn output(&mut self, name: &str, text: &[u8]);

    /// A free-form line, e.g. an error not tied to a job.
    fn message(&mut self, msg: &str);

    fn finish(&mut self, summary: &Summary);
}

/// Progress implementation for a plain console, one line per event.
#[derive(Default)]
pub struct ConsoleProgress {}

fn indent(text: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 16);
    for line in text.split_inclusive(|&b| b == b'\n') {
        out.extend_from_slice(b"  ");
        out.extend_from_slice(line);
    }
    if out.last().is_some_and(|&b| b != b'\n') {
        out.push(b'\n');
    }
    out
}

impl Progress for ConsoleProgress {
    fn report(&mut self, key: ReportKey, name: &str) {
        println!("{} {}", key, name);
    }

    fn output(&mut self, _name: &str, text: &[u8]) {
        if text.is_empty() {
            return;
        }
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&indent(text));
    }

    fn message(&mut self, msg: &str) {
        println!("{}", msg);
    }

    fn finish(&mut self, summary: &Summary) {
        println!("{}", summary);
    }
}
