//! A single compiled rule.

use super::expr::{Expr, Value};
use super::pattern::Pattern;
use super::RuleError;
use crate::autodep::Method;
use crate::hash::{Digest, JobHasher, TerseHash};
use crate::smallmap::SmallMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scan `list` right to left; the rightmost mention of a flag wins and
/// `-flag` clears it.
fn resolve_flags(
    list: &[String],
    mut set: impl FnMut(&str, bool) -> bool,
) -> Result<(), RuleError> {
    let mut seen: Vec<&str> = Vec::new();
    for flag in list.iter().rev() {
        let (name, on) = match flag.strip_prefix('-') {
            Some(n) => (n, false),
            None => (flag.as_str(), true),
        };
        let name = name.trim();
        if seen.contains(&name) {
            continue;
        }
        seen.push(name);
        if !set(name, on) {
            return Err(RuleError::UnknownFlag(flag.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFlags {
    pub essential: bool,
    pub incremental: bool,
    pub phony: bool,
    pub source_ok: bool,
    pub manual_ok: bool,
    /// Whether requesting this path selects the rule.
    pub matching: bool,
    pub star: bool,
    pub optional: bool,
    /// The job's stdout is this target's content.
    pub stdout: bool,
}

impl Default for TargetFlags {
    fn default() -> Self {
        TargetFlags {
            essential: false,
            incremental: false,
            phony: false,
            source_ok: false,
            manual_ok: false,
            matching: true,
            star: false,
            optional: false,
            stdout: false,
        }
    }
}

impl TargetFlags {
    pub fn resolve(list: &[String]) -> Result<Self, RuleError> {
        let mut f = TargetFlags::default();
        resolve_flags(list, |name, on| {
            match name {
                "essential" => f.essential = on,
                "incremental" => f.incremental = on,
                "phony" => f.phony = on,
                "source_ok" => f.source_ok = on,
                "manual_ok" => f.manual_ok = on,
                "match" => f.matching = on,
                "star" => f.star = on,
                "optional" => f.optional = on,
                _ => return false,
            }
            true
        })?;
        Ok(f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepFlags {
    pub essential: bool,
    pub critical: bool,
    pub ignore_error: bool,
    pub required: bool,
    /// Declared by the rule rather than discovered.
    #[serde(rename = "static")]
    pub is_static: bool,
}

impl DepFlags {
    pub fn resolve(list: &[String]) -> Result<Self, RuleError> {
        let mut f = DepFlags::default();
        resolve_flags(list, |name, on| {
            match name {
                "essential" => f.essential = on,
                "critical" => f.critical = on,
                "ignore_error" => f.ignore_error = on,
                "required" => f.required = on,
                _ => return false,
            }
            true
        })?;
        Ok(f)
    }

    /// Whether an error on this dep fails the job.
    pub fn error_matters(&self) -> bool {
        !self.ignore_error
    }

    /// Whether the dep must exist.
    pub fn must_exist(&self) -> bool {
        self.required || self.is_static
    }

    pub fn merge(&mut self, other: DepFlags) {
        self.essential |= other.essential;
        self.critical |= other.critical;
        self.ignore_error |= other.ignore_error;
        self.required |= other.required;
        self.is_static |= other.is_static;
    }
}

#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub key: String,
    pub pattern: Pattern,
    pub flags: TargetFlags,
}

#[derive(Debug, Clone)]
pub struct DepSpec {
    pub key: String,
    pub pattern: Pattern,
    pub flags: DepFlags,
}

#[derive(Debug, Clone)]
pub enum Cmd {
    Shell(Pattern),
    Argv(Vec<Pattern>),
}

/// The command of a job once its stems, deps and targets are substituted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CmdLine {
    Shell(String),
    Argv(Vec<String>),
}

impl std::fmt::Display for CmdLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CmdLine::Shell(s) => f.write_str(s),
            CmdLine::Argv(v) => f.write_str(&v.join(" ")),
        }
    }
}

/// An attribute value, either known at load time or computed per job.
#[derive(Debug, Clone, PartialEq)]
pub enum Attr {
    Static(Value),
    Dynamic(Expr),
}

#[derive(Debug, Clone)]
pub struct Attrs {
    pub resources: Vec<(String, Attr)>,
    pub env: Vec<(String, Attr)>,
    pub timeout: Option<Attr>,
    pub backend: String,
    pub cache: Option<String>,
    pub compression: i32,
    pub autodep: Method,
    pub kill_sigs: Option<Vec<i32>>,
    pub max_submits: Option<u32>,
    pub max_retries_on_lost: Option<u32>,
    pub keep_tmp: bool,
}

impl Default for Attrs {
    fn default() -> Self {
        Attrs {
            resources: vec![("cpu".to_string(), Attr::Static(Value::Int(1)))],
            env: Vec::new(),
            timeout: None,
            backend: "local".to_string(),
            cache: None,
            compression: 0,
            autodep: Method::default(),
            kill_sigs: None,
            max_submits: None,
            max_retries_on_lost: None,
            keep_tmp: false,
        }
    }
}

/// Attributes of one job, all expressions evaluated.  Part of the job's
/// digest, so every field must be deterministic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    pub resources: BTreeMap<String, u64>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<f64>,
    pub backend: String,
    pub cache: Option<String>,
    pub compression: i32,
    pub autodep: Method,
    pub kill_sigs: Option<Vec<i32>>,
    pub max_submits: Option<u32>,
    pub max_retries_on_lost: Option<u32>,
    pub keep_tmp: bool,
}

/// A compiled target pattern.
#[derive(Debug, Clone)]
pub struct Matcher {
    pub target: usize,
    regex: Regex,
    groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub prio: f64,
    pub stems: SmallMap<String, String>,
    pub targets: Vec<TargetSpec>,
    pub deps: Vec<DepSpec>,
    pub cmd: Cmd,
    pub attrs: Attrs,
    pub free_vars: Vec<String>,
    /// Digest of the rule's definition.
    pub identity: Digest,
    /// One per target, in target order.
    matchers: Vec<Matcher>,
}

/// A dep of a job instance, its pattern expanded.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticDep {
    pub key: String,
    pub path: String,
    pub flags: DepFlags,
}

impl Rule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        prio: f64,
        stems: SmallMap<String, String>,
        targets: Vec<TargetSpec>,
        deps: Vec<DepSpec>,
        cmd: Cmd,
        attrs: Attrs,
        free_vars: Option<Vec<String>>,
        identity: Digest,
    ) -> Result<Rule, RuleError> {
        let invalid = |msg: String| RuleError::Invalid {
            rule: name.clone(),
            msg,
        };
        let mut matchers = Vec::new();
        let mut job_stems: Option<Vec<&str>> = None;
        for (i, t) in targets.iter().enumerate() {
            let (re, groups) = t.pattern.to_regex(&stems)?;
            let regex = Regex::new(&re).map_err(|err| RuleError::Regex {
                rule: name.clone(),
                err,
            })?;
            matchers.push(Matcher {
                target: i,
                regex,
                groups,
            });
            // All targets must bind the same job stems, or a job would not
            // know the names of its siblings.
            let mut plain: Vec<&str> = t
                .pattern
                .stems()
                .filter(|(_, star)| !star)
                .map(|(n, _)| n)
                .collect();
            plain.sort_unstable();
            plain.dedup();
            match &job_stems {
                None => job_stems = Some(plain),
                Some(prev) if *prev != plain => {
                    return Err(invalid(format!(
                        "target {} does not use the same stems as the others",
                        t.key
                    )))
                }
                Some(_) => {}
            }
        }
        for d in &deps {
            if d.pattern.is_star() {
                return Err(invalid(format!("dep {} uses a star stem", d.key)));
            }
            for (stem, _) in d.pattern.stems() {
                if !job_stems.as_ref().map_or(false, |s| s.contains(&stem)) {
                    return Err(RuleError::UnknownStem {
                        pattern: d.pattern.text().to_string(),
                        stem: stem.to_string(),
                    });
                }
            }
        }
        // Without an explicit list, an expression may use anything in scope.
        let free_vars = free_vars.unwrap_or_else(|| {
            let mut v: Vec<String> = stems.keys().cloned().collect();
            v.extend(deps.iter().map(|d| d.key.clone()));
            v.extend(targets.iter().map(|t| t.key.clone()));
            v.extend(attrs.resources.iter().map(|(k, _)| k.clone()));
            v
        });
        let dynamic = attrs
            .resources
            .iter()
            .chain(attrs.env.iter())
            .map(|(k, a)| (k.as_str(), a))
            .chain(attrs.timeout.iter().map(|a| ("timeout", a)));
        for (attr, a) in dynamic {
            if let Attr::Dynamic(e) = a {
                e.check_free_vars(&free_vars).map_err(|err| RuleError::Attr {
                    rule: name.clone(),
                    attr: attr.to_string(),
                    err,
                })?;
            }
        }
        Ok(Rule {
            name,
            prio,
            stems,
            targets,
            deps,
            cmd,
            attrs,
            free_vars,
            identity,
            matchers,
        })
    }

    /// A rule with no matchable target is a base for others and never
    /// matches by itself.
    pub fn is_matchable(&self) -> bool {
        self.targets.iter().any(|t| t.flags.matching)
    }

    pub(super) fn matchers(&self) -> impl Iterator<Item = &Matcher> {
        self.matchers
            .iter()
            .filter(|m| self.targets[m.target].flags.matching)
    }

    pub(super) fn matcher_regex(m: &Matcher) -> &str {
        m.regex.as_str()
    }

    /// Match `path` against one target; returns all bindings, star stems
    /// included.
    pub(super) fn match_with(
        &self,
        m: &Matcher,
        path: &str,
    ) -> Option<SmallMap<String, String>> {
        let caps = m.regex.captures(path)?;
        let mut bindings: SmallMap<String, String> = SmallMap::new();
        for (i, stem) in m.groups.iter().enumerate() {
            let v = caps.name(&format!("_{}", i))?.as_str();
            match bindings.get(stem) {
                Some(prev) if prev != v => return None,
                Some(_) => {}
                None => bindings.insert(stem.clone(), v.to_string()),
            }
        }
        Some(bindings)
    }

    /// Restrict bindings to those that identify the job.
    pub fn job_stems(&self, target: usize, bindings: &SmallMap<String, String>) -> SmallMap<String, String> {
        let stars: Vec<&str> = self.targets[target]
            .pattern
            .stems()
            .filter(|(_, star)| *star)
            .map(|(n, _)| n)
            .collect();
        bindings
            .iter()
            .filter(|(k, _)| !stars.contains(&k.as_str()))
            .cloned()
            .collect()
    }

    fn lookup<'a>(stems: &'a SmallMap<String, String>) -> impl Fn(&str) -> Option<&'a str> {
        move |n| stems.get(n).map(String::as_str)
    }

    /// The job name is the first target with the job's stems substituted.
    pub fn job_name(&self, stems: &SmallMap<String, String>) -> Result<String, RuleError> {
        match self.targets.first() {
            Some(t) => t.pattern.expand(Self::lookup(stems)),
            None => Ok(self.name.clone()),
        }
    }

    /// Targets that are known without running the job.
    pub fn static_targets(
        &self,
        stems: &SmallMap<String, String>,
    ) -> Result<Vec<(String, TargetFlags)>, RuleError> {
        let mut out = Vec::new();
        for t in &self.targets {
            if t.pattern.is_star() {
                continue;
            }
            out.push((t.pattern.expand(Self::lookup(stems))?, t.flags));
        }
        Ok(out)
    }

    /// Flags for a path the job wrote, or None if no target of the job
    /// covers it.
    pub fn target_flags(&self, stems: &SmallMap<String, String>, path: &str) -> Option<TargetFlags> {
        for m in &self.matchers {
            let Some(bindings) = self.match_with(m, path) else {
                continue;
            };
            let agrees = stems
                .iter()
                .all(|(k, v)| bindings.get(k).map_or(true, |b| b == v));
            if agrees {
                let mut flags = self.targets[m.target].flags;
                flags.star |= self.targets[m.target].pattern.is_star();
                return Some(flags);
            }
        }
        None
    }

    pub fn expand_deps(
        &self,
        job: &str,
        stems: &SmallMap<String, String>,
    ) -> Result<Vec<StaticDep>, RuleError> {
        let mut out = Vec::with_capacity(self.deps.len());
        for d in &self.deps {
            let path = d.pattern.expand(Self::lookup(stems))?;
            if !crate::canon::is_local(&path) {
                return Err(RuleError::BadDep {
                    job: job.to_string(),
                    key: d.key.clone(),
                    path,
                });
            }
            let mut flags = d.flags;
            flags.is_static = true;
            flags.required = true;
            out.push(StaticDep {
                key: d.key.clone(),
                path: crate::canon::canon_path(&path),
                flags,
            });
        }
        Ok(out)
    }

    /// Names usable in commands and expressions: stems, then dep keys, then
    /// target keys.
    fn scope<'a>(
        &'a self,
        stems: &'a SmallMap<String, String>,
        deps: &'a [StaticDep],
    ) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            if let Some(v) = stems.get(name) {
                return Some(v.clone());
            }
            if let Some(d) = deps.iter().find(|d| d.key == name) {
                return Some(d.path.clone());
            }
            let t = self.targets.iter().find(|t| t.key == name)?;
            t.pattern.expand(Self::lookup(stems)).ok()
        }
    }

    pub fn render_cmd(
        &self,
        stems: &SmallMap<String, String>,
        deps: &[StaticDep],
    ) -> Result<CmdLine, RuleError> {
        let scope = self.scope(stems, deps);
        let values: Vec<(String, String)> = match &self.cmd {
            Cmd::Shell(p) => collect_names(std::slice::from_ref(p), &scope),
            Cmd::Argv(ps) => collect_names(ps, &scope),
        };
        let lookup = |n: &str| {
            values
                .iter()
                .find(|(k, _)| k == n)
                .map(|(_, v)| v.as_str())
        };
        Ok(match &self.cmd {
            Cmd::Shell(p) => CmdLine::Shell(p.expand(lookup)?),
            Cmd::Argv(ps) => CmdLine::Argv(
                ps.iter()
                    .map(|p| p.expand(lookup))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }

    /// Evaluate every attribute for a job.
    pub fn resolve(
        &self,
        stems: &SmallMap<String, String>,
        deps: &[StaticDep],
    ) -> Result<Resolved, RuleError> {
        let scope = self.scope(stems, deps);
        let mut resources: BTreeMap<String, u64> = BTreeMap::new();
        let attr_err = |attr: &str, err| RuleError::Attr {
            rule: self.name.clone(),
            attr: attr.to_string(),
            err,
        };
        // Static resources first so dynamic ones may refer to them.
        for (k, a) in &self.attrs.resources {
            if let Attr::Static(v) = a {
                let n = v.as_int().map_err(|e| attr_err(k, e))?;
                resources.insert(k.clone(), n.max(0) as u64);
            }
        }
        for (k, a) in &self.attrs.resources {
            if let Attr::Dynamic(e) = a {
                let lookup = |n: &str| match resources.get(n) {
                    Some(v) => Some(Value::Int(*v as i64)),
                    None => scope(n).map(Value::Str),
                };
                let v = e.eval(&self.free_vars, &lookup).map_err(|e| attr_err(k, e))?;
                let n = v.as_int().map_err(|e| attr_err(k, e))?;
                resources.insert(k.clone(), n.max(0) as u64);
            }
        }
        let lookup = |n: &str| match resources.get(n) {
            Some(v) => Some(Value::Int(*v as i64)),
            None => scope(n).map(Value::Str),
        };
        let eval = |k: &str, a: &Attr| -> Result<Value, RuleError> {
            match a {
                Attr::Static(v) => Ok(v.clone()),
                Attr::Dynamic(e) => e.eval(&self.free_vars, &lookup).map_err(|e| attr_err(k, e)),
            }
        };
        let mut env = BTreeMap::new();
        for (k, a) in &self.attrs.env {
            env.insert(k.clone(), eval(k, a)?.to_string());
        }
        let timeout = match &self.attrs.timeout {
            Some(a) => {
                let secs = eval("timeout", a)?
                    .as_int()
                    .map_err(|e| attr_err("timeout", e))?;
                (secs > 0).then_some(secs as f64)
            }
            None => None,
        };
        Ok(Resolved {
            resources,
            env,
            timeout,
            backend: self.attrs.backend.clone(),
            cache: self.attrs.cache.clone(),
            compression: self.attrs.compression,
            autodep: self.attrs.autodep,
            kill_sigs: self.attrs.kill_sigs.clone(),
            max_submits: self.attrs.max_submits,
            max_retries_on_lost: self.attrs.max_retries_on_lost,
            keep_tmp: self.attrs.keep_tmp,
        })
    }

    pub fn hash_inputs<H: JobHasher>(
        &self,
        hasher: &mut H,
        job: &str,
        cmd: &CmdLine,
        resolved: &Resolved,
    ) {
        hasher.write_field("rule", &self.name);
        hasher.write_field("identity", &self.identity.to_hex());
        hasher.write_field("job", job);
        hasher.write_field("cmd", &cmd.to_string());
        // serde_json of a BTreeMap-only struct is deterministic.
        let attrs = serde_json::to_string(resolved).unwrap_or_default();
        hasher.write_field("attrs", &attrs);
    }

    /// Digest of everything about a job that is known before it runs.
    pub fn job_digest(&self, job: &str, cmd: &CmdLine, resolved: &Resolved) -> Digest {
        let mut h = TerseHash::default();
        self.hash_inputs(&mut h, job, cmd, resolved);
        h.finish()
    }
}

fn collect_names(
    patterns: &[Pattern],
    scope: &impl Fn(&str) -> Option<String>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for p in patterns {
        for (name, _) in p.stems() {
            if out.iter().any(|(k, _)| k == name) {
                continue;
            }
            if let Some(v) = scope(name) {
                out.push((name.to_string(), v));
            }
        }
    }
    out
}
