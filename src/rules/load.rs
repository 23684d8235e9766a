//! Loading the rule table from its JSON description.
//!
//! ```json
//! {
//!   "sources": ["hello", "world"],
//!   "rules": [{
//!     "name": "cat", "prio": 0,
//!     "stems": {"A": "[^+]*", "B": "[^+]*"},
//!     "targets": {"out": "{A}+{B}"},
//!     "deps": {"a": "{A}", "b": ["{B}", "critical"]},
//!     "cmd": "cat {a} {b} > {out}",
//!     "attrs": {"resources": {"cpu": 1, "mem": {"expr": "len(A) * 10"}}}
//!   }]
//! }
//! ```

use super::expr::{Expr, Value};
use super::pattern::Pattern;
use super::rule::{Attr, Attrs, Cmd, DepFlags, DepSpec, Rule, TargetFlags, TargetSpec};
use super::{RuleError, RuleTable};
use crate::autodep::Method;
use crate::hash::Digest;
use crate::smallmap::SmallMap;
use anyhow::Context;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

/// A JSON object whose key order is kept: target order decides the job name.
#[derive(Debug, Clone)]
struct OrderedMap<V>(Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<T>(std::marker::PhantomData<T>);
        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedVisitor<T> {
            type Value = OrderedMap<T>;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a JSON object")
            }
            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some((k, v)) = map.next_entry::<String, T>()? {
                    if out.iter().any(|(ok, _): &(String, T)| *ok == k) {
                        return Err(serde::de::Error::custom(format!("duplicate key {:?}", k)));
                    }
                    out.push((k, v));
                }
                Ok(OrderedMap(out))
            }
        }
        d.deserialize_map(OrderedVisitor(std::marker::PhantomData))
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_map(self.0.iter().map(|(k, v)| (k, v)))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum PatternDesc {
    Plain(String),
    /// Pattern followed by flags.
    WithFlags(Vec<String>),
}

impl PatternDesc {
    fn split(&self) -> Result<(&str, &[String]), RuleError> {
        match self {
            PatternDesc::Plain(p) => Ok((p.as_str(), &[][..])),
            PatternDesc::WithFlags(v) => match v.split_first() {
                Some((p, flags)) => Ok((p.as_str(), flags)),
                None => Err(RuleError::BadPattern {
                    pattern: String::new(),
                    msg: "empty pattern list".into(),
                }),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum CmdDesc {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum AttrDesc {
    Expr { expr: String },
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
struct AttrsDesc {
    resources: Option<OrderedMap<AttrDesc>>,
    env: OrderedMap<AttrDesc>,
    timeout: Option<AttrDesc>,
    backend: Option<String>,
    cache: Option<String>,
    compression: i32,
    autodep: Option<Method>,
    kill_sigs: Option<Vec<i32>>,
    max_submits: Option<u32>,
    max_retries_on_lost: Option<u32>,
    keep_tmp: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RuleDesc {
    name: String,
    #[serde(default)]
    prio: f64,
    #[serde(default)]
    stems: OrderedMap<String>,
    #[serde(default)]
    targets: OrderedMap<PatternDesc>,
    /// Shorthand for a target holding the job's stdout.
    #[serde(default)]
    target: Option<PatternDesc>,
    #[serde(default)]
    deps: OrderedMap<PatternDesc>,
    cmd: CmdDesc,
    #[serde(default)]
    attrs: AttrsDesc,
    #[serde(default)]
    free_vars: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFile {
    #[serde(default)]
    sources: Option<Vec<String>>,
    rules: Vec<RuleDesc>,
}

fn attr(rule: &str, key: &str, desc: &AttrDesc) -> Result<Attr, RuleError> {
    Ok(match desc {
        AttrDesc::Int(i) => Attr::Static(Value::Int(*i)),
        AttrDesc::Str(s) => Attr::Static(Value::Str(s.clone())),
        AttrDesc::Expr { expr } => Attr::Dynamic(Expr::parse(expr).map_err(|err| RuleError::Attr {
            rule: rule.to_string(),
            attr: key.to_string(),
            err,
        })?),
    })
}

fn compile(desc: RuleDesc) -> Result<Rule, RuleError> {
    // Identity covers the whole definition, so editing a rule reruns its jobs.
    let identity = Digest::of(&serde_json::to_vec(&desc).unwrap_or_default());
    let name = desc.name.clone();
    let invalid = |msg: String| RuleError::Invalid {
        rule: name.clone(),
        msg,
    };

    let stems: SmallMap<String, String> = desc.stems.0.into_iter().collect();

    let mut targets = Vec::new();
    for (key, p) in &desc.targets.0 {
        let (pattern, flags) = p.split()?;
        let pattern = Pattern::parse(pattern)?;
        let mut flags = TargetFlags::resolve(flags)?;
        flags.star |= pattern.is_star();
        targets.push(TargetSpec {
            key: key.clone(),
            pattern,
            flags,
        });
    }
    if let Some(p) = &desc.target {
        if targets.iter().any(|t| t.key == "target") {
            return Err(invalid("both `target` and a target keyed \"target\"".into()));
        }
        let (pattern, flags) = p.split()?;
        let pattern = Pattern::parse(pattern)?;
        if pattern.is_star() {
            return Err(invalid("the stdout target cannot be a star target".into()));
        }
        let mut flags = TargetFlags::resolve(flags)?;
        flags.stdout = true;
        targets.insert(
            0,
            TargetSpec {
                key: "target".into(),
                pattern,
                flags,
            },
        );
    }
    let mut deps = Vec::new();
    for (key, p) in &desc.deps.0 {
        let (pattern, flags) = p.split()?;
        deps.push(DepSpec {
            key: key.clone(),
            pattern: Pattern::parse(pattern)?,
            flags: DepFlags::resolve(flags)?,
        });
    }
    let mut keys: Vec<&str> = targets.iter().map(|t| t.key.as_str()).collect();
    keys.extend(deps.iter().map(|d| d.key.as_str()));
    keys.sort_unstable();
    if keys.windows(2).any(|w| w[0] == w[1]) {
        return Err(invalid("a key is used for both a target and a dep".into()));
    }

    let cmd = match &desc.cmd {
        CmdDesc::Shell(s) => Cmd::Shell(Pattern::parse(s)?),
        CmdDesc::Argv(v) if v.is_empty() => return Err(invalid("empty argv".into())),
        CmdDesc::Argv(v) => Cmd::Argv(v.iter().map(|s| Pattern::parse(s)).collect::<Result<_, _>>()?),
    };

    let a = &desc.attrs;
    let mut attrs = Attrs::default();
    if let Some(res) = &a.resources {
        attrs.resources = res
            .0
            .iter()
            .map(|(k, d)| -> Result<_, RuleError> { Ok((k.clone(), attr(&name, k, d)?)) })
            .collect::<Result<_, RuleError>>()?;
    }
    attrs.env = a
        .env
        .0
        .iter()
        .map(|(k, d)| -> Result<_, RuleError> { Ok((k.clone(), attr(&name, k, d)?)) })
        .collect::<Result<_, RuleError>>()?;
    attrs.timeout = a.timeout.as_ref().map(|d| attr(&name, "timeout", d)).transpose()?;
    if let Some(b) = &a.backend {
        attrs.backend = b.clone();
    }
    attrs.cache = a.cache.clone();
    if !(0..=22).contains(&a.compression) {
        return Err(invalid(format!("compression {} out of range", a.compression)));
    }
    attrs.compression = a.compression;
    if let Some(m) = a.autodep {
        attrs.autodep = m;
    }
    attrs.kill_sigs = a.kill_sigs.clone();
    attrs.max_submits = a.max_submits;
    attrs.max_retries_on_lost = a.max_retries_on_lost;
    attrs.keep_tmp = a.keep_tmp;

    Rule::new(
        desc.name,
        desc.prio,
        stems,
        targets,
        deps,
        cmd,
        attrs,
        desc.free_vars,
        identity,
    )
}

/// Build a table from JSON text.
pub fn parse(text: &str) -> anyhow::Result<RuleTable> {
    let file: RulesFile = serde_json::from_str(text)?;
    let mut rules = Vec::with_capacity(file.rules.len());
    for desc in file.rules {
        let name = desc.name.clone();
        if rules.iter().any(|r: &Rule| r.name == name) {
            anyhow::bail!("duplicate rule {:?}", name);
        }
        rules.push(compile(desc).with_context(|| format!("rule {}", name))?);
    }
    Ok(RuleTable::new(rules, file.sources)?)
}

/// Read the rule table of a repository.
pub fn read(path: &Path) -> anyhow::Result<RuleTable> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse(&text).with_context(|| format!("load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_target_order() {
        let t = parse(
            r#"{"rules": [{"name": "r", "stems": {"X": ".*"},
                "targets": {"z": "{X}.z", "a": "{X}.a"}, "cmd": "x"}]}"#,
        )
        .unwrap();
        let m = t.matches("f.a").unwrap();
        assert_eq!(m[0].job_name, "f.z");
    }

    #[test]
    fn stdout_target() {
        let t = parse(
            r#"{"rules": [{"name": "r", "stems": {"X": ".*"},
                "target": "{X}.out", "cmd": "echo {X}"}]}"#,
        )
        .unwrap();
        let m = &t.matches("f.out").unwrap()[0];
        let rule = t.rule(m.rule);
        assert!(rule.targets[0].flags.stdout);
        assert_eq!(rule.targets[0].key, "target");
    }

    #[test]
    fn attrs() {
        let t = parse(
            r#"{"rules": [{"name": "r", "stems": {"X": ".*"}, "targets": {"o": "{X}.o"},
                "cmd": ["cc", "{X}.c"],
                "attrs": {"resources": {"cpu": 2, "mem": {"expr": "len(X) * 10"}},
                          "env": {"LANG": "C"}, "timeout": 5, "autodep": "ld_preload",
                          "compression": 3, "cache": "shared"}}]}"#,
        )
        .unwrap();
        let m = &t.matches("abc.o").unwrap()[0];
        let inst = t.instantiate(m).unwrap();
        assert_eq!(inst.resolved.resources["cpu"], 2);
        assert_eq!(inst.resolved.resources["mem"], 30);
        assert_eq!(inst.resolved.env["LANG"], "C");
        assert_eq!(inst.resolved.timeout, Some(5.0));
        assert_eq!(inst.resolved.autodep, Method::LdPreload);
        assert_eq!(inst.resolved.cache.as_deref(), Some("shared"));
    }

    #[test]
    fn undeclared_free_var() {
        let err = parse(
            r#"{"rules": [{"name": "r", "stems": {"X": ".*"}, "targets": {"o": "{X}.o"},
                "cmd": "x", "free_vars": ["X"],
                "attrs": {"resources": {"cpu": {"expr": "len(Y)"}}}}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn rejects_unknown_stem_in_dep() {
        let err = parse(
            r#"{"rules": [{"name": "r", "stems": {"X": ".*"}, "targets": {"o": "{X}.o"},
                "deps": {"c": "{Y}.c"}, "cmd": "x"}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn identity_tracks_definition() {
        let a = parse(r#"{"rules": [{"name": "r", "targets": {"o": "o"}, "cmd": "x"}]}"#).unwrap();
        let b = parse(r#"{"rules": [{"name": "r", "targets": {"o": "o"}, "cmd": "y"}]}"#).unwrap();
        let c = parse(r#"{"rules": [{"name": "r", "targets": {"o": "o"}, "cmd": "x"}]}"#).unwrap();
        let id = |t: &RuleTable| t.rule(t.by_name("r").unwrap()).identity;
        assert_ne!(id(&a), id(&b));
        assert_eq!(id(&a), id(&c));
    }
}
