//! Target and dep patterns: literal text interleaved with `{Stem}` references.
//!
//! `{Stem*}` marks a star stem, one the job does not bind: a target whose
//! pattern contains a star stem stands for any number of files.  `{{` and
//! `}}` are literal braces.

use super::RuleError;
use crate::smallmap::SmallMap;

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Lit(String),
    Stem { name: String, star: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    text: String,
    parts: Vec<Part>,
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Pattern, RuleError> {
        let bad = |msg: &str| RuleError::BadPattern {
            pattern: text.to_string(),
            msg: msg.to_string(),
        };
        let mut parts = Vec::new();
        let mut lit = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    lit.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    lit.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(bad("unterminated {")),
                        }
                    }
                    let (name, star) = match name.strip_suffix('*') {
                        Some(n) => (n.to_string(), true),
                        None => (name, false),
                    };
                    if !is_ident(&name) {
                        return Err(bad(&format!("bad stem name {:?}", name)));
                    }
                    if !lit.is_empty() {
                        parts.push(Part::Lit(std::mem::take(&mut lit)));
                    }
                    parts.push(Part::Stem { name, star });
                }
                '}' => return Err(bad("unmatched }")),
                c => lit.push(c),
            }
        }
        if !lit.is_empty() {
            parts.push(Part::Lit(lit));
        }
        Ok(Pattern {
            text: text.to_string(),
            parts,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Stem references in order of appearance, with their star marker.
    pub fn stems(&self) -> impl Iterator<Item = (&str, bool)> {
        self.parts.iter().filter_map(|p| match p {
            Part::Stem { name, star } => Some((name.as_str(), *star)),
            Part::Lit(_) => None,
        })
    }

    pub fn is_star(&self) -> bool {
        self.stems().any(|(_, star)| star)
    }

    /// True if the pattern has no stems at all.
    pub fn is_literal(&self) -> bool {
        self.stems().next().is_none()
    }

    /// Build an anchored regex.  Each stem occurrence gets its own group
    /// `_<n>`; the returned list maps group index to stem name so the caller
    /// can check that repeated stems matched the same text.
    pub fn to_regex(
        &self,
        stem_res: &SmallMap<String, String>,
    ) -> Result<(String, Vec<String>), RuleError> {
        let mut re = String::from("^");
        let mut groups = Vec::new();
        for part in &self.parts {
            match part {
                Part::Lit(s) => re.push_str(&regex::escape(s)),
                Part::Stem { name, .. } => {
                    let frag = stem_res.get(name).ok_or_else(|| RuleError::UnknownStem {
                        pattern: self.text.clone(),
                        stem: name.clone(),
                    })?;
                    re.push_str(&format!("(?P<_{}>{})", groups.len(), frag));
                    groups.push(name.clone());
                }
            }
        }
        re.push('$');
        Ok((re, groups))
    }

    /// Substitute stems.  `lookup` returns None for unbound names; star stems
    /// that are unbound are left as `{Name*}` so the result still names the
    /// whole family.
    pub fn expand<'a>(
        &self,
        lookup: impl Fn(&str) -> Option<&'a str>,
    ) -> Result<String, RuleError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Lit(s) => out.push_str(s),
                Part::Stem { name, star } => match lookup(name) {
                    Some(v) => out.push_str(v),
                    None if *star => {
                        out.push('{');
                        out.push_str(name);
                        out.push_str("*}");
                    }
                    None => {
                        return Err(RuleError::UnknownStem {
                            pattern: self.text.clone(),
                            stem: name.clone(),
                        })
                    }
                },
            }
        }
        Ok(out)
    }
}
