//! Codec files: tables mapping long values to short stable codes, so that
//! jobs can name things like option sets in file names.
//!
//! One entry per line, `ctx<TAB>code<TAB>value`, with tab, newline and
//! backslash escaped.  A code is the shortest prefix, at least
//! `MIN_CODE_LEN` long, of the value's hex digest that is unique in its
//! context.

use crate::hash::Digest;
use std::io::Write;
use std::path::Path;

pub const MIN_CODE_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    ctx: String,
    code: String,
    value: String,
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some(c) => out.push(c),
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
}

impl Table {
    pub fn parse(text: &str) -> Table {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\t');
                let ctx = parts.next()?;
                let code = parts.next()?;
                let value = parts.next()?;
                Some(Entry {
                    ctx: unescape(ctx),
                    code: code.to_string(),
                    value: unescape(value),
                })
            })
            .collect();
        Table { entries }
    }

    pub fn load(path: &Path) -> std::io::Result<Table> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Table::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Table::default()),
            Err(err) => Err(err),
        }
    }

    pub fn decode(&self, ctx: &str, code: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.ctx == ctx && e.code == code)
            .map(|e| e.value.as_str())
    }

    fn code_of(&self, ctx: &str, value: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.ctx == ctx && e.value == value)
            .map(|e| e.code.as_str())
    }

    /// Returns the code and whether a new entry was added.
    pub fn encode(&mut self, ctx: &str, value: &str, min_len: usize) -> (String, bool) {
        if let Some(code) = self.code_of(ctx, value) {
            return (code.to_string(), false);
        }
        let hex = Digest::of(value.as_bytes()).to_hex();
        let min_len = min_len.clamp(1, hex.len());
        let code = (min_len..=hex.len())
            .map(|n| &hex[..n])
            .find(|c| self.decode(ctx, c).is_none())
            .unwrap_or(hex.as_str())
            .to_string();
        self.entries.push(Entry {
            ctx: ctx.to_string(),
            code: code.clone(),
            value: value.to_string(),
        });
        (code, true)
    }

    fn line(e: &Entry) -> String {
        format!("{}\t{}\t{}\n", escape(&e.ctx), e.code, escape(&e.value))
    }
}

/// Look up or allocate the code for `value`, appending to the file.
pub fn encode(path: &Path, ctx: &str, value: &str, min_len: usize) -> std::io::Result<String> {
    let mut table = Table::load(path)?;
    let (code, added) = table.encode(ctx, value, min_len);
    if added {
        if let Some(e) = table.entries.last() {
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            f.write_all(Table::line(e).as_bytes())?;
        }
    }
    Ok(code)
}

pub fn decode(path: &Path, ctx: &str, code: &str) -> std::io::Result<Option<String>> {
    Ok(Table::load(path)?.decode(ctx, code).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping() {
        let s = "a\tb\\c\nd";
        assert_eq!(unescape(&escape(s)), s);
        assert!(!escape(s).contains('\t'));
    }

    #[test]
    fn codes_are_stable_and_short() {
        let mut t = Table::default();
        let (a, added) = t.encode("opts", "-O2 -g", MIN_CODE_LEN);
        assert!(added);
        assert_eq!(a.len(), 4);
        assert_eq!(t.encode("opts", "-O2 -g", MIN_CODE_LEN), (a.clone(), false));
        assert_eq!(t.decode("opts", &a), Some("-O2 -g"));
        assert_eq!(t.decode("other", &a), None);
    }

    #[test]
    fn collision_lengthens_code() {
        let hex = Digest::of(b"v").to_hex();
        let mut t = Table::parse(&format!("c\t{}\tsomething else\n", &hex[..4]));
        let (code, _) = t.encode("c", "v", 4);
        assert_eq!(code, &hex[..5]);
    }

    #[test]
    fn file_round_trip() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("codes");
        let code = encode(&path, "ctx", "line1\nline2", MIN_CODE_LEN)?;
        assert_eq!(encode(&path, "ctx", "line1\nline2", MIN_CODE_LEN)?, code);
        assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 1);
        assert_eq!(decode(&path, "ctx", &code)?.as_deref(), Some("line1\nline2"));
        Ok(())
    }
}
