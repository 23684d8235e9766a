//! Dynamic attribute expressions.
//!
//! A tiny sandboxed language: integer and string literals, variables,
//! `+ - * / %`, parentheses and the calls `len`, `int`, `str`, `min`, `max`.
//! Variables must appear in the rule's free-variable list; the evaluator
//! refuses anything else, so an attribute can only depend on what the rule
//! declares.

use serde::Serialize;
use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {pos}: {msg}")]
    Parse { pos: usize, msg: String },
    #[error("variable {0:?} is not a declared free variable")]
    Undeclared(String),
    #[error("variable {0:?} has no value")]
    Unbound(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivZero,
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl Value {
    pub fn as_int(&self) -> Result<i64, ExprError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Str(s) => Err(ExprError::Type(format!("expected integer, got {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Lit(Value),
    Var(String),
    Neg(Box<Node>),
    Bin(Op, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

/// A parsed expression with its source text kept for digests and messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    text: String,
    root: Node,
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err<T>(&self, msg: impl Into<String>) -> Result<T, ExprError> {
        Err(ExprError::Parse {
            pos: self.pos,
            msg: msg.into(),
        })
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<(), ExprError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            self.err(format!("expected {:?}", c as char))
        }
    }

    fn expr(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(b'+') => Op::Add,
                Some(b'-') => Op::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(b'*') => Op::Mul,
                Some(b'/') => Op::Div,
                Some(b'%') => Op::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Node::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.peek() == Some(b'-') {
            self.pos += 1;
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Node, ExprError> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let e = self.expr()?;
                self.expect(b')')?;
                Ok(e)
            }
            Some(b'"') | Some(b'\'') => self.string(),
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
                match text.parse::<i64>() {
                    Ok(i) => Ok(Node::Lit(Value::Int(i))),
                    Err(_) => self.err("integer overflow"),
                }
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let start = self.pos;
                while self.pos < self.src.len()
                    && (self.src[self.pos].is_ascii_alphanumeric() || self.src[self.pos] == b'_')
                {
                    self.pos += 1;
                }
                let name = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                if self.peek() != Some(b'(') {
                    return Ok(Node::Var(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() == Some(b')') {
                    self.pos += 1;
                } else {
                    loop {
                        args.push(self.expr()?);
                        match self.peek() {
                            Some(b',') => self.pos += 1,
                            Some(b')') => {
                                self.pos += 1;
                                break;
                            }
                            _ => return self.err("expected ',' or ')'"),
                        }
                    }
                }
                Ok(Node::Call(name, args))
            }
            Some(_) => self.err("unexpected character"),
            None => self.err("unexpected end of expression"),
        }
    }

    fn string(&mut self) -> Result<Node, ExprError> {
        let quote = self.src[self.pos];
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.src.get(self.pos) {
                None => return self.err("unterminated string"),
                Some(&c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    match self.src.get(self.pos + 1) {
                        Some(b'n') => out.push(b'\n'),
                        Some(b't') => out.push(b'\t'),
                        Some(&c) => out.push(c),
                        None => return self.err("unterminated string"),
                    }
                    self.pos += 2;
                }
                Some(&c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(Node::Lit(Value::Str(String::from_utf8_lossy(&out).into_owned())))
    }
}

fn collect_vars<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
    match node {
        Node::Lit(_) => {}
        Node::Var(v) => out.push(v),
        Node::Neg(n) => collect_vars(n, out),
        Node::Bin(_, a, b) => {
            collect_vars(a, out);
            collect_vars(b, out);
        }
        Node::Call(_, args) => args.iter().for_each(|a| collect_vars(a, out)),
    }
}

impl Expr {
    pub fn parse(text: &str) -> Result<Expr, ExprError> {
        let mut p = Parser {
            src: text.as_bytes(),
            pos: 0,
        };
        let root = p.expr()?;
        if p.peek().is_some() {
            return p.err("trailing input");
        }
        Ok(Expr {
            text: text.to_string(),
            root,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Variables referenced, in order, possibly repeated.
    pub fn vars(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_vars(&self.root, &mut out);
        out
    }

    /// Fail unless every referenced variable is declared.
    pub fn check_free_vars(&self, free_vars: &[String]) -> Result<(), ExprError> {
        for v in self.vars() {
            if !free_vars.iter().any(|f| f == v) {
                return Err(ExprError::Undeclared(v.to_string()));
            }
        }
        Ok(())
    }

    pub fn eval(
        &self,
        free_vars: &[String],
        lookup: &dyn Fn(&str) -> Option<Value>,
    ) -> Result<Value, ExprError> {
        eval(&self.root, free_vars, lookup)
    }
}

fn eval(
    node: &Node,
    free_vars: &[String],
    lookup: &dyn Fn(&str) -> Option<Value>,
) -> Result<Value, ExprError> {
    Ok(match node {
        Node::Lit(v) => v.clone(),
        Node::Var(name) => {
            if !free_vars.iter().any(|f| f == name) {
                return Err(ExprError::Undeclared(name.clone()));
            }
            lookup(name).ok_or_else(|| ExprError::Unbound(name.clone()))?
        }
        Node::Neg(n) => Value::Int(eval(n, free_vars, lookup)?.as_int()?.wrapping_neg()),
        Node::Bin(op, a, b) => {
            let a = eval(a, free_vars, lookup)?;
            let b = eval(b, free_vars, lookup)?;
            match (op, a, b) {
                (Op::Add, Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
                (op, Value::Int(a), Value::Int(b)) => Value::Int(match op {
                    Op::Add => a.wrapping_add(b),
                    Op::Sub => a.wrapping_sub(b),
                    Op::Mul => a.wrapping_mul(b),
                    Op::Div | Op::Rem if b == 0 => return Err(ExprError::DivZero),
                    Op::Div => a.wrapping_div(b),
                    Op::Rem => a.wrapping_rem(b),
                }),
                (op, a, b) => {
                    return Err(ExprError::Type(format!(
                        "cannot apply {:?} to {:?} and {:?}",
                        op, a, b
                    )))
                }
            }
        }
        Node::Call(name, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, free_vars, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)?
        }
    })
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    let arity = |n: usize| {
        if args.len() != n {
            Err(ExprError::Type(format!("{} takes {} argument(s)", name, n)))
        } else {
            Ok(())
        }
    };
    match name {
        "len" => {
            arity(1)?;
            match &args[0] {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::Int(_) => Err(ExprError::Type("len of integer".into())),
            }
        }
        "str" => {
            arity(1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "int" => {
            arity(1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Str(s) => s
                    .trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|_| ExprError::Type(format!("int({:?})", s))),
            }
        }
        "min" | "max" => {
            let ints = args
                .iter()
                .map(Value::as_int)
                .collect::<Result<Vec<_>, _>>()?;
            let v = if name == "min" {
                ints.into_iter().min()
            } else {
                ints.into_iter().max()
            };
            v.map(Value::Int)
                .ok_or_else(|| ExprError::Type(format!("{} of nothing", name)))
        }
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}
