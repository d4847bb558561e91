//! Action language for tool bodies
//!
//! A tiny expression language with `let`, `return`, `if`/`else`, string
//! concatenation, equality, argument field paths and `namespace.function(..)`
//! calls. There are no loops and no way to name host-language items, so a
//! body that passes [`Program::check`] can only reach the capabilities it
//! was granted.
//!
//! ```text
//! # paste the note into the focused window
//! let note = "Note: " + args.text
//! keyboard.paste(note)
//! return "Note pasted!"
//! ```

use std::collections::HashSet;
use std::iter::Peekable;
use std::str::Chars;
use std::time::{Duration, Instant};

use serde_json::{Map, Number, Value, json};

use super::host::Host;
use super::policy::{Capability, CapabilitySet};
use crate::{Error, Result};

/// Identifiers a body may never use
const RESERVED: &[&str] = &[
    "import",
    "require",
    "exec",
    "eval",
    "spawn",
    "open",
    "subprocess",
    "os",
];

/// Result payload when a body produces no value
pub const DEFAULT_RESULT: &str = "Function executed.";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Let,
    Return,
    If,
    Else,
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Plus,
    EqEq,
    NotEq,
    Assign,
    Sep,
}

fn syntax(message: impl Into<String>) -> Error {
    Error::SandboxViolation(format!("syntax error: {}", message.into()))
}

fn lex(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '\n' | ';' => {
                chars.next();
                tokens.push(Token::Sep);
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            '"' | '\'' => {
                chars.next();
                tokens.push(Token::Str(lex_string(&mut chars, c)?));
            }
            '0'..='9' | '-' => tokens.push(Token::Num(lex_number(&mut chars)?)),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(c) = chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
                    ident.push(c);
                }
                tokens.push(match ident.as_str() {
                    "let" => Token::Let,
                    "return" => Token::Return,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            _ => {
                chars.next();
                tokens.push(match c {
                    '.' => Token::Dot,
                    ',' => Token::Comma,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '+' => Token::Plus,
                    '=' if chars.next_if_eq(&'=').is_some() => Token::EqEq,
                    '=' => Token::Assign,
                    '!' if chars.next_if_eq(&'=').is_some() => Token::NotEq,
                    other => return Err(syntax(format!("unexpected character '{other}'"))),
                });
            }
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &mut Peekable<Chars<'_>>, quote: char) -> Result<String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err(syntax("unterminated string")),
            Some(c) if c == quote => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(c @ ('\\' | '"' | '\'')) => out.push(c),
                Some(c) => return Err(syntax(format!("unknown escape '\\{c}'"))),
                None => return Err(syntax("unterminated string")),
            },
            Some(c) => out.push(c),
        }
    }
}

fn lex_number(chars: &mut Peekable<Chars<'_>>) -> Result<f64> {
    let mut text = String::new();
    if let Some(minus) = chars.next_if_eq(&'-') {
        text.push(minus);
    }
    while let Some(c) = chars.next_if(|c| c.is_ascii_digit() || *c == '.') {
        text.push(c);
    }
    text.parse()
        .map_err(|_| syntax(format!("invalid number '{text}'")))
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    /// Variable or `args` followed by field names
    Path(Vec<String>),
    Call {
        namespace: String,
        function: String,
        args: Vec<Expr>,
    },
    Add(Box<Expr>, Box<Expr>),
    Compare {
        left: Box<Expr>,
        right: Box<Expr>,
        negate: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Let(String, Expr),
    Return(Expr),
    If {
        condition: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Expr(Expr),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(syntax(format!("expected {what}, found {}", self.describe())))
        }
    }

    fn describe(&self) -> String {
        self.peek()
            .map_or_else(|| "end of input".to_string(), |t| format!("{t:?}"))
    }

    fn skip_separators(&mut self) {
        while self.eat(&Token::Sep) {}
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(syntax(format!("expected {what}, found {}", self.describe())))
            }
        }
    }

    /// Statements up to the closing brace, or to end of input at top level
    fn block(&mut self, until_brace: bool) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        loop {
            self.skip_separators();
            match self.peek() {
                None if until_brace => return Err(syntax("missing '}'")),
                None => return Ok(stmts),
                Some(Token::RBrace) if until_brace => {
                    self.pos += 1;
                    return Ok(stmts);
                }
                Some(_) => {
                    stmts.push(self.statement()?);
                    match self.peek() {
                        None | Some(Token::Sep | Token::RBrace) => {}
                        Some(_) => {
                            return Err(syntax(format!(
                                "expected end of statement, found {}",
                                self.describe()
                            )));
                        }
                    }
                }
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt> {
        if self.eat(&Token::Let) {
            let name = self.ident("variable name")?;
            self.expect(&Token::Assign, "'='")?;
            return Ok(Stmt::Let(name, self.expression()?));
        }
        if self.eat(&Token::Return) {
            return Ok(Stmt::Return(self.expression()?));
        }
        if self.eat(&Token::If) {
            return self.if_statement();
        }
        Ok(Stmt::Expr(self.expression()?))
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        let condition = self.expression()?;
        self.expect(&Token::LBrace, "'{'")?;
        let then = self.block(true)?;

        let checkpoint = self.pos;
        self.skip_separators();
        let otherwise = if self.eat(&Token::Else) {
            if self.eat(&Token::If) {
                vec![self.if_statement()?]
            } else {
                self.expect(&Token::LBrace, "'{'")?;
                self.block(true)?
            }
        } else {
            self.pos = checkpoint;
            Vec::new()
        };

        Ok(Stmt::If {
            condition,
            then,
            otherwise,
        })
    }

    fn expression(&mut self) -> Result<Expr> {
        let left = self.sum()?;
        let negate = match self.peek() {
            Some(Token::EqEq) => false,
            Some(Token::NotEq) => true,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.sum()?;
        Ok(Expr::Compare {
            left: Box::new(left),
            right: Box::new(right),
            negate,
        })
    }

    fn sum(&mut self) -> Result<Expr> {
        let mut expr = self.term()?;
        while self.eat(&Token::Plus) {
            expr = Expr::Add(Box::new(expr), Box::new(self.term()?));
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let expr = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::Ident(root)) => {
                let mut path = vec![root];
                while self.eat(&Token::Dot) {
                    path.push(self.ident("field name")?);
                }
                if self.eat(&Token::LParen) {
                    let [namespace, function]: [String; 2] = path
                        .try_into()
                        .map_err(|_| syntax("calls take the form namespace.function(...)"))?;
                    let args = self.arguments()?;
                    return Ok(Expr::Call {
                        namespace,
                        function,
                        args,
                    });
                }
                Ok(Expr::Path(path))
            }
            _ => {
                self.pos -= 1;
                Err(syntax(format!("expected a value, found {}", self.describe())))
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        self.skip_separators();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            self.skip_separators();
            args.push(self.expression()?);
            self.skip_separators();
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number(n: f64) -> Value {
    if n.fract().abs() < f64::EPSILON && n.abs() < 9.0e15 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map_or(Value::Null, Value::Number)
}

/// A parsed tool body
#[derive(Debug, Clone)]
pub struct Program {
    body: Vec<Stmt>,
}

impl Program {
    /// Parse a body
    ///
    /// # Errors
    ///
    /// Returns `Error::SandboxViolation` for syntax errors
    pub fn parse(source: &str) -> Result<Self> {
        let mut parser = Parser {
            tokens: lex(source)?,
            pos: 0,
        };
        Ok(Self {
            body: parser.block(false)?,
        })
    }

    /// Parse and statically check a body against granted capabilities
    ///
    /// # Errors
    ///
    /// Returns `Error::SandboxViolation` if the body cannot be parsed or
    /// uses anything it was not granted
    pub fn compile(source: &str, granted: &CapabilitySet) -> Result<Self> {
        let program = Self::parse(source)?;
        program.check(granted)?;
        Ok(program)
    }

    /// Capabilities the body calls into
    #[must_use]
    pub fn required_capabilities(&self) -> CapabilitySet {
        let mut calls = Vec::new();
        collect_calls(&self.body, &mut calls);
        calls
            .into_iter()
            .filter_map(|(ns, _)| Capability::for_namespace(ns))
            .collect()
    }

    /// Static validation
    ///
    /// # Errors
    ///
    /// Returns `Error::SandboxViolation` describing the first disallowed
    /// construct
    pub fn check(&self, granted: &CapabilitySet) -> Result<()> {
        let mut bound = HashSet::from(["args".to_string()]);
        check_block(&self.body, granted, &mut bound)
    }

    /// Run the body
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` once the deadline passes, or `Error::Tool`
    /// when a call fails
    pub fn run(&self, args: &Value, host: &dyn Host, budget: Duration) -> Result<Value> {
        let mut interpreter = Interpreter {
            host,
            started: Instant::now(),
            budget,
            vars: Map::from_iter([("args".to_string(), args.clone())]),
            last: None,
        };
        let value = match interpreter.block(&self.body)? {
            Flow::Return(value) => Some(value),
            Flow::Normal => interpreter.last.take(),
        };
        Ok(value
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::String(DEFAULT_RESULT.to_string())))
    }
}

fn collect_calls<'a>(stmts: &'a [Stmt], out: &mut Vec<(&'a str, &'a str)>) {
    fn expr<'a>(e: &'a Expr, out: &mut Vec<(&'a str, &'a str)>) {
        match e {
            Expr::Literal(_) | Expr::Path(_) => {}
            Expr::Call {
                namespace,
                function,
                args,
            } => {
                out.push((namespace.as_str(), function.as_str()));
                args.iter().for_each(|a| expr(a, out));
            }
            Expr::Add(l, r) | Expr::Compare { left: l, right: r, .. } => {
                expr(l, out);
                expr(r, out);
            }
        }
    }

    for stmt in stmts {
        match stmt {
            Stmt::Let(_, e) | Stmt::Return(e) | Stmt::Expr(e) => expr(e, out),
            Stmt::If {
                condition,
                then,
                otherwise,
            } => {
                expr(condition, out);
                collect_calls(then, out);
                collect_calls(otherwise, out);
            }
        }
    }
}

fn violation(message: String) -> Error {
    Error::SandboxViolation(message)
}

fn check_identifier(name: &str) -> Result<()> {
    if RESERVED.contains(&name) {
        return Err(violation(format!("reserved identifier '{name}'")));
    }
    if name.starts_with("__") {
        return Err(violation(format!("identifier '{name}' is not allowed")));
    }
    Ok(())
}

fn check_block(stmts: &[Stmt], granted: &CapabilitySet, bound: &mut HashSet<String>) -> Result<()> {
    for stmt in stmts {
        match stmt {
            Stmt::Let(name, e) => {
                check_identifier(name)?;
                if name == "args" {
                    return Err(violation("'args' cannot be reassigned".to_string()));
                }
                check_expr(e, granted, bound)?;
                bound.insert(name.clone());
            }
            Stmt::Return(e) | Stmt::Expr(e) => check_expr(e, granted, bound)?,
            Stmt::If {
                condition,
                then,
                otherwise,
            } => {
                check_expr(condition, granted, bound)?;
                check_block(then, granted, bound)?;
                check_block(otherwise, granted, bound)?;
            }
        }
    }
    Ok(())
}

fn check_expr(expr: &Expr, granted: &CapabilitySet, bound: &HashSet<String>) -> Result<()> {
    match expr {
        Expr::Literal(_) => Ok(()),
        Expr::Path(path) => {
            let root = &path[0];
            check_identifier(root)?;
            for field in &path[1..] {
                if field.starts_with("__") {
                    return Err(violation(format!("field '{field}' is not allowed")));
                }
            }
            if !bound.contains(root) {
                return Err(violation(if path.len() > 1 {
                    format!("field access on '{root}' is not allowed")
                } else {
                    format!("unknown identifier '{root}'")
                }));
            }
            Ok(())
        }
        Expr::Call {
            namespace,
            function,
            args,
        } => {
            check_identifier(namespace)?;
            check_identifier(function)?;
            let capability = Capability::for_namespace(namespace)
                .ok_or_else(|| violation(format!("unknown namespace '{namespace}'")))?;
            if !Capability::functions(namespace).contains(&function.as_str()) {
                return Err(violation(format!("unknown function '{namespace}.{function}'")));
            }
            if !granted.contains(capability) {
                return Err(violation(format!(
                    "'{namespace}.{function}' requires the {capability} capability"
                )));
            }
            args.iter().try_for_each(|a| check_expr(a, granted, bound))
        }
        Expr::Add(left, right) | Expr::Compare { left, right, .. } => {
            check_expr(left, granted, bound)?;
            check_expr(right, granted, bound)
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
}

struct Interpreter<'h> {
    host: &'h dyn Host,
    started: Instant,
    budget: Duration,
    vars: Map<String, Value>,
    last: Option<Value>,
}

impl Interpreter<'_> {
    fn remaining(&self) -> Result<Duration> {
        self.budget
            .checked_sub(self.started.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(Error::Timeout(self.budget))
    }

    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            self.remaining()?;
            match stmt {
                Stmt::Let(name, e) => {
                    let value = self.eval(e)?;
                    self.vars.insert(name.clone(), value);
                }
                Stmt::Return(e) => return Ok(Flow::Return(self.eval(e)?)),
                Stmt::If {
                    condition,
                    then,
                    otherwise,
                } => {
                    let branch = if truthy(&self.eval(condition)?) {
                        then
                    } else {
                        otherwise
                    };
                    if let Flow::Return(value) = self.block(branch)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Stmt::Expr(e) => {
                    let value = self.eval(e)?;
                    self.last = Some(value);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => {
                let mut value = self.vars.get(&path[0]).cloned().unwrap_or(Value::Null);
                for field in &path[1..] {
                    value = value.get(field).cloned().unwrap_or(Value::Null);
                }
                Ok(value)
            }
            Expr::Add(left, right) => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                Ok(match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) if l.is_number() && r.is_number() => number(a + b),
                    _ => Value::String(text(&l) + &text(&r)),
                })
            }
            Expr::Compare {
                left,
                right,
                negate,
            } => {
                let (l, r) = (self.eval(left)?, self.eval(right)?);
                let equal = match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                    _ => l == r,
                };
                Ok(Value::Bool(equal != *negate))
            }
            Expr::Call {
                namespace,
                function,
                args,
            } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>>>()?;
                self.call(namespace, function, &values)
            }
        }
    }

    fn call(&self, namespace: &str, function: &str, args: &[Value]) -> Result<Value> {
        let arg = |i: usize| args.get(i).map(text).unwrap_or_default();
        let arity = |min: usize, max: usize| {
            if args.len() < min || args.len() > max {
                Err(Error::Tool(format!(
                    "{namespace}.{function} takes {min}..={max} arguments, got {}",
                    args.len()
                )))
            } else {
                Ok(())
            }
        };

        match (namespace, function) {
            ("clipboard", "set") => {
                arity(1, 1)?;
                self.host.clipboard_set(&arg(0))?;
                Ok(Value::Null)
            }
            ("clipboard", "get") => {
                arity(0, 0)?;
                Ok(Value::String(self.host.clipboard_get()?))
            }
            ("keyboard", "paste") => {
                arity(1, 1)?;
                self.host.keyboard_paste(&arg(0))?;
                Ok(Value::Null)
            }
            ("keyboard", "type") => {
                arity(1, 1)?;
                self.host.keyboard_type(&arg(0))?;
                Ok(Value::Null)
            }
            ("notify", "show") => {
                arity(1, 2)?;
                let (title, body) = if args.len() == 2 {
                    (arg(0), arg(1))
                } else {
                    ("Hark".to_string(), arg(0))
                };
                self.host.notify(&title, &body)?;
                Ok(Value::Null)
            }
            ("clock", "now") => {
                arity(0, 0)?;
                Ok(Value::String(chrono::Local::now().to_rfc3339()))
            }
            ("clock", "sleep") => {
                arity(1, 1)?;
                let requested = args[0]
                    .as_u64()
                    .ok_or_else(|| Error::Tool("clock.sleep takes milliseconds".to_string()))?;
                let requested = Duration::from_millis(requested);
                let remaining = self.remaining()?;
                std::thread::sleep(requested.min(remaining));
                if requested >= remaining {
                    return Err(Error::Timeout(self.budget));
                }
                Ok(Value::Null)
            }
            ("system", "info") => {
                arity(0, 0)?;
                Ok(json!({
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                    "family": std::env::consts::FAMILY,
                    "time": chrono::Local::now().to_rfc3339(),
                }))
            }
            ("log", "info") => {
                arity(1, 1)?;
                tracing::info!(message = %arg(0), "tool log");
                Ok(Value::Null)
            }
            ("net", "get") => {
                arity(1, 1)?;
                Ok(Value::String(self.host.http_get(&arg(0))?))
            }
            ("fs", "read") => {
                arity(1, 1)?;
                Ok(Value::String(self.host.read_file(&arg(0))?))
            }
            ("process", "run") => {
                arity(1, usize::MAX)?;
                let rest: Vec<String> = args[1..].iter().map(text).collect();
                let output = self
                    .host
                    .run_process(&arg(0), &rest, self.remaining()?)
                    .map_err(|e| match e {
                        Error::Timeout(_) => Error::Timeout(self.budget),
                        e => e,
                    })?;
                Ok(Value::String(output))
            }
            _ => Err(Error::Tool(format!("unknown function {namespace}.{function}"))),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() > f64::EPSILON),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Text form used for concatenation and string arguments
fn text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        pasted: Mutex<Vec<String>>,
    }

    impl Host for RecordingHost {
        fn clipboard_set(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        fn clipboard_get(&self) -> Result<String> {
            Ok("clip".to_string())
        }
        fn keyboard_paste(&self, text: &str) -> Result<()> {
            self.pasted.lock().unwrap().push(text.to_string());
            Ok(())
        }
        fn keyboard_type(&self, _text: &str) -> Result<()> {
            Ok(())
        }
        fn notify(&self, _title: &str, _body: &str) -> Result<()> {
            Ok(())
        }
        fn http_get(&self, _url: &str) -> Result<String> {
            Ok(String::new())
        }
        fn read_file(&self, _path: &str) -> Result<String> {
            Ok(String::new())
        }
        fn run_process(&self, _program: &str, _args: &[String], _timeout: Duration) -> Result<String> {
            Ok(String::new())
        }
    }

    fn run(source: &str, args: Value) -> Result<Value> {
        let program = Program::compile(source, &CapabilitySet::desktop_default())?;
        program.run(&args, &RecordingHost::default(), Duration::from_secs(5))
    }

    #[test]
    fn test_paste_note() {
        let host = RecordingHost::default();
        let program = Program::compile(
            "keyboard.paste(args.text)\nreturn \"Note pasted!\"",
            &CapabilitySet::desktop_default(),
        )
        .unwrap();
        let result = program
            .run(&json!({"text": "buy oat milk"}), &host, Duration::from_secs(5))
            .unwrap();

        assert_eq!(result, json!("Note pasted!"));
        assert_eq!(*host.pasted.lock().unwrap(), vec!["buy oat milk".to_string()]);
    }

    #[test]
    fn test_let_concat_and_if() {
        let source = r#"
            let greeting = "Hello, " + args.name   # build it
            if args.loud == true { return greeting + "!" } else { return greeting }
        "#;
        assert_eq!(run(source, json!({"name": "Ada", "loud": true})).unwrap(), json!("Hello, Ada!"));
        assert_eq!(run(source, json!({"name": "Ada", "loud": false})).unwrap(), json!("Hello, Ada"));
    }

    #[test]
    fn test_numeric_add_and_last_expression() {
        assert_eq!(run("args.a + 2", json!({"a": 40})).unwrap(), json!(42));
        assert_eq!(run("1 != 2", json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_no_value_yields_default() {
        assert_eq!(run("log.info('hi')", json!({})).unwrap(), json!(DEFAULT_RESULT));
        assert_eq!(run("", json!({})).unwrap(), json!(DEFAULT_RESULT));
    }

    #[test]
    fn test_ungranted_capability_rejected() {
        let err = Program::compile("process.run('rm', '-rf', '/')", &CapabilitySet::desktop_default())
            .unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(m) if m.contains("process")));
    }

    #[test]
    fn test_reserved_and_dunder_rejected() {
        let caps = CapabilitySet::desktop_default();
        assert!(Program::compile("let eval = 1", &caps).is_err());
        assert!(Program::compile("return args.__class__", &caps).is_err());
        assert!(Program::compile("os.system('ls')", &caps).is_err());
    }

    #[test]
    fn test_field_access_on_unbound_rejected() {
        let caps = CapabilitySet::desktop_default();
        let err = Program::compile("return config.secret", &caps).unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(m) if m.contains("field access")));
        assert!(Program::compile("let c = args\nreturn c.text", &caps).is_ok());
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = Program::compile("clipboard.clear()", &CapabilitySet::desktop_default()).unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(m) if m.contains("unknown function")));
    }

    #[test]
    fn test_syntax_error_is_violation() {
        let err = Program::parse("let = 3").unwrap_err();
        assert!(matches!(err, Error::SandboxViolation(m) if m.starts_with("syntax error")));
        assert!(Program::parse("if true { return 1").is_err());
    }

    #[test]
    fn test_sleep_past_deadline_times_out() {
        let program = Program::compile("clock.sleep(5000)", &CapabilitySet::desktop_default()).unwrap();
        let err = program
            .run(&json!({}), &RecordingHost::default(), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_required_capabilities() {
        let program = Program::parse("fs.read('/tmp/x')\nnet.get('https://example.com')").unwrap();
        let caps = program.required_capabilities();
        assert!(caps.contains(Capability::FileRead));
        assert!(caps.contains(Capability::Network));
        assert!(!caps.contains(Capability::Clipboard));
    }
}
