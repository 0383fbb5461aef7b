//! Code sandbox: restricted evaluation of small programs over JSON bindings.
//!
//! The sandbox evaluates a closed expression grammar (no imports, no file or
//! network primitives, no unbounded loops) against a bounded name set. The
//! same evaluator backs two surfaces: the worker's sandboxed-code action
//! (statement list, `name = expr` assignments, final expression as result)
//! and conditional-edge predicates (single expression coerced to boolean).
//!
//! Security is a whitelist: anything outside the grammar fails to parse, and
//! a static screen rejects programs whose text references imports, dunder
//! attributes, or process/file/socket builtins before parsing is attempted.
//! Refusals carry "Security violation" in the error text. Evaluation is
//! bounded by a wall-clock budget plus step and depth caps.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;

/// Outcome of one sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxResult {
    pub success: bool,
    /// Value of the program's final statement.
    #[serde(default)]
    pub result: Value,
    /// Names bound by the program (assignments), minus the initial inputs.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Restricted evaluator with wall-clock, step, and depth budgets.
#[derive(Debug, Clone)]
pub struct CodeSandbox {
    timeout: Duration,
    max_steps: u64,
    max_depth: usize,
}

impl Default for CodeSandbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Substrings whose presence rejects a program before parsing.
const FORBIDDEN: &[&str] = &[
    "import", "__", "open(", "exec", "eval(", "compile(", "socket", "subprocess", "os.", "sys.",
    "while",
];

impl CodeSandbox {
    /// Sandbox with the default budgets (1 s wall clock).
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_steps: 100_000,
            max_depth: 96,
        }
    }

    /// Override the wall-clock budget (builder).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Executes a program against the given bindings.
    ///
    /// Never panics and never returns `Err`: refusals and failures are
    /// reported inside `SandboxResult` so the worker can classify them
    /// (`security` when the error text contains "Security", else `code_error`).
    pub fn execute(&self, code: &str, locals: &BTreeMap<String, Value>) -> SandboxResult {
        let start = Instant::now();
        let finish = |result: Result<(Value, BTreeMap<String, Value>), String>| {
            let execution_time_ms = start.elapsed().as_millis() as u64;
            match result {
                Ok((result, variables)) => SandboxResult {
                    success: true,
                    result,
                    variables,
                    error: None,
                    execution_time_ms,
                },
                Err(error) => SandboxResult {
                    success: false,
                    result: Value::Null,
                    variables: BTreeMap::new(),
                    error: Some(error),
                    execution_time_ms,
                },
            }
        };

        if let Err(e) = screen(code) {
            return finish(Err(e));
        }

        let mut interp = Interp {
            scope: locals.clone(),
            deadline: start + self.timeout,
            steps_left: self.max_steps,
            max_depth: self.max_depth,
        };
        let result = interp.run_program(code).map(|value| {
            let variables: BTreeMap<String, Value> = interp
                .scope
                .iter()
                .filter(|(k, _)| !locals.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (value, variables)
        });
        finish(result)
    }

    /// Evaluates a single expression to a boolean (conditional edges).
    pub fn eval_predicate(
        &self,
        expression: &str,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<bool, EngineError> {
        let outcome = self.execute(expression, bindings);
        match outcome.error {
            None => Ok(truthy(&outcome.result)),
            Some(e) if e.contains("Security") => Err(EngineError::Security(e)),
            Some(e) => Err(EngineError::CodeError(e)),
        }
    }
}

/// Static screen: reject programs whose raw text reaches for anything outside
/// the sandbox's whitelist.
fn screen(code: &str) -> Result<(), String> {
    for needle in FORBIDDEN {
        if code.contains(needle) {
            return Err(format!("Security violation: '{needle}' is not allowed"));
        }
    }
    Ok(())
}

/// Truthiness over JSON values (empty containers and empty strings are false).
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// === Lexer ===

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Sym(&'static str),
}

fn lex(code: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let chars: Vec<char> = code.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' | ';' => {
                toks.push(Tok::Sym(";"));
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                        s.push(match chars[i] {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    } else {
                        s.push(chars[i]);
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err("unterminated string literal".into());
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| format!("bad number: {text}"))?;
                toks.push(Tok::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let sym = match two.as_str() {
                    "==" | "!=" | "<=" | ">=" | "&&" | "||" => {
                        i += 2;
                        match two.as_str() {
                            "==" => "==",
                            "!=" => "!=",
                            "<=" => "<=",
                            ">=" => ">=",
                            "&&" => "&&",
                            _ => "||",
                        }
                    }
                    _ => {
                        i += 1;
                        match c {
                            '+' => "+",
                            '-' => "-",
                            '*' => "*",
                            '/' => "/",
                            '%' => "%",
                            '<' => "<",
                            '>' => ">",
                            '=' => "=",
                            '(' => "(",
                            ')' => ")",
                            '[' => "[",
                            ']' => "]",
                            ',' => ",",
                            '.' => ".",
                            '!' => "!",
                            other => return Err(format!("Security violation: character '{other}' is not allowed")),
                        }
                    }
                };
                toks.push(Tok::Sym(sym));
            }
        }
    }
    Ok(toks)
}

// === Interpreter (recursive descent over the token stream) ===

struct Interp {
    scope: BTreeMap<String, Value>,
    deadline: Instant,
    steps_left: u64,
    max_depth: usize,
}

struct Parser<'a> {
    toks: &'a [Tok],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Tok::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

impl Interp {
    fn tick(&mut self) -> Result<(), String> {
        self.steps_left = self.steps_left.saturating_sub(1);
        if self.steps_left == 0 {
            return Err("step limit exceeded".into());
        }
        if self.steps_left % 256 == 0 && Instant::now() > self.deadline {
            return Err("execution time limit exceeded".into());
        }
        Ok(())
    }

    fn run_program(&mut self, code: &str) -> Result<Value, String> {
        let toks = lex(code)?;
        let mut parser = Parser { toks: &toks, pos: 0 };
        let mut last = Value::Null;
        loop {
            while parser.eat_sym(";") {}
            if parser.peek().is_none() {
                break;
            }
            // Assignment: IDENT '=' expr (not '==')
            if let (Some(Tok::Ident(name)), Some(Tok::Sym("="))) =
                (parser.toks.get(parser.pos), parser.toks.get(parser.pos + 1))
            {
                let name = name.clone();
                parser.pos += 2;
                let value = self.expr(&mut parser, 0)?;
                self.scope.insert(name, value.clone());
                last = value;
            } else {
                last = self.expr(&mut parser, 0)?;
            }
            if parser.peek().is_some() && !parser.eat_sym(";") {
                return Err(format!("unexpected token at position {}", parser.pos));
            }
        }
        Ok(last)
    }

    fn expr(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        self.or_expr(p, depth)
    }

    fn or_expr(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        self.check_depth(depth)?;
        let mut left = self.and_expr(p, depth + 1)?;
        loop {
            let is_or = match p.peek() {
                Some(Tok::Sym("||")) => true,
                Some(Tok::Ident(w)) if w == "or" => true,
                _ => false,
            };
            if !is_or {
                return Ok(left);
            }
            p.pos += 1;
            let right = self.and_expr(p, depth + 1)?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
    }

    fn and_expr(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        let mut left = self.not_expr(p, depth + 1)?;
        loop {
            let is_and = match p.peek() {
                Some(Tok::Sym("&&")) => true,
                Some(Tok::Ident(w)) if w == "and" => true,
                _ => false,
            };
            if !is_and {
                return Ok(left);
            }
            p.pos += 1;
            let right = self.not_expr(p, depth + 1)?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
    }

    fn not_expr(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        let is_not = match p.peek() {
            Some(Tok::Sym("!")) => true,
            Some(Tok::Ident(w)) if w == "not" => true,
            _ => false,
        };
        if is_not {
            p.pos += 1;
            let v = self.not_expr(p, depth + 1)?;
            return Ok(Value::Bool(!truthy(&v)));
        }
        self.comparison(p, depth + 1)
    }

    fn comparison(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        let left = self.additive(p, depth + 1)?;
        let op = match p.peek() {
            Some(Tok::Sym(s @ ("==" | "!=" | "<" | "<=" | ">" | ">="))) => {
                let s = *s;
                p.pos += 1;
                s
            }
            Some(Tok::Ident(w)) if w == "in" => {
                p.pos += 1;
                "in"
            }
            _ => return Ok(left),
        };
        let right = self.additive(p, depth + 1)?;
        self.tick()?;
        let result = match op {
            "==" => left == right,
            "!=" => left != right,
            "in" => match &right {
                Value::Array(items) => items.contains(&left),
                Value::String(s) => left.as_str().map(|l| s.contains(l)).unwrap_or(false),
                Value::Object(o) => left.as_str().map(|l| o.contains_key(l)).unwrap_or(false),
                _ => false,
            },
            _ => {
                let ordering = compare(&left, &right)
                    .ok_or_else(|| format!("cannot compare {left} with {right}"))?;
                match op {
                    "<" => ordering == std::cmp::Ordering::Less,
                    "<=" => ordering != std::cmp::Ordering::Greater,
                    ">" => ordering == std::cmp::Ordering::Greater,
                    ">=" => ordering != std::cmp::Ordering::Less,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn additive(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        let mut left = self.multiplicative(p, depth + 1)?;
        loop {
            let op = match p.peek() {
                Some(Tok::Sym(s @ ("+" | "-"))) => *s,
                _ => return Ok(left),
            };
            p.pos += 1;
            let right = self.multiplicative(p, depth + 1)?;
            self.tick()?;
            left = match op {
                "+" => add(&left, &right)?,
                _ => arith(&left, &right, |a, b| a - b)?,
            };
        }
    }

    fn multiplicative(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        let mut left = self.unary(p, depth + 1)?;
        loop {
            let op = match p.peek() {
                Some(Tok::Sym(s @ ("*" | "/" | "%"))) => *s,
                _ => return Ok(left),
            };
            p.pos += 1;
            let right = self.unary(p, depth + 1)?;
            self.tick()?;
            left = match op {
                "*" => arith(&left, &right, |a, b| a * b)?,
                "/" => {
                    let divisor = as_num(&right)?;
                    if divisor == 0.0 {
                        return Err("division by zero".into());
                    }
                    arith(&left, &right, |a, b| a / b)?
                }
                _ => {
                    let divisor = as_num(&right)?;
                    if divisor == 0.0 {
                        return Err("division by zero".into());
                    }
                    arith(&left, &right, |a, b| a % b)?
                }
            };
        }
    }

    fn unary(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        if p.eat_sym("-") {
            let v = self.unary(p, depth + 1)?;
            return arith(&json!(0), &v, |a, b| a - b);
        }
        self.postfix(p, depth + 1)
    }

    fn postfix(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        self.check_depth(depth)?;
        // Builtin call: IDENT '(' args ')'
        if let (Some(Tok::Ident(name)), Some(Tok::Sym("("))) =
            (p.toks.get(p.pos), p.toks.get(p.pos + 1))
        {
            if is_builtin(name) {
                let name = name.clone();
                p.pos += 2;
                let mut args = Vec::new();
                if !p.eat_sym(")") {
                    loop {
                        args.push(self.expr(p, depth + 1)?);
                        if p.eat_sym(")") {
                            break;
                        }
                        if !p.eat_sym(",") {
                            return Err("expected ',' or ')' in call".into());
                        }
                    }
                }
                let mut value = call_builtin(&name, &args)?;
                self.trailers(p, &mut value, depth)?;
                return Ok(value);
            }
        }

        let mut value = self.primary(p, depth + 1)?;
        self.trailers(p, &mut value, depth)?;
        Ok(value)
    }

    fn trailers(&mut self, p: &mut Parser<'_>, value: &mut Value, depth: usize) -> Result<(), String> {
        loop {
            if p.eat_sym(".") {
                match p.next() {
                    Some(Tok::Ident(field)) => {
                        *value = value.get(&field).cloned().unwrap_or(Value::Null);
                    }
                    _ => return Err("expected field name after '.'".into()),
                }
            } else if p.eat_sym("[") {
                let index = self.expr(p, depth + 1)?;
                if !p.eat_sym("]") {
                    return Err("expected ']'".into());
                }
                *value = match (&*value, &index) {
                    (Value::Array(items), Value::Number(n)) => n
                        .as_u64()
                        .and_then(|i| items.get(i as usize))
                        .cloned()
                        .unwrap_or(Value::Null),
                    (v, Value::String(key)) => v.get(key).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            } else {
                return Ok(());
            }
            self.tick()?;
        }
    }

    fn primary(&mut self, p: &mut Parser<'_>, depth: usize) -> Result<Value, String> {
        self.tick()?;
        match p.next() {
            Some(Tok::Num(n)) => Ok(num_value(n)),
            Some(Tok::Str(s)) => Ok(Value::String(s)),
            Some(Tok::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Value::Bool(true)),
                "false" | "False" => Ok(Value::Bool(false)),
                "null" | "none" | "None" => Ok(Value::Null),
                name => Ok(self.scope.get(name).cloned().unwrap_or(Value::Null)),
            },
            Some(Tok::Sym("(")) => {
                let v = self.expr(p, depth + 1)?;
                if !p.eat_sym(")") {
                    return Err("expected ')'".into());
                }
                Ok(v)
            }
            Some(Tok::Sym("[")) => {
                let mut items = Vec::new();
                if !p.eat_sym("]") {
                    loop {
                        items.push(self.expr(p, depth + 1)?);
                        if p.eat_sym("]") {
                            break;
                        }
                        if !p.eat_sym(",") {
                            return Err("expected ',' or ']' in list".into());
                        }
                    }
                }
                Ok(Value::Array(items))
            }
            other => Err(format!("unexpected token: {other:?}")),
        }
    }

    fn check_depth(&self, depth: usize) -> Result<(), String> {
        if depth > self.max_depth {
            return Err("expression nesting too deep".into());
        }
        Ok(())
    }
}

fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "len" | "str" | "int" | "float" | "min" | "max" | "abs" | "contains"
    )
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, String> {
    let one = || args.first().ok_or_else(|| format!("{name}() needs an argument"));
    match name {
        "len" => {
            let v = one()?;
            let n = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => return Err(format!("len() not supported for {v}")),
            };
            Ok(json!(n))
        }
        "str" => {
            let v = one()?;
            Ok(Value::String(match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
        }
        "int" => {
            let v = one()?;
            match v {
                Value::Number(_) => Ok(json!(as_num(v)? as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|n| json!(n))
                    .map_err(|_| format!("int() cannot parse '{s}'")),
                Value::Bool(b) => Ok(json!(if *b { 1 } else { 0 })),
                other => Err(format!("int() not supported for {other}")),
            }
        }
        "float" => {
            let v = one()?;
            match v {
                Value::Number(_) => Ok(json!(as_num(v)?)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(|n| json!(n))
                    .map_err(|_| format!("float() cannot parse '{s}'")),
                other => Err(format!("float() not supported for {other}")),
            }
        }
        "min" | "max" => {
            if args.len() != 2 {
                return Err(format!("{name}() needs two arguments"));
            }
            let (a, b) = (as_num(&args[0])?, as_num(&args[1])?);
            Ok(num_value(if name == "min" { a.min(b) } else { a.max(b) }))
        }
        "abs" => Ok(num_value(as_num(one()?)?.abs())),
        "contains" => {
            if args.len() != 2 {
                return Err("contains() needs two arguments".into());
            }
            let found = match (&args[0], &args[1]) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                (Value::Object(o), Value::String(key)) => o.contains_key(key),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        _ => Err(format!("unknown function: {name}")),
    }
}

fn as_num(v: &Value) -> Result<f64, String> {
    v.as_f64().ok_or_else(|| format!("expected a number, got {v}"))
}

fn num_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, String> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.clone());
            Ok(Value::Array(out))
        }
        _ => arith(left, right, |a, b| a + b),
    }
}

fn arith(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> Result<Value, String> {
    Ok(num_value(op(as_num(left)?, as_num(right)?)))
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            left.as_f64().and_then(|a| right.as_f64().map(|b| (a, b)))
                .and_then(|(a, b)| a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
