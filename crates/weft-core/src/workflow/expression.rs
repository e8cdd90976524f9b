//! Condition expression language for step `condition` and loop `while`/`until`.
//!
//! Expressions are parsed once into a typed AST and evaluated against a
//! [`Scope`]. The grammar is deliberately small:
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := primary (("==" | "!=" | "<" | "<=" | ">" | ">=") primary)?
//! primary := number | string | "true" | "false" | path | "(" or ")"
//! path    := ident ("." ident | "[" string "]")*
//! ```
//!
//! Evaluation fails closed: unknown identifiers and type mismatches are
//! errors, never silently false. `&&` and `||` short-circuit, so the right
//! operand is not resolved when the left one decides the result.

use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

fn parse_error(offset: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        offset,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Values and AST
// ---------------------------------------------------------------------------

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "'{s}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

/// Resolves dotted paths to values during evaluation.
pub trait Scope {
    fn lookup(&self, path: &[String]) -> Result<Value, ExpressionError>;
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// A parsed, reusable expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse expression text.
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = lex(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let ast = parser.parse_or()?;
        if let Some(tok) = parser.peek() {
            return Err(parse_error(
                tok.offset,
                format!("unexpected token {:?}", tok.kind),
            ));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate to any value.
    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, ExpressionError> {
        eval_expr(&self.ast, scope)
    }

    /// Evaluate and require a boolean result. There is no truthiness.
    pub fn eval_bool(&self, scope: &dyn Scope) -> Result<bool, ExpressionError> {
        match self.eval(scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::TypeMismatch(format!(
                "expected boolean result, got {} {other}",
                other.type_name()
            ))),
        }
    }

    /// Every path referenced by the expression, in source order.
    pub fn paths(&self) -> Vec<&[String]> {
        let mut out = Vec::new();
        collect_paths(&self.ast, &mut out);
        out
    }

    /// Step ids referenced through `steps.<id>...` paths.
    pub fn referenced_steps(&self) -> BTreeSet<&str> {
        self.paths()
            .into_iter()
            .filter(|p| p.len() >= 2 && p[0] == "steps")
            .map(|p| p[1].as_str())
            .collect()
    }
}

fn collect_paths<'a>(expr: &'a Expr, out: &mut Vec<&'a [String]>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(p) => out.push(p.as_slice()),
        Expr::Not(inner) => collect_paths(inner, out),
        Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
            collect_paths(l, out);
            collect_paths(r, out);
        }
    }
}

fn expect_bool(value: Value, context: &str) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(ExpressionError::TypeMismatch(format!(
            "operand of {context} must be boolean, got {} {other}",
            other.type_name()
        ))),
    }
}

fn eval_expr(expr: &Expr, scope: &dyn Scope) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => scope.lookup(path),
        Expr::Not(inner) => Ok(Value::Bool(!expect_bool(eval_expr(inner, scope)?, "!")?)),
        Expr::And(l, r) => {
            if !expect_bool(eval_expr(l, scope)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(expect_bool(eval_expr(r, scope)?, "&&")?))
        }
        Expr::Or(l, r) => {
            if expect_bool(eval_expr(l, scope)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(expect_bool(eval_expr(r, scope)?, "||")?))
        }
        Expr::Compare(op, l, r) => {
            let left = eval_expr(l, scope)?;
            let right = eval_expr(r, scope)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => match op {
            CompareOp::Eq => return Ok(a == b),
            CompareOp::Ne => return Ok(a != b),
            _ => {
                return Err(ExpressionError::TypeMismatch(format!(
                    "booleans do not support '{}'",
                    op.symbol()
                )));
            }
        },
        _ => {
            return Err(ExpressionError::TypeMismatch(format!(
                "cannot compare {} with {} using '{}'",
                left.type_name(),
                right.type_name(),
                op.symbol()
            )));
        }
    };

    // NaN compares unequal to everything.
    let Some(ordering) = ordering else {
        return Ok(op == CompareOp::Ne);
    };

    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Not,
    And,
    Or,
    Cmp(CompareOp),
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn lex(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (kind, width) = match c {
            '(' => (TokenKind::LParen, 1),
            ')' => (TokenKind::RParen, 1),
            '[' => (TokenKind::LBracket, 1),
            ']' => (TokenKind::RBracket, 1),
            '.' => (TokenKind::Dot, 1),
            '&' if next == Some('&') => (TokenKind::And, 2),
            '|' if next == Some('|') => (TokenKind::Or, 2),
            '=' if next == Some('=') => (TokenKind::Cmp(CompareOp::Eq), 2),
            '!' if next == Some('=') => (TokenKind::Cmp(CompareOp::Ne), 2),
            '!' => (TokenKind::Not, 1),
            '<' if next == Some('=') => (TokenKind::Cmp(CompareOp::Le), 2),
            '<' => (TokenKind::Cmp(CompareOp::Lt), 1),
            '>' if next == Some('=') => (TokenKind::Cmp(CompareOp::Ge), 2),
            '>' => (TokenKind::Cmp(CompareOp::Gt), 1),
            '\'' | '"' => {
                let quote = c;
                let mut j = i + 1;
                let mut text = String::new();
                loop {
                    match chars.get(j) {
                        None => return Err(parse_error(offset, "unterminated string literal")),
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, '\\')) => {
                            let Some((_, escaped)) = chars.get(j + 1) else {
                                return Err(parse_error(offset, "unterminated string literal"));
                            };
                            text.push(*escaped);
                            j += 2;
                        }
                        Some((_, ch)) => {
                            text.push(*ch);
                            j += 1;
                        }
                    }
                }
                (TokenKind::Str(text), j + 1 - i)
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                let mut seen_dot = false;
                while let Some((_, ch)) = chars.get(j) {
                    if ch.is_ascii_digit() {
                        j += 1;
                    } else if *ch == '.'
                        && !seen_dot
                        && chars.get(j + 1).is_some_and(|(_, n)| n.is_ascii_digit())
                    {
                        seen_dot = true;
                        j += 1;
                    } else {
                        break;
                    }
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
                let text = &source[offset..end];
                let number = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(offset, format!("invalid number '{text}'")))?;
                (TokenKind::Number(number), j - i)
            }
            c if is_ident_start(c) => {
                let mut j = i + 1;
                while chars.get(j).is_some_and(|(_, ch)| is_ident_continue(*ch)) {
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(source.len());
                let word = &source[offset..end];
                let kind = match word {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    _ => TokenKind::Ident(word.to_string()),
                };
                (kind, j - i)
            }
            other => return Err(parse_error(offset, format!("unexpected character '{other}'"))),
        };

        tokens.push(Token { kind, offset });
        i += width;
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().is_some_and(|t| &t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.eat(&TokenKind::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat(&TokenKind::Not) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token {
                kind: TokenKind::Cmp(op),
                ..
            }) => *op,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        if let Some(Token {
            kind: TokenKind::Cmp(_),
            offset,
        }) = self.peek()
        {
            return Err(parse_error(
                *offset,
                "comparisons cannot be chained; use parentheses with && or ||",
            ));
        }
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        let Some(tok) = self.next() else {
            return Err(parse_error(offset, "unexpected end of expression"));
        };
        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                if !self.eat(&TokenKind::RParen) {
                    return Err(parse_error(self.offset(), "expected ')'"));
                }
                Ok(inner)
            }
            TokenKind::Ident(first) => self.parse_path(first),
            other => Err(parse_error(tok.offset, format!("unexpected token {other:?}"))),
        }
    }

    fn parse_path(&mut self, first: String) -> Result<Expr, ExpressionError> {
        let mut segments = vec![first];
        loop {
            if self.eat(&TokenKind::Dot) {
                let offset = self.offset();
                match self.next().map(|t| t.kind) {
                    Some(TokenKind::Ident(seg)) => segments.push(seg),
                    // Keywords are valid field names after a dot.
                    Some(TokenKind::True) => segments.push("true".to_string()),
                    Some(TokenKind::False) => segments.push("false".to_string()),
                    Some(TokenKind::And) => segments.push("and".to_string()),
                    Some(TokenKind::Or) => segments.push("or".to_string()),
                    Some(TokenKind::Not) => segments.push("not".to_string()),
                    _ => return Err(parse_error(offset, "expected identifier after '.'")),
                }
            } else if self.eat(&TokenKind::LBracket) {
                let offset = self.offset();
                match self.next().map(|t| t.kind) {
                    Some(TokenKind::Str(seg)) => segments.push(seg),
                    _ => return Err(parse_error(offset, "expected string key inside '[ ]'")),
                }
                if !self.eat(&TokenKind::RBracket) {
                    return Err(parse_error(self.offset(), "expected ']'"));
                }
            } else {
                return Ok(Expr::Path(segments));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapScope(HashMap<String, Value>);

    impl Scope for MapScope {
        fn lookup(&self, path: &[String]) -> Result<Value, ExpressionError> {
            let key = path.join(".");
            self.0
                .get(&key)
                .cloned()
                .ok_or(ExpressionError::UnknownIdentifier(key))
        }
    }

    fn scope() -> MapScope {
        let mut vars = HashMap::new();
        vars.insert("steps.build.exit_status".to_string(), Value::Number(0.0));
        vars.insert(
            "steps.build.status".to_string(),
            Value::Str("succeeded".to_string()),
        );
        vars.insert("steps.test.metrics.coverage".to_string(), Value::Number(0.82));
        vars.insert("steps.lint-js.failed".to_string(), Value::Bool(false));
        vars.insert("inputs.env".to_string(), Value::Str("prod".to_string()));
        vars.insert("loop.iteration".to_string(), Value::Number(3.0));
        MapScope(vars)
    }

    fn eval(src: &str) -> Result<bool, ExpressionError> {
        Expression::parse(src)?.eval_bool(&scope())
    }

    #[test]
    fn test_simple_comparisons() {
        assert!(eval("steps.build.exit_status == 0").unwrap());
        assert!(eval("steps.test.metrics.coverage >= 0.8").unwrap());
        assert!(!eval("steps.test.metrics.coverage > 0.9").unwrap());
        assert!(eval("inputs.env == 'prod'").unwrap());
        assert!(eval("inputs.env != \"staging\"").unwrap());
        assert!(eval("loop.iteration < 4").unwrap());
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        // && binds tighter than ||
        assert!(eval("false && false || true").unwrap());
        assert!(!eval("false && (false || true)").unwrap());
        assert!(eval("not steps.lint-js.failed").unwrap());
        assert!(eval("!(inputs.env == 'dev') and steps.build.status == 'succeeded'").unwrap());
    }

    #[test]
    fn test_bracket_path_access() {
        assert!(eval("steps['build'].exit_status == 0").unwrap());
        assert!(!eval("steps[\"lint-js\"].failed").unwrap());
    }

    #[test]
    fn test_negative_number_literal() {
        assert!(eval("-1 < steps.build.exit_status").unwrap());
    }

    #[test]
    fn test_unknown_identifier_fails_closed() {
        let err = eval("steps.deploy.exit_status == 0").unwrap_err();
        assert_eq!(
            err,
            ExpressionError::UnknownIdentifier("steps.deploy.exit_status".to_string())
        );
    }

    #[test]
    fn test_short_circuit_skips_unknown_operand() {
        assert!(!eval("false && steps.missing.status == 'x'").unwrap());
        assert!(eval("true || steps.missing.status == 'x'").unwrap());
    }

    #[test]
    fn test_type_mismatch_errors() {
        assert!(matches!(
            eval("inputs.env > 3"),
            Err(ExpressionError::TypeMismatch(_))
        ));
        assert!(matches!(
            eval("steps.build.exit_status"),
            Err(ExpressionError::TypeMismatch(_))
        ));
        assert!(matches!(
            eval("!inputs.env"),
            Err(ExpressionError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        for src in [
            "",
            "(a == 1",
            "a ==",
            "a == 1 == 2",
            "a = 1",
            "'open",
            "a.",
            "a[1]",
            "a == 1 b",
        ] {
            assert!(
                matches!(Expression::parse(src), Err(ExpressionError::Parse { .. })),
                "expected parse error for {src:?}"
            );
        }
    }

    #[test]
    fn test_referenced_steps() {
        let expr = Expression::parse(
            "steps.build.exit_status == 0 && steps['lint-js'].failed == false || inputs.x == 1",
        )
        .unwrap();
        let refs: Vec<&str> = expr.referenced_steps().into_iter().collect();
        assert_eq!(refs, vec!["build", "lint-js"]);
        assert_eq!(expr.paths().len(), 3);
    }

    #[test]
    fn test_keyword_field_after_dot() {
        let expr = Expression::parse("flags.not == true").unwrap();
        assert_eq!(expr.paths()[0], ["flags".to_string(), "not".to_string()]);
    }
}
