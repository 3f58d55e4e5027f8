//! Parsed code blocks.
//!
//! [`Code`] is the unit `execute` runs. It is parsed once on the caller side
//! and travels to workers in its parsed form, so a worker never sees source
//! text it would have to re-parse.

use crate::config::types::ConfinedError;
use crate::exec::lexer::{self, Spanned, Token};
use crate::value::{Value, MAX_NESTING};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A parsed code block
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Code {
    statements: Vec<Stmt>,
}

impl Code {
    pub fn parse(source: &str) -> Result<Self, ConfinedError> {
        let tokens = lexer::tokenize(source)?;
        let statements = Parser {
            tokens,
            pos: 0,
            depth: 0,
        }
        .program()?;
        Ok(Self { statements })
    }

    pub(crate) fn statements(&self) -> &[Stmt] {
        &self.statements
    }

    /// Number of top-level statements
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Names of every function the block calls, builtins included
    pub fn called_functions(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for stmt in &self.statements {
            match stmt {
                Stmt::Assign { target, value } => {
                    for accessor in &target.path {
                        if let Accessor::Item(key) = accessor {
                            key.collect_calls(&mut names);
                        }
                    }
                    value.collect_calls(&mut names);
                }
                Stmt::Raise {
                    message: Some(message),
                    ..
                } => message.collect_calls(&mut names),
                Stmt::Expr(expr) => expr.collect_calls(&mut names),
                Stmt::Raise { message: None, .. } | Stmt::Delete(_) => {}
            }
        }
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl FromStr for Code {
    type Err = ConfinedError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Code::parse(source)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Stmt {
    Assign { target: Target, value: Expr },
    Delete(String),
    Raise { kind: String, message: Option<Expr> },
    Expr(Expr),
}

/// `root`, optionally followed by `.attr` / `[key]` steps
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Target {
    pub root: String,
    pub path: Vec<Accessor>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Accessor {
    Attr(String),
    Item(Expr),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Attr(Box<Expr>, String),
    Item(Box<Expr>, Box<Expr>),
    Call {
        function: String,
        args: Vec<Expr>,
        keywords: Vec<(String, Expr)>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Whether this expression spans more than `levels` levels of nesting.
    /// Never descends past `levels`, so long operator chains stay cheap.
    fn nests_deeper_than(&self, levels: usize) -> bool {
        let Some(inner) = levels.checked_sub(1) else {
            return true;
        };
        match self {
            Expr::Literal(value) => value.nests_deeper_than(levels),
            Expr::Name(_) => false,
            Expr::List(items) => items.iter().any(|item| item.nests_deeper_than(inner)),
            Expr::Map(entries) => entries.iter().any(|(_, item)| item.nests_deeper_than(inner)),
            Expr::Attr(base, _) | Expr::Unary(_, base) => base.nests_deeper_than(inner),
            Expr::Item(left, right)
            | Expr::Binary(_, left, right)
            | Expr::And(left, right)
            | Expr::Or(left, right) => {
                left.nests_deeper_than(inner) || right.nests_deeper_than(inner)
            }
            Expr::Call { args, keywords, .. } => {
                args.iter().any(|arg| arg.nests_deeper_than(inner))
                    || keywords.iter().any(|(_, arg)| arg.nests_deeper_than(inner))
            }
        }
    }

    fn collect_calls<'e>(&'e self, names: &mut Vec<&'e str>) {
        match self {
            Expr::Literal(_) | Expr::Name(_) => {}
            Expr::List(items) => items.iter().for_each(|item| item.collect_calls(names)),
            Expr::Map(entries) => entries.iter().for_each(|(_, item)| item.collect_calls(names)),
            Expr::Attr(base, _) | Expr::Unary(_, base) => base.collect_calls(names),
            Expr::Item(left, right)
            | Expr::Binary(_, left, right)
            | Expr::And(left, right)
            | Expr::Or(left, right) => {
                left.collect_calls(names);
                right.collect_calls(names);
            }
            Expr::Call {
                function,
                args,
                keywords,
            } => {
                names.push(function);
                args.iter().for_each(|arg| arg.collect_calls(names));
                keywords.iter().for_each(|(_, arg)| arg.collect_calls(names));
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Current recursion depth of the descent
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ConfinedError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, what: &str) -> ConfinedError {
        lexer::syntax_error(
            self.line(),
            format!("expected {}, found {}", what, describe(self.peek())),
        )
    }

    /// Enter one more level of recursion, refusing to go past `MAX_NESTING`
    fn descend(&mut self) -> Result<(), ConfinedError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(too_deep(self.line()));
        }
        Ok(())
    }

    fn ident(&mut self, what: &str) -> Result<String, ConfinedError> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn program(mut self) -> Result<Vec<Stmt>, ConfinedError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Newline) {}
            if *self.peek() == Token::Eof {
                return Ok(statements);
            }
            statements.push(self.statement()?);
            if !self.eat(&Token::Newline) {
                return Err(self.unexpected("end of statement"));
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, ConfinedError> {
        match self.peek() {
            Token::Del => {
                self.advance();
                Ok(Stmt::Delete(self.ident("a name after 'del'")?))
            }
            Token::Raise => {
                self.advance();
                let kind = self.ident("an error kind after 'raise'")?;
                let mut message = None;
                if self.eat(&Token::LParen) && !self.eat(&Token::RParen) {
                    message = Some(self.expr()?);
                    self.expect(&Token::RParen, "')'")?;
                }
                Ok(Stmt::Raise { kind, message })
            }
            _ => {
                let line = self.line();
                let expr = self.expr()?;
                if self.eat(&Token::Assign) {
                    let target = into_target(expr).ok_or_else(|| {
                        lexer::syntax_error(line, "cannot assign to expression")
                    })?;
                    let value = self.expr()?;
                    Ok(Stmt::Assign { target, value })
                } else {
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    /// A full expression, no deeper than `MAX_NESTING` once built
    fn expr(&mut self) -> Result<Expr, ConfinedError> {
        let line = self.line();
        self.descend()?;
        let expr = self.or_expr()?;
        self.depth -= 1;
        if expr.nests_deeper_than(MAX_NESTING) {
            return Err(too_deep(line));
        }
        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr, ConfinedError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ConfinedError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ConfinedError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let operand = self.not_expr()?;
            self.depth -= 1;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ConfinedError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr, ConfinedError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn term(&mut self) -> Result<Expr, ConfinedError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::DoubleSlash => BinaryOp::FloorDiv,
                Token::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ConfinedError> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let operand = self.unary()?;
            self.depth -= 1;
            return Ok(match operand {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Float(f)) => Expr::Literal(Value::Float(-f)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ConfinedError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let name = self.ident("an attribute name after '.'")?;
                expr = Expr::Attr(Box::new(expr), name);
            } else if self.eat(&Token::LBracket) {
                let key = self.expr()?;
                self.expect(&Token::RBracket, "']'")?;
                expr = Expr::Item(Box::new(expr), Box::new(key));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ConfinedError> {
        let line = self.line();
        match self.advance() {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::None => Ok(Expr::Literal(Value::None)),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    self.call(name)
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while !self.eat(&Token::RBracket) {
                    items.push(self.expr()?);
                    if !self.eat(&Token::Comma) {
                        self.expect(&Token::RBracket, "',' or ']'")?;
                        break;
                    }
                }
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                while !self.eat(&Token::RBrace) {
                    let key = match self.advance() {
                        Token::Str(key) => key,
                        other => {
                            return Err(lexer::syntax_error(
                                line,
                                format!("map keys must be string literals, found {}", describe(&other)),
                            ))
                        }
                    };
                    self.expect(&Token::Colon, "':'")?;
                    entries.push((key, self.expr()?));
                    if !self.eat(&Token::Comma) {
                        self.expect(&Token::RBrace, "',' or '}'")?;
                        break;
                    }
                }
                Ok(Expr::Map(entries))
            }
            other => Err(lexer::syntax_error(
                line,
                format!("expected an expression, found {}", describe(&other)),
            )),
        }
    }

    /// Arguments after `name(`; positional arguments must come first
    fn call(&mut self, function: String) -> Result<Expr, ConfinedError> {
        let mut args = Vec::new();
        let mut keywords: Vec<(String, Expr)> = Vec::new();
        while !self.eat(&Token::RParen) {
            let is_keyword = matches!(self.peek(), Token::Ident(_))
                && self.tokens.get(self.pos + 1).map(|s| &s.token) == Some(&Token::Assign);
            if is_keyword {
                let name = self.ident("a keyword name")?;
                self.advance();
                if keywords.iter().any(|(existing, _)| *existing == name) {
                    return Err(lexer::syntax_error(
                        self.line(),
                        format!("keyword argument repeated: {}", name),
                    ));
                }
                keywords.push((name, self.expr()?));
            } else {
                if !keywords.is_empty() {
                    return Err(lexer::syntax_error(
                        self.line(),
                        "positional argument follows keyword argument",
                    ));
                }
                args.push(self.expr()?);
            }
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RParen, "',' or ')'")?;
                break;
            }
        }
        Ok(Expr::Call {
            function,
            args,
            keywords,
        })
    }
}

fn into_target(expr: Expr) -> Option<Target> {
    let mut path = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Name(root) => {
                path.reverse();
                return Some(Target { root, path });
            }
            Expr::Attr(base, name) => {
                path.push(Accessor::Attr(name));
                current = *base;
            }
            Expr::Item(base, key) => {
                path.push(Accessor::Item(*key));
                current = *base;
            }
            _ => return None,
        }
    }
}

fn too_deep(line: usize) -> ConfinedError {
    lexer::syntax_error(
        line,
        format!("expression nested too deeply (limit {} levels)", MAX_NESTING),
    )
}

fn describe(token: &Token) -> String {
    match token {
        Token::Int(i) => format!("number {}", i),
        Token::Float(f) => format!("number {}", f),
        Token::Str(s) => format!("string {:?}", s),
        Token::Ident(name) => format!("name '{}'", name),
        Token::Newline => "end of line".to_string(),
        Token::Eof => "end of input".to_string(),
        other => format!("{:?}", other),
    }
}
