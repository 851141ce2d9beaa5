//! Lexer and recursive-descent parser for the closed expression grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | postfix
//! postfix := primary ('.' IDENT '(' args? ')')*
//! primary := NUMBER | STRING | CHANNEL | '(' expr ')' | IDENT '(' args? ')'
//! args    := expr (',' expr)*
//! ```

use super::rewrite::{ChannelRef, Rewritten, Segment};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Channel(ChannelRef),
    Plus,
    Minus,
    Star,
    Slash,
    Dot,
    Comma,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Channel(ChannelRef),
    Neg(Box<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
    Method { target: Box<Expr>, name: String, args: Vec<Expr> },
}

pub fn parse(rewritten: &Rewritten) -> Result<Expr, String> {
    let tokens = lex(rewritten)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected {} after end of expression", describe(token))),
    }
}

pub fn lex(rewritten: &Rewritten) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    for segment in &rewritten.segments {
        match segment {
            Segment::Channel(channel) => tokens.push(Token::Channel(channel.clone())),
            Segment::Text(text) => lex_text(text, &mut tokens)?,
        }
    }
    Ok(tokens)
}

fn lex_text(text: &str, tokens: &mut Vec<Token>) -> Result<(), String> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '+' => push(tokens, Token::Plus, &mut i),
            '-' => push(tokens, Token::Minus, &mut i),
            '*' => push(tokens, Token::Star, &mut i),
            '/' => push(tokens, Token::Slash, &mut i),
            ',' => push(tokens, Token::Comma, &mut i),
            '(' => push(tokens, Token::LParen, &mut i),
            ')' => push(tokens, Token::RParen, &mut i),
            '.' if !starts_number(tokens, chars.get(i + 1)) => push(tokens, Token::Dot, &mut i),
            '\'' | '"' => {
                let quote = ch;
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|c| *c == quote)
                    .map(|offset| start + offset)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent: 1e3, 2.5E-4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", literal))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(())
}

fn push(tokens: &mut Vec<Token>, token: Token, i: &mut usize) {
    tokens.push(token);
    *i += 1;
}

/// A '.' starts a number only where a value may begin and a digit follows.
fn starts_number(tokens: &[Token], next: Option<&char>) -> bool {
    let digit_follows = next.map_or(false, |c| c.is_ascii_digit());
    let value_expected = !matches!(
        tokens.last(),
        Some(Token::Number(_) | Token::Str(_) | Token::Ident(_) | Token::Channel(_) | Token::RParen)
    );
    digit_follows && value_expected
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {}", n),
        Token::Str(s) => format!("string '{}'", s),
        Token::Ident(name) => format!("identifier '{}'", name),
        Token::Channel(channel) => format!("channel {}", channel.name),
        Token::Plus => "'+'".to_string(),
        Token::Minus => "'-'".to_string(),
        Token::Star => "'*'".to_string(),
        Token::Slash => "'/'".to_string(),
        Token::Dot => "'.'".to_string(),
        Token::Comma => "','".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
    }
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
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        if self.eat(&expected) {
            return Ok(());
        }
        match self.peek() {
            Some(found) => Err(format!("expected {}, found {}", describe(&expected), describe(found))),
            None => Err(format!("expected {}, found end of expression", describe(&expected))),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut target = self.primary()?;
        while self.eat(&Token::Dot) {
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                Some(other) => return Err(format!("expected method name after '.', found {}", describe(&other))),
                None => return Err("expected method name after '.'".to_string()),
            };
            self.expect(Token::LParen)?;
            let args = self.args()?;
            target = Expr::Method { target: Box::new(target), name, args };
        }
        Ok(target)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Number(value)),
            Some(Token::Str(text)) => Ok(Expr::Str(text)),
            Some(Token::Channel(channel)) => Ok(Expr::Channel(channel)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Err(format!("unknown name '{}'", name))
                }
            }
            Some(other) => Err(format!("unexpected {}", describe(&other))),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    /// Arguments after an opening parenthesis, consuming the closing one.
    fn args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(args);
        }
    }
}
