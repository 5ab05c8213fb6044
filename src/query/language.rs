//! # Query Language: Lexer and Parser
//!
//! The boolean attribute language, e.g.:
//!
//! ```text
//! (type = "document" || type = "image") && !(version = 0)
//! category in ("reports" "images") && $owner = 0xAB..CD
//! name ~ "inv-*" && $expiration >= 1100
//! ```
//!
//! Lexing and parsing are hand-written: a small token set and a
//! recursive-descent parser that mirrors the grammar one function per rule.
//! The parser produces the surface tree ([`TopLevel`]); DNF normalization
//! lives in the sibling `normalize` module.
//!
//! Grammar (precedence low to high):
//!
//! ```text
//! TopLevel   = Expression | '$all' | '*'
//! Expression = AndGroup (('||'|'OR'|'or') AndGroup)*
//! AndGroup   = Term (('&&'|'AND'|'and') Term)*
//! Term       = ['!'|'NOT'|'not'] '(' Expression ')'
//!            | Ident ('='|'=='|'!=') Value
//!            | Ident ['NOT'|'not'] ('IN'|'in') '(' Value+ ')'
//!            | Ident ('<'|'<='|'>'|'>=') Value
//!            | Ident ('~'|'!~'| ['NOT'|'not'] ('GLOB'|'glob')) String
//! Value      = String | EntityKey | Address | Number
//! ```
//!
//! Entity keys (66 chars) and addresses (42 chars) are hex literals and are
//! string-typed values; `IN` lists must be all string-typed or all numeric.

use crate::error::{Error, Result};

// =============================================================================
// Tokens
// =============================================================================

/// Reserved `$`-prefixed attribute names accepted by the lexer.
const DOLLAR_IDENTS: &[&str] = &[
    "$owner",
    "$creator",
    "$key",
    "$expiration",
    "$sequence",
    "$all",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    LParen,
    RParen,
    /// `&&`
    AndOp,
    /// `||`
    OrOp,
    /// `=` or `==`
    Eq,
    /// `!=`
    Neq,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `~`
    GlobOp,
    /// `!~`
    NotGlobOp,
    /// `!`
    Bang,
    KwAnd,
    KwOr,
    KwNot,
    KwIn,
    KwGlob,
    /// Quoted string, unescaped.
    Str(String),
    Number(u64),
    /// `0x` + 64 hex digits, kept as written.
    EntityKey(String),
    /// `0x` + 40 hex digits, kept as written.
    Address(String),
    /// Attribute name, including the reserved `$` names.
    Ident(String),
    /// `$all`
    All,
    /// `*`
    Star,
}

// =============================================================================
// Lexer
// =============================================================================

pub fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '&' => {
                chars.next();
                match chars.next_if(|&(_, c)| c == '&') {
                    Some(_) => tokens.push(Token::AndOp),
                    None => return Err(unexpected_char('&', pos)),
                }
            }
            '|' => {
                chars.next();
                match chars.next_if(|&(_, c)| c == '|') {
                    Some(_) => tokens.push(Token::OrOp),
                    None => return Err(unexpected_char('|', pos)),
                }
            }
            '=' => {
                chars.next();
                // `=` and `==` are the same operator.
                chars.next_if(|&(_, c)| c == '=');
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    tokens.push(Token::Neq);
                } else if chars.next_if(|&(_, c)| c == '~').is_some() {
                    tokens.push(Token::NotGlobOp);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '~' => {
                chars.next();
                tokens.push(Token::GlobOp);
            }
            '"' => tokens.push(lex_string(&mut chars, pos)?),
            '$' => tokens.push(lex_dollar_ident(&mut chars, pos)?),
            '0'..='9' => tokens.push(lex_number_or_hex(&mut chars, pos)?),
            c if c.is_alphabetic() || c == '_' => tokens.push(lex_ident(&mut chars)),
            other => return Err(unexpected_char(other, pos)),
        }
    }

    Ok(tokens)
}

fn unexpected_char(c: char, pos: usize) -> Error {
    Error::Parse(format!("unexpected character {c:?} at offset {pos}"))
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    start: usize,
) -> Result<Token> {
    chars.next(); // opening quote
    let mut out = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(Error::Parse(format!(
                    "unterminated string literal starting at offset {start}"
                )))
            }
            Some((_, '"')) => return Ok(Token::Str(out)),
            Some((pos, '\\')) => match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, '"')) => out.push('"'),
                Some((_, other)) => {
                    return Err(Error::Parse(format!(
                        "invalid escape sequence \\{other} at offset {pos}"
                    )))
                }
                None => {
                    return Err(Error::Parse(format!(
                        "unterminated string literal starting at offset {start}"
                    )))
                }
            },
            Some((_, c)) => out.push(c),
        }
    }
}

fn lex_dollar_ident(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    start: usize,
) -> Result<Token> {
    chars.next(); // '$'
    let mut name = String::from("$");
    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if name == "$all" {
        return Ok(Token::All);
    }
    if DOLLAR_IDENTS.contains(&name.as_str()) {
        return Ok(Token::Ident(name));
    }
    Err(Error::Parse(format!(
        "unknown attribute {name:?} at offset {start}"
    )))
}

fn lex_number_or_hex(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    start: usize,
) -> Result<Token> {
    let mut digits = String::new();
    let (_, first) = chars.next().expect("caller peeked a digit");
    digits.push(first);

    // `0x...` hex literal: an entity key or an address, by digit count.
    if first == '0' && chars.peek().map(|&(_, c)| c) == Some('x') {
        chars.next();
        let mut hex = String::from("0x");
        while let Some(&(_, c)) = chars.peek() {
            if c.is_ascii_hexdigit() {
                hex.push(c);
                chars.next();
            } else {
                break;
            }
        }
        return match hex.len() - 2 {
            64 => Ok(Token::EntityKey(hex)),
            40 => Ok(Token::Address(hex)),
            n => Err(Error::Parse(format!(
                "hex literal at offset {start} has {n} digits, expected 40 (address) or 64 (entity key)"
            ))),
        };
    }

    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            chars.next();
        } else {
            break;
        }
    }
    digits
        .parse::<u64>()
        .map(Token::Number)
        .map_err(|_| Error::Parse(format!("number at offset {start} does not fit in 64 bits")))
}

fn lex_ident(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Token {
    let mut name = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if c.is_alphanumeric() || c == '_' {
            name.push(c);
            chars.next();
        } else {
            break;
        }
    }
    match name.as_str() {
        "AND" | "and" => Token::KwAnd,
        "OR" | "or" => Token::KwOr,
        "NOT" | "not" => Token::KwNot,
        "IN" | "in" => Token::KwIn,
        "GLOB" | "glob" => Token::KwGlob,
        _ => Token::Ident(name),
    }
}

// =============================================================================
// Surface tree
// =============================================================================

/// A whole query: either the universe or a boolean expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopLevel {
    /// `$all` / `*`: every live entity.
    All,
    Expression(Expression),
}

/// Disjunction of conjunctions of terms, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub or: Vec<AndGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndGroup {
    pub terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A (possibly negated) parenthesized sub-expression.
    Paren { negated: bool, expr: Expression },
    Atom(Atom),
}

/// A leaf predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    Equality {
        name: String,
        negated: bool,
        value: Value,
    },
    Inclusion {
        name: String,
        negated: bool,
        values: Values,
    },
    Compare {
        name: String,
        op: CompareOp,
        value: Value,
    },
    Glob {
        name: String,
        negated: bool,
        pattern: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// A literal value. Entity keys and addresses are string-typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Number(u64),
}

/// A homogeneous `IN` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Values {
    Strings(Vec<String>),
    Numbers(Vec<u64>),
}

// =============================================================================
// Parser
// =============================================================================

/// Parses a query string into its surface tree.
pub fn parse(input: &str) -> Result<TopLevel> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };

    // `$all` / `*` are only valid as the entire query.
    if matches!(parser.peek(), Some(Token::All) | Some(Token::Star)) && parser.tokens.len() == 1 {
        return Ok(TopLevel::All);
    }

    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(TopLevel::Expression(expr)),
        Some(tok) => Err(Error::Parse(format!(
            "unexpected trailing token {tok:?}"
        ))),
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
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(Error::Parse(format!(
                "expected {expected:?}, found {tok:?}"
            ))),
            None => Err(Error::Parse(format!(
                "expected {expected:?}, found end of query"
            ))),
        }
    }

    fn parse_expression(&mut self) -> Result<Expression> {
        let mut or = vec![self.parse_and_group()?];
        while self.eat(&Token::OrOp) || self.eat(&Token::KwOr) {
            or.push(self.parse_and_group()?);
        }
        Ok(Expression { or })
    }

    fn parse_and_group(&mut self) -> Result<AndGroup> {
        let mut terms = vec![self.parse_term()?];
        while self.eat(&Token::AndOp) || self.eat(&Token::KwAnd) {
            terms.push(self.parse_term()?);
        }
        Ok(AndGroup { terms })
    }

    fn parse_term(&mut self) -> Result<Term> {
        // A leading `!`/`NOT` at term position negates a parenthesized
        // sub-expression; negation of an atom is spelled in its operator.
        if self.eat(&Token::Bang) || self.eat(&Token::KwNot) {
            self.expect(Token::LParen)?;
            let expr = self.parse_expression()?;
            self.expect(Token::RParen)?;
            return Ok(Term::Paren {
                negated: true,
                expr,
            });
        }
        if self.eat(&Token::LParen) {
            let expr = self.parse_expression()?;
            self.expect(Token::RParen)?;
            return Ok(Term::Paren {
                negated: false,
                expr,
            });
        }
        self.parse_atom().map(Term::Atom)
    }

    fn parse_atom(&mut self) -> Result<Atom> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            Some(tok) => {
                return Err(Error::Parse(format!(
                    "expected attribute name, found {tok:?}"
                )))
            }
            None => return Err(Error::Parse("expected attribute name, found end of query".into())),
        };

        match self.next() {
            Some(Token::Eq) => Ok(Atom::Equality {
                name,
                negated: false,
                value: self.parse_value()?,
            }),
            Some(Token::Neq) => Ok(Atom::Equality {
                name,
                negated: true,
                value: self.parse_value()?,
            }),
            Some(Token::Lt) => Ok(Atom::Compare {
                name,
                op: CompareOp::Lt,
                value: self.parse_value()?,
            }),
            Some(Token::Le) => Ok(Atom::Compare {
                name,
                op: CompareOp::Le,
                value: self.parse_value()?,
            }),
            Some(Token::Gt) => Ok(Atom::Compare {
                name,
                op: CompareOp::Gt,
                value: self.parse_value()?,
            }),
            Some(Token::Ge) => Ok(Atom::Compare {
                name,
                op: CompareOp::Ge,
                value: self.parse_value()?,
            }),
            Some(Token::GlobOp) => Ok(Atom::Glob {
                name,
                negated: false,
                pattern: self.parse_glob_pattern()?,
            }),
            Some(Token::NotGlobOp) => Ok(Atom::Glob {
                name,
                negated: true,
                pattern: self.parse_glob_pattern()?,
            }),
            Some(Token::KwGlob) => Ok(Atom::Glob {
                name,
                negated: false,
                pattern: self.parse_glob_pattern()?,
            }),
            Some(Token::KwIn) => Ok(Atom::Inclusion {
                name,
                negated: false,
                values: self.parse_inclusion_values()?,
            }),
            Some(Token::KwNot) => match self.next() {
                Some(Token::KwIn) => Ok(Atom::Inclusion {
                    name,
                    negated: true,
                    values: self.parse_inclusion_values()?,
                }),
                Some(Token::KwGlob) => Ok(Atom::Glob {
                    name,
                    negated: true,
                    pattern: self.parse_glob_pattern()?,
                }),
                other => Err(Error::Parse(format!(
                    "expected IN or GLOB after NOT, found {other:?}"
                ))),
            },
            other => Err(Error::Parse(format!(
                "expected an operator after {name:?}, found {other:?}"
            ))),
        }
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::EntityKey(s)) | Some(Token::Address(s)) => Ok(Value::String(s)),
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            other => Err(Error::Parse(format!("expected a value, found {other:?}"))),
        }
    }

    fn parse_glob_pattern(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(Error::Parse(format!(
                "glob patterns must be string literals, found {other:?}"
            ))),
        }
    }

    /// `'(' Value+ ')'`, all string-typed or all numeric.
    fn parse_inclusion_values(&mut self) -> Result<Values> {
        self.expect(Token::LParen)?;
        let mut values = Vec::new();
        loop {
            if self.eat(&Token::RParen) {
                break;
            }
            values.push(self.parse_value()?);
        }
        if values.is_empty() {
            return Err(Error::Parse("IN list must contain at least one value".into()));
        }

        let all_strings = values.iter().all(|v| matches!(v, Value::String(_)));
        let all_numbers = values.iter().all(|v| matches!(v, Value::Number(_)));
        if all_strings {
            Ok(Values::Strings(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::String(s) => s,
                        Value::Number(_) => unreachable!("checked all_strings"),
                    })
                    .collect(),
            ))
        } else if all_numbers {
            Ok(Values::Numbers(
                values
                    .into_iter()
                    .map(|v| match v {
                        Value::Number(n) => n,
                        Value::String(_) => unreachable!("checked all_numbers"),
                    })
                    .collect(),
            ))
        } else {
            Err(Error::Type(
                "IN list mixes string and numeric values".into(),
            ))
        }
    }
}
