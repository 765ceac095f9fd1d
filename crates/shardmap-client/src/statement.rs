//! Statement language understood by the bundled connectors.
//!
//! ```text
//! SELECT * FROM <table>
//! INSERT INTO <table> VALUES (<literal>, ...)
//! DELETE FROM <table>
//! ```
//!
//! Keywords are case-insensitive and a trailing `;` is accepted. Literals are
//! integers, floats, `'text'` (with `''` as escaped quote), `TRUE`, `FALSE`
//! and `NULL`.

use crate::value::{Row, Value};
use shardmap_common::{Error, Result};

/// Parsed statement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Statement {
    Select { table: String },
    Insert { table: String, values: Row },
    Delete { table: String },
}

impl Statement {
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        Parser { tokens, pos: 0 }.statement()
    }

    /// Target table name as written
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Select { table } | Self::Insert { table, .. } | Self::Delete { table } => table,
        }
    }

    /// Whether the statement produces rows
    #[must_use]
    pub const fn is_query(&self) -> bool {
        matches!(self, Self::Select { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(char),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if !(c.is_ascii_alphanumeric() || c == '_') {
                    break;
                }
                end = i + c.len_utf8();
                chars.next();
            }
            tokens.push(Token::Ident(text[start..end].to_string()));
        } else if c.is_ascii_digit() || c == '-' {
            let mut end = start + 1;
            chars.next();
            let mut is_float = false;
            while let Some(&(i, c)) = chars.peek() {
                if c == '.' && !is_float {
                    is_float = true;
                } else if !c.is_ascii_digit() {
                    break;
                }
                end = i + 1;
                chars.next();
            }
            let literal = &text[start..end];
            let token = if is_float {
                literal.parse().map(Token::Float).ok()
            } else {
                literal.parse().map(Token::Int).ok()
            };
            tokens.push(
                token.ok_or_else(|| Error::query(format!("invalid number literal '{literal}'")))?,
            );
        } else if c == '\'' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some((_, '\'')) => {
                        if chars.peek().is_some_and(|&(_, c)| c == '\'') {
                            chars.next();
                            value.push('\'');
                        } else {
                            break;
                        }
                    }
                    Some((_, c)) => value.push(c),
                    None => return Err(Error::query("unterminated string literal")),
                }
            }
            tokens.push(Token::Str(value));
        } else if matches!(c, '(' | ')' | ',' | '*' | ';') {
            chars.next();
            tokens.push(Token::Symbol(c));
        } else {
            return Err(Error::query(format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn statement(mut self) -> Result<Statement> {
        let keyword = self.ident()?;
        let statement = match keyword.to_ascii_uppercase().as_str() {
            "SELECT" => {
                self.symbol('*')?;
                self.keyword("FROM")?;
                Statement::Select {
                    table: self.ident()?,
                }
            }
            "INSERT" => {
                self.keyword("INTO")?;
                let table = self.ident()?;
                self.keyword("VALUES")?;
                self.symbol('(')?;
                let mut values = vec![self.literal()?];
                while self.eat_symbol(',') {
                    values.push(self.literal()?);
                }
                self.symbol(')')?;
                Statement::Insert { table, values }
            }
            "DELETE" => {
                self.keyword("FROM")?;
                Statement::Delete {
                    table: self.ident()?,
                }
            }
            other => return Err(Error::query(format!("unsupported statement '{other}'"))),
        };

        self.eat_symbol(';');
        if let Some(token) = self.tokens.get(self.pos) {
            return Err(Error::query(format!("unexpected trailing {token:?}")));
        }
        Ok(statement)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(Error::query(format!("expected identifier, found {other:?}"))),
        }
    }

    fn keyword(&mut self, expected: &str) -> Result<()> {
        let ident = self.ident()?;
        if ident.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::query(format!("expected {expected}, found '{ident}'")))
        }
    }

    fn symbol(&mut self, expected: char) -> Result<()> {
        if self.eat_symbol(expected) {
            Ok(())
        } else {
            Err(Error::query(format!(
                "expected '{expected}', found {:?}",
                self.tokens.get(self.pos)
            )))
        }
    }

    fn eat_symbol(&mut self, expected: char) -> bool {
        if self.tokens.get(self.pos) == Some(&Token::Symbol(expected)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn literal(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::Str(s)) => Ok(Value::Text(s)),
            Some(Token::Ident(word)) => match word.to_ascii_uppercase().as_str() {
                "NULL" => Ok(Value::Null),
                "TRUE" => Ok(Value::Bool(true)),
                "FALSE" => Ok(Value::Bool(false)),
                _ => Err(Error::query(format!("unexpected identifier '{word}'"))),
            },
            other => Err(Error::query(format!("expected literal, found {other:?}"))),
        }
    }
}
