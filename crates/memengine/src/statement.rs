//! The handful of statements the engine understands.
//!
//! There's no real SQL here. Statements are split into tokens and matched
//! against a fixed set of shapes.

use std::fmt;

use nativesrv::block::DataType;

use crate::errors::{MemEngineError, Result};

/// Default number of rows per mark.
pub const DEFAULT_INDEX_GRANULARITY: u64 = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: Option<String>,
    pub table: String,
}

impl TableRef {
    fn parse(name: &str) -> Self {
        match name.split_once('.') {
            Some((database, table)) => TableRef {
                database: Some(database.to_string()),
                table: table.to_string(),
            },
            None => TableRef {
                database: None,
                table: name.to_string(),
            },
        }
    }

    /// Database of this table, `current` if the statement didn't name one.
    pub fn database_or<'a>(&'a self, current: &'a str) -> &'a str {
        self.database.as_deref().unwrap_or(current)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.database {
            Some(db) => write!(f, "{db}.{}", self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSettings {
    /// Inserts fail once the table has this many parts.
    pub parts_to_throw_insert: Option<usize>,
    pub index_granularity: u64,
}

impl Default for TableSettings {
    fn default() -> Self {
        TableSettings {
            parts_to_throw_insert: None,
            index_granularity: DEFAULT_INDEX_GRANULARITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `SELECT <int>`
    SelectLiteral { text: String, value: i64 },
    /// `SELECT * FROM <table>`
    SelectAll(TableRef),
    /// `SELECT count() FROM <table>`
    SelectCount(TableRef),
    /// `SELECT number FROM system.numbers [LIMIT n]`
    SelectNumbers { limit: Option<u64> },
    /// `SELECT sum(number) FROM system.numbers [LIMIT n]`
    SumNumbers { limit: Option<u64> },
    CreateDatabase(String),
    CreateTable {
        table: TableRef,
        columns: Vec<(String, DataType)>,
        settings: TableSettings,
    },
    /// `INSERT INTO <table> [VALUES | FORMAT Native]`, data follows from the
    /// client.
    Insert(TableRef),
    /// `INSERT INTO <table> SELECT * FROM input()`
    InsertFromInput(TableRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Number(String),
    Punct(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(s) | Token::Number(s) => f.write_str(s),
            Token::Punct(c) => write!(f, "{c}"),
        }
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ';' {
            chars.next();
        } else if c.is_ascii_digit() || c == '-' {
            let mut num = String::new();
            num.push(c);
            chars.next();
            while let Some(&d) = chars.peek() {
                if !d.is_ascii_digit() {
                    break;
                }
                num.push(d);
                chars.next();
            }
            if num == "-" {
                return Err(MemEngineError::Syntax("unexpected '-'".to_string()));
            }
            tokens.push(Token::Number(num));
        } else if c.is_alphanumeric() || c == '_' {
            let mut word = String::new();
            while let Some(&d) = chars.peek() {
                if !(d.is_alphanumeric() || d == '_' || d == '.') {
                    break;
                }
                word.push(d);
                chars.next();
            }
            tokens.push(Token::Word(word));
        } else if "()*,=".contains(c) {
            tokens.push(Token::Punct(c));
            chars.next();
        } else {
            return Err(MemEngineError::Syntax(format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
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
        self.pos += 1;
        tok
    }

    fn unexpected<T>(&self, expected: &str) -> Result<T> {
        match self.peek() {
            Some(tok) => Err(MemEngineError::Syntax(format!(
                "expected {expected}, found '{tok}'"
            ))),
            None => Err(MemEngineError::Syntax(format!(
                "expected {expected}, found end of query"
            ))),
        }
    }

    fn parse_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.parse_keyword(keyword) {
            Ok(())
        } else {
            self.unexpected(keyword)
        }
    }

    fn parse_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        if self.parse_punct(c) {
            Ok(())
        } else {
            self.unexpected(&format!("'{c}'"))
        }
    }

    fn expect_word(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Token::Word(_)) => match self.next() {
                Some(Token::Word(w)) => Ok(w),
                _ => self.unexpected(what),
            },
            _ => self.unexpected(what),
        }
    }

    fn expect_number(&mut self) -> Result<u64> {
        match self.next() {
            Some(Token::Number(n)) => n
                .parse()
                .map_err(|_| MemEngineError::Syntax(format!("invalid number '{n}'"))),
            _ => {
                self.pos -= 1;
                self.unexpected("number")
            }
        }
    }

    fn expect_end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(_) => self.unexpected("end of query"),
        }
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        if self.parse_keyword("SELECT") {
            self.parse_select()
        } else if self.parse_keyword("CREATE") {
            self.parse_create()
        } else if self.parse_keyword("INSERT") {
            self.parse_insert()
        } else {
            self.unexpected("SELECT, CREATE or INSERT")
        }
    }

    fn parse_select(&mut self) -> Result<Statement> {
        if let Some(Token::Number(text)) = self.peek().cloned() {
            self.pos += 1;
            self.expect_end()?;
            let value = text
                .parse()
                .map_err(|_| MemEngineError::Syntax(format!("integer out of range: {text}")))?;
            return Ok(Statement::SelectLiteral { text, value });
        }

        if self.parse_punct('*') {
            self.expect_keyword("FROM")?;
            let table = TableRef::parse(&self.expect_word("table name")?);
            self.expect_end()?;
            return Ok(Statement::SelectAll(table));
        }

        if self.parse_keyword("count") {
            self.expect_punct('(')?;
            self.expect_punct(')')?;
            self.expect_keyword("FROM")?;
            let table = TableRef::parse(&self.expect_word("table name")?);
            self.expect_end()?;
            return Ok(Statement::SelectCount(table));
        }

        let sum = if self.parse_keyword("number") {
            false
        } else if self.parse_keyword("sum") {
            self.expect_punct('(')?;
            self.expect_keyword("number")?;
            self.expect_punct(')')?;
            true
        } else {
            return self.unexpected("select expression");
        };
        self.expect_keyword("FROM")?;
        self.expect_keyword("system.numbers")?;
        let limit = if self.parse_keyword("LIMIT") {
            Some(self.expect_number()?)
        } else {
            None
        };
        self.expect_end()?;
        Ok(if sum {
            Statement::SumNumbers { limit }
        } else {
            Statement::SelectNumbers { limit }
        })
    }

    fn parse_create(&mut self) -> Result<Statement> {
        if self.parse_keyword("DATABASE") {
            let name = self.expect_word("database name")?;
            self.expect_end()?;
            return Ok(Statement::CreateDatabase(name));
        }

        self.expect_keyword("TABLE")?;
        let table = TableRef::parse(&self.expect_word("table name")?);
        self.expect_punct('(')?;
        let mut columns = Vec::new();
        loop {
            let name = self.expect_word("column name")?;
            let typ = self.expect_word("column type")?;
            let typ: DataType = typ
                .parse()
                .map_err(|_| MemEngineError::Syntax(format!("unknown type '{typ}'")))?;
            columns.push((name, typ));
            if !self.parse_punct(',') {
                break;
            }
        }
        self.expect_punct(')')?;

        if self.parse_keyword("ENGINE") {
            self.expect_punct('=')?;
            self.expect_word("engine name")?;
            if self.parse_punct('(') {
                self.expect_punct(')')?;
            }
        }

        let mut settings = TableSettings::default();
        if self.parse_keyword("SETTINGS") {
            loop {
                let name = self.expect_word("setting name")?;
                self.expect_punct('=')?;
                let value = self.expect_number()?;
                match name.as_str() {
                    "parts_to_throw_insert" => settings.parts_to_throw_insert = Some(value as usize),
                    "index_granularity" => settings.index_granularity = value.max(1),
                    other => {
                        return Err(MemEngineError::Syntax(format!(
                            "unknown table setting '{other}'"
                        )));
                    }
                }
                if !self.parse_punct(',') {
                    break;
                }
            }
        }
        self.expect_end()?;

        Ok(Statement::CreateTable {
            table,
            columns,
            settings,
        })
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_keyword("INTO")?;
        let table = TableRef::parse(&self.expect_word("table name")?);

        if self.parse_keyword("SELECT") {
            self.expect_punct('*')?;
            self.expect_keyword("FROM")?;
            self.expect_keyword("input")?;
            self.expect_punct('(')?;
            self.expect_punct(')')?;
            self.expect_end()?;
            return Ok(Statement::InsertFromInput(table));
        }

        if self.parse_keyword("FORMAT") {
            self.expect_keyword("Native")?;
        } else {
            self.parse_keyword("VALUES");
        }
        self.expect_end()?;
        Ok(Statement::Insert(table))
    }
}

pub fn parse(sql: &str) -> Result<Statement> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
    };
    parser.parse_statement()
}
