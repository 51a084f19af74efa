//! Search filter AST
//!
//! Covers the operator subset the gateway acts on: equality, presence,
//! `&`, `|` and `!`. Any other assertion (substring, ordering, approximate,
//! extensible) is carried verbatim as [`Filter::Other`] so it still renders
//! back to text for providers that want the raw string.

use ldap3_proto::proto::LdapFilter;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Present(String),
    /// Unmodeled assertion in its textual form, parentheses included
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter at offset {offset}: {message}")]
pub struct FilterParseError {
    pub offset: usize,
    pub message: String,
}

impl Filter {
    /// Parse an RFC 4515 style string. A bare `attr=value` without
    /// surrounding parentheses is accepted.
    pub fn parse(input: &str) -> Result<Filter, FilterParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FilterParseError {
                offset: 0,
                message: "empty filter".to_string(),
            });
        }

        let mut parser = Parser {
            src: trimmed.as_bytes(),
            pos: 0,
        };
        let filter = if trimmed.starts_with('(') {
            parser.filter()?
        } else {
            parser.item(trimmed.len())?
        };
        if parser.pos != trimmed.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(filter)
    }

    /// Depth-first search for a node satisfying `pred`.
    pub fn any(&self, pred: &dyn Fn(&Filter) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Filter::And(items) | Filter::Or(items) => items.iter().any(|f| f.any(pred)),
            Filter::Not(inner) => inner.any(pred),
            _ => false,
        }
    }

    /// First equality value for `attr` (case-insensitive), anywhere in the tree.
    pub fn equality_value(&self, attr: &str) -> Option<&str> {
        match self {
            Filter::Equality(a, v) if a.eq_ignore_ascii_case(attr) => Some(v.as_str()),
            Filter::And(items) | Filter::Or(items) => {
                items.iter().find_map(|f| f.equality_value(attr))
            }
            Filter::Not(inner) => inner.equality_value(attr),
            _ => None,
        }
    }

    /// Like [`Filter::equality_value`] but ignores terms under a negation.
    pub fn asserted_value(&self, attr: &str) -> Option<&str> {
        match self {
            Filter::Equality(a, v) if a.eq_ignore_ascii_case(attr) => Some(v.as_str()),
            Filter::And(items) | Filter::Or(items) => {
                items.iter().find_map(|f| f.asserted_value(attr))
            }
            _ => None,
        }
    }

    /// True when `attr` appears in an equality or presence term.
    pub fn mentions(&self, attr: &str) -> bool {
        self.any(&|f| match f {
            Filter::Equality(a, _) | Filter::Present(a) => a.eq_ignore_ascii_case(attr),
            _ => false,
        })
    }

    pub fn has_presence(&self, attr: &str) -> bool {
        self.any(&|f| match f {
            Filter::Present(a) => a.eq_ignore_ascii_case(attr),
            Filter::Equality(a, v) => a.eq_ignore_ascii_case(attr) && v == "*",
            _ => false,
        })
    }

    /// True when an equality term on `attr` matches one of `values`, ignoring case.
    pub fn asserts_any(&self, attr: &str, values: &[&str]) -> bool {
        self.any(&|f| match f {
            Filter::Equality(a, v) => {
                a.eq_ignore_ascii_case(attr) && values.iter().any(|c| v.eq_ignore_ascii_case(c))
            }
            _ => false,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) => {
                write!(f, "(&")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Or(items) => {
                write!(f, "(|")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::Equality(a, v) => write!(f, "({}={})", a, escape_value(v)),
            Filter::Present(a) => write!(f, "({}=*)", a),
            Filter::Other(raw) => write!(f, "{}", raw),
        }
    }
}

impl From<&LdapFilter> for Filter {
    fn from(filter: &LdapFilter) -> Self {
        match filter {
            LdapFilter::And(items) => Filter::And(items.iter().map(Filter::from).collect()),
            LdapFilter::Or(items) => Filter::Or(items.iter().map(Filter::from).collect()),
            LdapFilter::Not(inner) => Filter::Not(Box::new(Filter::from(inner.as_ref()))),
            LdapFilter::Equality(a, v) => Filter::Equality(a.clone(), v.clone()),
            LdapFilter::Present(a) => Filter::Present(a.clone()),
            LdapFilter::Substring(a, sub) => {
                let mut raw = format!("({}=", a);
                if let Some(initial) = &sub.initial {
                    raw.push_str(&escape_value(initial));
                }
                raw.push('*');
                for part in &sub.any {
                    raw.push_str(&escape_value(part));
                    raw.push('*');
                }
                if let Some(last) = &sub.final_ {
                    raw.push_str(&escape_value(last));
                }
                raw.push(')');
                Filter::Other(raw)
            }
            LdapFilter::GreaterOrEqual(a, v) => {
                Filter::Other(format!("({}>={})", a, escape_value(v)))
            }
            LdapFilter::LessOrEqual(a, v) => Filter::Other(format!("({}<={})", a, escape_value(v))),
            LdapFilter::Approx(a, v) => Filter::Other(format!("({}~={})", a, escape_value(v))),
            #[allow(unreachable_patterns)]
            other => Filter::Other(format!("({:?})", other)),
        }
    }
}

/// Escape the characters RFC 4515 reserves inside assertion values.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> FilterParseError {
        FilterParseError {
            offset: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", byte as char)))
        }
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterParseError> {
        self.skip_spaces();
        self.expect(b'(')?;
        let node = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            Some(_) => {
                let end = self.item_end()?;
                self.item(end)?
            }
            None => return Err(self.error("unexpected end of filter")),
        };
        self.skip_spaces();
        self.expect(b')')?;
        Ok(node)
    }

    fn list(&mut self) -> Result<Vec<Filter>, FilterParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(b'(') => items.push(self.filter()?),
                _ => return Ok(items),
            }
        }
    }

    /// Offset of the `)` closing the current simple item.
    fn item_end(&self) -> Result<usize, FilterParseError> {
        self.src[self.pos..]
            .iter()
            .position(|b| *b == b')' || *b == b'(')
            .map(|rel| self.pos + rel)
            .filter(|end| self.src[*end] == b')')
            .ok_or_else(|| self.error("unterminated assertion"))
    }

    /// Parse `attr op value` spanning `self.pos..end`.
    fn item(&mut self, end: usize) -> Result<Filter, FilterParseError> {
        let start = self.pos;
        let text = std::str::from_utf8(&self.src[start..end])
            .map_err(|_| self.error("filter is not valid UTF-8"))?;
        let eq = text.find('=').ok_or_else(|| self.error("missing '='"))?;
        let (attr_part, value) = (&text[..eq], &text[eq + 1..]);
        self.pos = end;

        let attr = attr_part.trim();
        if attr.is_empty() {
            return Err(FilterParseError {
                offset: start,
                message: "missing attribute name".to_string(),
            });
        }

        // Ordering, approximate and extensible matches
        if attr.ends_with(['>', '<', '~', ':']) {
            return Ok(Filter::Other(format!("({})", text.trim())));
        }
        if value == "*" {
            return Ok(Filter::Present(attr.to_string()));
        }
        if value.contains('*') {
            return Ok(Filter::Other(format!("({}={})", attr, value)));
        }
        let value = unescape(value).map_err(|message| FilterParseError {
            offset: start + eq + 1,
            message,
        })?;
        Ok(Filter::Equality(attr.to_string(), value))
    }
}

fn unescape(value: &str) -> Result<String, String> {
    if !value.contains('\\') {
        return Ok(value.to_string());
    }
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| "invalid escape sequence".to_string())?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| "escaped value is not valid UTF-8".to_string())
}
