// ABOUTME: Finds named (:name) and positional ($n) placeholders in transformation SQL
// ABOUTME: Rewrites named placeholders to positional ones and orders bound values by index

use crate::error::{Error, Result};
use crate::types::JsonObject;
use serde_json::Value;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// `$n`, 1-based
    Positional(usize),
    /// `:name`
    Named(String),
}

/// One placeholder occurrence with its byte range in the SQL text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub start: usize,
    pub end: usize,
    pub line: u64,
    pub column: u64,
}

impl Placeholder {
    pub fn is_positional(&self) -> bool {
        matches!(self.kind, PlaceholderKind::Positional(_))
    }

    pub fn is_named(&self) -> bool {
        matches!(self.kind, PlaceholderKind::Named(_))
    }

    /// Placeholder as written, e.g. `$2` or `:id`
    pub fn text(&self) -> String {
        match &self.kind {
            PlaceholderKind::Positional(index) => format!("${}", index),
            PlaceholderKind::Named(name) => format!(":{}", name),
        }
    }
}

/// Placeholders of one SQL statement, in order of appearance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSql {
    pub placeholders: Vec<Placeholder>,
}

impl ParsedSql {
    pub fn has_positional(&self) -> bool {
        self.placeholders.iter().any(Placeholder::is_positional)
    }

    pub fn has_named(&self) -> bool {
        self.placeholders.iter().any(Placeholder::is_named)
    }

    pub fn is_mixed(&self) -> bool {
        self.has_positional() && self.has_named()
    }

    /// Distinct named placeholders in order of first appearance
    pub fn distinct_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for placeholder in &self.placeholders {
            if let PlaceholderKind::Named(name) = &placeholder.kind {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn max_positional_index(&self) -> usize {
        self.placeholders
            .iter()
            .filter_map(|p| match p.kind {
                PlaceholderKind::Positional(index) => Some(index),
                PlaceholderKind::Named(_) => None,
            })
            .max()
            .unwrap_or(0)
    }
}

/// A problem found while validating placeholders against an available key set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderIssue {
    MixedPlaceholders { sql: String },
    UnknownPlaceholders {
        sql: String,
        names: Vec<String>,
        placeholders: Vec<String>,
        available_keys: Vec<String>,
    },
}

impl fmt::Display for PlaceholderIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderIssue::MixedPlaceholders { .. } => f.write_str(
                "Mixing positional ($) and named (:) placeholders in the same SQL statement is not allowed",
            ),
            PlaceholderIssue::UnknownPlaceholders { names, .. } => write!(
                f,
                "Transformation contains placeholders not available in the schema: {}",
                names.join(", ")
            ),
        }
    }
}

/// Positional SQL plus values ordered by placeholder index
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedSql {
    pub sql: String,
    pub values: Vec<Value>,
}

/// Tokenize `sql` and collect its placeholders.
///
/// String literals, comments, dollar-quoted bodies and `::` casts never
/// produce placeholders because they tokenize differently.
pub fn parse_placeholders(sql: &str) -> Result<ParsedSql> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| Error::SqlTokenize {
            message: e.to_string(),
            sql: sql.to_string(),
        })?;

    let offsets = LineOffsets::new(sql);
    let mut placeholders = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        match &token.token {
            Token::Placeholder(text) => {
                let Some(index) = positional_index(text) else {
                    continue;
                };
                placeholders.push(Placeholder {
                    kind: PlaceholderKind::Positional(index),
                    start: offsets.byte_offset(token.span.start),
                    end: token_end(&tokens, i + 1, &offsets, sql.len()),
                    line: token.span.start.line,
                    column: token.span.start.column,
                });
            }
            Token::Colon => {
                let Some(TokenWithSpan {
                    token: Token::Word(word),
                    ..
                }) = tokens.get(i + 1)
                else {
                    continue;
                };
                if word.quote_style.is_some() {
                    continue;
                }
                placeholders.push(Placeholder {
                    kind: PlaceholderKind::Named(word.value.clone()),
                    start: offsets.byte_offset(token.span.start),
                    end: token_end(&tokens, i + 2, &offsets, sql.len()),
                    line: token.span.start.line,
                    column: token.span.start.column,
                });
            }
            _ => {}
        }
    }

    Ok(ParsedSql { placeholders })
}

pub fn is_mixing_positional_and_named_placeholders(sql: &str) -> Result<bool> {
    Ok(parse_placeholders(sql)?.is_mixed())
}

pub fn validate_sql_placeholders(
    sql: &str,
    available_keys: &[String],
) -> Result<Vec<PlaceholderIssue>> {
    let parsed = parse_placeholders(sql)?;
    Ok(validate_parsed(sql, &parsed, available_keys))
}

pub fn convert_named_to_positional_placeholders(
    sql: &str,
    object: &JsonObject,
) -> Result<ConvertedSql> {
    let parsed = parse_placeholders(sql)?;
    convert_parsed(sql, &parsed, object)
}

pub(crate) fn validate_parsed(
    sql: &str,
    parsed: &ParsedSql,
    available_keys: &[String],
) -> Vec<PlaceholderIssue> {
    let mut issues = Vec::new();

    if parsed.is_mixed() {
        issues.push(PlaceholderIssue::MixedPlaceholders {
            sql: sql.to_string(),
        });
    }

    if parsed.has_named() {
        let mut unknown: Vec<String> = Vec::new();
        for placeholder in &parsed.placeholders {
            let name = match &placeholder.kind {
                PlaceholderKind::Named(name) if !available_keys.contains(name) => name.clone(),
                PlaceholderKind::Named(_) => continue,
                // Positional placeholders never match a key name
                PlaceholderKind::Positional(_) => placeholder.text(),
            };
            if !unknown.contains(&name) {
                unknown.push(name);
            }
        }

        if !unknown.is_empty() {
            issues.push(PlaceholderIssue::UnknownPlaceholders {
                sql: sql.to_string(),
                names: unknown,
                placeholders: parsed.placeholders.iter().map(Placeholder::text).collect(),
                available_keys: available_keys.to_vec(),
            });
        }
    }

    issues
}

pub(crate) fn convert_parsed(
    sql: &str,
    parsed: &ParsedSql,
    object: &JsonObject,
) -> Result<ConvertedSql> {
    if parsed.is_mixed() {
        return Err(Error::MixedPlaceholders {
            sql: sql.to_string(),
        });
    }

    if !parsed.has_named() {
        let required = parsed.max_positional_index();
        if object.len() < required {
            return Err(Error::NotEnoughPositionalValues {
                required,
                supplied: object.len(),
                sql: sql.to_string(),
            });
        }
        return Ok(ConvertedSql {
            sql: sql.to_string(),
            values: object.values().take(required).cloned().collect(),
        });
    }

    let mut indices: HashMap<&str, usize> = HashMap::new();
    let mut values = Vec::new();
    for name in parsed.distinct_names() {
        let value = object
            .get(name)
            .ok_or_else(|| Error::MissingPlaceholderValue {
                name: name.to_string(),
                sql: sql.to_string(),
            })?;
        values.push(value.clone());
        indices.insert(name, values.len());
    }

    let mut rewritten = String::with_capacity(sql.len());
    let mut cursor = 0;
    for placeholder in &parsed.placeholders {
        if let PlaceholderKind::Named(name) = &placeholder.kind {
            rewritten.push_str(&sql[cursor..placeholder.start]);
            rewritten.push('$');
            rewritten.push_str(&indices[name.as_str()].to_string());
            cursor = placeholder.end;
        }
    }
    rewritten.push_str(&sql[cursor..]);

    Ok(ConvertedSql {
        sql: rewritten,
        values,
    })
}

fn positional_index(text: &str) -> Option<usize> {
    let digits = text.strip_prefix('$')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn token_end(tokens: &[TokenWithSpan], next: usize, offsets: &LineOffsets, len: usize) -> usize {
    tokens
        .get(next)
        .map(|t| offsets.byte_offset(t.span.start))
        .unwrap_or(len)
}

/// Maps tokenizer locations (1-based line and character column) to byte offsets
struct LineOffsets<'a> {
    sql: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineOffsets<'a> {
    fn new(sql: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(sql.match_indices('\n').map(|(i, _)| i + 1));
        Self { sql, starts }
    }

    fn byte_offset(&self, location: Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&line_start) = self.starts.get(line) else {
            return self.sql.len();
        };
        let column = (location.column as usize).saturating_sub(1);
        self.sql[line_start..]
            .char_indices()
            .nth(column)
            .map(|(i, _)| line_start + i)
            .unwrap_or(self.sql.len())
    }
}
