// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! URI templates (RFC 6570) for CONNECT-UDP endpoints.
//!
//! CONNECT-UDP couples the proxy endpoint with its target through a URI
//! template such as
//! `https://proxy.example:443/masque?h={target_host}&p={target_port}`.
//! This module implements the subset those templates use: literal text plus
//! simple string expressions `{var}`, with full percent-encoding of reserved
//! characters on expansion (`:` becomes `%3A`, which is how IPv6 literals
//! travel) and literal-anchored extraction on matching. Matched values are
//! returned as they appear in the URI, still percent-encoded; decoding is the
//! caller's business.

use std::fmt;

use thiserror::Error;

/// Errors raised while parsing a URI template
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// An expression was opened with `{` but never closed
    #[error("unterminated expression in template")]
    Unterminated,

    /// `}` appeared outside an expression, or `{` inside one
    #[error("unbalanced braces in template")]
    UnbalancedBrace,

    /// An expression was empty or contained invalid variable characters
    #[error("invalid variable name: {0:?}")]
    InvalidVarName(String),

    /// The expression used an RFC 6570 operator this subset does not cover
    #[error("unsupported template operator: {0:?}")]
    UnsupportedOperator(char),

    /// Expansion referenced no value for a variable
    #[error("missing value for template variable {0:?}")]
    MissingValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Var(String),
}

/// A parsed URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    parts: Vec<Part>,
}

impl UriTemplate {
    /// Parse a template string.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(TemplateError::UnbalancedBrace),
                            c => name.push(c),
                        }
                    }
                    if !closed {
                        return Err(TemplateError::Unterminated);
                    }
                    if let Some(op) = name.chars().next().filter(|c| "+#./;?&=,!@|".contains(*c)) {
                        return Err(TemplateError::UnsupportedOperator(op));
                    }
                    if name.is_empty()
                        || !name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(TemplateError::InvalidVarName(name));
                    }
                    parts.push(Part::Var(name));
                }
                '}' => return Err(TemplateError::UnbalancedBrace),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self {
            raw: raw.to_owned(),
            parts,
        })
    }

    /// The template source text
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Names of the variables the template declares, in order
    pub fn var_names(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Var(name) => Some(name.as_str()),
                Part::Literal(_) => None,
            })
            .collect()
    }

    /// Expand the template with the given variable values.
    ///
    /// Values are percent-encoded as simple string expansion requires; every
    /// character outside the unreserved set is escaped, so `::1` expands to
    /// `%3A%3A1`.
    pub fn expand(&self, values: &[(&str, &str)]) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                Part::Literal(lit) => out.push_str(lit),
                Part::Var(name) => {
                    let value = values
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| *v)
                        .ok_or_else(|| TemplateError::MissingValue(name.clone()))?;
                    pct_encode(value, &mut out);
                }
            }
        }
        Ok(out)
    }

    /// Match a URI against the template, extracting variable values.
    ///
    /// Literal segments must match exactly; each variable captures up to the
    /// next literal (or the end of input). Returns `None` when the URI does
    /// not fit the template. Captured values are still percent-encoded.
    pub fn matches(&self, uri: &str) -> Option<Vec<(String, String)>> {
        let mut values = Vec::new();
        let mut rest = uri;
        let mut parts = self.parts.iter().peekable();
        while let Some(part) = parts.next() {
            match part {
                Part::Literal(lit) => {
                    rest = rest.strip_prefix(lit.as_str())?;
                }
                Part::Var(name) => {
                    let value = match parts.peek() {
                        Some(Part::Literal(lit)) => {
                            let at = rest.find(lit.as_str())?;
                            let (value, tail) = rest.split_at(at);
                            rest = tail;
                            value
                        }
                        // Adjacent variables cannot be delimited; the earlier
                        // one captures nothing.
                        Some(Part::Var(_)) => "",
                        None => {
                            let value = rest;
                            rest = "";
                            value
                        }
                    };
                    values.push((name.clone(), value.to_owned()));
                }
            }
        }
        rest.is_empty().then_some(values)
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

fn pct_encode(value: &str, out: &mut String) {
    for byte in value.bytes() {
        if UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0').to_ascii_uppercase());
            out.push(char::from_digit(u32::from(byte & 0xf), 16).unwrap_or('0').to_ascii_uppercase());
        }
    }
}
