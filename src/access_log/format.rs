//! Access-log record formatter.
//!
//! A template is literal text with `$name` or `${name}` placeholders naming
//! request fields; `$$` is a literal dollar sign. Text encoding substitutes
//! each placeholder with the field's text (`-` when absent). JSON encoding
//! emits one object keyed by the placeholder names and ignores the literal
//! text.

use thiserror::Error;

use crate::config::AccessEncode;
use crate::context::{FieldResolver, FieldValue, RequestContext};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),

    #[error("empty placeholder at byte {0}")]
    Empty(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Field(String),
}

/// A compiled access-log template.
#[derive(Debug, Clone)]
pub struct AccessFormat {
    parts: Vec<Part>,
    encode: AccessEncode,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl AccessFormat {
    pub fn compile(template: &str, encode: AccessEncode) -> Result<Self, FormatError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            if c != '$' {
                literal.push(c);
                continue;
            }

            let name = match chars.peek().copied() {
                Some((_, '$')) => {
                    chars.next();
                    literal.push('$');
                    continue;
                }
                Some((_, '{')) => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(FormatError::Unclosed(pos));
                    }
                    if name.is_empty() {
                        return Err(FormatError::Empty(pos));
                    }
                    name
                }
                _ => {
                    let mut name = String::new();
                    while let Some((_, c)) = chars.peek().copied() {
                        if !is_name_char(c) {
                            break;
                        }
                        name.push(c);
                        chars.next();
                    }
                    if name.is_empty() {
                        // a lone '$' is kept as text
                        literal.push('$');
                        continue;
                    }
                    name
                }
            };

            if !literal.is_empty() {
                parts.push(Part::Literal(std::mem::take(&mut literal)));
            }
            parts.push(Part::Field(name));
        }

        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self { parts, encode })
    }

    pub fn encode(&self) -> AccessEncode {
        self.encode
    }

    /// Field names referenced by the template, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Field(name) => Some(name.as_str()),
            Part::Literal(_) => None,
        })
    }

    /// Render one record for the request. No trailing newline.
    pub fn render(&self, ctx: &RequestContext) -> Vec<u8> {
        match self.encode {
            AccessEncode::Text => {
                let mut out = String::new();
                for part in &self.parts {
                    match part {
                        Part::Literal(text) => out.push_str(text),
                        Part::Field(name) => match FieldResolver::resolve(ctx, name) {
                            FieldValue::Null => out.push('-'),
                            value => out.push_str(&value.to_text()),
                        },
                    }
                }
                out.into_bytes()
            }
            AccessEncode::Json => {
                let mut record = serde_json::Map::new();
                for name in self.fields() {
                    record.insert(name.to_string(), FieldResolver::resolve(ctx, name).to_json());
                }
                serde_json::Value::Object(record).to_string().into_bytes()
            }
        }
    }
}
